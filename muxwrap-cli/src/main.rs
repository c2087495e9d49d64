use std::path::Path;

use muxwrap_engine::http::HttpOptions;
use muxwrap_engine::{
    CookieJar, DatabaseLocation, KeyDatabase, Pipeline, PreparedRequest, ProxyPolicy, RawRequest,
    ResolveContext, ResolvedRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod cli;
mod config;
mod error;
mod logging;
mod utils;

use config::{FileConfig, Settings};
use error::{AppError, exit_code};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let code = match bootstrap() {
        Ok(()) => exit_code::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = match cli::parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => return Err(e.into()),
    };

    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::merge(args, file)?;
    let _guard = logging::init_logging(settings.log_level, settings.log_file.as_deref())?;

    info!(version = env!("CARGO_PKG_VERSION"), "muxwrap starting");
    run(settings).await
}

async fn run(settings: Settings) -> Result<(), AppError> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let options = settings.static_options();
    let raw = RawRequest {
        input_url: settings.input_url,
        user_agent: settings.user_agent,
    };
    let request = PreparedRequest::prepare(&raw, &options)?;

    let (policy, rejected) =
        ProxyPolicy::load(settings.proxy.as_deref(), settings.proxy_bypass.as_deref())?;
    for e in rejected {
        warn!(error = %e, "Ignoring invalid proxy bypass pattern");
    }
    if let Some(proxy) = policy.proxy() {
        info!(proxy = %proxy, bypass = policy.bypass().len(), "Proxy configured");
    }

    let config = settings.engine;
    let fetch_program = config.fetch_tool.resolve()?;
    let mux_program = config.mux_tool.resolve()?;

    let cookies = settings
        .cookies
        .as_deref()
        .map(|path| CookieJar::load(path, &config.install_dir))
        .transpose()?;

    let keys = match settings.clearkeys.as_deref() {
        Some(source) => {
            let location = DatabaseLocation::parse(source, &config.install_dir);
            match load_keys(&location, &config.http_options(), &cancel).await {
                Some(keys) => keys,
                None => {
                    info!("Cancelled while loading the key database");
                    return Ok(());
                }
            }
        }
        None => KeyDatabase::empty(),
    };

    let mut context = ResolveContext::new(config, keys, policy);
    if let Some(jar) = cookies {
        context = context.with_cookies(jar);
    }

    let variants = context.variant_engine(&request, &fetch_program);
    let resolved = tokio::select! {
        resolved = context.resolve(request, &variants) => resolved?,
        () = cancel.cancelled() => {
            info!("Cancelled before the pipeline started");
            return Ok(());
        }
    };

    stream(&context, &resolved, &fetch_program, &mux_program, cancel).await
}

/// Load the key database unless `cancel` fires first.
async fn load_keys(
    location: &DatabaseLocation,
    http: &HttpOptions,
    cancel: &CancellationToken,
) -> Option<KeyDatabase> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        keys = KeyDatabase::load_or_empty(location, http) => Some(keys),
    }
}

async fn stream(
    context: &ResolveContext,
    resolved: &ResolvedRequest,
    fetch_program: &Path,
    mux_program: &Path,
    cancel: CancellationToken,
) -> Result<(), AppError> {
    let spec = context.pipeline_spec(resolved, fetch_program, mux_program);
    let pipeline = Pipeline::new(spec)
        .with_chunk_size(context.config.chunk_size)
        .with_grace_period(context.config.grace_period);

    let mut stdout = tokio::io::stdout();
    let outcome = pipeline.run(&mut stdout, cancel).await?;
    info!(
        bytes = outcome.bytes_written,
        reason = %outcome.end,
        "Stream finished"
    );
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => {
                    error!("Failed to install Ctrl+C handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {}
            () = terminate => {}
        }
        token.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_load_stops_on_cancel() {
        // Accepts connections but never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let source = format!("http://{}/keys.json", listener.local_addr().unwrap());
        let location = DatabaseLocation::parse(&source, Path::new("/opt/muxwrap"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let loaded = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            load_keys(&location, &HttpOptions::default(), &cancel),
        )
        .await
        .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_key_load_without_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, r#"{"https://x/*.mpd": "kid:key"}"#).unwrap();
        let location = DatabaseLocation::parse(path.to_str().unwrap(), dir.path());

        let loaded = load_keys(&location, &HttpOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!loaded.is_empty());
    }
}
