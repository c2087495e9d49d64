use muxwrap_engine::{ConfigurationError, PipelineError};
use thiserror::Error;

/// Exit codes reported to the host.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const USAGE: i32 = 20;
    pub const MALFORMED_DIRECTIVE: i32 = 21;
    pub const INVALID_CONFIG: i32 = 22;
    pub const STAGE_FAILED: i32 = 30;
    pub const SPAWN_FAILED: i32 = 31;
    pub const OUTPUT_IO: i32 = 32;
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Usage(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Configuration file error: {0}")]
    ConfigFile(String),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Initialization failed: {0}")]
    Initialization(String),
}

impl AppError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Usage(_) => exit_code::USAGE,
            AppError::Configuration(e) => match e {
                ConfigurationError::Directive(_) => exit_code::MALFORMED_DIRECTIVE,
                e if e.is_input_error() => exit_code::USAGE,
                _ => exit_code::INVALID_CONFIG,
            },
            AppError::ConfigFile(_) | AppError::Initialization(_) => exit_code::INVALID_CONFIG,
            AppError::Pipeline(e) => match e {
                PipelineError::Spawn { .. } => exit_code::SPAWN_FAILED,
                PipelineError::StageFailed { .. } => exit_code::STAGE_FAILED,
                PipelineError::Output { .. } => exit_code::OUTPUT_IO,
            },
            AppError::Io(_) => exit_code::OUTPUT_IO,
        }
    }
}

impl From<clap::Error> for AppError {
    fn from(error: clap::Error) -> Self {
        AppError::Usage(error.render().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxwrap_engine::directive;

    #[test]
    fn test_exit_codes() {
        assert_eq!(AppError::Usage("x".into()).exit_code(), 20);
        assert_eq!(
            AppError::from(ConfigurationError::MissingInput("input URL")).exit_code(),
            20
        );

        let directive_error = directive::parse("https://x/a.m3u8#noaudio=maybe").unwrap_err();
        assert_eq!(
            AppError::from(ConfigurationError::from(directive_error)).exit_code(),
            21
        );
        assert_eq!(
            AppError::from(ConfigurationError::Proxy("bad".into())).exit_code(),
            22
        );
        assert_eq!(
            AppError::from(PipelineError::Spawn {
                stage: muxwrap_engine::StageKind::Mux,
                source: std::io::ErrorKind::NotFound.into(),
            })
            .exit_code(),
            31
        );
        assert_eq!(
            AppError::from(PipelineError::Output {
                source: std::io::ErrorKind::Other.into(),
                bytes_written: 10,
            })
            .exit_code(),
            32
        );
    }
}
