use reqwest::header::{HeaderName, HeaderValue};
use tracing::{debug, warn};

/// Parse a header string in format "Name: Value"
pub fn parse_header(header_str: &str) -> Option<(String, String)> {
    // Find the first colon which separates name and value
    let Some((name, value)) = header_str.split_once(':') else {
        warn!("Invalid header format: '{header_str}'. Expected 'Name: Value'");
        return None;
    };

    let name = name.trim();
    let value = value.trim();

    if HeaderName::from_bytes(name.as_bytes()).is_err() {
        warn!("Invalid header name: '{name}'");
        return None;
    }
    if HeaderValue::from_str(value).is_err() {
        warn!("Invalid header value for '{name}'");
        return None;
    }

    debug!("Adding header: {name}");
    Some((name.to_string(), value.to_string()))
}

/// Parse a collection of header strings, skipping invalid ones
pub fn parse_header_pairs(header_strings: &[String]) -> Vec<(String, String)> {
    header_strings
        .iter()
        .filter_map(|header| parse_header(header))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let headers = parse_header_pairs(&[
            "X-Token: abc:def".to_string(),
            "no colon".to_string(),
            "Bad Name: x".to_string(),
            "Accept-Language:  en ".to_string(),
        ]);
        assert_eq!(
            headers,
            [
                ("X-Token".to_string(), "abc:def".to_string()),
                ("Accept-Language".to_string(), "en".to_string()),
            ]
        );
    }
}
