use tracing::{debug, warn};

/// Split "Name: Value" strings into pairs, skipping malformed entries
pub fn parse_headers(header_strings: &[String]) -> Vec<(String, String)> {
    header_strings
        .iter()
        .filter_map(|header| {
            let Some((name, value)) = header.split_once(':') else {
                warn!(header = %header, "Invalid header format, expected 'Name: Value'");
                return None;
            };
            let name = name.trim();
            if name.is_empty() {
                warn!(header = %header, "Header name is empty");
                return None;
            }
            debug!(name, "Adding header");
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let parsed = parse_headers(&[
            "Referer: https://example.com".to_string(),
            "no-colon".to_string(),
            ": empty".to_string(),
            "X-Token:abc:def".to_string(),
        ]);
        assert_eq!(
            parsed,
            vec![
                ("Referer".to_string(), "https://example.com".to_string()),
                ("X-Token".to_string(), "abc:def".to_string()),
            ]
        );
    }
}
