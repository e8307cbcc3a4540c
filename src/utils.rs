/// Join key segments with `:` the way counters are named in logs and metrics.
pub fn format_rate_limit_key(prefix: &str, parts: &[&str]) -> String {
    let mut key = String::from(prefix);
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

/// Case-insensitive lookup in a string map, returning the first non-empty value.
pub fn lookup_ignore_case<'a>(
    map: &'a std::collections::HashMap<String, String>,
    name: &str,
) -> Option<&'a str> {
    map.iter()
        .find(|(k, v)| k.eq_ignore_ascii_case(name) && !v.trim().is_empty())
        .map(|(_, v)| v.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_format_rate_limit_key() {
        assert_eq!(
            format_rate_limit_key("rate_limit", &["app", "gpt-4", "ip:1.2.3.4"]),
            "rate_limit:app:gpt-4:ip:1.2.3.4"
        );
        assert_eq!(format_rate_limit_key("rate_limit", &[]), "rate_limit");
    }

    #[test]
    fn test_lookup_ignore_case() {
        let mut map = HashMap::new();
        map.insert("X-Api-Key".to_string(), " secret ".to_string());
        map.insert("Empty".to_string(), "  ".to_string());

        assert_eq!(lookup_ignore_case(&map, "x-api-key"), Some("secret"));
        assert_eq!(lookup_ignore_case(&map, "empty"), None);
        assert_eq!(lookup_ignore_case(&map, "missing"), None);
    }
}
