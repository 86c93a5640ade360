//! Directory key layout: `<root>/<pattern>/<host>`.
//!
//! The pattern segment is the form-urlencoded canonical pattern string, so
//! it never contains `/` and decodes back to the same pattern.

use url::form_urlencoded;

use crate::routing::Pattern;

/// Key under which `host` advertises `pattern`.
pub fn directory_key(root: &str, pattern: &Pattern, host: &str) -> String {
    let segment: String = form_urlencoded::byte_serialize(pattern.as_str().as_bytes()).collect();
    format!("{}/{}/{}", root.trim_end_matches('/'), segment, host)
}

/// Split a key into (pattern, host). `None` for anything not shaped like a
/// directory entry under `root`.
pub fn parse_key(root: &str, key: &str) -> Option<(Pattern, String)> {
    let rest = key.strip_prefix(root.trim_end_matches('/'))?.strip_prefix('/')?;
    let mut segments = rest.split('/');
    let (encoded, host) = match (segments.next(), segments.next(), segments.next()) {
        (Some(encoded), Some(host), None) if !host.is_empty() => (encoded, host),
        _ => return None,
    };

    let decoded: String = form_urlencoded::parse(format!("{}=", encoded).as_bytes())
        .next()
        .map(|(name, _)| name.into_owned())?;
    let pattern = Pattern::parse(&decoded).ok()?;
    Some((pattern, host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        let pattern = Pattern::parse("role:adder, cmd:sum").unwrap();
        let key = directory_key("/micro", &pattern, "host-1");
        assert_eq!(key, "/micro/cmd%3A%22sum%22%2Crole%3A%22adder%22/host-1");

        let (parsed, host) = parse_key("/micro", &key).unwrap();
        assert_eq!(parsed, pattern);
        assert_eq!(host, "host-1");
    }

    #[test]
    fn test_values_with_slashes_and_spaces() {
        let pattern = Pattern::parse(r#"{"path": "/a b/c"}"#).unwrap();
        let key = directory_key("/micro/", &pattern, "h");
        assert_eq!(key.matches('/').count(), 3);
        assert_eq!(parse_key("/micro", &key).unwrap().0, pattern);
    }

    #[test]
    fn test_malformed_keys_are_rejected() {
        let ok = directory_key("/micro", &Pattern::parse("role:adder").unwrap(), "h");
        assert!(parse_key("/micro", &ok).is_some());

        for key in [
            "/micro",
            "/micro/",
            "/micro/role%3A%22adder%22",
            "/micro/role%3A%22adder%22/",
            "/micro/role%3A%22adder%22/h/extra",
            "/other/role%3A%22adder%22/h",
            "/microscope/role%3A%22adder%22/h",
            "/micro/%7Bnot-a-pattern/h",
        ] {
            assert!(parse_key("/micro", key).is_none(), "accepted {}", key);
        }
    }
}
