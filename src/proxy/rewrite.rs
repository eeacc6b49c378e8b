//! Target URL construction for forwarded requests

use regex::Regex;
use std::borrow::Cow;

/// Strips a configured path prefix before the path is joined to a backend
#[derive(Debug, Clone, Default)]
pub struct PathRewriter {
    pattern: Option<Regex>,
}

impl PathRewriter {
    /// `None`, an empty prefix and `/` all disable stripping
    pub fn new(strip_prefix: Option<&str>) -> Result<Self, regex::Error> {
        let prefix = strip_prefix.map(|p| p.trim_end_matches('/')).unwrap_or("");
        if prefix.is_empty() {
            return Ok(Self::default());
        }

        let pattern = Regex::new(&format!("^{}(/.*)?$", regex::escape(prefix)))?;
        Ok(Self { pattern: Some(pattern) })
    }

    /// `/api/users` becomes `/users` and `/api` becomes an empty path.
    /// Paths that merely share the leading characters (`/apix`) are left alone.
    pub fn rewrite<'a>(&self, path: &'a str) -> Cow<'a, str> {
        match &self.pattern {
            Some(pattern) => pattern.replace(path, "$1"),
            None => Cow::Borrowed(path),
        }
    }
}

/// Join two path segments with exactly one slash between them
pub fn single_joining_slash(a: &str, b: &str) -> String {
    if a.is_empty() {
        return b.to_string();
    }
    if b.is_empty() {
        return a.to_string();
    }

    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Backend query first, then the inbound one, joined by `&` when both are present
pub fn merge_query(target: Option<&str>, incoming: Option<&str>) -> Option<String> {
    let target = target.unwrap_or("");
    let incoming = incoming.unwrap_or("");
    match (target.is_empty(), incoming.is_empty()) {
        (true, true) => None,
        (false, true) => Some(target.to_string()),
        (true, false) => Some(incoming.to_string()),
        (false, false) => Some(format!("{}&{}", target, incoming)),
    }
}

/// Build the URL a request is forwarded to. Backends registered as bare
/// `host:port` are reached over plain HTTP.
pub fn target_url(backend: &str, path: &str, query: Option<&str>) -> Result<url::Url, url::ParseError> {
    let mut url = if backend.contains("://") {
        url::Url::parse(backend)?
    } else {
        url::Url::parse(&format!("http://{}", backend))?
    };

    let joined = single_joining_slash(url.path(), path);
    let merged = merge_query(url.query(), query);
    url.set_path(&joined);
    url.set_query(merged.as_deref());
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_joining_slash() {
        assert_eq!(single_joining_slash("/base", "/users"), "/base/users");
        assert_eq!(single_joining_slash("/base/", "/users"), "/base/users");
        assert_eq!(single_joining_slash("/base/", "users"), "/base/users");
        assert_eq!(single_joining_slash("/base", "users"), "/base/users");
        assert_eq!(single_joining_slash("", "/users"), "/users");
        assert_eq!(single_joining_slash("/base", ""), "/base");
    }

    #[test]
    fn test_merge_query() {
        assert_eq!(merge_query(None, None), None);
        assert_eq!(merge_query(Some(""), Some("")), None);
        assert_eq!(merge_query(Some("k=v"), None), Some("k=v".to_string()));
        assert_eq!(merge_query(None, Some("a=1")), Some("a=1".to_string()));
        assert_eq!(merge_query(Some("k=v"), Some("a=1")), Some("k=v&a=1".to_string()));
    }

    #[test]
    fn test_strip_prefix() {
        let rewriter = PathRewriter::new(Some("/api/")).unwrap();
        assert_eq!(rewriter.rewrite("/api/users"), "/users");
        assert_eq!(rewriter.rewrite("/api"), "");
        assert_eq!(rewriter.rewrite("/apix/users"), "/apix/users");
        assert_eq!(rewriter.rewrite("/other"), "/other");

        let dotted = PathRewriter::new(Some("/v1.0")).unwrap();
        assert_eq!(dotted.rewrite("/v1x0/users"), "/v1x0/users");
        assert_eq!(dotted.rewrite("/v1.0/users"), "/users");
    }

    #[test]
    fn test_no_prefix_keeps_path() {
        for prefix in [None, Some(""), Some("/")] {
            let rewriter = PathRewriter::new(prefix).unwrap();
            assert_eq!(rewriter.rewrite("/api/users"), "/api/users");
        }
    }

    #[test]
    fn test_target_url() {
        let url = target_url("http://127.0.0.1:2003/base", "/users", Some("a=1")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:2003/base/users?a=1");

        let url = target_url("http://127.0.0.1:2003/base?k=v", "/users", Some("a=1")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:2003/base/users?k=v&a=1");

        let url = target_url("127.0.0.1:2004", "/users", None).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:2004/users");

        let url = target_url("http://127.0.0.1:2003/base", "", None).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:2003/base");

        assert!(target_url("http://", "/users", None).is_err());
    }
}
