use super::key::Destination;
use std::collections::HashMap;

/// The slice of an outbound request the pool cares about.
///
/// The pool never looks at bodies. It reads the destination, the `Cookie`
/// header (session affinity), the `Host` header (TLS server name) and whether
/// the request allows its connection to be kept alive afterwards.
#[derive(Debug, Clone)]
pub struct Request {
    destination: Destination,
    /// Header names are stored lowercase.
    headers: HashMap<String, String>,
    keep_alive: bool,
}

impl Request {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            headers: HashMap::new(),
            keep_alive: true,
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Whether the connection may be reused once this request is done.
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let req = Request::new(Destination::new("example.com", 80))
            .with_header("Cookie", "a=1")
            .with_header("HOST", "example.com");

        assert_eq!(req.header("cookie"), Some("a=1"));
        assert_eq!(req.header("COOKIE"), Some("a=1"));
        assert_eq!(req.header("host"), Some("example.com"));
        assert_eq!(req.header("missing"), None);
    }

    #[test]
    fn keep_alive_defaults_on() {
        let req = Request::new(Destination::default());
        assert!(req.keep_alive());
        assert!(!req.with_keep_alive(false).keep_alive());
    }
}
