use super::request::Request;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Host used when a destination leaves it unset.
pub const DEFAULT_HOST: &str = "localhost";

/// Explicit address family hint for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    #[serde(rename = "4")]
    V4,
    #[serde(rename = "6")]
    V6,
}

impl AddressFamily {
    /// Map a numeric family hint; anything other than 4 or 6 means "no preference".
    pub fn from_hint(hint: u8) -> Option<Self> {
        match hint {
            4 => Some(AddressFamily::V4),
            6 => Some(AddressFamily::V6),
            _ => None,
        }
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        matches!(
            (self, ip),
            (AddressFamily::V4, IpAddr::V4(_)) | (AddressFamily::V6, IpAddr::V6(_))
        )
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("4"),
            AddressFamily::V6 => f.write_str("6"),
        }
    }
}

/// Where a request wants to go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destination {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub local_address: Option<IpAddr>,
    pub family: Option<AddressFamily>,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn with_local_address(mut self, local_address: IpAddr) -> Self {
        self.local_address = Some(local_address);
        self
    }

    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = Some(family);
        self
    }

    /// Host name with the `localhost` fallback applied.
    pub fn host_or_default(&self) -> &str {
        match self.host.as_deref() {
            Some(host) if !host.is_empty() => host,
            _ => DEFAULT_HOST,
        }
    }
}

/// Identity of a bucket of interchangeable connections.
///
/// Two requests share connections only if every field is equal. Fields stay
/// structurally separate, so host `"a:1"` and host `"a"` + port `1` never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    host: String,
    port: Option<u16>,
    local_address: Option<IpAddr>,
    session: Option<String>,
    family: Option<AddressFamily>,
}

impl BucketKey {
    /// Derive the key for `request`. The session token only takes part when
    /// `session_field` is configured and the request carries a non-empty value.
    pub fn for_request(request: &Request, session_field: Option<&str>) -> Self {
        let destination = request.destination();
        let session = session_field
            .filter(|field| !field.is_empty())
            .and_then(|field| {
                request
                    .header("cookie")
                    .and_then(|cookie| session_token(cookie, field))
            });

        Self {
            host: destination.host_or_default().to_string(),
            port: destination.port,
            local_address: destination.local_address,
            session,
            family: destination.family,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn family(&self) -> Option<AddressFamily> {
        self.family
    }

    /// Session buckets are pinned to a single connection.
    pub fn is_session_bound(&self) -> bool {
        self.session.is_some()
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)?;
        f.write_str(":")?;
        if let Some(port) = self.port {
            write!(f, "{}", port)?;
        }
        f.write_str(":")?;
        if let Some(local) = self.local_address {
            write!(f, "{}", local)?;
        }
        if let Some(session) = &self.session {
            write!(f, ":{}", session)?;
        }
        if let Some(family) = self.family {
            write!(f, ":{}", family)?;
        }
        Ok(())
    }
}

/// Extract the value of cookie `name` from a `Cookie` header.
///
/// Names are matched exactly after trimming. The value is everything after the
/// first `=`, so base64 padding survives. Empty values count as absent.
pub fn session_token(cookie_header: &str, name: &str) -> Option<String> {
    cookie_header
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .find(|(cookie_name, _)| cookie_name.trim() == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// TLS server name for a request: the `Host` header without its port, falling
/// back to the destination host.
pub fn server_name(request: &Request) -> String {
    request
        .header("host")
        .and_then(strip_port)
        .unwrap_or_else(|| request.destination().host_or_default())
        .to_string()
}

fn strip_port(authority: &str) -> Option<&str> {
    let authority = authority.trim();
    let host = if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal: keep what is inside the brackets.
        rest.split_once(']').map(|(inner, _)| inner)?
    } else {
        authority.split(':').next().unwrap_or(authority)
    };

    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn request(destination: Destination) -> Request {
        Request::new(destination)
    }

    #[test]
    fn defaults_host_to_localhost() {
        let key = BucketKey::for_request(&request(Destination::default()), None);
        assert_eq!(key.host(), "localhost");
        assert_eq!(key.to_string(), "localhost::");
    }

    #[test]
    fn renders_all_fields_in_order() {
        let destination = Destination::new("example.com", 443)
            .with_local_address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)))
            .with_family(AddressFamily::V6);
        let req = request(destination).with_header("Cookie", "SID=u1");
        let key = BucketKey::for_request(&req, Some("SID"));

        assert_eq!(key.to_string(), "example.com:443:10.0.0.5:u1:6");
        assert!(key.is_session_bound());
    }

    #[test]
    fn session_token_ignored_without_field() {
        let req = request(Destination::new("example.com", 80)).with_header("cookie", "SID=u1");
        let key = BucketKey::for_request(&req, None);
        assert_eq!(key.session(), None);
        assert!(!key.is_session_bound());
    }

    #[test]
    fn different_tokens_produce_different_keys() {
        let a = request(Destination::new("example.com", 80)).with_header("cookie", "SID=u1");
        let b = request(Destination::new("example.com", 80)).with_header("cookie", "SID=u2");
        let c = request(Destination::new("example.com", 80));

        let ka = BucketKey::for_request(&a, Some("SID"));
        let kb = BucketKey::for_request(&b, Some("SID"));
        let kc = BucketKey::for_request(&c, Some("SID"));

        assert_ne!(ka, kb);
        assert_ne!(ka, kc);
        assert_eq!(kc.session(), None);
    }

    #[test]
    fn host_and_port_stay_separate() {
        let glued = Destination {
            host: Some("a:1".to_string()),
            ..Default::default()
        };
        let split = Destination {
            host: Some("a".to_string()),
            port: Some(1),
            ..Default::default()
        };

        let k1 = BucketKey::for_request(&request(glued), None);
        let k2 = BucketKey::for_request(&request(split), None);
        assert_ne!(k1, k2);
    }

    #[test]
    fn family_hint_only_for_four_and_six() {
        assert_eq!(AddressFamily::from_hint(4), Some(AddressFamily::V4));
        assert_eq!(AddressFamily::from_hint(6), Some(AddressFamily::V6));
        assert_eq!(AddressFamily::from_hint(0), None);
        assert_eq!(AddressFamily::from_hint(5), None);
    }

    #[test]
    fn extracts_cookie_by_exact_name() {
        let header = "theme=dark; NTLMSESSION=abc123; NTLMSESSION2=zzz";
        assert_eq!(
            session_token(header, "NTLMSESSION").as_deref(),
            Some("abc123")
        );
        assert_eq!(session_token(header, "NTLM"), None);
        assert_eq!(session_token(header, "missing"), None);
    }

    #[test]
    fn cookie_value_keeps_padding() {
        assert_eq!(
            session_token("SID=dGVzdA==; other=1", "SID").as_deref(),
            Some("dGVzdA==")
        );
    }

    #[test]
    fn empty_cookie_value_is_absent() {
        assert_eq!(session_token("SID=; other=1", "SID"), None);
        assert_eq!(session_token("", "SID"), None);
    }

    #[test]
    fn server_name_prefers_host_header() {
        let req = request(Destination::new("10.0.0.1", 443)).with_header("Host", "api.example.com:8443");
        assert_eq!(server_name(&req), "api.example.com");

        let req = request(Destination::new("10.0.0.1", 443)).with_header("Host", "[::1]:8443");
        assert_eq!(server_name(&req), "::1");

        let req = request(Destination::new("origin.example.com", 443));
        assert_eq!(server_name(&req), "origin.example.com");
    }
}
