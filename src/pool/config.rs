use super::key::BucketKey;
use std::time::Duration;

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Park released connections for reuse instead of closing them
    pub keep_alive: bool,
    /// TCP keep-alive probe interval for parked connections
    pub keep_alive_interval: Duration,
    /// Connections (active + idle + dialing) allowed per bucket; `None` is
    /// unbounded and `Some(0)` is treated as 1
    pub max_active_per_key: Option<usize>,
    /// Idle connections allowed across all buckets
    pub max_idle_total: usize,
    /// How long a parked connection may sit idle; `None` keeps it forever
    pub idle_timeout: Option<Duration>,
    /// Deadline for a connection while assigned to a request
    pub active_timeout: Option<Duration>,
    /// Cookie carrying the session token; setting it enables session affinity
    pub session_token_field: Option<String>,
    /// Deadline for establishing new connections
    pub connect_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keep_alive: false,
            keep_alive_interval: Duration::from_millis(1000),
            max_active_per_key: None,
            max_idle_total: 256,
            idle_timeout: None,
            active_timeout: None,
            session_token_field: None,
            connect_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Connection ceiling for one bucket, never below one. Session buckets
    /// always get exactly one.
    pub fn capacity_for(&self, key: &BucketKey) -> usize {
        if key.is_session_bound() {
            1
        } else {
            self.max_active_per_key.map_or(usize::MAX, |max| max.max(1))
        }
    }

    pub(crate) fn session_field(&self) -> Option<&str> {
        self.session_token_field
            .as_deref()
            .filter(|field| !field.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::key::Destination;
    use crate::pool::request::Request;

    #[test]
    fn defaults_match_documented_values() {
        let config = PoolConfig::default();
        assert!(!config.keep_alive);
        assert_eq!(config.keep_alive_interval, Duration::from_millis(1000));
        assert_eq!(config.max_active_per_key, None);
        assert_eq!(config.max_idle_total, 256);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.active_timeout, None);
        assert_eq!(config.session_token_field, None);
    }

    #[test]
    fn session_bucket_capacity_is_one() {
        let config = PoolConfig {
            max_active_per_key: Some(8),
            session_token_field: Some("SID".to_string()),
            ..Default::default()
        };

        let with_token = Request::new(Destination::new("example.com", 80))
            .with_header("cookie", "SID=u1");
        let without_token = Request::new(Destination::new("example.com", 80));

        let k1 = BucketKey::for_request(&with_token, config.session_field());
        let k2 = BucketKey::for_request(&without_token, config.session_field());

        assert_eq!(config.capacity_for(&k1), 1);
        assert_eq!(config.capacity_for(&k2), 8);
    }

    #[test]
    fn unbounded_by_default() {
        let config = PoolConfig::default();
        let key = BucketKey::for_request(&Request::new(Destination::default()), None);
        assert_eq!(config.capacity_for(&key), usize::MAX);
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let config = PoolConfig {
            max_active_per_key: Some(0),
            ..Default::default()
        };
        let key = BucketKey::for_request(&Request::new(Destination::default()), None);
        assert_eq!(config.capacity_for(&key), 1);
    }

    #[test]
    fn empty_session_field_disables_affinity() {
        let config = PoolConfig {
            session_token_field: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(config.session_field(), None);
    }
}
