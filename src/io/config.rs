//! Client connection settings

use std::time::Duration;

/// Default DE server command port
pub const DEFAULT_PORT: u16 = 13240;

/// Connection and receive-window settings
///
/// Used with [`ClientBuilder`](crate::io::builder::ClientBuilder).
///
/// # Examples
///
/// ```no_run
/// use deapi::io::builder::ClientBuilder;
/// use deapi::io::config::ClientConfig;
///
/// let config = ClientConfig {
///     recv_buffer_size: Some(8 * 1024 * 1024),
///     ..Default::default()
/// };
/// let client = ClientBuilder::new()
///     .tcp("192.168.0.10", 13240)
///     .with_config(config)
///     .build()?;
/// # Ok::<(), deapi::DeError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Disable Nagle's algorithm; `None` disables it for remote hosts only
    pub tcp_nodelay: Option<bool>,
    /// Give up connecting after this long (None = OS default)
    pub connect_timeout: Option<Duration>,
    /// SO_RCVBUF size for large image transfers
    pub recv_buffer_size: Option<usize>,
    /// Receive window before any exposure is added
    pub base_timeout: Duration,
    /// Seconds of receive window added per second of exposure
    pub exposure_timeout_factor: f64,
    /// How long to wait for the reply to a stop datagram
    pub stop_reply_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            tcp_nodelay: None,
            connect_timeout: Some(Duration::from_secs(10)),
            recv_buffer_size: None,
            base_timeout: Duration::from_secs(30),
            exposure_timeout_factor: 10.0,
            stop_reply_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Config for a specific server, other settings default
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Receive window for one operation: `exposure * factor + base`
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use deapi::io::config::ClientConfig;
    ///
    /// let config = ClientConfig::default();
    /// assert_eq!(config.receive_timeout(2.0), Duration::from_secs(50));
    /// ```
    pub fn receive_timeout(&self, exposure_time: f64) -> Duration {
        let extra = (exposure_time.max(0.0) * self.exposure_timeout_factor).min(1e9);
        self.base_timeout + Duration::from_secs_f64(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 13240);
        assert_eq!(config.base_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_receive_timeout_grows_with_exposure() {
        let config = ClientConfig::new("localhost", 13241);
        assert_eq!(config.receive_timeout(0.0), Duration::from_secs(30));
        assert_eq!(config.receive_timeout(-5.0), Duration::from_secs(30));
        assert_eq!(config.receive_timeout(0.5), Duration::from_secs(35));
    }
}
