//! Type-state builder for DE clients
//!
//! The transport is chosen before anything can be built, so a client without
//! a target is a compile error rather than a runtime one.
//!
//! # Type-State Pattern
//!
//! - Target state: Unspecified -> TcpConfigured or LocalConfigured
//!
//! # Examples
//!
//! ```no_run
//! use deapi::io::builder::ClientBuilder;
//! use deapi::simulator::Simulator;
//!
//! // Real server
//! let client = ClientBuilder::new()
//!     .tcp("192.168.1.20", 13240)
//!     .recv_buffer_size(16 * 1024 * 1024)
//!     .build()?;
//!
//! // In-process simulator
//! let sim_client = ClientBuilder::new()
//!     .simulated(Simulator::with_defaults()?)
//!     .build()?;
//! # Ok::<(), deapi::DeError>(())
//! ```

use std::time::Duration;

use crate::error::Result;
use crate::io::client::Client;
use crate::io::config::ClientConfig;
use crate::io::local::LocalTransport;
use crate::io::transport::TcpTransport;
use crate::simulator::{SharedSimulator, Simulator};

// ============================================================================
// State Marker Types
// ============================================================================

/// No target selected yet
pub struct Unspecified;

/// TCP target selected
pub struct TcpConfigured {
    pub(crate) host: String,
    pub(crate) port: u16,
}

/// In-process simulator selected
pub struct LocalConfigured {
    pub(crate) simulator: SharedSimulator,
}

// ============================================================================
// ClientBuilder - Type-State Pattern
// ============================================================================

/// Type-state builder for [`Client`]
///
/// # Type Parameters
/// * `Target` - Target state (Unspecified, TcpConfigured, LocalConfigured)
pub struct ClientBuilder<Target = Unspecified> {
    target: Target,
    config: ClientConfig,
}

// ============================================================================
// Initial Construction
// ============================================================================

impl ClientBuilder<Unspecified> {
    /// Create a new client builder
    ///
    /// # Examples
    ///
    /// ```
    /// use deapi::io::builder::ClientBuilder;
    ///
    /// let builder = ClientBuilder::new();
    /// ```
    pub fn new() -> Self {
        Self {
            target: Unspecified,
            config: ClientConfig::default(),
        }
    }

    /// Connect to a DE server over TCP
    ///
    /// The stop datagram goes to the same host and port over UDP.
    ///
    /// # Examples
    ///
    /// ```
    /// use deapi::io::builder::ClientBuilder;
    ///
    /// let builder = ClientBuilder::new().tcp("127.0.0.1", 13240);
    /// ```
    pub fn tcp(self, host: impl Into<String>, port: u16) -> ClientBuilder<TcpConfigured> {
        ClientBuilder {
            target: TcpConfigured {
                host: host.into(),
                port,
            },
            config: self.config,
        }
    }

    /// Drive an in-process simulator instead of a network server
    pub fn simulated(self, simulator: Simulator) -> ClientBuilder<LocalConfigured> {
        self.shared_simulator(simulator.into_shared())
    }

    /// Drive a simulator that is shared with a server or other clients
    pub fn shared_simulator(self, simulator: SharedSimulator) -> ClientBuilder<LocalConfigured> {
        ClientBuilder {
            target: LocalConfigured { simulator },
            config: self.config,
        }
    }
}

impl Default for ClientBuilder<Unspecified> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Options (any state)
// ============================================================================

impl<Target> ClientBuilder<Target> {
    /// Replace all settings; the host and port given to `tcp()` still win
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set SO_RCVBUF on the TCP socket
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.config.recv_buffer_size = Some(size);
        self
    }

    /// Force TCP_NODELAY on or off
    pub fn nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = Some(enable);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Receive window before the exposure-dependent part is added
    pub fn base_timeout(mut self, timeout: Duration) -> Self {
        self.config.base_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

// ============================================================================
// Build Methods
// ============================================================================

impl ClientBuilder<TcpConfigured> {
    /// Connect and run the handshake
    ///
    /// # Errors
    ///
    /// Connection failures and any handshake error of [`Client::connect`]
    pub fn build(self) -> Result<Client<TcpTransport>> {
        let mut config = self.config;
        config.host = self.target.host;
        config.port = self.target.port;
        let transport = TcpTransport::connect(&config)?;
        Client::connect(transport, config)
    }
}

impl ClientBuilder<LocalConfigured> {
    /// Attach to the simulator and run the handshake
    pub fn build(self) -> Result<Client<LocalTransport>> {
        let transport = LocalTransport::from_shared(self.target.simulator);
        Client::connect(transport, self.config)
    }
}
