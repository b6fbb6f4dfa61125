//! Network I/O for the DE server protocol
//!
//! The blocking [`Client`] runs over any [`Transport`]: [`TcpTransport`] for a
//! real server or [`LocalTransport`] for an in-process simulator. The
//! simulator servers expose a [`Simulator`](crate::simulator::Simulator) over
//! TCP and UDP, blocking or on tokio.

pub mod async_server;
pub mod builder;
pub mod bulk;
pub mod client;
pub mod config;
pub mod groups;
pub mod local;
pub mod server;
pub mod transport;

pub use async_server::{AsyncSimulatorConnection, AsyncSimulatorServer};
pub use builder::ClientBuilder;
pub use client::{Client, ResultFrame};
pub use config::{ClientConfig, DEFAULT_PORT};
pub use groups::PropertyGroups;
pub use local::LocalTransport;
pub use server::{SimulatorConnection, SimulatorServer};
pub use transport::{StopHandle, TcpTransport, Transport};
