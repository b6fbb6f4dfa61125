//! Client library and simulator for the DE camera server protocol
//!
//! A DE server controls a direct electron detector. Clients talk to it over
//! TCP with length-prefixed protobuf envelopes: one command, one
//! acknowledgment. Image results follow their acknowledgment as a data
//! header and a raw little-endian payload. A UDP datagram on the same port
//! stops a running acquisition from any thread.
//!
//! # Quick Start
//!
//! **Client:**
//! ```no_run
//! use deapi::io::ClientBuilder;
//! use deapi::protocol::{FrameType, PixelFormat};
//!
//! let mut client = ClientBuilder::new().tcp("127.0.0.1", 13240).build()?;
//!
//! client.set_property("Frames Per Second", 200)?;
//! client.start_acquisition(10, false)?;
//! let result = client.get_result(FrameType::SumTotal, PixelFormat::Auto, None, None)?;
//! println!("{:?} frame, {:?}", result.image.shape(), result.pixel_format);
//! # Ok::<(), deapi::DeError>(())
//! ```
//!
//! **Simulator:**
//! ```no_run
//! use deapi::io::SimulatorServer;
//! use deapi::simulator::Simulator;
//!
//! let shared = Simulator::with_defaults()?.into_shared();
//! SimulatorServer::bind("127.0.0.1:13241", shared)?.serve()?;
//! # Ok::<(), deapi::DeError>(())
//! ```
//!
//! **Without sockets:**
//! ```
//! use deapi::io::ClientBuilder;
//! use deapi::simulator::Simulator;
//!
//! let mut client = ClientBuilder::new()
//!     .simulated(Simulator::with_defaults()?)
//!     .build()?;
//! assert_eq!(client.current_camera(), "Fake Test Camera");
//! # Ok::<(), deapi::DeError>(())
//! ```
//!
//! # Module Structure
//!
//! - **`protocol`** - Wire format
//!   - `packet` - prost envelope schema
//!   - `codec` - typed parameters, framing, decoding
//!   - `opcode` - opcodes and protocol version negotiation
//!   - `schema` - versioned `GET_RESULT` field layout
//!   - `types` - frame types, pixel formats, attributes, images
//!
//! - **`io`** - Transports, the client and the simulator servers
//!
//! - **`simulator`** - Property table, expressions and synthetic scan data
//!
//! - **`error`** - [`DeError`] and [`Result`]
//!
//! - **`logging`** - Opt-in `tracing` subscriber setup
//!
//! # Error Handling
//!
//! Every operation returns `Result<T, DeError>`. Errors for which
//! [`DeError::is_fatal`] is true (I/O, version mismatch, undecodable or
//! oversized envelopes, short reads) disconnect the client; the rest leave it usable.
//!
//! ```no_run
//! use deapi::io::ClientBuilder;
//! use deapi::DeError;
//!
//! let mut client = ClientBuilder::new().tcp("127.0.0.1", 13240).build()?;
//! match client.get_property("Not A Property") {
//!     Ok(value) => println!("{}", value),
//!     Err(DeError::Server(msg)) => eprintln!("server refused: {}", msg),
//!     Err(e) => return Err(e),
//! }
//! # Ok::<(), deapi::DeError>(())
//! ```

pub mod error;
pub mod io;
pub mod logging;
pub mod protocol;
pub mod simulator;

// Re-export commonly used types
pub use error::{DeError, Result};
