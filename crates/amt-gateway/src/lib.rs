//! # AMT Gateway
//!
//! Receive side of Automatic Multicast Tunneling.
//!
//! A [`Session`] reads a multicast stream natively and, when the local
//! network delivers nothing, tunnels it through an AMT relay:
//!
//! 1. [`RelayResolver`] turns the configured relay into candidate addresses
//! 2. [`HandshakeEngine`] runs discovery and request against one candidate
//! 3. the group is joined and the [`RefreshScheduler`] keeps the relay informed
//! 4. Multicast Data is unwrapped and handed to the caller as [`Block`]s
//!
//! ## Example
//!
//! ```no_run
//! use amt_gateway::{GatewayConfig, Session};
//!
//! # async fn example() -> Result<(), amt_gateway::GatewayError> {
//! let locator = "amt://198.51.100.7@232.1.2.3:5000".parse()?;
//! let mut session = Session::open(GatewayConfig::default(), locator).await?;
//!
//! while let Ok(block) = session.recv().await {
//!     println!("{} bytes", block.data.len());
//! }
//! session.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod handshake;
pub mod probe;
pub mod refresh;
pub mod resolver;
pub mod session;
pub mod stats;
pub mod tunnel;

pub use config::{DEFAULT_RELAY, DEFAULT_STREAM_PORT, GatewayConfig, StreamLocator};
pub use error::{GatewayError, HandshakeStage};
pub use handshake::{HandshakeEngine, HandshakeOutcome, HandshakeState};
pub use probe::{ProbeReport, probe_relays};
pub use refresh::{RefreshScheduler, UpdateState};
pub use resolver::RelayResolver;
pub use session::{Block, Mode, Session};
pub use stats::SessionStats;
pub use tunnel::Tunnel;
