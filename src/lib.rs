//! A multi-protocol network server framework: one cooperative,
//! single-threaded reactor hosting many TCP/UDP/ICMP/RAW/pipe server
//! instances behind a shared socket abstraction.
//!
//! The reactor itself lives in [`runtime`]; everything else is the
//! machinery it's built from:
//!
//! - [`socket`] / [`buffer`] -- the per-connection object and its byte
//!   buffers (§4.1/§4.3).
//! - [`transport`] -- the TCP/UDP/ICMP/RAW/pipe variants sharing that
//!   object (§4.4/§4.5).
//! - [`registry`] -- the id-indexed, insertion-ordered socket table
//!   (§4.2).
//! - [`portcfg`] / [`binding`] -- declarative port configuration and the
//!   manager that resolves it to listeners, merging and shadowing
//!   `INADDR_ANY` as needed (§4.7).
//! - [`detect`] -- protocol detection on freshly accepted streams (§4.6).
//! - [`rate`] -- flood points and per-peer connect-frequency limiting
//!   (§4.8).
//! - [`server`] -- named server-type registration and the configuration
//!   schema builder.
//! - [`signals`] -- the OS signal plane (§4.10).
//! - [`loader`] -- the dynamic server-type loader (§4.11).
//! - [`error`] -- the crate-wide error taxonomy.
//!
//! None of these hold a `mio::Poll`; only [`runtime::Runtime`] does, so
//! every OS-registration decision funnels through one place.

pub mod binding;
pub mod buffer;
pub mod containers;
pub mod detect;
pub mod error;
pub mod loader;
pub mod portcfg;
pub mod rate;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod signals;
pub mod socket;
pub mod transport;

pub use error::{Error, Result};
pub use runtime::Runtime;
pub use server::{ConnectFn, DetectFn, NotifyFn, ResetFn, ServerRegistry, ServerType};
pub use socket::{Socket, SocketId};
