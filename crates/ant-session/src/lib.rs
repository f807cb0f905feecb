//! Blocking host-side driver for ANT radios and the ANT-FS protocol
//!
//! A [`Session`] owns a [`Transport`] and a background reader thread. It hands
//! out [`Channel`] and [`Network`] handles whose calls block until the device
//! answers, and a [`Host`] drives one channel through the ANT-FS handshake.
//!
//! # Features
//!
//! - Request/reply correlation with per-message retry policies
//! - Buffered broadcast, acknowledged and burst reception
//! - ANT-FS search, link, pairing and authentication
//!
//! The `ant-replay` binary decodes captured traffic with the same codec.

mod channel;
mod host;
mod session;
mod transport;

pub use channel::{Channel, Network};
pub use host::{Discovered, Host, HostError};
pub use session::{DataKind, Reply, Request, Session};
pub use transport::{Transport, TransportError};
