//! The hub connection state machine and message pump: the piece that sits
//! between a raw bidirectional [`Transport`] and an application hub,
//! speaking whichever [`hc_protocol::HubProtocol`] the handshake negotiated.
//!
//! Construct a connection with [`start_client`] or [`start_server`]; both
//! return a cloneable [`HubConnectionHandle`] for sends/cancellation and a
//! single-consumer [`ReceiveStream`] for inbound messages and pump errors.

pub mod config;
pub mod connection;
pub mod error;
pub(crate) mod keepalive;
pub mod registry;
pub mod transport;

pub use config::HubConnectionOptions;
pub use connection::{start_client, start_server, CloseReason, ConnectionState, HubConnectionHandle, ReceiveStream};
pub use error::HubError;
pub use registry::{InvocationIdGenerator, StreamEvent};
pub use transport::{Transport, TransportReader, TransportWriter};
