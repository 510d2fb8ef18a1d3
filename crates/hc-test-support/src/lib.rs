//! Shared test harness for `hc-protocol`/`hc-core` integration tests: an
//! in-memory duplex [`hc_core::Transport`] so a full client/server
//! handshake-plus-pump can run without a real socket, the same role
//! `rt-test-utils`'s `MockWsClient` plays for the teacher's websocket
//! integration tests.

mod duplex_transport;

pub use duplex_transport::{connected_pair, DuplexTransport};
