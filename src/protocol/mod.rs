//! Tor protocol implementation
//!
//! The wire protocol layers, leaves first:
//! - Cell framing and the incremental decoder
//! - Circuit handshakes (ntor and CREATE_FAST) and relay crypto
//! - SENDME flow control
//! - Streams, circuits, and the OR connection itself

mod cell;
mod circuit;
mod crypto;
mod flow_control;
mod link;
mod ntor;
mod stream;

pub use cell::{
    parse_versions, versions_cell, Cell, CellCommand, CellDecoder, RelayCell, RelayCommand,
};
pub use circuit::{Circuit, CircuitEvent, CircuitState};
pub use crypto::{kdf_tor, CryptoState, KeyMaterial, TapHandshake, TapKeys};
pub use flow_control::{CircuitFlowControl, StreamFlowControl};
pub use link::{LinkConn, LinkEvent, LinkState, Netinfo};
pub use ntor::{parse_created2, NtorHandshake, HTYPE_NTOR, PROTOID};
pub use stream::{Stream, StreamState, END_REASON_DONE};
