//! Stream management
//!
//! A stream is a logical bidirectional byte pipe multiplexed inside a
//! circuit. Outbound bytes are fragmented into RELAY_DATA payloads and
//! queued; the owning circuit drains the queue as the stream and circuit
//! package windows allow, so a closed window suspends the stream rather
//! than dropping data.

use crate::error::{Result, TorError};
use crate::protocol::cell::{RelayCell, RelayCommand};
use crate::protocol::flow_control::StreamFlowControl;
use std::collections::VecDeque;

/// RELAY_END reason: stream finished normally.
pub const END_REASON_DONE: u8 = 6;

/// Stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Allocated, nothing sent yet.
    New,
    /// RELAY_BEGIN or RELAY_BEGIN_DIR sent, waiting for RELAY_CONNECTED.
    Connecting,
    /// RELAY_CONNECTED received; data may flow.
    Open,
    /// RELAY_END sent or received.
    Closed,
}

/// One logical stream within a circuit.
pub struct Stream {
    id: u16,
    state: StreamState,
    flow: StreamFlowControl,
    /// Outbound chunks (each at most 498 bytes) waiting for window room.
    pending: VecDeque<Vec<u8>>,
}

impl Stream {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            state: StreamState::New,
            flow: StreamFlowControl::new(id),
            pending: VecDeque::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Build the RELAY_BEGIN cell for a data stream to `addr:port`.
    ///
    /// Payload: `"<addr>:<port>\0"` followed by a 4-byte flags word (zero).
    pub fn begin(&mut self, addr: &str, port: u16) -> Result<RelayCell> {
        self.check_can_open()?;
        let mut payload = format!("{}:{}\0", addr, port).into_bytes();
        payload.extend_from_slice(&0u32.to_be_bytes());

        self.state = StreamState::Connecting;
        log::info!("stream {}: RELAY_BEGIN to {}:{}", self.id, addr, port);
        Ok(RelayCell::new(RelayCommand::Begin, self.id, payload))
    }

    /// Build the RELAY_BEGIN_DIR cell for a directory stream.
    pub fn begin_dir(&mut self) -> Result<RelayCell> {
        self.check_can_open()?;
        self.state = StreamState::Connecting;
        log::info!("stream {}: RELAY_BEGIN_DIR", self.id);
        Ok(RelayCell::new(RelayCommand::BeginDir, self.id, Vec::new()))
    }

    fn check_can_open(&self) -> Result<()> {
        match self.state {
            StreamState::New => Ok(()),
            StreamState::Closed => Err(TorError::StreamClosed(self.id)),
            _ => Err(TorError::Internal(format!(
                "stream {} already opened",
                self.id
            ))),
        }
    }

    /// Queue caller bytes for sending, fragmented into relay-sized chunks.
    ///
    /// The circuit drains the queue as windows permit.
    pub fn enqueue_data(&mut self, data: &[u8]) -> Result<()> {
        if self.state == StreamState::Closed {
            return Err(TorError::StreamClosed(self.id));
        }
        for chunk in data.chunks(RelayCell::MAX_DATA_SIZE) {
            self.pending.push_back(chunk.to_vec());
        }
        Ok(())
    }

    /// Whether outbound chunks are waiting and the stream window has room.
    pub fn can_flush(&self) -> bool {
        self.state == StreamState::Open && !self.pending.is_empty() && self.flow.can_package()
    }

    /// Pop the next chunk as a RELAY_DATA cell, charging the stream window.
    ///
    /// Callers must have charged the circuit window first; the chunk stays
    /// queued when the stream window is empty.
    pub fn flush_chunk(&mut self) -> Result<Option<RelayCell>> {
        if !self.can_flush() {
            return Ok(None);
        }
        self.flow.on_package()?;
        let chunk = self
            .pending
            .pop_front()
            .ok_or_else(|| TorError::Internal("flushable stream had no chunk".into()))?;
        Ok(Some(RelayCell::new(RelayCommand::Data, self.id, chunk)))
    }

    /// RELAY_CONNECTED arrived.
    pub fn on_connected(&mut self) {
        log::info!("stream {}: connected", self.id);
        self.state = StreamState::Open;
    }

    /// Inbound RELAY_DATA accounted against the deliver window.
    ///
    /// Returns `true` when a stream-level SENDME is owed.
    pub fn on_data(&mut self) -> bool {
        self.flow.on_deliver()
    }

    /// Inbound stream-level SENDME.
    pub fn on_sendme(&mut self) {
        self.flow.on_sendme();
    }

    /// RELAY_END arrived; the id is released by the circuit.
    pub fn on_end(&mut self, reason: Option<u8>) {
        log::info!(
            "stream {}: closed by peer (reason {})",
            self.id,
            reason.unwrap_or(0)
        );
        self.state = StreamState::Closed;
        self.pending.clear();
    }

    /// Close locally: emits the RELAY_END cell to send.
    pub fn close(&mut self) -> Result<RelayCell> {
        if self.state == StreamState::Closed {
            return Err(TorError::StreamClosed(self.id));
        }
        self.state = StreamState::Closed;
        self.pending.clear();
        Ok(RelayCell::new(
            RelayCommand::End,
            self.id,
            vec![END_REASON_DONE],
        ))
    }
}
