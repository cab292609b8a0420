//! Circuit management
//!
//! A circuit is a cryptographic tunnel to the first hop. It owns the relay
//! crypto state and the streams multiplexed inside it, decrypts and
//! verifies every inbound relay cell, routes it to the addressed stream,
//! and packages outbound stream data under the SENDME windows.

use crate::config::HandshakeKind;
use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand};
use crate::protocol::crypto::{CryptoState, KeyMaterial, TapHandshake};
use crate::protocol::flow_control::CircuitFlowControl;
use crate::protocol::ntor::{parse_created2, NtorHandshake};
use crate::protocol::stream::Stream;
use std::collections::HashMap;

/// Circuit lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Allocated, no handshake sent.
    New,
    /// CREATE2 or CREATE_FAST sent, waiting for the reply.
    Handshaking,
    /// Key material negotiated; relay cells flow.
    Established,
    /// Torn down; the id must not be reused on this link.
    Closed,
}

/// In-flight circuit handshake state.
enum PendingHandshake {
    Ntor(NtorHandshake),
    Tap(TapHandshake),
}

/// Upward notifications produced while handling circuit traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitEvent {
    /// The circuit finished its handshake and is usable.
    Established { circuit: u32 },
    /// A stream got its RELAY_CONNECTED.
    StreamConnected { circuit: u32, stream: u16 },
    /// Stream payload, in arrival order.
    StreamData {
        circuit: u32,
        stream: u16,
        data: Vec<u8>,
    },
    /// A stream ended (RELAY_END, or teardown cascade).
    StreamClosed { circuit: u32, stream: u16 },
    /// The circuit itself is gone; all streams are already closed.
    Closed { circuit: u32 },
}

/// A single one-hop circuit on a link.
pub struct Circuit {
    id: u32,
    state: CircuitState,
    handshake: Option<PendingHandshake>,
    crypto: Option<CryptoState>,
    flow: CircuitFlowControl,
    streams: HashMap<u16, Stream>,
    next_stream_id: u16,
}

impl Circuit {
    /// Construct the circuit and the CREATE cell that opens it.
    ///
    /// For ntor, `relay_id` and `relay_ntor_key` identify the hop; for
    /// CREATE_FAST they are unused.
    pub fn create(
        id: u32,
        kind: HandshakeKind,
        relay_id: [u8; 20],
        relay_ntor_key: [u8; 32],
    ) -> (Self, Cell) {
        let (handshake, cell) = match kind {
            HandshakeKind::Ntor => {
                let hs = NtorHandshake::new(relay_id, relay_ntor_key);
                let cell = Cell::new(id, CellCommand::Create2, hs.create2_payload());
                (PendingHandshake::Ntor(hs), cell)
            }
            HandshakeKind::Fast => {
                let hs = TapHandshake::new();
                let cell = Cell::new(id, CellCommand::CreateFast, hs.payload());
                (PendingHandshake::Tap(hs), cell)
            }
        };

        log::info!("initializing circuit id {}", id);
        let circuit = Self {
            id,
            state: CircuitState::Handshaking,
            handshake: Some(handshake),
            crypto: None,
            flow: CircuitFlowControl::new(),
            streams: HashMap::new(),
            next_stream_id: 1,
        };
        (circuit, cell)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == CircuitState::Established
    }

    /// Handle a cell addressed to this circuit.
    ///
    /// Outbound cells are pushed to `out`; notifications to `events`. An
    /// error return is fatal to this circuit; the caller removes it.
    pub fn handle_cell(
        &mut self,
        cell: Cell,
        out: &mut Vec<Cell>,
        events: &mut Vec<CircuitEvent>,
    ) -> Result<()> {
        match cell.command {
            CellCommand::Created2 => self.on_created2(&cell.payload, events),
            CellCommand::CreatedFast => self.on_created_fast(&cell.payload, events),
            CellCommand::Relay | CellCommand::RelayEarly => {
                self.on_relay(&cell.payload, out, events)
            }
            CellCommand::Destroy => {
                let reason = cell.payload.first().copied().unwrap_or(0);
                log::info!("circuit {}: DESTROY received (reason {})", self.id, reason);
                self.teardown(events);
                Ok(())
            }
            CellCommand::Padding => Ok(()),
            other => {
                log::warn!("circuit {}: unexpected cell {:?}, dropped", self.id, other);
                Ok(())
            }
        }
    }

    fn on_created2(&mut self, payload: &[u8], events: &mut Vec<CircuitEvent>) -> Result<()> {
        let hs = match self.take_handshake()? {
            PendingHandshake::Ntor(hs) => hs,
            PendingHandshake::Tap(_) => {
                return Err(TorError::Handshake(
                    "CREATED2 on a CREATE_FAST circuit".into(),
                ))
            }
        };

        let (server_public, server_auth) = parse_created2(payload)?;
        let key_seed = match hs.complete(&server_public, &server_auth) {
            Ok(seed) => seed,
            Err(e) => {
                // Bad handshake: close quietly, emitting nothing further.
                self.state = CircuitState::Closed;
                return Err(e);
            }
        };

        let material = KeyMaterial::from_ntor_seed(&key_seed)?;
        self.establish(&material, events);
        Ok(())
    }

    fn on_created_fast(&mut self, payload: &[u8], events: &mut Vec<CircuitEvent>) -> Result<()> {
        let hs = match self.take_handshake()? {
            PendingHandshake::Tap(hs) => hs,
            PendingHandshake::Ntor(_) => {
                return Err(TorError::Handshake(
                    "CREATED_FAST on an ntor circuit".into(),
                ))
            }
        };

        let material = match hs.complete(payload) {
            Ok(m) => m,
            Err(e) => {
                self.state = CircuitState::Closed;
                return Err(e);
            }
        };
        self.establish(&material, events);
        Ok(())
    }

    fn take_handshake(&mut self) -> Result<PendingHandshake> {
        if self.state != CircuitState::Handshaking {
            return Err(TorError::Handshake(format!(
                "unexpected CREATED* in state {:?}",
                self.state
            )));
        }
        self.handshake
            .take()
            .ok_or_else(|| TorError::Internal("handshaking circuit without handshake".into()))
    }

    fn establish(&mut self, material: &KeyMaterial, events: &mut Vec<CircuitEvent>) {
        self.crypto = Some(CryptoState::new(material));
        self.state = CircuitState::Established;
        log::info!("established circuit id {}", self.id);
        events.push(CircuitEvent::Established { circuit: self.id });
    }

    fn on_relay(
        &mut self,
        payload: &[u8],
        out: &mut Vec<Cell>,
        events: &mut Vec<CircuitEvent>,
    ) -> Result<()> {
        let relay = {
            let crypto = self
                .crypto
                .as_mut()
                .ok_or_else(|| TorError::Handshake("relay cell before keys".into()))?;
            match crypto.open(payload) {
                Ok(relay) => relay,
                Err(e) => {
                    // Digest failure is fatal to the circuit.
                    self.teardown(events);
                    return Err(e);
                }
            }
        };

        log::debug!(
            "circuit {}: got relay cell {:?} stream={}",
            self.id,
            relay.command,
            relay.stream_id
        );

        match relay.command {
            RelayCommand::Data => self.on_relay_data(relay, out, events),
            RelayCommand::Connected => {
                if let Some(stream) = self.streams.get_mut(&relay.stream_id) {
                    stream.on_connected();
                    events.push(CircuitEvent::StreamConnected {
                        circuit: self.id,
                        stream: relay.stream_id,
                    });
                } else {
                    log::warn!(
                        "circuit {}: CONNECTED for unknown stream {}",
                        self.id,
                        relay.stream_id
                    );
                }
                Ok(())
            }
            RelayCommand::End => {
                if let Some(mut stream) = self.streams.remove(&relay.stream_id) {
                    stream.on_end(relay.data.first().copied());
                    events.push(CircuitEvent::StreamClosed {
                        circuit: self.id,
                        stream: relay.stream_id,
                    });
                }
                Ok(())
            }
            RelayCommand::Sendme => {
                if relay.stream_id == 0 {
                    self.flow.on_sendme();
                } else if let Some(stream) = self.streams.get_mut(&relay.stream_id) {
                    stream.on_sendme();
                }
                // Windows opened; drain whatever was suspended on them.
                self.pump(out)
            }
            RelayCommand::Truncated => {
                log::warn!("circuit {}: TRUNCATED, tearing down", self.id);
                self.teardown(events);
                Ok(())
            }
            other => {
                log::warn!("circuit {}: relay command {:?} dropped", self.id, other);
                Ok(())
            }
        }
    }

    fn on_relay_data(
        &mut self,
        relay: RelayCell,
        out: &mut Vec<Cell>,
        events: &mut Vec<CircuitEvent>,
    ) -> Result<()> {
        // Circuit-level accounting happens whether or not the stream is
        // known; the relay spent circuit window on the cell either way.
        if self.flow.on_deliver() {
            self.queue_relay(RelayCell::new(RelayCommand::Sendme, 0, Vec::new()), out)?;
        }

        let Some(stream) = self.streams.get_mut(&relay.stream_id) else {
            log::warn!(
                "circuit {}: DATA for unknown stream {}, dropped",
                self.id,
                relay.stream_id
            );
            return Ok(());
        };

        let sendme_owed = stream.on_data();
        events.push(CircuitEvent::StreamData {
            circuit: self.id,
            stream: relay.stream_id,
            data: relay.data,
        });

        if sendme_owed {
            let stream_id = stream.id();
            self.queue_relay(RelayCell::new(RelayCommand::Sendme, stream_id, Vec::new()), out)?;
        }
        Ok(())
    }

    /// Open a directory stream; returns the allocated stream id.
    pub fn open_directory_stream(&mut self, out: &mut Vec<Cell>) -> Result<u16> {
        self.require_established()?;
        let id = self.allocate_stream_id()?;
        let mut stream = Stream::new(id);
        let begin = stream.begin_dir()?;
        self.streams.insert(id, stream);
        self.queue_relay(begin, out)?;
        Ok(id)
    }

    /// Open a data stream to `addr:port`; returns the allocated stream id.
    pub fn open_data_stream(&mut self, addr: &str, port: u16, out: &mut Vec<Cell>) -> Result<u16> {
        self.require_established()?;
        let id = self.allocate_stream_id()?;
        let mut stream = Stream::new(id);
        let begin = stream.begin(addr, port)?;
        self.streams.insert(id, stream);
        self.queue_relay(begin, out)?;
        Ok(id)
    }

    /// Queue caller bytes on a stream and flush what the windows allow.
    pub fn send_data(&mut self, stream_id: u16, data: &[u8], out: &mut Vec<Cell>) -> Result<()> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(TorError::StreamClosed(stream_id))?;
        stream.enqueue_data(data)?;
        self.pump(out)
    }

    /// Close one stream, sending RELAY_END.
    pub fn close_stream(&mut self, stream_id: u16, out: &mut Vec<Cell>) -> Result<()> {
        let mut stream = self
            .streams
            .remove(&stream_id)
            .ok_or(TorError::StreamClosed(stream_id))?;
        let end = stream.close()?;
        self.queue_relay(end, out)
    }

    /// Drain suspended outbound data on every stream, oldest stream first,
    /// while the circuit and stream package windows have room.
    fn pump(&mut self, out: &mut Vec<Cell>) -> Result<()> {
        if self.crypto.is_none() {
            return Ok(());
        }

        let mut ids: Vec<u16> = self.streams.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            loop {
                if !self.flow.can_package() {
                    log::debug!("circuit {}: package window closed, suspending", self.id);
                    return Ok(());
                }
                let Some(stream) = self.streams.get_mut(&id) else { break };
                let Some(data_cell) = stream.flush_chunk()? else { break };
                self.flow.on_package()?;
                self.queue_relay(data_cell, out)?;
            }
        }
        Ok(())
    }

    /// Seal a relay cell and queue it on the link.
    fn queue_relay(&mut self, relay: RelayCell, out: &mut Vec<Cell>) -> Result<()> {
        let crypto = self
            .crypto
            .as_mut()
            .ok_or_else(|| TorError::Internal("sealing before keys".into()))?;
        let payload = crypto.seal(&relay)?;
        out.push(Cell::relay(self.id, payload));
        Ok(())
    }

    fn require_established(&self) -> Result<()> {
        if self.state != CircuitState::Established {
            return Err(TorError::Handshake(format!(
                "circuit {} not established",
                self.id
            )));
        }
        Ok(())
    }

    fn allocate_stream_id(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_stream_id;
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            if self.next_stream_id == 0 {
                self.next_stream_id = 1;
            }
            if id != 0 && !self.streams.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(TorError::Internal("no free stream id".into()))
    }

    /// The DESTROY cell for a local close.
    pub fn destroy_cell(&self) -> Cell {
        Cell::new(self.id, CellCommand::Destroy, vec![0])
    }

    /// Tear the circuit down, closing every stream beneath it.
    pub fn teardown(&mut self, events: &mut Vec<CircuitEvent>) {
        if self.state == CircuitState::Closed {
            return;
        }
        self.state = CircuitState::Closed;

        let mut ids: Vec<u16> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(mut stream) = self.streams.remove(&id) {
                if !stream.is_closed() {
                    stream.on_end(None);
                }
                events.push(CircuitEvent::StreamClosed {
                    circuit: self.id,
                    stream: id,
                });
            }
        }
        events.push(CircuitEvent::Closed { circuit: self.id });
    }
}
