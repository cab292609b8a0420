//! Tor cell protocol
//!
//! Implements the cell format for communication with relays. Cells are the
//! basic unit of communication on the link: fixed-length cells carry a
//! 509-byte payload, variable-length cells a 2-byte length plus payload.
//!
//! The circuit-id width depends on the negotiated link protocol version:
//! 2 bytes until VERSIONS is exchanged, 4 bytes from version 4 on. VERSIONS
//! itself always uses the 2-byte form because it predates negotiation.

use crate::error::{Result, TorError};

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - used for padding
    Padding = 0,
    /// CREATE - create a circuit (deprecated)
    Create = 1,
    /// CREATED - circuit created (deprecated)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - fast circuit creation
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created
    CreatedFast = 6,
    /// VERSIONS - negotiate link protocol version
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell that can carry extensions
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// PADDING_NEGOTIATE - negotiate padding
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Whether this command uses the variable-length cell form.
    pub fn is_variable_length(self) -> bool {
        self == CellCommand::Versions || (self as u8) >= 128
    }
}

/// A cell on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (0 for link-level cells)
    pub circuit_id: u32,

    /// Command
    pub command: CellCommand,

    /// Payload; padded to 509 bytes on the wire for fixed-length commands
    pub payload: Vec<u8>,
}

impl Cell {
    /// Payload size for fixed-length cells
    pub const PAYLOAD_SIZE: usize = 509;

    /// Create a new cell
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a RELAY cell
    pub fn relay(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::Relay, relay_payload)
    }

    /// Serialize to wire bytes.
    ///
    /// `circ_id_len` is the negotiated circuit-id width (2 or 4). VERSIONS
    /// always uses 2 bytes regardless.
    pub fn encode(&self, circ_id_len: usize) -> Result<Vec<u8>> {
        let id_len = if self.command == CellCommand::Versions {
            2
        } else {
            circ_id_len
        };

        let mut buf = Vec::with_capacity(id_len + 1 + 2 + self.payload.len().max(Self::PAYLOAD_SIZE));
        match id_len {
            2 => {
                if self.circuit_id > u16::MAX as u32 {
                    return Err(TorError::Cell(format!(
                        "circuit id {} does not fit 2 bytes",
                        self.circuit_id
                    )));
                }
                buf.extend_from_slice(&(self.circuit_id as u16).to_be_bytes());
            }
            4 => buf.extend_from_slice(&self.circuit_id.to_be_bytes()),
            n => return Err(TorError::Internal(format!("bad circuit id width {}", n))),
        }

        buf.push(self.command as u8);

        if self.command.is_variable_length() {
            if self.payload.len() > u16::MAX as usize {
                return Err(TorError::Cell(format!(
                    "variable cell payload too long: {}",
                    self.payload.len()
                )));
            }
            buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
            buf.extend_from_slice(&self.payload);
        } else {
            if self.payload.len() > Self::PAYLOAD_SIZE {
                return Err(TorError::Cell(format!(
                    "fixed cell payload too long: {}",
                    self.payload.len()
                )));
            }
            buf.extend_from_slice(&self.payload);
            buf.resize(id_len + 1 + Self::PAYLOAD_SIZE, 0);
        }

        Ok(buf)
    }
}

/// A cell whose header has been consumed but whose payload has not fully
/// arrived yet. Carried across decoder calls.
#[derive(Debug, Clone)]
struct PartialCell {
    circuit_id: u32,
    command: CellCommand,
    /// Payload length once known; variable-length cells learn it from the
    /// 2-byte length field, which may itself still be in flight.
    length: Option<usize>,
}

/// Incremental cell decoder.
///
/// Callers feed raw bytes with [`CellDecoder::push`] and drain complete
/// cells with [`CellDecoder::next_cell`] until it returns `None`. Header
/// and payload may arrive on different calls; the partial state composes
/// them.
#[derive(Debug)]
pub struct CellDecoder {
    buf: Vec<u8>,
    partial: Option<PartialCell>,
    circ_id_len: usize,
}

impl CellDecoder {
    /// New decoder in pre-negotiation mode (2-byte circuit ids).
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            partial: None,
            circ_id_len: 2,
        }
    }

    /// Switch the circuit-id width after version negotiation.
    pub fn set_circ_id_len(&mut self, len: usize) {
        debug_assert!(len == 2 || len == 4);
        self.circ_id_len = len;
    }

    /// Negotiated circuit-id width in effect.
    pub fn circ_id_len(&self) -> usize {
        self.circ_id_len
    }

    /// Append raw bytes from the transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed into a cell.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Try to assemble the next complete cell.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A command byte outside
    /// the known set fails with a cell error; the caller closes the link.
    pub fn next_cell(&mut self) -> Result<Option<Cell>> {
        // Phase 1: header (circuit id + command).
        if self.partial.is_none() {
            let header_len = self.circ_id_len + 1;
            if self.buf.len() < header_len {
                return Ok(None);
            }

            let circuit_id = match self.circ_id_len {
                2 => u16::from_be_bytes([self.buf[0], self.buf[1]]) as u32,
                _ => u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]),
            };
            let cmd_byte = self.buf[self.circ_id_len];
            let command = CellCommand::from_u8(cmd_byte)
                .ok_or_else(|| TorError::Cell(format!("unknown command: {}", cmd_byte)))?;

            self.buf.drain(..header_len);
            self.partial = Some(PartialCell {
                circuit_id,
                command,
                length: if command.is_variable_length() {
                    None
                } else {
                    Some(Cell::PAYLOAD_SIZE)
                },
            });
        }

        // Phase 2: variable-length cells carry their payload length next.
        if let Some(partial) = self.partial.as_mut() {
            if partial.length.is_none() {
                if self.buf.len() < 2 {
                    return Ok(None);
                }
                let length = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
                self.buf.drain(..2);
                partial.length = Some(length);
            }
        }

        // Phase 3: payload.
        let needed = self
            .partial
            .as_ref()
            .and_then(|p| p.length)
            .ok_or_else(|| TorError::Internal("partial cell without length".into()))?;
        if self.buf.len() < needed {
            return Ok(None);
        }

        let partial = self
            .partial
            .take()
            .ok_or_else(|| TorError::Internal("partial cell vanished".into()))?;
        let payload: Vec<u8> = self.buf.drain(..needed).collect();

        Ok(Some(Cell {
            circuit_id: partial.circuit_id,
            command: partial.command,
            payload,
        }))
    }
}

impl Default for CellDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - relay data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (deprecated)
    Extend = 6,
    /// EXTENDED - circuit extended (deprecated)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - drop cell
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory connection
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// Relay cell (inner framing of a RELAY cell's 509-byte payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized (zero when the cell is addressed to us)
    pub recognized: u16,

    /// Stream ID (0 for circuit-level commands)
    pub stream_id: u16,

    /// Digest (4 bytes of the rolling SHA-1)
    pub digest: [u8; 4],

    /// Data (up to 498 bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Relay header: command(1) + recognized(2) + stream id(2) + digest(4) + length(2)
    pub const HEADER_SIZE: usize = 11;

    /// Maximum data per relay cell
    pub const MAX_DATA_SIZE: usize = Cell::PAYLOAD_SIZE - Self::HEADER_SIZE;

    /// Create a new relay cell with a zeroed digest.
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= Self::MAX_DATA_SIZE);
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Serialize into a full 509-byte relay payload, zero padded.
    pub fn to_payload(&self) -> Result<[u8; Cell::PAYLOAD_SIZE]> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::Cell(format!(
                "relay data too long: {}",
                self.data.len()
            )));
        }

        let mut buf = [0u8; Cell::PAYLOAD_SIZE];
        buf[0] = self.command as u8;
        buf[1..3].copy_from_slice(&self.recognized.to_be_bytes());
        buf[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[5..9].copy_from_slice(&self.digest);
        buf[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf[11..11 + self.data.len()].copy_from_slice(&self.data);
        Ok(buf)
    }

    /// Parse from a decrypted 509-byte relay payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::HEADER_SIZE {
            return Err(TorError::Cell("relay cell too short".into()));
        }

        let command = RelayCommand::from_u8(payload[0])
            .ok_or_else(|| TorError::Cell(format!("unknown relay command: {}", payload[0])))?;
        let recognized = u16::from_be_bytes([payload[1], payload[2]]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let digest = [payload[5], payload[6], payload[7], payload[8]];
        let length = u16::from_be_bytes([payload[9], payload[10]]) as usize;

        if length > Self::MAX_DATA_SIZE || Self::HEADER_SIZE + length > payload.len() {
            return Err(TorError::Cell(format!("relay cell length {} truncated", length)));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: payload[Self::HEADER_SIZE..Self::HEADER_SIZE + length].to_vec(),
        })
    }
}

/// Build a VERSIONS cell advertising the given link protocol versions.
pub fn versions_cell(versions: &[u16]) -> Cell {
    let mut payload = Vec::with_capacity(versions.len() * 2);
    for v in versions {
        payload.extend_from_slice(&v.to_be_bytes());
    }
    Cell::new(0, CellCommand::Versions, payload)
}

/// Parse the version list out of a VERSIONS cell payload.
pub fn parse_versions(payload: &[u8]) -> Result<Vec<u16>> {
    if payload.len() % 2 != 0 {
        return Err(TorError::Cell("odd VERSIONS payload length".into()));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}
