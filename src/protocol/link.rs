//! OR connection (link) management
//!
//! A `LinkConn` owns the TLS byte pipe and everything on it: the incoming
//! cell decoder, the link handshake state machine, the outbound cell queue
//! and the circuits multiplexed over the connection.
//!
//! Link handshake, driven by cells on circuit id 0:
//!
//! ```text
//! INIT -> WAIT_VERSIONS -> WAIT_CERTS -> WAIT_AUTHCHAL -> WAIT_NETINFO -> READY
//! ```
//!
//! We send VERSIONS as soon as TLS finishes, pick the highest shared link
//! protocol version, store CERTS and AUTH_CHALLENGE without responding,
//! and answer the relay's NETINFO with our own mirrored one.

use crate::config::ClientConfig;
use crate::error::{ErrorScope, Result, TorError};
use crate::protocol::cell::{
    parse_versions, versions_cell, Cell, CellCommand, CellDecoder,
};
use crate::protocol::circuit::{Circuit, CircuitEvent};
use crate::transport::Transport;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Link handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// TLS not finished yet.
    Init,
    /// VERSIONS sent, waiting for the peer's.
    WaitVersions,
    /// Waiting for CERTS.
    WaitCerts,
    /// Waiting for AUTH_CHALLENGE.
    WaitAuthChallenge,
    /// Waiting for the relay's NETINFO.
    WaitNetinfo,
    /// Operational; cells dispatch to circuits.
    Ready,
    /// Torn down.
    Closed,
}

/// Upward notifications from link processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Link handshake finished; circuits may be opened.
    Ready,
    /// Bubbled circuit/stream notification.
    Circuit(CircuitEvent),
    /// The link itself is gone.
    Closed,
}

/// One OR connection and the circuits on it.
pub struct LinkConn<T: Transport> {
    transport: T,
    decoder: CellDecoder,
    state: LinkState,
    config: ClientConfig,
    /// Negotiated link protocol version (0 before negotiation).
    link_version: u16,
    circuits: HashMap<u32, Circuit>,
    /// Encoded cells waiting for socket writability, in submission order.
    outbound: VecDeque<Vec<u8>>,
    /// Raw CERTS payload, stored unvalidated.
    certs: Option<Vec<u8>>,
    /// Raw AUTH_CHALLENGE payload; we never authenticate back.
    auth_challenge: Option<Vec<u8>>,
    /// Our address as the relay reported it in NETINFO.
    our_addr: Option<IpAddr>,
}

impl<T: Transport> LinkConn<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self {
            transport,
            decoder: CellDecoder::new(),
            state: LinkState::Init,
            config,
            link_version: 0,
            circuits: HashMap::new(),
            outbound: VecDeque::new(),
            certs: None,
            auth_challenge: None,
            our_addr: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    pub fn link_version(&self) -> u16 {
        self.link_version
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Raw CERTS cell payload, if one arrived. Unvalidated; a production
    /// client must verify the chain before trusting the link.
    pub fn certs(&self) -> Option<&[u8]> {
        self.certs.as_deref()
    }

    /// Whether outbound cells or TLS records are waiting on writability.
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty() || self.transport.wants_write()
    }

    /// Kick off the link handshake once TLS reports completion.
    ///
    /// Idempotent: does nothing before the TLS handshake finishes or after
    /// VERSIONS went out.
    pub fn start(&mut self) -> Result<()> {
        if self.state != LinkState::Init || self.transport.is_handshaking() {
            return Ok(());
        }
        log::info!("TLS up, sending VERSIONS {:?}", self.config.link_versions);
        let cell = versions_cell(&self.config.link_versions);
        self.queue_cell(cell)?;
        self.state = LinkState::WaitVersions;
        Ok(())
    }

    /// Readable readiness: drain the transport into the decoder and
    /// dispatch every complete cell.
    ///
    /// An `Err` return means the link is dead; teardown has already run
    /// and its closing events are in `events`.
    pub fn read_ready(&mut self, events: &mut Vec<LinkEvent>) -> Result<()> {
        self.start()?;

        let mut buf = [0u8; 4096];
        loop {
            let n = match self.transport.recv(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    log::warn!("transport read failed: {}", e);
                    self.teardown(events);
                    return Err(e);
                }
            };
            self.decoder.push(&buf[..n]);
        }

        loop {
            let cell = match self.decoder.next_cell() {
                Ok(Some(cell)) => cell,
                Ok(None) => break,
                Err(e) => {
                    log::error!("invalid cell received: {}", e);
                    self.teardown(events);
                    return Err(e);
                }
            };
            // Circuit-fatal errors are resolved inside handle_cell; what
            // propagates out is fatal to the whole link.
            if let Err(e) = self.handle_cell(cell, events) {
                self.teardown(events);
                return Err(e);
            }
        }

        self.flush()?;
        Ok(())
    }

    /// Writable readiness: drain queued cells in submission order.
    pub fn write_ready(&mut self) -> Result<()> {
        self.start()?;
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        while let Some(front) = self.outbound.front_mut() {
            let n = self.transport.send(front)?;
            if n == 0 {
                break;
            }
            if n < front.len() {
                front.drain(..n);
                break;
            }
            self.outbound.pop_front();
        }
        Ok(())
    }

    fn queue_cell(&mut self, cell: Cell) -> Result<()> {
        log::debug!(
            "sending cell {:?} on circuit {}",
            cell.command,
            cell.circuit_id
        );
        let encoded = cell.encode(self.decoder.circ_id_len())?;
        self.outbound.push_back(encoded);
        self.flush()
    }

    fn handle_cell(&mut self, cell: Cell, events: &mut Vec<LinkEvent>) -> Result<()> {
        if cell.circuit_id == 0 {
            return self.handle_link_cell(cell, events);
        }

        // Padding is legal on any circuit id at any point after VERSIONS.
        if matches!(cell.command, CellCommand::Padding | CellCommand::Vpadding) {
            return Ok(());
        }

        if self.state != LinkState::Ready {
            return Err(TorError::Handshake(format!(
                "circuit cell {:?} during link handshake",
                cell.command
            )));
        }

        let circuit_id = cell.circuit_id;
        let Some(circuit) = self.circuits.get_mut(&circuit_id) else {
            log::warn!(
                "cell {:?} for unknown circuit {}, dropped",
                cell.command,
                circuit_id
            );
            return Ok(());
        };

        let mut out = Vec::new();
        let mut circuit_events = Vec::new();
        let result = circuit.handle_cell(cell, &mut out, &mut circuit_events);

        for ev in circuit_events {
            events.push(LinkEvent::Circuit(ev));
        }
        for c in out {
            self.queue_cell(c)?;
        }

        if let Err(e) = result {
            match e.scope() {
                ErrorScope::Circuit => {
                    log::warn!("circuit {} failed: {}", circuit_id, e);
                    // A failed circuit handshake closes quietly: nothing
                    // further goes on the wire, but the owner still hears
                    // about it. Other circuit-fatal errors answer with
                    // DESTROY; their teardown already emitted the events.
                    if matches!(e, TorError::Handshake(_)) {
                        events.push(LinkEvent::Circuit(CircuitEvent::Closed {
                            circuit: circuit_id,
                        }));
                    } else if let Some(c) = self.circuits.get(&circuit_id) {
                        let destroy = c.destroy_cell();
                        self.queue_cell(destroy)?;
                    }
                    self.circuits.remove(&circuit_id);
                    // Resolved here; the link itself stays up.
                    Ok(())
                }
                _ => Err(e),
            }
        } else {
            Ok(())
        }
    }

    fn handle_link_cell(&mut self, cell: Cell, events: &mut Vec<LinkEvent>) -> Result<()> {
        match (self.state, cell.command) {
            (LinkState::WaitVersions, CellCommand::Versions) => {
                let theirs = parse_versions(&cell.payload)?;
                let negotiated = self
                    .config
                    .link_versions
                    .iter()
                    .copied()
                    .filter(|v| theirs.contains(v))
                    .max()
                    .ok_or_else(|| {
                        TorError::Handshake(format!("no shared link version in {:?}", theirs))
                    })?;

                self.link_version = negotiated;
                if negotiated >= 4 {
                    self.decoder.set_circ_id_len(4);
                }
                log::info!("negotiated link protocol version {}", negotiated);
                self.state = LinkState::WaitCerts;
                Ok(())
            }
            (LinkState::WaitCerts, CellCommand::Certs) => {
                log::debug!("got CERTS ({} bytes), stored", cell.payload.len());
                self.certs = Some(cell.payload);
                self.state = LinkState::WaitAuthChallenge;
                Ok(())
            }
            (LinkState::WaitAuthChallenge, CellCommand::AuthChallenge) => {
                log::debug!("got AUTH_CHALLENGE, not authenticating");
                self.auth_challenge = Some(cell.payload);
                self.state = LinkState::WaitNetinfo;
                Ok(())
            }
            (LinkState::WaitNetinfo, CellCommand::Netinfo) => {
                let netinfo = Netinfo::parse(&cell.payload)?;
                log::info!(
                    "got NETINFO: we are {:?}, relay is {:?}",
                    netinfo.other_addr,
                    netinfo.my_addrs.first()
                );
                self.our_addr = netinfo.other_addr;

                // Mirror it back: their address as OTHERADDR, the address
                // they saw us at as ours.
                let their_addr = netinfo
                    .my_addrs
                    .first()
                    .copied()
                    .or_else(|| self.transport.peer_addr().map(|a| a.ip()));
                let reply = Netinfo {
                    timestamp: unix_now(),
                    other_addr: their_addr,
                    my_addrs: self.our_addr.into_iter().collect(),
                };
                self.queue_cell(Cell::new(0, CellCommand::Netinfo, reply.encode()))?;

                self.state = LinkState::Ready;
                log::info!("link ready");
                events.push(LinkEvent::Ready);
                Ok(())
            }
            (_, CellCommand::Padding | CellCommand::Vpadding) => Ok(()),
            (state, command) => Err(TorError::Handshake(format!(
                "unexpected {:?} in link state {:?}",
                command, state
            ))),
        }
    }

    /// Open a circuit toward the given relay; returns its id. Completion is
    /// asynchronous: the caller observes `CircuitEvent::Established`.
    pub fn open_circuit(&mut self, relay_id: [u8; 20], relay_ntor_key: [u8; 32]) -> Result<u32> {
        if self.state != LinkState::Ready {
            return Err(TorError::Handshake("link not ready".into()));
        }

        // The originator sets the high bit; re-draw on collision.
        let mut id = rand::random::<u32>() | 0x8000_0000;
        while self.circuits.contains_key(&id) {
            id = rand::random::<u32>() | 0x8000_0000;
        }

        let (circuit, create) = Circuit::create(
            id,
            self.config.handshake,
            relay_id,
            relay_ntor_key,
        );
        self.circuits.insert(id, circuit);
        self.queue_cell(create)?;
        Ok(id)
    }

    /// First established circuit on this link, if any.
    pub fn established_circuit(&self) -> Option<u32> {
        let mut ids: Vec<u32> = self
            .circuits
            .values()
            .filter(|c| c.is_established())
            .map(|c| c.id())
            .collect();
        ids.sort_unstable();
        ids.first().copied()
    }

    /// Open a directory stream on a circuit; returns the stream id.
    pub fn open_directory_stream(&mut self, circuit_id: u32) -> Result<u16> {
        self.with_circuit(circuit_id, |circuit, out| circuit.open_directory_stream(out))
    }

    /// Open a data stream to `addr:port`; returns the stream id.
    pub fn open_data_stream(&mut self, circuit_id: u32, addr: &str, port: u16) -> Result<u16> {
        self.with_circuit(circuit_id, |circuit, out| {
            circuit.open_data_stream(addr, port, out)
        })
    }

    /// Send caller bytes on a stream.
    pub fn send_stream_data(&mut self, circuit_id: u32, stream_id: u16, data: &[u8]) -> Result<()> {
        self.with_circuit(circuit_id, |circuit, out| {
            circuit.send_data(stream_id, data, out)
        })
    }

    /// Close a stream with RELAY_END.
    pub fn close_stream(&mut self, circuit_id: u32, stream_id: u16) -> Result<()> {
        self.with_circuit(circuit_id, |circuit, out| circuit.close_stream(stream_id, out))
    }

    /// Close a circuit with DESTROY, cascading to its streams.
    pub fn close_circuit(&mut self, circuit_id: u32, events: &mut Vec<LinkEvent>) -> Result<()> {
        let Some(mut circuit) = self.circuits.remove(&circuit_id) else {
            return Ok(());
        };
        let destroy = circuit.destroy_cell();
        let mut circuit_events = Vec::new();
        circuit.teardown(&mut circuit_events);
        for ev in circuit_events {
            events.push(LinkEvent::Circuit(ev));
        }
        self.queue_cell(destroy)
    }

    fn with_circuit<R>(
        &mut self,
        circuit_id: u32,
        f: impl FnOnce(&mut Circuit, &mut Vec<Cell>) -> Result<R>,
    ) -> Result<R> {
        let circuit = self
            .circuits
            .get_mut(&circuit_id)
            .ok_or_else(|| TorError::Internal(format!("no circuit {}", circuit_id)))?;

        let mut out = Vec::new();
        let result = f(circuit, &mut out)?;
        for cell in out {
            self.queue_cell(cell)?;
        }
        Ok(result)
    }

    /// Tear down the link and everything beneath it.
    pub fn teardown(&mut self, events: &mut Vec<LinkEvent>) {
        if self.state == LinkState::Closed {
            return;
        }
        self.state = LinkState::Closed;
        log::info!("link closed, tearing down {} circuit(s)", self.circuits.len());

        let mut ids: Vec<u32> = self.circuits.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(mut circuit) = self.circuits.remove(&id) {
                let mut circuit_events = Vec::new();
                circuit.teardown(&mut circuit_events);
                for ev in circuit_events {
                    events.push(LinkEvent::Circuit(ev));
                }
            }
        }
        events.push(LinkEvent::Closed);
    }
}

/// Seconds since the epoch, truncated the way the cell carries it.
fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// NETINFO cell body.
///
/// ```text
/// TIME(4) | OTHERADDR | N(1) | MYADDR...
/// addr = ATYPE(1) ALEN(1) AVAL(ALEN), ATYPE 4 = IPv4, 6 = IPv6
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Netinfo {
    pub timestamp: u32,
    /// The address of the *other* side: in the relay's cell, that is us.
    pub other_addr: Option<IpAddr>,
    /// The sender's own addresses.
    pub my_addrs: Vec<IpAddr>,
}

impl Netinfo {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 5 {
            return Err(TorError::Cell("NETINFO too short".into()));
        }
        let timestamp = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let mut pos = 4;

        let other_addr = Self::parse_addr(payload, &mut pos)?;

        let count = *payload
            .get(pos)
            .ok_or_else(|| TorError::Cell("NETINFO truncated".into()))? as usize;
        pos += 1;

        let mut my_addrs = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(addr) = Self::parse_addr(payload, &mut pos)? {
                my_addrs.push(addr);
            }
        }

        Ok(Self {
            timestamp,
            other_addr,
            my_addrs,
        })
    }

    fn parse_addr(payload: &[u8], pos: &mut usize) -> Result<Option<IpAddr>> {
        let atype = *payload
            .get(*pos)
            .ok_or_else(|| TorError::Cell("NETINFO address truncated".into()))?;
        let alen = *payload
            .get(*pos + 1)
            .ok_or_else(|| TorError::Cell("NETINFO address truncated".into()))?
            as usize;
        *pos += 2;

        let bytes = payload
            .get(*pos..*pos + alen)
            .ok_or_else(|| TorError::Cell("NETINFO address truncated".into()))?;
        *pos += alen;

        let addr = match (atype, alen) {
            (4, 4) => {
                let v4: [u8; 4] = bytes.try_into().expect("length checked");
                Some(IpAddr::from(v4))
            }
            (6, 16) => {
                let v6: [u8; 16] = bytes.try_into().expect("length checked");
                Some(IpAddr::from(v6))
            }
            // Unknown address type: skip it.
            _ => None,
        };
        Ok(addr)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 8 + 1 + self.my_addrs.len() * 18);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        Self::encode_addr(&mut buf, self.other_addr);
        buf.push(self.my_addrs.len() as u8);
        for addr in &self.my_addrs {
            Self::encode_addr(&mut buf, Some(*addr));
        }
        buf
    }

    fn encode_addr(buf: &mut Vec<u8>, addr: Option<IpAddr>) {
        match addr {
            Some(IpAddr::V4(v4)) => {
                buf.push(4);
                buf.push(4);
                buf.extend_from_slice(&v4.octets());
            }
            Some(IpAddr::V6(v6)) => {
                buf.push(6);
                buf.push(16);
                buf.extend_from_slice(&v6.octets());
            }
            None => {
                buf.push(4);
                buf.push(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use std::collections::VecDeque;
    use std::net::SocketAddr;

    /// In-memory transport: the test plays the relay side.
    pub struct MemTransport {
        pub inbound: VecDeque<u8>,
        pub outbound: Vec<u8>,
        pub handshaking: bool,
    }

    impl MemTransport {
        pub fn new() -> Self {
            Self {
                inbound: VecDeque::new(),
                outbound: Vec::new(),
                handshaking: false,
            }
        }
    }

    impl Transport for MemTransport {
        fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(self.inbound.len());
            for b in buf.iter_mut().take(n) {
                *b = self.inbound.pop_front().expect("length checked");
            }
            Ok(n)
        }

        fn send(&mut self, data: &[u8]) -> Result<usize> {
            self.outbound.extend_from_slice(data);
            Ok(data.len())
        }

        fn is_handshaking(&self) -> bool {
            self.handshaking
        }

        fn wants_write(&self) -> bool {
            false
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            Some("192.0.2.10:9001".parse().expect("static addr"))
        }
    }

    fn feed<TR: Transport>(link: &mut LinkConn<TR>, cell: &Cell, width: usize) -> Vec<LinkEvent> {
        let bytes = cell.encode(width).unwrap();
        let mut events = Vec::new();
        // Push straight into the decoder via the transport.
        link.decoder.push(&bytes);
        loop {
            match link.decoder.next_cell() {
                Ok(Some(c)) => link.handle_cell(c, &mut events).unwrap(),
                Ok(None) => break,
                Err(e) => panic!("decode: {}", e),
            }
        }
        events
    }

    fn handshake_to_ready(link: &mut LinkConn<MemTransport>) -> Vec<LinkEvent> {
        link.start().unwrap();
        assert_eq!(link.state(), LinkState::WaitVersions);

        let mut events = Vec::new();
        events.extend(feed(link, &versions_cell(&[3, 4, 5]), 2));
        assert_eq!(link.state(), LinkState::WaitCerts);
        assert_eq!(link.link_version(), 5);

        events.extend(feed(
            link,
            &Cell::new(0, CellCommand::Certs, vec![0x00]),
            4,
        ));
        events.extend(feed(
            link,
            &Cell::new(0, CellCommand::AuthChallenge, vec![0x00; 36]),
            4,
        ));
        assert_eq!(link.state(), LinkState::WaitNetinfo);

        let netinfo = Netinfo {
            timestamp: 1_700_000_000,
            other_addr: Some("198.51.100.7".parse().unwrap()),
            my_addrs: vec!["192.0.2.10".parse().unwrap()],
        };
        events.extend(feed(
            link,
            &Cell::new(0, CellCommand::Netinfo, netinfo.encode()),
            4,
        ));
        assert_eq!(link.state(), LinkState::Ready);
        events
    }

    #[test]
    fn versions_sent_on_start() {
        let mut link = LinkConn::new(MemTransport::new(), ClientConfig::default());
        link.start().unwrap();
        // VERSIONS with 2-byte circuit id: 00 00 07 00 06 0003 0004 0005
        assert_eq!(
            link.transport.outbound,
            vec![0x00, 0x00, 0x07, 0x00, 0x06, 0x00, 0x03, 0x00, 0x04, 0x00, 0x05]
        );
    }

    #[test]
    fn start_waits_for_tls() {
        let mut transport = MemTransport::new();
        transport.handshaking = true;
        let mut link = LinkConn::new(transport, ClientConfig::default());
        link.start().unwrap();
        assert_eq!(link.state(), LinkState::Init);
        assert!(link.transport.outbound.is_empty());
    }

    #[test]
    fn full_link_handshake_reaches_ready() {
        let mut link = LinkConn::new(MemTransport::new(), ClientConfig::default());
        let events = handshake_to_ready(&mut link);
        assert!(events.contains(&LinkEvent::Ready));

        // Our NETINFO went out after theirs: mirror of addresses.
        let sent = link.transport.outbound.clone();
        // Skip the VERSIONS cell (11 bytes).
        let netinfo_wire = &sent[11..];
        // 4-byte circuit id now.
        assert_eq!(netinfo_wire[..4], [0, 0, 0, 0]);
        assert_eq!(netinfo_wire[4], CellCommand::Netinfo as u8);
        let reply = Netinfo::parse(&netinfo_wire[5..]).unwrap();
        assert_eq!(reply.other_addr, Some("192.0.2.10".parse().unwrap()));
        assert_eq!(reply.my_addrs, vec!["198.51.100.7".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn no_shared_version_is_fatal() {
        let mut link = LinkConn::new(MemTransport::new(), ClientConfig::default());
        link.start().unwrap();

        let bytes = versions_cell(&[1, 2]).encode(2).unwrap();
        link.decoder.push(&bytes);
        let cell = link.decoder.next_cell().unwrap().unwrap();
        let mut events = Vec::new();
        assert!(matches!(
            link.handle_cell(cell, &mut events),
            Err(TorError::Handshake(_))
        ));
    }

    #[test]
    fn open_circuit_requires_ready() {
        let mut link = LinkConn::new(MemTransport::new(), ClientConfig::default());
        assert!(link.open_circuit([0u8; 20], [0u8; 32]).is_err());
    }

    #[test]
    fn open_circuit_sets_high_bit_and_sends_create2() {
        let mut link = LinkConn::new(MemTransport::new(), ClientConfig::default());
        handshake_to_ready(&mut link);
        link.transport.outbound.clear();

        let id = link.open_circuit([7u8; 20], [8u8; 32]).unwrap();
        assert_ne!(id & 0x8000_0000, 0);

        let wire = &link.transport.outbound;
        assert_eq!(&wire[..4], &id.to_be_bytes());
        assert_eq!(wire[4], CellCommand::Create2 as u8);
    }

    #[test]
    fn netinfo_round_trip_v6() {
        let n = Netinfo {
            timestamp: 42,
            other_addr: Some("2001:db8::1".parse().unwrap()),
            my_addrs: vec!["192.0.2.1".parse().unwrap(), "2001:db8::2".parse().unwrap()],
        };
        let parsed = Netinfo::parse(&n.encode()).unwrap();
        assert_eq!(parsed, n);
    }

    #[test]
    fn cells_before_ready_close_the_link() {
        let mut link = LinkConn::new(MemTransport::new(), ClientConfig::default());
        link.start().unwrap();

        // A NETINFO in WAIT_VERSIONS is a protocol violation.
        let bytes = Cell::new(0, CellCommand::Netinfo, vec![0; 8]).encode(2).unwrap();
        link.decoder.push(&bytes);
        let cell = link.decoder.next_cell().unwrap().unwrap();
        let mut events = Vec::new();
        assert!(link.handle_cell(cell, &mut events).is_err());
    }
}
