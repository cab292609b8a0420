//! End-to-end tests against a scripted in-memory relay.
//!
//! The harness wires a `ProxyCoordinator` to a fake relay that speaks the
//! link handshake, answers CREATE_FAST and CREATE2, and then follows the
//! test's script for relay cells. No network, no reactor: readiness is
//! simulated by pumping bytes across the in-memory wire.

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use tor_dirlink::protocol::{
    kdf_tor, versions_cell, Cell, CellCommand, CellDecoder, CryptoState, KeyMaterial, Netinfo,
    RelayCell, RelayCommand,
};
use tor_dirlink::{
    Authority, ClientConfig, Connector, HandshakeKind, ProxyCoordinator, RequestId, Result,
    StreamEvents, Transport,
};
use x25519_dalek::{PublicKey, StaticSecret};

/// Bytes in flight between the client and the fake relay.
#[derive(Clone, Default)]
struct Wire {
    to_client: Rc<RefCell<VecDeque<u8>>>,
    to_relay: Rc<RefCell<VecDeque<u8>>>,
}

struct MemTransport {
    wire: Wire,
}

impl Transport for MemTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut inbound = self.wire.to_client.borrow_mut();
        let n = buf.len().min(inbound.len());
        for b in buf.iter_mut().take(n) {
            *b = inbound.pop_front().expect("length checked");
        }
        Ok(n)
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.wire.to_relay.borrow_mut().extend(data.iter().copied());
        Ok(data.len())
    }

    fn is_handshaking(&self) -> bool {
        false
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some("192.0.2.10:9001".parse().expect("static addr"))
    }
}

struct MemConnector {
    wire: Wire,
}

impl Connector for MemConnector {
    type Transport = MemTransport;

    fn connect(&mut self, _authority: &Authority) -> Result<MemTransport> {
        Ok(MemTransport {
            wire: self.wire.clone(),
        })
    }
}

/// Records every observer callback.
#[derive(Default)]
struct Recorder {
    connected: Vec<RequestId>,
    closed: Vec<RequestId>,
    recv: Vec<(RequestId, Vec<u8>)>,
}

impl Recorder {
    fn bytes_for(&self, request_id: RequestId) -> Vec<u8> {
        self.recv
            .iter()
            .filter(|(id, _)| *id == request_id)
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }
}

impl StreamEvents for Recorder {
    fn stream_connected(&mut self, request_id: RequestId) {
        self.connected.push(request_id);
    }

    fn stream_recv(&mut self, request_id: RequestId, data: &[u8]) {
        self.recv.push((request_id, data.to_vec()));
    }

    fn stream_closed(&mut self, request_id: RequestId) {
        self.closed.push(request_id);
    }
}

const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// The relay side of the conversation.
struct FakeRelay {
    wire: Wire,
    decoder: CellDecoder,
    identity: [u8; 20],
    ntor_secret: StaticSecret,
    crypto: Option<CryptoState>,
    /// Relay cells from the client, in arrival order.
    inbound_relay: Vec<RelayCell>,
    /// Flip one AUTH bit to simulate a corrupt ntor reply.
    corrupt_auth: bool,
    answered_create: bool,
    /// Circuit id the answered CREATE* rode on.
    created_circuit: Option<u32>,
}

impl FakeRelay {
    fn new(wire: Wire) -> Self {
        Self {
            wire,
            decoder: CellDecoder::new(),
            identity: [0x42; 20],
            ntor_secret: StaticSecret::random_from_rng(OsRng),
            crypto: None,
            inbound_relay: Vec::new(),
            corrupt_auth: false,
            answered_create: false,
            created_circuit: None,
        }
    }

    fn authority(&self) -> Authority {
        fn unpadded(bytes: &[u8]) -> &'static str {
            let mut s = general_purpose::STANDARD.encode(bytes);
            while s.ends_with('=') {
                s.pop();
            }
            Box::leak(s.into_boxed_str())
        }

        Authority {
            name: "testauth",
            ip: "192.0.2.10",
            or_port: 9001,
            identity: unpadded(&self.identity),
            ntor_onion_key: unpadded(PublicKey::from(&self.ntor_secret).as_bytes()),
        }
    }

    fn reply(&mut self, cell: Cell, width: usize) {
        let bytes = cell.encode(width).expect("encodable");
        self.wire.to_client.borrow_mut().extend(bytes);
    }

    /// Push a relay cell to the client through our forward crypto track.
    fn send_relay(&mut self, circuit_id: u32, relay: RelayCell) {
        let payload = self
            .crypto
            .as_mut()
            .expect("circuit established")
            .seal(&relay)
            .expect("sealable");
        self.reply(Cell::relay(circuit_id, payload), 4);
    }

    /// Consume client bytes and answer handshake cells.
    fn pump(&mut self) {
        loop {
            let bytes: Vec<u8> = self.wire.to_relay.borrow_mut().drain(..).collect();
            if bytes.is_empty() {
                break;
            }
            self.decoder.push(&bytes);
        }

        while let Some(cell) = self.decoder.next_cell().expect("well-formed client cell") {
            self.handle(cell);
        }
    }

    fn handle(&mut self, cell: Cell) {
        match cell.command {
            CellCommand::Versions => {
                self.reply(versions_cell(&[3, 4, 5]), 2);
                self.decoder.set_circ_id_len(4);
                self.reply(Cell::new(0, CellCommand::Certs, vec![0x00]), 4);
                self.reply(Cell::new(0, CellCommand::AuthChallenge, vec![0x00; 36]), 4);
                let netinfo = Netinfo {
                    timestamp: 1_700_000_000,
                    other_addr: Some("198.51.100.7".parse().expect("static addr")),
                    my_addrs: vec!["192.0.2.10".parse().expect("static addr")],
                };
                self.reply(Cell::new(0, CellCommand::Netinfo, netinfo.encode()), 4);
            }
            CellCommand::Netinfo => {}
            CellCommand::CreateFast => {
                if self.answered_create {
                    return;
                }
                self.answered_create = true;
                self.created_circuit = Some(cell.circuit_id);

                let mut x = [0u8; 20];
                x.copy_from_slice(&cell.payload[..20]);
                let y = [0x21u8; 20];
                let keys = kdf_tor(&x, &y);

                let mut created = y.to_vec();
                created.extend_from_slice(&keys.kh);
                self.crypto = Some(CryptoState::new(&keys.material.reversed()));
                self.reply(
                    Cell::new(cell.circuit_id, CellCommand::CreatedFast, created),
                    4,
                );
            }
            CellCommand::Create2 => {
                if self.answered_create {
                    return;
                }
                self.answered_create = true;
                self.created_circuit = Some(cell.circuit_id);

                // HTYPE(2) | HLEN(2) | ID(20) | B(32) | X(32)
                assert_eq!(&cell.payload[..2], &2u16.to_be_bytes());
                assert_eq!(&cell.payload[2..4], &84u16.to_be_bytes());
                assert_eq!(&cell.payload[4..24], &self.identity);
                let onion_public = PublicKey::from(&self.ntor_secret);
                assert_eq!(&cell.payload[24..56], onion_public.as_bytes());
                let mut client_public = [0u8; 32];
                client_public.copy_from_slice(&cell.payload[56..88]);
                let client_public = PublicKey::from(client_public);

                let y_secret = StaticSecret::random_from_rng(OsRng);
                let y_public = PublicKey::from(&y_secret);

                let shared_xy = y_secret.diffie_hellman(&client_public);
                let shared_xb = self.ntor_secret.diffie_hellman(&client_public);

                let mut secret_input = Vec::new();
                secret_input.extend_from_slice(shared_xy.as_bytes());
                secret_input.extend_from_slice(shared_xb.as_bytes());
                secret_input.extend_from_slice(&self.identity);
                secret_input.extend_from_slice(onion_public.as_bytes());
                secret_input.extend_from_slice(client_public.as_bytes());
                secret_input.extend_from_slice(y_public.as_bytes());
                secret_input.extend_from_slice(PROTOID);

                let key_seed = hmac_sha256(T_KEY, &secret_input);
                let verify = hmac_sha256(T_VERIFY, &secret_input);

                let mut auth_input = Vec::new();
                auth_input.extend_from_slice(&verify);
                auth_input.extend_from_slice(&self.identity);
                auth_input.extend_from_slice(onion_public.as_bytes());
                auth_input.extend_from_slice(y_public.as_bytes());
                auth_input.extend_from_slice(client_public.as_bytes());
                auth_input.extend_from_slice(PROTOID);
                auth_input.extend_from_slice(b"Server");
                let mut auth = hmac_sha256(T_MAC, &auth_input);

                if self.corrupt_auth {
                    auth[0] ^= 0x01;
                } else {
                    let material = KeyMaterial::from_ntor_seed(&key_seed).expect("expandable");
                    self.crypto = Some(CryptoState::new(&material.reversed()));
                }

                let mut created = 64u16.to_be_bytes().to_vec();
                created.extend_from_slice(y_public.as_bytes());
                created.extend_from_slice(&auth);
                self.reply(Cell::new(cell.circuit_id, CellCommand::Created2, created), 4);
            }
            CellCommand::Relay | CellCommand::RelayEarly => {
                let relay = self
                    .crypto
                    .as_mut()
                    .expect("relay cell before CREATE")
                    .open(&cell.payload)
                    .expect("client digest valid");
                self.inbound_relay.push(relay);
            }
            CellCommand::Destroy | CellCommand::Padding => {}
            other => panic!("relay got unexpected cell {:?}", other),
        }
    }
}

type Coordinator = ProxyCoordinator<MemConnector, Recorder>;

fn setup(handshake: HandshakeKind) -> (Coordinator, FakeRelay) {
    let wire = Wire::default();
    let relay = FakeRelay::new(wire.clone());
    let config = ClientConfig {
        handshake,
        ..ClientConfig::default()
    };
    let coordinator = ProxyCoordinator::with_authority(
        MemConnector { wire },
        config,
        Recorder::default(),
        relay.authority(),
    );
    (coordinator, relay)
}

/// Alternate readiness between the two sides until the wire drains.
fn settle(coordinator: &mut Coordinator, relay: &mut FakeRelay) {
    for _ in 0..8 {
        relay.pump();
        coordinator.on_readable().expect("link healthy");
    }
}

#[test]
fn directory_stream_end_to_end() {
    let (mut coordinator, mut relay) = setup(HandshakeKind::Fast);

    coordinator.open_directory_stream(1).unwrap();
    settle(&mut coordinator, &mut relay);

    // The relay saw exactly one BEGIN_DIR, with an empty payload.
    assert_eq!(relay.inbound_relay.len(), 1);
    let begin = &relay.inbound_relay[0];
    assert_eq!(begin.command, RelayCommand::BeginDir);
    assert!(begin.data.is_empty());
    let stream_id = begin.stream_id;
    let circ = relay_circuit_id(&relay);

    relay.send_relay(
        circ,
        RelayCell::new(RelayCommand::Connected, stream_id, Vec::new()),
    );
    settle(&mut coordinator, &mut relay);
    assert_eq!(coordinator.observer().connected, vec![1]);

    // Caller sends a directory request; the relay sees it as one DATA cell.
    let request = b"GET /tor/status-vote/current/consensus HTTP/1.0\r\n\r\n";
    coordinator.stream_send(1, request).unwrap();
    relay.pump();
    let data_cells: Vec<&RelayCell> = relay
        .inbound_relay
        .iter()
        .filter(|c| c.command == RelayCommand::Data)
        .collect();
    assert_eq!(data_cells.len(), 1);
    assert_eq!(data_cells[0].data, request);

    // 1200 bytes back across three DATA cells arrive as one byte stream.
    let body: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
    for chunk in body.chunks(498) {
        relay.send_relay(
            circ,
            RelayCell::new(RelayCommand::Data, stream_id, chunk.to_vec()),
        );
    }
    settle(&mut coordinator, &mut relay);
    assert_eq!(coordinator.observer().bytes_for(1), body);

    // Clean close from the relay side.
    relay.send_relay(circ, RelayCell::new(RelayCommand::End, stream_id, vec![6]));
    settle(&mut coordinator, &mut relay);
    assert_eq!(coordinator.observer().closed, vec![1]);
}

/// The circuit id the fake relay's crypto rides on: the one the CREATE*
/// cell carried. Recorded when answering it.
fn relay_circuit_id(relay: &FakeRelay) -> u32 {
    relay.created_circuit.expect("CREATE answered")
}

#[test]
fn ntor_directory_stream_connects() {
    let (mut coordinator, mut relay) = setup(HandshakeKind::Ntor);

    coordinator.open_directory_stream(7).unwrap();
    settle(&mut coordinator, &mut relay);

    assert_eq!(relay.inbound_relay.len(), 1);
    let begin = &relay.inbound_relay[0];
    assert_eq!(begin.command, RelayCommand::BeginDir);

    let circ = relay_circuit_id(&relay);
    relay.send_relay(
        circ,
        RelayCell::new(RelayCommand::Connected, begin.stream_id, Vec::new()),
    );
    settle(&mut coordinator, &mut relay);
    assert_eq!(coordinator.observer().connected, vec![7]);
}

#[test]
fn ntor_auth_mismatch_emits_no_relay_cells() {
    let (mut coordinator, mut relay) = setup(HandshakeKind::Ntor);
    relay.corrupt_auth = true;

    coordinator.open_directory_stream(3).unwrap();
    settle(&mut coordinator, &mut relay);

    // The handshake failed: the circuit closed quietly and nothing rode it.
    assert!(relay.inbound_relay.is_empty());
    assert!(coordinator.observer().connected.is_empty());
}

#[test]
fn concurrent_requests_share_one_circuit() {
    let (mut coordinator, mut relay) = setup(HandshakeKind::Fast);

    coordinator.open_directory_stream(10).unwrap();
    coordinator.open_directory_stream(11).unwrap();
    settle(&mut coordinator, &mut relay);

    let begins: Vec<&RelayCell> = relay
        .inbound_relay
        .iter()
        .filter(|c| c.command == RelayCommand::BeginDir)
        .collect();
    assert_eq!(begins.len(), 2);
    assert_ne!(begins[0].stream_id, begins[1].stream_id);
    // One CREATE answered means one circuit carried both.
    assert!(relay.answered_create);
}

#[test]
fn link_loss_closes_every_stream() {
    let (mut coordinator, mut relay) = setup(HandshakeKind::Fast);

    coordinator.open_directory_stream(20).unwrap();
    coordinator.open_directory_stream(21).unwrap();
    settle(&mut coordinator, &mut relay);

    coordinator.on_exceptional().unwrap();
    let mut closed = coordinator.observer().closed.clone();
    closed.sort_unstable();
    assert_eq!(closed, vec![20, 21]);
}

#[test]
fn local_close_sends_relay_end() {
    let (mut coordinator, mut relay) = setup(HandshakeKind::Fast);

    coordinator.open_directory_stream(30).unwrap();
    settle(&mut coordinator, &mut relay);
    let begin_stream = relay.inbound_relay[0].stream_id;
    let circ = relay_circuit_id(&relay);
    relay.send_relay(
        circ,
        RelayCell::new(RelayCommand::Connected, begin_stream, Vec::new()),
    );
    settle(&mut coordinator, &mut relay);

    coordinator.stream_close(30).unwrap();
    relay.pump();

    let end = relay
        .inbound_relay
        .iter()
        .find(|c| c.command == RelayCommand::End)
        .expect("RELAY_END on the wire");
    assert_eq!(end.stream_id, begin_stream);
    assert_eq!(end.data, vec![6]);
    assert_eq!(coordinator.observer().closed, vec![30]);
}
