//! Directory-stream coordination
//!
//! The coordinator sits between the caller and the link: it lazily opens a
//! single OR connection to the first configured authority, opens one
//! circuit on it, and multiplexes every directory-stream request onto that
//! circuit. Requests arriving while the link or circuit is still
//! handshaking are queued and drained the moment the circuit establishes.
//!
//! Callers address streams by request id; the mapping to (circuit, stream)
//! ids stays in here. Upward notifications go through [`StreamEvents`].

use crate::authorities::{Authority, AUTHORITIES};
use crate::config::ClientConfig;
use crate::error::{Result, TorError};
use crate::protocol::CircuitEvent;
use crate::protocol::{LinkConn, LinkEvent};
use crate::reactor::{Mask, Reactor, EXCEPTIONAL, READABLE, WRITABLE};
use crate::transport::{Connector, Transport};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// Caller-chosen handle for one directory-stream request.
pub type RequestId = u64;

/// Upward notifications about directory streams.
pub trait StreamEvents {
    /// The stream's RELAY_CONNECTED arrived; data may be sent.
    fn stream_connected(&mut self, request_id: RequestId);

    /// Stream payload, delivered in arrival order without cell framing.
    fn stream_recv(&mut self, request_id: RequestId, data: &[u8]);

    /// The stream ended, cleanly or through a teardown cascade.
    fn stream_closed(&mut self, request_id: RequestId);
}

/// Opens and multiplexes directory streams over a single lazy link.
pub struct ProxyCoordinator<C: Connector, E: StreamEvents> {
    connector: C,
    config: ClientConfig,
    observer: E,
    authority: Authority,
    link: Option<LinkConn<C::Transport>>,
    /// The one circuit requests ride on, once established.
    circuit: Option<u32>,
    /// Circuit in handshake, when one is in flight.
    circuit_pending: Option<u32>,
    /// Requests waiting for the circuit.
    queued: VecDeque<RequestId>,
    /// (circuit, stream) -> request
    requests: HashMap<(u32, u16), RequestId>,
    /// request -> (circuit, stream)
    streams: HashMap<RequestId, (u32, u16)>,
}

impl<C: Connector, E: StreamEvents> ProxyCoordinator<C, E> {
    /// The coordinator always talks to the first configured authority.
    pub fn new(connector: C, config: ClientConfig, observer: E) -> Self {
        Self::with_authority(connector, config, observer, AUTHORITIES[0].clone())
    }

    /// Talk to a specific authority instead of the first configured one.
    pub fn with_authority(
        connector: C,
        config: ClientConfig,
        observer: E,
        authority: Authority,
    ) -> Self {
        Self {
            connector,
            config,
            observer,
            authority,
            link: None,
            circuit: None,
            circuit_pending: None,
            queued: VecDeque::new(),
            requests: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    pub fn observer(&self) -> &E {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut E {
        &mut self.observer
    }

    /// Request a directory stream.
    ///
    /// Creates the link on first use; the request is queued until the
    /// circuit establishes, then opens as a BEGIN_DIR stream.
    pub fn open_directory_stream(&mut self, request_id: RequestId) -> Result<()> {
        if self.link.is_none() {
            log::info!("no link yet, connecting to {}", self.authority.name);
            let transport = self.connector.connect(&self.authority)?;
            let mut link = LinkConn::new(transport, self.config.clone());
            // TLS may already be up for loopback transports.
            link.start()?;
            self.link = Some(link);
            self.queued.push_back(request_id);
            return Ok(());
        }

        if let Some(circuit) = self.circuit {
            return self.dispatch_request(circuit, request_id);
        }

        self.queued.push_back(request_id);
        self.maybe_open_circuit()?;
        Ok(())
    }

    /// Send caller bytes down an open directory stream.
    pub fn stream_send(&mut self, request_id: RequestId, data: &[u8]) -> Result<()> {
        let (circuit, stream) = *self
            .streams
            .get(&request_id)
            .ok_or_else(|| TorError::Internal(format!("unknown request {}", request_id)))?;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| TorError::Transport("no link".into()))?;
        link.send_stream_data(circuit, stream, data)
    }

    /// Close a directory stream with RELAY_END.
    pub fn stream_close(&mut self, request_id: RequestId) -> Result<()> {
        let (circuit, stream) = *self
            .streams
            .get(&request_id)
            .ok_or_else(|| TorError::Internal(format!("unknown request {}", request_id)))?;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| TorError::Transport("no link".into()))?;
        link.close_stream(circuit, stream)?;
        self.unmap(request_id);
        self.observer.stream_closed(request_id);
        Ok(())
    }

    /// Readable readiness on the link's descriptor.
    pub fn on_readable(&mut self) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        let mut events = Vec::new();
        let result = link.read_ready(&mut events);
        self.process_events(events)?;
        if let Err(e) = result {
            self.drop_link();
            return Err(e);
        }
        // The link handshake may just have finished.
        self.maybe_open_circuit()?;
        Ok(())
    }

    /// Writable readiness on the link's descriptor.
    pub fn on_writable(&mut self) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        link.write_ready()?;
        self.maybe_open_circuit()?;
        Ok(())
    }

    /// Exceptional readiness: the link is gone.
    pub fn on_exceptional(&mut self) -> Result<()> {
        if let Some(link) = self.link.as_mut() {
            let mut events = Vec::new();
            link.teardown(&mut events);
            self.process_events(events)?;
        }
        self.drop_link();
        Ok(())
    }

    fn maybe_open_circuit(&mut self) -> Result<()> {
        if self.queued.is_empty() || self.circuit.is_some() || self.circuit_pending.is_some() {
            return Ok(());
        }
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        if !link.is_ready() {
            return Ok(());
        }

        let relay_id = self.authority.identity_fingerprint()?;
        let ntor_key = self.authority.ntor_key()?;
        let id = link.open_circuit(relay_id, ntor_key)?;
        log::info!("opened circuit {} for {} queued request(s)", id, self.queued.len());
        self.circuit_pending = Some(id);
        Ok(())
    }

    fn process_events(&mut self, events: Vec<LinkEvent>) -> Result<()> {
        for event in events {
            match event {
                LinkEvent::Ready => {
                    log::info!("link to {} ready", self.authority.name);
                    self.maybe_open_circuit()?;
                }
                LinkEvent::Circuit(ev) => self.process_circuit_event(ev)?,
                LinkEvent::Closed => {
                    self.fail_all_requests();
                }
            }
        }
        Ok(())
    }

    fn process_circuit_event(&mut self, event: CircuitEvent) -> Result<()> {
        match event {
            CircuitEvent::Established { circuit } => {
                log::info!("circuit {} established, draining queue", circuit);
                self.circuit = Some(circuit);
                self.circuit_pending = None;
                while let Some(request_id) = self.queued.pop_front() {
                    self.dispatch_request(circuit, request_id)?;
                }
            }
            CircuitEvent::StreamConnected { circuit, stream } => {
                if let Some(&request_id) = self.requests.get(&(circuit, stream)) {
                    self.observer.stream_connected(request_id);
                }
            }
            CircuitEvent::StreamData {
                circuit,
                stream,
                data,
            } => {
                if let Some(&request_id) = self.requests.get(&(circuit, stream)) {
                    self.observer.stream_recv(request_id, &data);
                }
            }
            CircuitEvent::StreamClosed { circuit, stream } => {
                if let Some(request_id) = self.requests.remove(&(circuit, stream)) {
                    self.streams.remove(&request_id);
                    self.observer.stream_closed(request_id);
                }
            }
            CircuitEvent::Closed { circuit } => {
                if self.circuit == Some(circuit) {
                    self.circuit = None;
                }
                if self.circuit_pending == Some(circuit) {
                    self.circuit_pending = None;
                }
            }
        }
        Ok(())
    }

    fn dispatch_request(&mut self, circuit: u32, request_id: RequestId) -> Result<()> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| TorError::Transport("no link".into()))?;
        let stream = link.open_directory_stream(circuit)?;
        log::info!(
            "request {} -> circuit {} stream {}",
            request_id,
            circuit,
            stream
        );
        self.requests.insert((circuit, stream), request_id);
        self.streams.insert(request_id, (circuit, stream));
        Ok(())
    }

    fn unmap(&mut self, request_id: RequestId) {
        if let Some(key) = self.streams.remove(&request_id) {
            self.requests.remove(&key);
        }
    }

    /// Everything under a dead link is closed, queued requests included.
    fn fail_all_requests(&mut self) {
        for (_, request_id) in self.requests.drain() {
            self.streams.remove(&request_id);
            self.observer.stream_closed(request_id);
        }
        for request_id in std::mem::take(&mut self.queued) {
            self.observer.stream_closed(request_id);
        }
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.circuit = None;
        self.circuit_pending = None;
        self.fail_all_requests();
    }
}

impl<C, E> ProxyCoordinator<C, E>
where
    C: Connector,
    C::Transport: AsRawFd,
    E: StreamEvents,
{
    /// Keep the link's reactor registration in step with what it wants.
    pub fn update_registration(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        let Some(link) = self.link.as_ref() else {
            return Ok(());
        };
        let fd = link.transport().as_raw_fd();
        let mut mask = READABLE | EXCEPTIONAL;
        if link.wants_write() || link.transport().is_handshaking() {
            mask |= WRITABLE;
        }
        reactor.register(fd, mask)
    }

    /// One reactor turn: poll, then feed readiness into the link.
    ///
    /// Transport errors tear the link down and surface here after the
    /// cascade has notified every affected stream.
    pub fn pump(&mut self, reactor: &mut dyn Reactor, timeout: Option<Duration>) -> Result<()> {
        self.update_registration(reactor)?;

        let Some(link) = self.link.as_ref() else {
            return Ok(());
        };
        let fd = link.transport().as_raw_fd();

        for (ready_fd, mask) in reactor.poll(timeout)? {
            if ready_fd != fd {
                continue;
            }
            let result = self.dispatch_readiness(mask);
            if self.link.is_none() {
                reactor.unregister(fd)?;
            }
            result?;
            if self.link.is_none() {
                break;
            }
        }

        if self.link.is_some() {
            self.update_registration(reactor)?;
        }
        Ok(())
    }

    fn dispatch_readiness(&mut self, mask: Mask) -> Result<()> {
        if mask & EXCEPTIONAL != 0 {
            return self.on_exceptional();
        }
        if mask & READABLE != 0 {
            self.on_readable()?;
        }
        if mask & WRITABLE != 0 {
            if self.link.is_some() {
                self.on_writable()?;
            }
        }
        Ok(())
    }
}
