//! Socket table and listener over `std::net`.
//!
//! The same code runs on the host and on ESP-IDF, whose lwIP port backs the
//! standard library's TCP types. All sockets are non-blocking. Inbound
//! connections are accepted, and data is moved between the kernel and the
//! per-socket buffers, whenever the host looks at a socket.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use super::{ConnStatus, Listener, Socket, SocketState, SocketSummary, SocketTable};
use crate::protocol::MAX_CONNECTIONS;

/// Receive data buffered per socket before the stack is left to hold it.
pub const RX_BUFFER_SIZE: usize = 2048;

/// Send data a socket accepts from the host ahead of the stack.
pub const TX_BUFFER_SIZE: usize = 2920;

const READ_CHUNK: usize = 512;

struct PortListener {
    listener: TcpListener,
    port: u16,
    protocol: u8,
    remote_ip: Ipv4Addr,
    max_connections: u8,
}

type Registry = Arc<Mutex<Vec<PortListener>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, Vec<PortListener>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Listening sockets, shared with the [`TcpSockets`] that accepts from them.
pub struct TcpListeners {
    registry: Registry,
}

impl TcpListeners {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A socket table accepting connections from these listeners.
    pub fn sockets(&self) -> TcpSockets {
        TcpSockets {
            sockets: (0..MAX_CONNECTIONS as u8).map(TcpSocket::new).collect(),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Ports currently listened on.
    pub fn ports(&self) -> Vec<u16> {
        lock(&self.registry).iter().map(|l| l.port).collect()
    }
}

impl Default for TcpListeners {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener for TcpListeners {
    fn listen(
        &mut self,
        remote_ip: Ipv4Addr,
        port: u16,
        protocol: u8,
        max_connections: u8,
    ) -> bool {
        if max_connections == 0 {
            self.stop_listening(port);
            return true;
        }

        let mut registry = lock(&self.registry);
        if let Some(existing) = registry.iter_mut().find(|l| l.port == port) {
            existing.protocol = protocol;
            existing.remote_ip = remote_ip;
            existing.max_connections = max_connections;
            return true;
        }

        let bound = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .and_then(|listener| listener.set_nonblocking(true).map(|_| listener));
        match bound {
            Ok(listener) => {
                info!(
                    "Listening on port {} (protocol {}, max {} connections)",
                    port, protocol, max_connections
                );
                registry.push(PortListener {
                    listener,
                    port,
                    protocol,
                    remote_ip,
                    max_connections,
                });
                true
            }
            Err(e) => {
                warn!("Failed to listen on port {}: {}", port, e);
                false
            }
        }
    }

    fn stop_listening(&mut self, port: u16) {
        let mut registry = lock(&self.registry);
        if port == 0 {
            registry.clear();
        } else {
            registry.retain(|l| l.port != port);
        }
        info!("Stopped listening on port {}", port);
    }
}

/// One TCP connection slot.
pub struct TcpSocket {
    number: u8,
    state: SocketState,
    stream: Option<TcpStream>,
    rx: Vec<u8>,
    tx: Vec<u8>,
    local_port: u16,
    remote_port: u16,
    remote_ip: Ipv4Addr,
}

impl TcpSocket {
    fn new(number: u8) -> Self {
        Self {
            number,
            state: SocketState::Free,
            stream: None,
            rx: Vec::new(),
            tx: Vec::new(),
            local_port: 0,
            remote_port: 0,
            remote_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    fn attach(&mut self, stream: TcpStream, local_port: u16, remote: SocketAddrV4) {
        self.state = SocketState::Connected;
        self.stream = Some(stream);
        self.rx.clear();
        self.tx.clear();
        self.local_port = local_port;
        self.remote_port = remote.port();
        self.remote_ip = *remote.ip();
    }

    fn release(&mut self, state: SocketState) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.rx.clear();
        self.tx.clear();
        self.state = state;
    }

    fn is_active(&self) -> bool {
        !matches!(self.state, SocketState::Free | SocketState::Aborted)
    }

    /// Move queued data to the stack and received data into the buffer.
    fn service(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        while !self.tx.is_empty() {
            match stream.write(&self.tx) {
                Ok(0) => break,
                Ok(n) => {
                    self.tx.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Socket {} send failed: {}", self.number, e);
                    self.release(SocketState::Aborted);
                    return;
                }
            }
        }

        if self.state == SocketState::ClosePending {
            if self.tx.is_empty() {
                debug!("Socket {} closed after flush", self.number);
                self.release(SocketState::Free);
            }
            return;
        }

        let mut chunk = [0u8; READ_CHUNK];
        while self.state == SocketState::Connected && self.rx.len() < RX_BUFFER_SIZE {
            let room = (RX_BUFFER_SIZE - self.rx.len()).min(READ_CHUNK);
            match stream.read(&mut chunk[..room]) {
                Ok(0) => {
                    debug!("Socket {}: other end closed", self.number);
                    self.state = SocketState::OtherEndClosed;
                }
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Socket {} receive failed: {}", self.number, e);
                    self.release(SocketState::Aborted);
                    return;
                }
            }
        }
    }
}

impl Socket for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.rx.len());
        buf[..n].copy_from_slice(&self.rx[..n]);
        self.rx.drain(..n);
        if self.state == SocketState::OtherEndClosed && self.rx.is_empty() {
            self.state = SocketState::CloseReady;
        }
        n
    }

    fn can_write(&self) -> usize {
        match self.state {
            SocketState::Connected | SocketState::OtherEndClosed => {
                TX_BUFFER_SIZE.saturating_sub(self.tx.len())
            }
            _ => 0,
        }
    }

    fn write(&mut self, data: &[u8], push: bool, close_after: bool) -> usize {
        let n = data.len().min(self.can_write());
        self.tx.extend_from_slice(&data[..n]);
        if let (true, Some(stream)) = (push, self.stream.as_ref()) {
            let _ = stream.set_nodelay(true);
        }
        if close_after && n == data.len() {
            self.state = SocketState::ClosePending;
        }
        self.service();
        n
    }

    fn close(&mut self) {
        if self.stream.is_none() {
            self.state = SocketState::Free;
            return;
        }
        self.state = SocketState::ClosePending;
        self.service();
    }

    fn terminate(&mut self, external: bool) {
        if self.is_active() {
            debug!("Socket {} terminated (external: {})", self.number, external);
        }
        self.release(SocketState::Free);
    }

    fn status(&self) -> ConnStatus {
        ConnStatus {
            state: self.state.code(),
            socket: self.number,
            bytes_available: self.rx.len().min(u16::MAX as usize) as u16,
            write_buffer_space: self.can_write().min(u16::MAX as usize) as u16,
            local_port: self.local_port,
            remote_port: self.remote_port,
            remote_ip: self.remote_ip,
        }
    }
}

/// Fixed table of [`TcpSocket`]s fed by a [`TcpListeners`].
pub struct TcpSockets {
    sockets: Vec<TcpSocket>,
    registry: Registry,
}

impl TcpSockets {
    /// Accept every pending inbound connection that has a free slot.
    fn accept_pending(&mut self) {
        let registry = lock(&self.registry);
        for port in registry.iter() {
            loop {
                let (stream, peer) = match port.listener.accept() {
                    Ok(accepted) => accepted,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("Accept on port {} failed: {}", port.port, e);
                        break;
                    }
                };
                let SocketAddr::V4(peer) = peer else {
                    continue;
                };
                if !port.remote_ip.is_unspecified() && *peer.ip() != port.remote_ip {
                    debug!("Rejected {} on port {}", peer, port.port);
                    continue;
                }
                let in_use = self
                    .sockets
                    .iter()
                    .filter(|s| s.is_active() && s.local_port == port.port)
                    .count();
                if in_use >= port.max_connections as usize {
                    debug!("Port {} at its connection limit", port.port);
                    continue;
                }
                let Some(slot) = self.sockets.iter_mut().find(|s| !s.is_active()) else {
                    warn!("No free socket for {}", peer);
                    continue;
                };
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!("Socket setup failed for {}: {}", peer, e);
                    continue;
                }
                info!("Socket {}: accepted {} on port {}", slot.number, peer, port.port);
                slot.attach(stream, port.port, peer);
            }
        }
    }

    fn service_all(&mut self) {
        self.accept_pending();
        for socket in &mut self.sockets {
            socket.service();
        }
    }
}

impl SocketTable for TcpSockets {
    fn socket(&mut self, number: u8) -> Option<&mut dyn Socket> {
        self.service_all();
        self.sockets
            .get_mut(number as usize)
            .map(|s| s as &mut dyn Socket)
    }

    fn terminate_all(&mut self) {
        for socket in &mut self.sockets {
            socket.terminate(false);
        }
    }

    fn summary(&self) -> SocketSummary {
        let mut summary = SocketSummary::default();
        for socket in &self.sockets {
            match socket.state {
                SocketState::Connected => summary.connected |= 1 << socket.number,
                SocketState::OtherEndClosed | SocketState::CloseReady => {
                    summary.other_end_closed |= 1 << socket.number
                }
                _ => {}
            }
        }
        summary
    }

    fn report(&self) {
        for socket in &self.sockets {
            info!(
                "Socket {}: {:?} {}:{} local {} rx {} tx {}",
                socket.number,
                socket.state,
                socket.remote_ip,
                socket.remote_port,
                socket.local_port,
                socket.rx.len(),
                socket.tx.len()
            );
        }
    }
}
