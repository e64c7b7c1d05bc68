//! Telemetry channel: owns the glove socket, decodes packets, and publishes the
//! latest snapshot to any number of readers.
//!
//! The latest snapshot is an `Arc<Snapshot>` swapped under a mutex, so readers
//! see the old or the new value and never a partial one. Each reader owns a
//! bounded(1) crossbeam "doorbell" that the receive loop rings after every
//! publish; `wait_for_update` blocks on it with a timeout.

use crate::packet::{decode_binary, decode_json_line, LineBuffer};
use crate::types::{SessionClock, Snapshot};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Socket read timeout; bounds how long a disconnect waits for the loop.
pub const READ_TIMEOUT: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DATAGRAM: usize = 1024;

pub const DEFAULT_UDP_BIND: &str = "0.0.0.0:8888";
pub const DEFAULT_TCP_HOST: &str = "192.168.4.1:8888";

#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
    /// Listen for binary records, one per datagram.
    Udp { bind: String },
    /// Connect to the glove and read newline-delimited JSON.
    Tcp { connect: String },
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Udp {
            bind: DEFAULT_UDP_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub accepted: u64,
    pub dropped: u64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    latest: Mutex<Option<Arc<Snapshot>>>,
    generation: AtomicU64,
    doorbells: Mutex<Vec<Sender<()>>>,
    status: Mutex<String>,
    connected: AtomicBool,
    accepted: AtomicU64,
    dropped: AtomicU64,
    local_addr: Mutex<Option<SocketAddr>>,
    tcp: Mutex<Option<TcpStream>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            latest: Mutex::new(None),
            generation: AtomicU64::new(0),
            doorbells: Mutex::new(Vec::new()),
            status: Mutex::new("Stopped".to_string()),
            connected: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            local_addr: Mutex::new(None),
            tcp: Mutex::new(None),
        }
    }

    fn publish(&self, snapshot: Snapshot) {
        *lock(&self.latest) = Some(Arc::new(snapshot));
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.ring();
    }

    fn drop_packet(&self, reason: &dyn std::fmt::Display) {
        let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("Dropped packet #{}: {}", n, reason);
    }

    /// Wake every reader. A full doorbell already has a pending wake-up.
    fn ring(&self) {
        lock(&self.doorbells)
            .retain(|tx| !matches!(tx.try_send(()), Err(TrySendError::Disconnected(_))));
    }

    fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        debug!("Telemetry status: {}", status);
        *lock(&self.status) = status;
    }

    fn subscribe(self: &Arc<Self>) -> TelemetryReader {
        let (tx, rx) = bounded(1);
        lock(&self.doorbells).push(tx);
        TelemetryReader {
            seen: AtomicU64::new(self.generation.load(Ordering::Acquire)),
            shared: Arc::clone(self),
            updates: rx,
        }
    }
}

/// Read side of the channel. Each reader tracks its own "new data" state.
pub struct TelemetryReader {
    shared: Arc<Shared>,
    updates: Receiver<()>,
    seen: AtomicU64,
}

impl TelemetryReader {
    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        lock(&self.shared.latest).clone()
    }

    /// Block until a snapshot newer than the last one this reader was told
    /// about lands, or `timeout` elapses. Disconnect wakes the wait early
    /// and returns `false`.
    pub fn wait_for_update(&self, timeout: Duration) -> bool {
        // Drain before sampling the generation. A ring that lands after the
        // sample belongs to data we will see on the next call, not a stale wake.
        while self.updates.try_recv().is_ok() {}
        if self.take_new() {
            return true;
        }
        let _ = self.updates.recv_timeout(timeout);
        self.take_new()
    }

    fn take_new(&self) -> bool {
        let current = self.shared.generation.load(Ordering::Acquire);
        self.seen.swap(current, Ordering::AcqRel) != current
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn status(&self) -> String {
        lock(&self.shared.status).clone()
    }
}

/// Owns the socket and the background receive loop.
pub struct TelemetryChannel {
    transport: Transport,
    shared: Arc<Shared>,
    reader: TelemetryReader,
    clock: SessionClock,
    handle: Option<JoinHandle<()>>,
}

impl TelemetryChannel {
    pub fn new(transport: Transport, clock: SessionClock) -> Self {
        let shared = Arc::new(Shared::new());
        let reader = shared.subscribe();
        Self {
            transport,
            shared,
            reader,
            clock,
            handle: None,
        }
    }

    /// Start the receive loop. No-op while already connected.
    pub fn connect(&mut self) {
        if self.is_connected() {
            return;
        }
        self.join_loop();

        self.shared.connected.store(true, Ordering::Release);
        self.shared.set_status("Connecting...");

        let shared = Arc::clone(&self.shared);
        let transport = self.transport.clone();
        let clock = self.clock.clone();
        let spawned = thread::Builder::new()
            .name("telemetry-rx".into())
            .spawn(move || {
                match &transport {
                    Transport::Udp { bind } => run_udp(&shared, bind, &clock),
                    Transport::Tcp { connect } => run_tcp(&shared, connect, &clock),
                }
                *lock(&shared.tcp) = None;
                *lock(&shared.local_addr) = None;
                shared.connected.store(false, Ordering::Release);
                shared.ring();
            });

        match spawned {
            Ok(h) => self.handle = Some(h),
            Err(e) => {
                self.shared.connected.store(false, Ordering::Release);
                self.shared.set_status(format!("Error: {}", e));
            }
        }
    }

    /// Stop the receive loop. Returns within one read timeout.
    pub fn disconnect(&mut self) {
        self.shared.connected.store(false, Ordering::Release);
        if let Some(stream) = lock(&self.shared.tcp).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.shared.ring();
        self.join_loop();
        self.shared.set_status("Stopped");
        info!("Telemetry channel stopped");
    }

    /// Connect if stopped, disconnect if running.
    pub fn toggle(&mut self) {
        if self.is_connected() {
            self.disconnect();
        } else {
            self.connect();
        }
    }

    fn join_loop(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn status(&self) -> String {
        lock(&self.shared.status).clone()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            accepted: self.shared.accepted.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Address the UDP socket is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }

    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.reader.latest_snapshot()
    }

    pub fn wait_for_update(&self, timeout: Duration) -> bool {
        self.reader.wait_for_update(timeout)
    }

    /// A new independent reader, e.g. for the scheduler thread.
    pub fn reader(&self) -> TelemetryReader {
        self.shared.subscribe()
    }

    /// Install a snapshot through the same path as the receive loop.
    pub fn publish(&self, snapshot: Snapshot) {
        self.shared.publish(snapshot);
    }
}

impl Drop for TelemetryChannel {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.disconnect();
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn run_udp(shared: &Shared, bind: &str, clock: &SessionClock) {
    let socket = match UdpSocket::bind(bind) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to bind UDP {}: {}", bind, e);
            shared.set_status(format!("Error: bind {}: {}", bind, e));
            return;
        }
    };
    if let Err(e) = socket.set_read_timeout(Some(READ_TIMEOUT)) {
        shared.set_status(format!("Error: {}", e));
        return;
    }
    let local = socket.local_addr().ok();
    *lock(&shared.local_addr) = local;
    info!("Listening for glove packets on {:?}", local);
    shared.set_status(format!("Listening on {}", bind));

    let mut buf = [0u8; MAX_DATAGRAM];
    while shared.connected.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((n, _from)) => match decode_binary(&buf[..n], clock.now_us()) {
                Ok(snap) => shared.publish(snap),
                Err(e) => shared.drop_packet(&e),
            },
            Err(ref e) if is_timeout(e) => continue,
            Err(e) => {
                warn!("UDP receive error: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn run_tcp(shared: &Shared, addr: &str, clock: &SessionClock) {
    let target = match addr.to_socket_addrs().map(|mut a| a.next()) {
        Ok(Some(a)) => a,
        Ok(None) => {
            shared.set_status(format!("Error: no address for {}", addr));
            return;
        }
        Err(e) => {
            shared.set_status(format!("Error: {}: {}", addr, e));
            return;
        }
    };

    info!("Connecting to glove at {}...", target);
    let mut stream = match TcpStream::connect_timeout(&target, CONNECT_TIMEOUT) {
        Ok(s) => s,
        Err(e) => {
            warn!("Glove connection to {} failed: {}", target, e);
            shared.set_status(format!("Error: connect {}: {}", target, e));
            return;
        }
    };
    if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        shared.set_status(format!("Error: {}", e));
        return;
    }
    *lock(&shared.tcp) = stream.try_clone().ok();
    *lock(&shared.local_addr) = stream.local_addr().ok();
    // disconnect() may have run between connect and registering the clone
    if !shared.connected.load(Ordering::Acquire) {
        return;
    }
    shared.set_status(format!("Connected to {}", target));
    info!("Connected to glove at {}", target);

    let mut lines = LineBuffer::new();
    let mut buf = [0u8; MAX_DATAGRAM];
    while shared.connected.load(Ordering::Acquire) {
        match stream.read(&mut buf) {
            Ok(0) => {
                info!("Glove closed the connection");
                shared.set_status("Disconnected (server closed)");
                break;
            }
            Ok(n) => {
                for line in lines.push(&buf[..n]) {
                    match decode_json_line(&line, clock.now_us()) {
                        Ok(snap) => shared.publish(snap),
                        Err(e) => shared.drop_packet(&format!("{} in {:?}", e, line)),
                    }
                }
            }
            Err(ref e) if is_timeout(e) => continue,
            Err(e) => {
                if !shared.connected.load(Ordering::Acquire) {
                    break;
                }
                warn!("TCP receive error: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}
