//! In-memory collaborators for host builds.
//!
//! These back the unit tests and the host binary. Handles that tests need
//! to inspect after handing a boxed copy to the firmware (partitions, key
//! value engine, bus, GPIO, radio) are cheap clones sharing one state.

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info};

use super::{
    check_range, ConnStatus, GpioLines, HostBus, KvEngine, Listener, Partition, PlatformError,
    ResetReason, Socket, SocketState, SocketSummary, SocketTable, SystemServices,
};
use crate::config::CredentialRecord;
use crate::protocol::MAX_CONNECTIONS;
use crate::wifi::{
    AccessPointSettings, EnterpriseCredentials, RadioDriver, RadioError, RadioMode, ScanResult,
    StationStatus, StationStatusCell,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Longest key accepted by [`MemoryKv`], matching flash key-value engines.
pub const MAX_KEY_LEN: usize = 15;

// ==================== Storage ====================

/// RAM-backed partition. Starts erased.
#[derive(Debug, Clone)]
pub struct MemoryPartition {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryPartition {
    pub fn new(size: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0xFF; size])),
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }
}

impl Partition for MemoryPartition {
    fn size(&self) -> usize {
        lock(&self.data).len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), PlatformError> {
        let data = lock(&self.data);
        check_range(offset, buf.len(), data.len())?;
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), PlatformError> {
        let mut data = lock(&self.data);
        check_range(offset, bytes.len(), data.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn erase(&mut self, offset: usize, len: usize) -> Result<(), PlatformError> {
        let mut data = lock(&self.data);
        check_range(offset, len, data.len())?;
        data[offset..offset + len].fill(0xFF);
        Ok(())
    }
}

/// Ordered in-memory key-value engine.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    sets_left: Arc<Mutex<Option<usize>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all entries.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        lock(&self.entries).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Let the next `count` writes through, then fail every write.
    pub fn fail_sets_after(&self, count: usize) {
        *lock(&self.sets_left) = Some(count);
    }
}

fn check_key(key: &str) -> Result<(), PlatformError> {
    if key.len() > MAX_KEY_LEN {
        return Err(PlatformError::KeyTooLong(key.to_string()));
    }
    Ok(())
}

impl KvEngine for MemoryKv {
    fn get(&self, key: &str, buf: &mut [u8]) -> Result<Option<usize>, PlatformError> {
        check_key(key)?;
        let entries = lock(&self.entries);
        match entries.get(key) {
            None => Ok(None),
            Some(value) if value.len() > buf.len() => Err(PlatformError::Storage(format!(
                "value of {} is {} bytes, buffer {}",
                key,
                value.len(),
                buf.len()
            ))),
            Some(value) => {
                buf[..value.len()].copy_from_slice(value);
                Ok(Some(value.len()))
            }
        }
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), PlatformError> {
        check_key(key)?;
        if let Some(left) = lock(&self.sets_left).as_mut() {
            if *left == 0 {
                return Err(PlatformError::Storage(format!("write of {} failed", key)));
            }
            *left -= 1;
        }
        lock(&self.entries).insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool, PlatformError> {
        check_key(key)?;
        Ok(lock(&self.entries).remove(key).is_some())
    }
}

// ==================== Bus & GPIO ====================

#[derive(Debug, Default)]
struct BusScript {
    incoming: VecDeque<u32>,
    sent: Vec<u32>,
    fail_after: Option<usize>,
    divider: u32,
    transactions: usize,
}

/// Bus peripheral fed from a queue of host words.
///
/// Once the queue runs dry the host is assumed to clock zeros, as it does
/// while receiving.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBus {
    script: Arc<Mutex<BusScript>>,
}

impl ScriptedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue words the host will send.
    pub fn queue_words(&self, words: &[u32]) {
        lock(&self.script).incoming.extend(words.iter().copied());
    }

    /// Queue bytes the host will send, zero-padded to whole words.
    pub fn queue_bytes(&self, bytes: &[u8]) {
        let mut script = lock(&self.script);
        for chunk in bytes.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            script.incoming.push_back(u32::from_le_bytes(word));
        }
    }

    /// Drain the words the module has sent.
    pub fn take_sent(&self) -> Vec<u32> {
        std::mem::take(&mut lock(&self.script).sent)
    }

    /// Fail the transfer after `words` more words.
    pub fn fail_after(&self, words: usize) {
        lock(&self.script).fail_after = Some(words);
    }

    /// Number of completed transactions.
    pub fn transactions(&self) -> usize {
        lock(&self.script).transactions
    }

    pub fn clock_divider(&self) -> u32 {
        lock(&self.script).divider
    }

    /// Words queued but not yet consumed.
    pub fn pending_words(&self) -> usize {
        lock(&self.script).incoming.len()
    }
}

impl HostBus for ScriptedBus {
    fn begin_transaction(&mut self) {}

    fn end_transaction(&mut self) {
        lock(&self.script).transactions += 1;
    }

    fn transfer_word(&mut self, out: u32) -> Result<u32, PlatformError> {
        let mut script = lock(&self.script);
        match script.fail_after {
            Some(0) => {
                script.fail_after = None;
                return Err(PlatformError::BusFault);
            }
            Some(n) => script.fail_after = Some(n - 1),
            None => {}
        }
        script.sent.push(out);
        Ok(script.incoming.pop_front().unwrap_or(0))
    }

    fn set_clock_divider(&mut self, divider: u32) {
        lock(&self.script).divider = divider;
    }

    fn clock_register(&self) -> u32 {
        lock(&self.script).divider
    }
}

#[derive(Debug, Default)]
struct GpioState {
    host_ready: bool,
    pulses: usize,
    transfer_ready: bool,
    select: bool,
    led: bool,
    led_changes: usize,
    delay_us: u64,
}

/// GPIO lines recorded in memory.
#[derive(Debug, Clone, Default)]
pub struct HostGpio {
    state: Arc<Mutex<GpioState>>,
}

impl HostGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive the host's transfer-ready line.
    pub fn set_transfer_ready(&self, high: bool) {
        lock(&self.state).transfer_ready = high;
    }

    /// Number of high-to-low transitions of the host-ready line.
    pub fn pulses(&self) -> usize {
        lock(&self.state).pulses
    }

    pub fn host_ready(&self) -> bool {
        lock(&self.state).host_ready
    }

    pub fn select_asserted(&self) -> bool {
        lock(&self.state).select
    }

    pub fn led_on(&self) -> bool {
        lock(&self.state).led
    }

    /// Number of LED state changes.
    pub fn led_changes(&self) -> usize {
        lock(&self.state).led_changes
    }
}

impl GpioLines for HostGpio {
    fn set_host_ready(&mut self, high: bool) {
        let mut state = lock(&self.state);
        if state.host_ready && !high {
            state.pulses += 1;
        }
        state.host_ready = high;
    }

    fn transfer_ready(&mut self) -> bool {
        lock(&self.state).transfer_ready
    }

    fn set_select(&mut self, asserted: bool) {
        lock(&self.state).select = asserted;
    }

    fn set_led(&mut self, on: bool) {
        let mut state = lock(&self.state);
        if state.led != on {
            state.led_changes += 1;
        }
        state.led = on;
    }

    fn led(&self) -> bool {
        lock(&self.state).led
    }

    fn delay_us(&mut self, us: u32) {
        lock(&self.state).delay_us += u64::from(us);
    }
}

// ==================== Radio ====================

/// One call to [`RadioDriver::connect_station`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub ssid: String,
    pub password: String,
    pub host_name: String,
    pub credentials: Option<EnterpriseCredentials>,
}

#[derive(Debug)]
struct RadioState {
    scan_results: Vec<ScanResult>,
    fail_scan: bool,
    fail_connect: bool,
    fail_access_point: bool,
    connects: Vec<ConnectAttempt>,
    access_point: Option<AccessPointSettings>,
    disconnects: usize,
    stops: usize,
    tx_power: Option<u8>,
    rssi: i8,
    clients: u8,
    ip: Ipv4Addr,
}

impl Default for RadioState {
    fn default() -> Self {
        Self {
            scan_results: Vec::new(),
            fail_scan: false,
            fail_connect: false,
            fail_access_point: false,
            connects: Vec::new(),
            access_point: None,
            disconnects: 0,
            stops: 0,
            tx_power: None,
            rssi: -60,
            clients: 0,
            ip: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Radio whose station status is driven by the test.
///
/// `connect_station` moves the status to [`StationStatus::Connecting`];
/// everything after that is up to [`SimulatedRadio::set_status`].
#[derive(Debug, Clone, Default)]
pub struct SimulatedRadio {
    state: Arc<Mutex<RadioState>>,
    status: StationStatusCell,
}

impl SimulatedRadio {
    /// Locally administered MAC reported for both interfaces.
    pub const MAC: [u8; 6] = [0x02, 0x00, 0x00, 0xC0, 0xFF, 0xEE];

    pub fn new() -> Self {
        Self::default()
    }

    /// What the driver callback would write.
    pub fn set_status(&self, status: StationStatus) {
        self.status.store(status);
    }

    pub fn set_scan_results(&self, results: Vec<ScanResult>) {
        lock(&self.state).scan_results = results;
    }

    pub fn fail_scan(&self, fail: bool) {
        lock(&self.state).fail_scan = fail;
    }

    pub fn fail_connect(&self, fail: bool) {
        lock(&self.state).fail_connect = fail;
    }

    pub fn fail_access_point(&self, fail: bool) {
        lock(&self.state).fail_access_point = fail;
    }

    pub fn set_ip(&self, ip: Ipv4Addr) {
        lock(&self.state).ip = ip;
    }

    pub fn connects(&self) -> Vec<ConnectAttempt> {
        lock(&self.state).connects.clone()
    }

    pub fn access_point(&self) -> Option<AccessPointSettings> {
        lock(&self.state).access_point.clone()
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.state).disconnects
    }

    pub fn stops(&self) -> usize {
        lock(&self.state).stops
    }

    pub fn tx_power(&self) -> Option<u8> {
        lock(&self.state).tx_power
    }
}

impl RadioDriver for SimulatedRadio {
    fn connect_station(
        &mut self,
        record: &CredentialRecord,
        credentials: Option<&EnterpriseCredentials>,
        host_name: &str,
    ) -> Result<(), RadioError> {
        let mut state = lock(&self.state);
        if state.fail_connect {
            return Err(RadioError::Driver("simulated connect failure".into()));
        }
        state.connects.push(ConnectAttempt {
            ssid: record.ssid().into_owned(),
            password: String::from_utf8_lossy(record.password_bytes()).into_owned(),
            host_name: host_name.to_string(),
            credentials: credentials.cloned(),
        });
        state.access_point = None;
        self.status.store(StationStatus::Connecting);
        Ok(())
    }

    fn start_access_point(&mut self, settings: &AccessPointSettings) -> Result<(), RadioError> {
        let mut state = lock(&self.state);
        if state.fail_access_point {
            return Err(RadioError::Driver("simulated access point failure".into()));
        }
        state.access_point = Some(settings.clone());
        state.ip = settings.ip_addr();
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<ScanResult>, RadioError> {
        let state = lock(&self.state);
        if state.fail_scan {
            return Err(RadioError::ScanFailed("simulated".into()));
        }
        Ok(state.scan_results.clone())
    }

    fn disconnect(&mut self) {
        lock(&self.state).disconnects += 1;
        self.status.store(StationStatus::Idle);
    }

    fn stop(&mut self) {
        let mut state = lock(&self.state);
        state.stops += 1;
        state.access_point = None;
        self.status.store(StationStatus::Idle);
    }

    fn status(&self) -> StationStatus {
        self.status.load()
    }

    fn rssi(&self) -> i8 {
        lock(&self.state).rssi
    }

    fn client_count(&self) -> u8 {
        lock(&self.state).clients
    }

    fn mac_address(&self, _mode: RadioMode) -> [u8; 6] {
        Self::MAC
    }

    fn ip_address(&self, _mode: RadioMode) -> Ipv4Addr {
        lock(&self.state).ip
    }

    fn set_max_tx_power(&mut self, quarter_dbm: u8) -> Result<(), RadioError> {
        lock(&self.state).tx_power = Some(quarter_dbm);
        Ok(())
    }
}

// ==================== Sockets ====================

/// A socket backed by byte vectors.
#[derive(Debug, Clone)]
pub struct MemorySocket {
    pub number: u8,
    pub state: u8,
    /// Data waiting to be read by the host.
    pub rx: Vec<u8>,
    /// Data the host has written.
    pub written: Vec<u8>,
    /// Send buffer space.
    pub write_space: usize,
    pub pushed: bool,
    pub close_after: bool,
    pub closed: bool,
    pub terminated: bool,
    pub local_port: u16,
    pub remote_port: u16,
    pub remote_ip: Ipv4Addr,
}

impl MemorySocket {
    pub const CONNECTED: u8 = SocketState::Connected.code();

    fn new(number: u8) -> Self {
        Self {
            number,
            state: 0,
            rx: Vec::new(),
            written: Vec::new(),
            write_space: 0,
            pushed: false,
            close_after: false,
            closed: false,
            terminated: false,
            local_port: 0,
            remote_port: 0,
            remote_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Put the socket into the connected state with `write_space` bytes of
    /// send buffer.
    pub fn connect(&mut self, remote: Ipv4Addr, remote_port: u16, write_space: usize) {
        self.state = Self::CONNECTED;
        self.remote_ip = remote;
        self.remote_port = remote_port;
        self.local_port = 80;
        self.write_space = write_space;
        self.closed = false;
        self.terminated = false;
    }
}

impl Socket for MemorySocket {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.rx.len());
        buf[..n].copy_from_slice(&self.rx[..n]);
        self.rx.drain(..n);
        n
    }

    fn can_write(&self) -> usize {
        self.write_space
    }

    fn write(&mut self, data: &[u8], push: bool, close_after: bool) -> usize {
        let n = data.len().min(self.write_space);
        self.written.extend_from_slice(&data[..n]);
        self.write_space -= n;
        self.pushed |= push;
        self.close_after |= close_after;
        n
    }

    fn close(&mut self) {
        self.closed = true;
        self.state = SocketState::Free.code();
    }

    fn terminate(&mut self, _external: bool) {
        self.terminated = true;
        self.state = SocketState::Free.code();
    }

    fn status(&self) -> ConnStatus {
        ConnStatus {
            state: self.state,
            socket: self.number,
            bytes_available: self.rx.len().min(u16::MAX as usize) as u16,
            write_buffer_space: self.write_space.min(u16::MAX as usize) as u16,
            local_port: self.local_port,
            remote_port: self.remote_port,
            remote_ip: self.remote_ip,
        }
    }
}

/// Fixed table of [`MemorySocket`]s.
#[derive(Debug, Clone)]
pub struct MemorySockets {
    pub sockets: Vec<MemorySocket>,
}

impl MemorySockets {
    pub fn new() -> Self {
        Self {
            sockets: (0..MAX_CONNECTIONS as u8).map(MemorySocket::new).collect(),
        }
    }
}

impl Default for MemorySockets {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketTable for MemorySockets {
    fn socket(&mut self, number: u8) -> Option<&mut dyn Socket> {
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
            if socket.state == MemorySocket::CONNECTED {
                summary.connected |= 1 << socket.number;
            }
            if socket.closed {
                summary.other_end_closed |= 1 << socket.number;
            }
        }
        summary
    }

    fn report(&self) {
        for socket in &self.sockets {
            info!(
                "Socket {}: state {} rx {} tx-space {}",
                socket.number,
                socket.state,
                socket.rx.len(),
                socket.write_space
            );
        }
    }
}

/// One call to [`Listener::listen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenCall {
    pub remote_ip: Ipv4Addr,
    pub port: u16,
    pub protocol: u8,
    pub max_connections: u8,
}

/// Listener that records its calls.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    pub calls: Vec<ListenCall>,
    pub stopped: Vec<u16>,
    pub fail: bool,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Listener for RecordingListener {
    fn listen(
        &mut self,
        remote_ip: Ipv4Addr,
        port: u16,
        protocol: u8,
        max_connections: u8,
    ) -> bool {
        self.calls.push(ListenCall {
            remote_ip,
            port,
            protocol,
            max_connections,
        });
        !self.fail
    }

    fn stop_listening(&mut self, port: u16) {
        self.stopped.push(port);
    }
}

// ==================== System ====================

/// System services of the host process.
#[derive(Debug, Clone)]
pub struct HostSystem {
    pub free_heap: u32,
    pub reset_reason: ResetReason,
    pub flash_size: u32,
    /// Sleep for real in `delay_ms`; off in tests.
    pub real_delays: bool,
    /// Every delay requested, in milliseconds.
    pub delays: Vec<u32>,
    pub watchdog_feeds: u64,
}

impl HostSystem {
    /// System that really sleeps, for the host binary.
    pub fn new() -> Self {
        Self {
            free_heap: 160 * 1024,
            reset_reason: ResetReason::PowerOn,
            flash_size: 4 * 1024 * 1024,
            real_delays: true,
            delays: Vec::new(),
            watchdog_feeds: 0,
        }
    }

    /// System that only records delays.
    pub fn instant() -> Self {
        Self {
            real_delays: false,
            ..Self::new()
        }
    }
}

impl Default for HostSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemServices for HostSystem {
    fn free_heap(&self) -> u32 {
        self.free_heap
    }

    fn reset_reason(&self) -> ResetReason {
        self.reset_reason
    }

    fn flash_size(&self) -> u32 {
        self.flash_size
    }

    fn vcc(&self) -> u16 {
        3300
    }

    fn sleep_mode(&self) -> u8 {
        1
    }

    fn phy_mode(&self) -> u8 {
        3
    }

    fn feed_watchdog(&mut self) {
        self.watchdog_feeds += 1;
    }

    fn dump_stats(&self) {
        debug!("Host system: free heap {} bytes", self.free_heap);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delays.push(ms);
        if self.real_delays {
            std::thread::sleep(Duration::from_millis(u64::from(ms)));
        }
    }
}
