//! Bus transaction engine.
//!
//! One call to [`TransactionEngine::process`] runs exactly one
//! request/response cycle with the host and then any operation the request
//! deferred. Protocol-level rejections are answered with a [`ResponseCode`]
//! and never touch the sticky error; failures of the work a command asks
//! for are reported through the sticky error instead.

use std::time::Instant;

use log::{debug, error, info, warn};
use zeroize::Zeroize;

use crate::config::{
    field_bytes, CredentialKind, CredentialRecord, FIRMWARE_VERSION, RECORD_SIZE,
    REDUCED_RECORD_SIZE, SSID_LENGTH,
};
use crate::platform::{GpioLines, HostBus, Listener, PlatformError, SocketTable, SystemServices};
use crate::state::ModuleState;
use crate::wifi::{ConfigStore, ConnectionManager, RadioMode, StoreError, WifiState};

use super::pending::PendingOperation;
use super::records::{encode_conn_status, ListenRecord, NetworkStatus, LISTEN_RECORD_SIZE};
use super::wire::{
    pack_words, word_count, Command, EnterpriseOp, RequestHeader, ResponseCode, ResponseHeader,
    FLAG_CLOSE_AFTER_WRITE, FLAG_PUSH, FORMAT_VERSION, HOST_NAME_LENGTH, MAX_CONNECTIONS,
    MAX_DATA_LENGTH, MAX_TX_POWER,
};

/// Pause between the socket report and the statistics dump.
const DIAGNOSTICS_SETTLE_MS: u32 = 20;

/// Everything a transaction may touch, lent by the runtime for one cycle.
pub struct TransactionContext<'a> {
    pub bus: &'a mut dyn HostBus,
    pub gpio: &'a mut dyn GpioLines,
    pub state: &'a mut ModuleState,
    pub store: &'a ConfigStore,
    pub wifi: &'a mut ConnectionManager,
    pub sockets: &'a mut dyn SocketTable,
    pub listener: &'a mut dyn Listener,
    pub system: &'a mut dyn SystemServices,
}

/// Host bridge protocol state: the transfer buffer and the deferred slot.
pub struct TransactionEngine {
    buffer: Box<[u8]>,
    pending: PendingOperation,
}

impl Default for TransactionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionEngine {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; MAX_DATA_LENGTH].into_boxed_slice(),
            pending: PendingOperation::None,
        }
    }

    /// Operation staged by the last transaction and not yet run.
    pub fn pending(&self) -> &PendingOperation {
        &self.pending
    }

    /// Run one transaction, then the operation it deferred.
    ///
    /// A bus failure abandons the transaction: the error is returned and
    /// nothing staged during it survives.
    pub fn process(
        &mut self,
        ctx: &mut TransactionContext<'_>,
        now: Instant,
    ) -> Result<(), PlatformError> {
        ctx.gpio.set_select(true);
        ctx.bus.begin_transaction();
        let result = self.exchange(ctx);
        ctx.gpio.set_select(false);
        ctx.bus.end_transaction();

        if let Err(e) = result {
            warn!("Transaction abandoned: {}", e);
            self.pending = PendingOperation::None;
            return Err(e);
        }

        self.run_pending(ctx, now);
        Ok(())
    }

    fn exchange(&mut self, ctx: &mut TransactionContext<'_>) -> Result<(), PlatformError> {
        let out = ResponseHeader::new(ctx.state.wifi_state().as_u8()).to_leading_words();
        let mut incoming = [0u32; 2];
        ctx.bus.transfer_words(&out, &mut incoming)?;
        let header = RequestHeader::from_leading_words(incoming);

        if header.format_version != FORMAT_VERSION {
            warn!(
                "Bad request format version 0x{:02x}",
                header.format_version
            );
            return respond(ctx.bus, ResponseCode::BadFormatVersion);
        }
        if usize::from(header.data_length) > MAX_DATA_LENGTH {
            warn!("Request data length {} too large", header.data_length);
            return respond(ctx.bus, ResponseCode::BadDataLength);
        }

        let Some(command) = Command::from_u8(header.command) else {
            debug!("Unknown command {}", header.command);
            return respond(ctx.bus, ResponseCode::UnknownCommand);
        };
        debug!(
            "{:?} socket={} flags=0x{:02x} len={} avail={}",
            command, header.socket, header.flags, header.data_length, header.buffer_available
        );

        match command {
            Command::Null => respond(ctx.bus, ResponseCode::Empty),
            Command::StartClient => self.start_client(&header, ctx),
            Command::StartAccessPoint => {
                if ctx.state.wifi_state() != WifiState::Idle {
                    return respond(ctx.bus, ResponseCode::WrongState);
                }
                respond(ctx.bus, ResponseCode::Empty)?;
                self.pending = PendingOperation::StartAccessPoint;
                Ok(())
            }
            Command::Stop => {
                respond(ctx.bus, ResponseCode::Empty)?;
                self.pending = PendingOperation::Stop;
                Ok(())
            }
            Command::FactoryReset => {
                respond(ctx.bus, ResponseCode::Empty)?;
                self.pending = PendingOperation::FactoryReset;
                Ok(())
            }
            Command::Diagnostics => {
                respond(ctx.bus, ResponseCode::Empty)?;
                self.pending = PendingOperation::Diagnostics;
                Ok(())
            }
            Command::SetClockControl => {
                let divider = ctx.bus.transfer_word(ResponseCode::Empty.code() as u32)?;
                self.pending = PendingOperation::SetClock(divider);
                Ok(())
            }
            Command::GetStatus => self.get_status(ctx),
            Command::AddSsid | Command::ConfigureAccessPoint => {
                let result = self.add_ssid(&header, command == Command::ConfigureAccessPoint, ctx);
                self.buffer.zeroize();
                result
            }
            Command::DeleteSsid => self.delete_ssid(&header, ctx),
            Command::ListSsidsDeprecated => {
                let capacity = receiver_capacity(&header);
                match ctx.store.list_ssids_text() {
                    Ok(text) if text.len() > capacity => {
                        respond(ctx.bus, ResponseCode::BufferTooSmall)
                    }
                    Ok(text) => respond_with(ctx.bus, &text),
                    Err(e) => store_failure(ctx, e),
                }
            }
            Command::RetrieveSsidData => {
                let capacity = receiver_capacity(&header);
                if capacity < REDUCED_RECORD_SIZE {
                    return respond(ctx.bus, ResponseCode::BufferTooSmall);
                }
                match ctx.store.list_reduced(capacity) {
                    Ok(records) => respond_with(ctx.bus, &records),
                    Err(e) => store_failure(ctx, e),
                }
            }
            Command::SetHostName => self.set_host_name(&header, ctx),
            Command::GetLastError => self.get_last_error(&header, ctx),
            Command::Listen => self.listen(&header, ctx),
            Command::SetTxPower => {
                if header.flags > MAX_TX_POWER {
                    return respond(ctx.bus, ResponseCode::BadParameter);
                }
                if let Err(e) = ctx.wifi.radio_mut().set_max_tx_power(header.flags) {
                    ctx.state.set_error(format!("Failed to set transmit power: {}", e));
                }
                respond(ctx.bus, ResponseCode::Empty)
            }
            Command::AddEnterpriseSsid => {
                let result = self.add_enterprise(&header, ctx);
                self.buffer.zeroize();
                result
            }
            Command::ConnRead
            | Command::ConnWrite
            | Command::ConnClose
            | Command::ConnAbort
            | Command::ConnGetStatus => self.connection(command, &header, ctx),
            Command::ConnCreate => respond(ctx.bus, ResponseCode::UnknownCommand),
        }
    }

    fn start_client(
        &mut self,
        header: &RequestHeader,
        ctx: &mut TransactionContext<'_>,
    ) -> Result<(), PlatformError> {
        if ctx.state.wifi_state() != WifiState::Idle {
            return respond(ctx.bus, ResponseCode::WrongState);
        }
        let len = usize::from(header.data_length);
        if len > SSID_LENGTH + 1 {
            return respond(ctx.bus, ResponseCode::BadDataLength);
        }

        respond(ctx.bus, ResponseCode::Empty)?;
        receive(ctx.bus, &mut self.buffer, len)?;
        let ssid = field_bytes(&self.buffer[..len]);
        self.pending = PendingOperation::StartClient((!ssid.is_empty()).then(|| ssid.to_vec()));
        Ok(())
    }

    fn get_status(&mut self, ctx: &mut TransactionContext<'_>) -> Result<(), PlatformError> {
        let radio = ctx.wifi.radio();
        let (ip, rssi, client_count, mac) = match ctx.state.wifi_state() {
            WifiState::Connected => (
                radio.ip_address(RadioMode::Station),
                radio.rssi(),
                0,
                radio.mac_address(RadioMode::Station),
            ),
            WifiState::RunningAsAccessPoint => (
                radio.ip_address(RadioMode::AccessPoint),
                0,
                radio.client_count(),
                radio.mac_address(RadioMode::AccessPoint),
            ),
            _ => (
                std::net::Ipv4Addr::UNSPECIFIED,
                0,
                0,
                radio.mac_address(RadioMode::Station),
            ),
        };

        let status = NetworkStatus {
            ip,
            free_heap: ctx.system.free_heap(),
            reset_reason: ctx.system.reset_reason().code(),
            flash_size: ctx.system.flash_size(),
            rssi,
            client_count,
            sleep_mode: ctx.system.sleep_mode(),
            phy_mode: ctx.system.phy_mode(),
            vcc: ctx.system.vcc(),
            mac,
            firmware_version: FIRMWARE_VERSION.to_string(),
            host_name: ctx.state.host_name().to_string(),
            ssid: ctx.state.active_ssid().to_string(),
            clock_register: ctx.bus.clock_register(),
        };
        respond_with(ctx.bus, &status.to_bytes())
    }

    fn add_ssid(
        &mut self,
        header: &RequestHeader,
        access_point: bool,
        ctx: &mut TransactionContext<'_>,
    ) -> Result<(), PlatformError> {
        if usize::from(header.data_length) != RECORD_SIZE {
            return respond(ctx.bus, ResponseCode::BadDataLength);
        }
        respond(ctx.bus, ResponseCode::Empty)?;
        receive(ctx.bus, &mut self.buffer, RECORD_SIZE)?;

        let result = CredentialRecord::from_bytes(&self.buffer[..RECORD_SIZE])
            .map_err(StoreError::from)
            .and_then(|record| ctx.store.set_credential(&record, access_point));
        if let Err(e) = result {
            ctx.state.set_error(e.to_string());
        }
        Ok(())
    }

    fn delete_ssid(
        &mut self,
        header: &RequestHeader,
        ctx: &mut TransactionContext<'_>,
    ) -> Result<(), PlatformError> {
        if usize::from(header.data_length) != SSID_LENGTH {
            return respond(ctx.bus, ResponseCode::BadDataLength);
        }
        respond(ctx.bus, ResponseCode::Empty)?;
        receive(ctx.bus, &mut self.buffer, SSID_LENGTH)?;

        if let Err(e) = ctx.store.erase_credential(&self.buffer[..SSID_LENGTH]) {
            ctx.state.set_error(e.to_string());
        }
        Ok(())
    }

    fn set_host_name(
        &mut self,
        header: &RequestHeader,
        ctx: &mut TransactionContext<'_>,
    ) -> Result<(), PlatformError> {
        if usize::from(header.data_length) != HOST_NAME_LENGTH {
            return respond(ctx.bus, ResponseCode::BadDataLength);
        }
        respond(ctx.bus, ResponseCode::Empty)?;
        receive(ctx.bus, &mut self.buffer, HOST_NAME_LENGTH)?;

        // Leave room for the terminator the status record needs
        let name = field_bytes(&self.buffer[..HOST_NAME_LENGTH - 1]);
        ctx.state
            .set_host_name(String::from_utf8_lossy(name).into_owned());
        Ok(())
    }

    fn get_last_error(
        &mut self,
        header: &RequestHeader,
        ctx: &mut TransactionContext<'_>,
    ) -> Result<(), PlatformError> {
        let result = match ctx.state.take_error() {
            None => respond(ctx.bus, ResponseCode::Empty),
            Some(message) => {
                let len = message.len() + 1;
                if len > receiver_capacity(header) {
                    respond(ctx.bus, ResponseCode::BufferTooSmall)
                } else {
                    let mut text = message.into_bytes();
                    text.push(0);
                    respond_with(ctx.bus, &text)
                }
            }
        };
        ctx.state.mark_reported();
        result
    }

    fn listen(
        &mut self,
        header: &RequestHeader,
        ctx: &mut TransactionContext<'_>,
    ) -> Result<(), PlatformError> {
        if usize::from(header.data_length) != LISTEN_RECORD_SIZE {
            return respond(ctx.bus, ResponseCode::BadDataLength);
        }
        respond(ctx.bus, ResponseCode::Empty)?;
        receive(ctx.bus, &mut self.buffer, LISTEN_RECORD_SIZE)?;

        let mut bytes = [0u8; LISTEN_RECORD_SIZE];
        bytes.copy_from_slice(&self.buffer[..LISTEN_RECORD_SIZE]);
        let record = ListenRecord::from_bytes(&bytes);

        if record.max_connections == 0 {
            ctx.listener.stop_listening(record.port);
            info!("Stopped listening on port {}", record.port);
        } else if ctx.listener.listen(
            record.remote_ip,
            record.port,
            record.protocol,
            record.max_connections,
        ) {
            info!("Listening on port {}", record.port);
        } else {
            ctx.state.set_error("Listen failed");
        }
        Ok(())
    }

    fn add_enterprise(
        &mut self,
        header: &RequestHeader,
        ctx: &mut TransactionContext<'_>,
    ) -> Result<(), PlatformError> {
        let Some(op) = EnterpriseOp::from_u8(header.flags) else {
            return respond(ctx.bus, ResponseCode::BadParameter);
        };
        let len = usize::from(header.data_length);

        match op {
            EnterpriseOp::Begin => {
                if len != RECORD_SIZE {
                    return respond(ctx.bus, ResponseCode::BadDataLength);
                }
                respond(ctx.bus, ResponseCode::Empty)?;
                receive(ctx.bus, &mut self.buffer, RECORD_SIZE)?;

                let result = CredentialRecord::from_bytes(&self.buffer[..RECORD_SIZE])
                    .map_err(StoreError::from)
                    .and_then(|record| ctx.store.begin_enterprise(record));
                if let Err(e) = result {
                    ctx.state.set_error(e.to_string());
                }
                Ok(())
            }
            EnterpriseOp::CaCertificate
            | EnterpriseOp::ClientCertificate
            | EnterpriseOp::PrivateKey => {
                if len == 0 {
                    return respond(ctx.bus, ResponseCode::BadDataLength);
                }
                let kind = match op {
                    EnterpriseOp::CaCertificate => CredentialKind::CaCertificate,
                    EnterpriseOp::ClientCertificate => CredentialKind::ClientCertificate,
                    _ => CredentialKind::PrivateKey,
                };
                respond(ctx.bus, ResponseCode::Empty)?;
                receive(ctx.bus, &mut self.buffer, len)?;

                if let Err(e) = ctx.store.set_enterprise_chunk(kind, &self.buffer[..len]) {
                    ctx.state.set_error(e.to_string());
                }
                Ok(())
            }
            EnterpriseOp::Commit | EnterpriseOp::Cancel => {
                match ctx.store.end_enterprise(op == EnterpriseOp::Commit) {
                    Ok(()) => respond(ctx.bus, ResponseCode::Empty),
                    Err(e) => {
                        ctx.state.set_error(e.to_string());
                        respond(ctx.bus, ResponseCode::BadParameter)
                    }
                }
            }
        }
    }

    fn connection(
        &mut self,
        command: Command,
        header: &RequestHeader,
        ctx: &mut TransactionContext<'_>,
    ) -> Result<(), PlatformError> {
        let number = header.socket;
        if usize::from(number) >= MAX_CONNECTIONS {
            return respond(ctx.bus, ResponseCode::BadParameter);
        }
        let Some(socket) = ctx.sockets.socket(number) else {
            return respond(ctx.bus, ResponseCode::BadParameter);
        };

        match command {
            Command::ConnAbort => {
                respond(ctx.bus, ResponseCode::Empty)?;
                socket.terminate(true);
            }
            Command::ConnClose => {
                respond(ctx.bus, ResponseCode::Empty)?;
                socket.close();
            }
            Command::ConnRead => {
                let capacity = receiver_capacity(header);
                let amount = socket.read(&mut self.buffer[..capacity]);
                respond_with(ctx.bus, &self.buffer[..amount])?;
            }
            Command::ConnWrite => {
                let requested = usize::from(header.data_length);
                let accepted = socket.can_write().min(requested.min(MAX_DATA_LENGTH));
                let complete = accepted == requested;
                let close_after = complete && header.flags & FLAG_CLOSE_AFTER_WRITE != 0;
                let push = complete && header.flags & FLAG_PUSH != 0;

                ctx.bus.transfer_word(accepted as u32)?;
                receive(ctx.bus, &mut self.buffer, accepted)?;
                let written = socket.write(&self.buffer[..accepted], push, close_after);
                if written != accepted {
                    ctx.state.set_error("incomplete write");
                }
            }
            _ => {
                let status = socket.status();
                let summary = ctx.sockets.summary();
                let record = encode_conn_status(&status, &summary);
                respond_with(ctx.bus, &record)?;
            }
        }
        Ok(())
    }

    fn run_pending(&mut self, ctx: &mut TransactionContext<'_>, now: Instant) {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_none() {
            return;
        }
        ctx.state.clear_error();

        match pending {
            PendingOperation::None => {}
            PendingOperation::StartClient(ssid) => {
                ctx.wifi.start_client(ctx.state, ssid.as_deref(), now)
            }
            PendingOperation::StartAccessPoint => ctx.wifi.start_access_point(ctx.state),
            PendingOperation::Stop => {
                ctx.wifi
                    .stop(ctx.state, ctx.sockets, ctx.listener, ctx.system)
            }
            PendingOperation::FactoryReset => match ctx.store.factory_reset() {
                Ok(()) => info!("Factory reset complete"),
                Err(e) => {
                    error!("Factory reset failed: {}", e);
                    ctx.state.set_error(format!("Factory reset failed: {}", e));
                }
            },
            PendingOperation::Diagnostics => {
                ctx.sockets.report();
                ctx.system.delay_ms(DIAGNOSTICS_SETTLE_MS);
                ctx.system.dump_stats();
            }
            PendingOperation::SetClock(0) => ctx.state.set_error("invalid clock divider"),
            PendingOperation::SetClock(divider) => {
                ctx.bus.set_clock_divider(divider);
                info!("Bus clock divider set to {}", divider);
            }
        }
    }
}

/// Report a failed store read through the sticky error.
fn store_failure(ctx: &mut TransactionContext<'_>, e: StoreError) -> Result<(), PlatformError> {
    error!("Credential store read failed: {}", e);
    ctx.state.set_error(e.to_string());
    respond(ctx.bus, ResponseCode::Empty)
}

/// Send a bare response code.
fn respond(bus: &mut dyn HostBus, code: ResponseCode) -> Result<(), PlatformError> {
    bus.transfer_word(code.code() as u32).map(drop)
}

/// Positive response followed by `payload`.
fn respond_with(bus: &mut dyn HostBus, payload: &[u8]) -> Result<(), PlatformError> {
    bus.transfer_word(payload.len() as u32)?;
    bus.write_words(&pack_words(payload))
}

/// Clock in `len` payload bytes, whole words at a time.
fn receive(bus: &mut dyn HostBus, buffer: &mut [u8], len: usize) -> Result<(), PlatformError> {
    for chunk in buffer[..word_count(len) * 4].chunks_mut(4) {
        let word = bus.transfer_word(0)?;
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Ok(())
}

/// Bytes the host can take back, capped at the transfer buffer.
fn receiver_capacity(header: &RequestHeader) -> usize {
    usize::from(header.buffer_available).min(MAX_DATA_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use crate::config::{ModuleConfig, Security, MAX_REMEMBERED_NETWORKS};
    use crate::platform::host::{
        HostGpio, HostSystem, MemoryKv, MemoryPartition, MemorySockets, RecordingListener,
        ScriptedBus, SimulatedRadio,
    };
    use crate::protocol::records::{CONN_STATUS_SIZE, NETWORK_STATUS_SIZE};
    use crate::protocol::wire::unpack_words;
    use crate::wifi::{ScanResult, StationStatus, TABLE_SIZE};

    struct Harness {
        engine: TransactionEngine,
        bus: ScriptedBus,
        gpio: HostGpio,
        state: ModuleState,
        store: Arc<ConfigStore>,
        wifi: ConnectionManager,
        radio: SimulatedRadio,
        sockets: MemorySockets,
        listener: RecordingListener,
        system: HostSystem,
        now: Instant,
    }

    /// What the module clocked out during one transaction.
    struct Reply {
        words: Vec<u32>,
    }

    impl Reply {
        fn state(&self) -> u8 {
            ResponseHeader::from_leading_words([self.words[0], self.words[1]]).state
        }

        fn version(&self) -> u8 {
            ResponseHeader::from_leading_words([self.words[0], self.words[1]]).format_version
        }

        fn code(&self) -> i32 {
            self.words[2] as i32
        }

        fn payload(&self) -> Vec<u8> {
            let len = usize::try_from(self.code()).unwrap();
            let mut out = vec![0u8; len];
            unpack_words(&self.words[3..], &mut out);
            out
        }
    }

    fn harness() -> Harness {
        let store = Arc::new(
            ConfigStore::open(
                Box::new(MemoryPartition::new(TABLE_SIZE)),
                Box::new(MemoryPartition::new(16 * 1024)),
                Box::new(MemoryKv::new()),
            )
            .unwrap(),
        );
        let radio = SimulatedRadio::new();
        let config = ModuleConfig::default();
        let mut wifi = ConnectionManager::new(Box::new(radio.clone()), Arc::clone(&store), &config);
        let mut state = ModuleState::new(config.host_name.clone());
        wifi.init(&mut state);
        state.mark_reported();

        Harness {
            engine: TransactionEngine::new(),
            bus: ScriptedBus::new(),
            gpio: HostGpio::new(),
            state,
            store,
            wifi,
            radio,
            sockets: MemorySockets::new(),
            listener: RecordingListener::new(),
            system: HostSystem::instant(),
            now: Instant::now(),
        }
    }

    impl Harness {
        fn send(&mut self, header: RequestHeader, payload: &[u8]) -> Reply {
            self.bus.queue_words(&header.to_words());
            self.bus.queue_bytes(payload);
            self.process().unwrap();
            Reply {
                words: self.bus.take_sent(),
            }
        }

        fn process(&mut self) -> Result<(), PlatformError> {
            let mut ctx = TransactionContext {
                bus: &mut self.bus,
                gpio: &mut self.gpio,
                state: &mut self.state,
                store: &self.store,
                wifi: &mut self.wifi,
                sockets: &mut self.sockets,
                listener: &mut self.listener,
                system: &mut self.system,
            };
            self.engine.process(&mut ctx, self.now)
        }
    }

    fn request(command: Command, data_length: usize) -> RequestHeader {
        RequestHeader {
            data_length: data_length as u16,
            ..RequestHeader::new(command)
        }
    }

    fn ssid_field(ssid: &str) -> [u8; SSID_LENGTH] {
        let mut field = [0u8; SSID_LENGTH];
        field[..ssid.len()].copy_from_slice(ssid.as_bytes());
        field
    }

    fn remember(h: &Harness, ssid: &str) -> usize {
        let record = CredentialRecord::station(ssid, "password1").unwrap();
        h.store.set_credential(&record, false).unwrap()
    }

    // ==================== Framing Tests ====================

    #[test]
    fn test_null_command_reports_state() {
        let mut h = harness();
        let reply = h.send(RequestHeader::new(Command::Null), &[]);
        assert_eq!(reply.version(), FORMAT_VERSION);
        assert_eq!(reply.state(), WifiState::Idle.as_u8());
        assert_eq!(reply.code(), ResponseCode::Empty.code());
        assert_eq!(h.bus.transactions(), 1);
        assert!(!h.gpio.select_asserted());
    }

    #[test]
    fn test_bad_format_version() {
        let mut h = harness();
        let header = RequestHeader {
            format_version: FORMAT_VERSION - 1,
            ..RequestHeader::new(Command::Stop)
        };
        let reply = h.send(header, &[]);
        assert_eq!(reply.code(), ResponseCode::BadFormatVersion.code());
        assert!(h.engine.pending().is_none());
        assert_eq!(h.state.last_error(), None);
    }

    #[test]
    fn test_oversized_data_length() {
        let mut h = harness();
        let reply = h.send(request(Command::AddSsid, MAX_DATA_LENGTH + 1), &[]);
        assert_eq!(reply.code(), ResponseCode::BadDataLength.code());
    }

    #[test]
    fn test_unknown_commands() {
        let mut h = harness();
        let header = RequestHeader {
            command: 12,
            ..RequestHeader::new(Command::Null)
        };
        assert_eq!(h.send(header, &[]).code(), ResponseCode::UnknownCommand.code());
        assert_eq!(
            h.send(RequestHeader::new(Command::ConnCreate), &[]).code(),
            ResponseCode::UnknownCommand.code()
        );
    }

    #[test]
    fn test_bus_failure_drops_pending() {
        let mut h = harness();
        remember(&h, "Home");
        let ssid = ssid_field("Home");
        h.bus.queue_words(&request(Command::StartClient, ssid.len()).to_words());
        h.bus.queue_bytes(&ssid);
        // Fail during the payload, after the response word
        h.bus.fail_after(4);

        assert_eq!(h.process(), Err(PlatformError::BusFault));
        assert!(h.engine.pending().is_none());
        assert_eq!(h.state.wifi_state(), WifiState::Idle);
        assert!(h.radio.connects().is_empty());
        assert!(!h.gpio.select_asserted());
    }

    // ==================== Deferred Operation Tests ====================

    #[test]
    fn test_start_client_with_ssid() {
        let mut h = harness();
        remember(&h, "Home");
        let reply = h.send(request(Command::StartClient, 5), b"Home\0");
        assert_eq!(reply.code(), ResponseCode::Empty.code());
        assert_eq!(h.state.wifi_state(), WifiState::Connecting);
        assert_eq!(h.radio.connects()[0].ssid, "Home");
        assert!(h.engine.pending().is_none());
    }

    #[test]
    fn test_start_client_scans_without_ssid() {
        let mut h = harness();
        remember(&h, "Weak");
        remember(&h, "Strong");
        h.radio.set_scan_results(vec![
            ScanResult {
                ssid: "Weak".into(),
                rssi: -80,
                channel: 1,
            },
            ScanResult {
                ssid: "Strong".into(),
                rssi: -40,
                channel: 6,
            },
        ]);
        h.send(RequestHeader::new(Command::StartClient), &[]);
        assert_eq!(h.radio.connects()[0].ssid, "Strong");
    }

    #[test]
    fn test_start_client_wrong_state() {
        let mut h = harness();
        h.state.set_wifi_state(WifiState::Connected);
        let reply = h.send(request(Command::StartClient, 5), b"Home\0");
        assert_eq!(reply.code(), ResponseCode::WrongState.code());
        assert!(h.radio.connects().is_empty());
        assert_eq!(h.state.last_error(), None);
    }

    #[test]
    fn test_start_client_ssid_too_long() {
        let mut h = harness();
        let reply = h.send(request(Command::StartClient, SSID_LENGTH + 2), &[b'a'; 34]);
        assert_eq!(reply.code(), ResponseCode::BadDataLength.code());
        assert!(h.radio.connects().is_empty());
    }

    #[test]
    fn test_start_access_point() {
        let mut h = harness();
        let record = CredentialRecord::station("Module", "password1")
            .unwrap()
            .with_static_ip(
                Ipv4Addr::new(192, 168, 4, 1),
                Ipv4Addr::new(192, 168, 4, 1),
                Ipv4Addr::new(255, 255, 255, 0),
            );
        h.store.set_credential(&record, true).unwrap();

        let reply = h.send(RequestHeader::new(Command::StartAccessPoint), &[]);
        assert_eq!(reply.code(), ResponseCode::Empty.code());
        assert_eq!(h.state.wifi_state(), WifiState::RunningAsAccessPoint);

        let reply = h.send(RequestHeader::new(Command::StartAccessPoint), &[]);
        assert_eq!(reply.code(), ResponseCode::WrongState.code());
        assert_eq!(reply.state(), WifiState::RunningAsAccessPoint.as_u8());
    }

    #[test]
    fn test_stop_clears_previous_error() {
        let mut h = harness();
        h.state.set_error("stale");
        h.sockets.sockets[1].connect(Ipv4Addr::new(10, 0, 0, 2), 4000, 100);

        h.send(RequestHeader::new(Command::Stop), &[]);
        assert_eq!(h.state.last_error(), None);
        assert_eq!(h.state.wifi_state(), WifiState::Idle);
        assert!(h.sockets.sockets[1].terminated);
        assert_eq!(h.listener.stopped, vec![0]);
    }

    #[test]
    fn test_factory_reset_erases_networks() {
        let mut h = harness();
        remember(&h, "Home");
        h.send(RequestHeader::new(Command::FactoryReset), &[]);
        assert_eq!(h.store.find_credential(b"Home").unwrap(), None);
    }

    #[test]
    fn test_diagnostics_deferred() {
        let mut h = harness();
        let reply = h.send(RequestHeader::new(Command::Diagnostics), &[]);
        assert_eq!(reply.code(), ResponseCode::Empty.code());
        assert_eq!(h.system.delays, vec![DIAGNOSTICS_SETTLE_MS]);
    }

    #[test]
    fn test_set_clock_control() {
        let mut h = harness();
        let header = RequestHeader {
            param32: 0x2001,
            ..RequestHeader::new(Command::SetClockControl)
        };
        assert_eq!(h.send(header, &[]).code(), ResponseCode::Empty.code());
        assert_eq!(h.bus.clock_divider(), 0x2001);

        let header = RequestHeader {
            param32: 0,
            ..RequestHeader::new(Command::SetClockControl)
        };
        h.send(header, &[]);
        assert_eq!(h.bus.clock_divider(), 0x2001);
        assert_eq!(h.state.last_error(), Some("invalid clock divider"));
    }

    // ==================== Credential Command Tests ====================

    #[test]
    fn test_add_ssid() {
        let mut h = harness();
        let record = CredentialRecord::station("Office", "secret-pass").unwrap();
        let reply = h.send(request(Command::AddSsid, RECORD_SIZE), &record.to_bytes());
        assert_eq!(reply.code(), ResponseCode::Empty.code());

        let (slot, stored) = h.store.find_credential(b"Office").unwrap().unwrap();
        assert_eq!(slot, 1);
        assert_eq!(stored.password_bytes(), b"secret-pass");
        assert!(h.engine.buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_add_ssid_wrong_length() {
        let mut h = harness();
        let reply = h.send(request(Command::AddSsid, RECORD_SIZE - 4), &[0u8; RECORD_SIZE - 4]);
        assert_eq!(reply.code(), ResponseCode::BadDataLength.code());
        assert_eq!(h.state.last_error(), None);
    }

    #[test]
    fn test_add_ssid_table_full() {
        let mut h = harness();
        for i in 0..MAX_REMEMBERED_NETWORKS {
            remember(&h, &format!("net{}", i));
        }
        let record = CredentialRecord::station("one-too-many", "password1").unwrap();
        let reply = h.send(request(Command::AddSsid, RECORD_SIZE), &record.to_bytes());
        assert_eq!(reply.code(), ResponseCode::Empty.code());
        assert_eq!(h.state.last_error(), Some("SSID table full"));
    }

    #[test]
    fn test_configure_access_point_uses_slot_zero() {
        let mut h = harness();
        let record = CredentialRecord::station("Module", "password1").unwrap();
        h.send(
            request(Command::ConfigureAccessPoint, RECORD_SIZE),
            &record.to_bytes(),
        );
        assert_eq!(h.store.credential(0).unwrap().unwrap().ssid(), "Module");
    }

    #[test]
    fn test_delete_ssid() {
        let mut h = harness();
        remember(&h, "Home");
        h.send(request(Command::DeleteSsid, SSID_LENGTH), &ssid_field("Home"));
        assert_eq!(h.store.find_credential(b"Home").unwrap(), None);
        assert_eq!(h.state.last_error(), None);

        h.send(request(Command::DeleteSsid, SSID_LENGTH), &ssid_field("Home"));
        assert_eq!(h.state.last_error(), Some("SSID not found"));
    }

    #[test]
    fn test_retrieve_ssid_data() {
        let mut h = harness();
        remember(&h, "Home");
        remember(&h, "Office");

        let mut header = RequestHeader::new(Command::RetrieveSsidData);
        header.buffer_available = (REDUCED_RECORD_SIZE - 1) as u16;
        assert_eq!(h.send(header, &[]).code(), ResponseCode::BufferTooSmall.code());

        header.buffer_available = MAX_DATA_LENGTH as u16;
        let payload = h.send(header, &[]).payload();
        // Unset access point slot plus two networks
        assert_eq!(payload.len(), 3 * REDUCED_RECORD_SIZE);
        assert!(payload[..REDUCED_RECORD_SIZE].iter().all(|&b| b == 0));
        assert_eq!(&payload[REDUCED_RECORD_SIZE + 16..REDUCED_RECORD_SIZE + 20], b"Home");
    }

    #[test]
    fn test_list_ssids_text() {
        let mut h = harness();
        remember(&h, "Home");
        let payload = h.send(RequestHeader::new(Command::ListSsidsDeprecated), &[]).payload();
        assert_eq!(payload, b"\nHome\n\0");

        let mut header = RequestHeader::new(Command::ListSsidsDeprecated);
        header.buffer_available = 4;
        assert_eq!(h.send(header, &[]).code(), ResponseCode::BufferTooSmall.code());
    }

    // ==================== Status Command Tests ====================

    #[test]
    fn test_get_status_when_connected() {
        let mut h = harness();
        remember(&h, "Home");
        h.send(request(Command::StartClient, 4), b"Home");
        h.radio.set_ip(Ipv4Addr::new(192, 168, 1, 50));
        h.radio.set_status(StationStatus::GotIp);
        h.wifi.poll(&mut h.state, h.now);

        let reply = h.send(RequestHeader::new(Command::GetStatus), &[]);
        assert_eq!(reply.state(), WifiState::Connected.as_u8());
        let payload = reply.payload();
        assert_eq!(payload.len(), NETWORK_STATUS_SIZE);
        assert_eq!(&payload[0..4], &[192, 168, 1, 50]);
        assert_eq!(payload[16] as i8, -60);
        assert_eq!(&payload[22..28], &SimulatedRadio::MAC);
        assert_eq!(&payload[108..113], b"Home\0");
    }

    #[test]
    fn test_get_status_when_idle_has_no_address() {
        let mut h = harness();
        h.radio.set_ip(Ipv4Addr::new(192, 168, 1, 50));
        let payload = h.send(RequestHeader::new(Command::GetStatus), &[]).payload();
        assert_eq!(&payload[0..4], &[0, 0, 0, 0]);
        assert_eq!(&payload[44..44 + 16], b"net-coprocessor\0");
    }

    #[test]
    fn test_set_host_name() {
        let mut h = harness();
        let mut name = [0u8; HOST_NAME_LENGTH];
        name[..7].copy_from_slice(b"printer");
        h.send(request(Command::SetHostName, HOST_NAME_LENGTH), &name);
        assert_eq!(h.state.host_name(), "printer");

        let reply = h.send(request(Command::SetHostName, 7), b"printer");
        assert_eq!(reply.code(), ResponseCode::BadDataLength.code());
    }

    #[test]
    fn test_get_last_error() {
        let mut h = harness();
        assert_eq!(
            h.send(RequestHeader::new(Command::GetLastError), &[]).code(),
            0
        );

        h.state.set_error("Listen failed");
        h.state.set_wifi_state(WifiState::Connecting);
        assert!(h.state.needs_attention());
        let payload = h.send(RequestHeader::new(Command::GetLastError), &[]).payload();
        assert_eq!(payload, b"Listen failed\0");
        assert_eq!(h.state.last_error(), None);
        assert!(!h.state.needs_attention());
    }

    #[test]
    fn test_get_last_error_buffer_too_small_still_clears() {
        let mut h = harness();
        h.state.set_error("Listen failed");
        let mut header = RequestHeader::new(Command::GetLastError);
        header.buffer_available = 13;
        assert_eq!(h.send(header, &[]).code(), ResponseCode::BufferTooSmall.code());
        assert_eq!(h.state.last_error(), None);
    }

    #[test]
    fn test_set_tx_power() {
        let mut h = harness();
        let mut header = RequestHeader::new(Command::SetTxPower);
        header.flags = MAX_TX_POWER;
        assert_eq!(h.send(header, &[]).code(), ResponseCode::Empty.code());
        assert_eq!(h.radio.tx_power(), Some(MAX_TX_POWER));

        header.flags = MAX_TX_POWER + 1;
        assert_eq!(h.send(header, &[]).code(), ResponseCode::BadParameter.code());
        assert_eq!(h.radio.tx_power(), Some(MAX_TX_POWER));
    }

    // ==================== Listener Tests ====================

    #[test]
    fn test_listen() {
        let mut h = harness();
        let record = ListenRecord {
            remote_ip: Ipv4Addr::UNSPECIFIED,
            port: 80,
            protocol: 0,
            max_connections: 4,
        };
        let reply = h.send(request(Command::Listen, LISTEN_RECORD_SIZE), &record.to_bytes());
        assert_eq!(reply.code(), ResponseCode::Empty.code());
        assert_eq!(h.listener.calls.len(), 1);
        assert_eq!(h.listener.calls[0].port, 80);
        assert_eq!(h.listener.calls[0].max_connections, 4);
    }

    #[test]
    fn test_listen_zero_connections_stops() {
        let mut h = harness();
        let record = ListenRecord {
            remote_ip: Ipv4Addr::UNSPECIFIED,
            port: 21,
            protocol: 1,
            max_connections: 0,
        };
        h.send(request(Command::Listen, LISTEN_RECORD_SIZE), &record.to_bytes());
        assert!(h.listener.calls.is_empty());
        assert_eq!(h.listener.stopped, vec![21]);
    }

    #[test]
    fn test_listen_failure_sets_error() {
        let mut h = harness();
        h.listener.fail = true;
        let record = ListenRecord {
            remote_ip: Ipv4Addr::UNSPECIFIED,
            port: 80,
            protocol: 0,
            max_connections: 1,
        };
        h.send(request(Command::Listen, LISTEN_RECORD_SIZE), &record.to_bytes());
        assert_eq!(h.state.last_error(), Some("Listen failed"));

        let reply = h.send(request(Command::Listen, 4), &[0u8; 4]);
        assert_eq!(reply.code(), ResponseCode::BadDataLength.code());
    }

    // ==================== Connection Command Tests ====================

    #[test]
    fn test_invalid_socket_number() {
        let mut h = harness();
        let mut header = RequestHeader::new(Command::ConnRead);
        header.socket = MAX_CONNECTIONS as u8;
        assert_eq!(h.send(header, &[]).code(), ResponseCode::BadParameter.code());
        assert_eq!(h.state.last_error(), None);
    }

    #[test]
    fn test_conn_read() {
        let mut h = harness();
        h.sockets.sockets[2].rx = b"hello world".to_vec();

        let mut header = RequestHeader::new(Command::ConnRead);
        header.socket = 2;
        header.buffer_available = 5;
        let reply = h.send(header, &[]);
        assert_eq!(reply.payload(), b"hello");
        assert_eq!(h.sockets.sockets[2].rx, b" world");
    }

    #[test]
    fn test_conn_write_complete() {
        let mut h = harness();
        h.sockets.sockets[0].connect(Ipv4Addr::new(10, 0, 0, 2), 4000, 100);

        let mut header = request(Command::ConnWrite, 6);
        header.flags = FLAG_PUSH | FLAG_CLOSE_AFTER_WRITE;
        let reply = h.send(header, b"abcdef");
        assert_eq!(reply.code(), 6);
        let socket = &h.sockets.sockets[0];
        assert_eq!(socket.written, b"abcdef");
        assert!(socket.pushed);
        assert!(socket.close_after);
    }

    #[test]
    fn test_conn_write_partial_ignores_flags() {
        let mut h = harness();
        h.sockets.sockets[0].connect(Ipv4Addr::new(10, 0, 0, 2), 4000, 4);

        let mut header = request(Command::ConnWrite, 6);
        header.flags = FLAG_PUSH | FLAG_CLOSE_AFTER_WRITE;
        let reply = h.send(header, b"abcdef");
        assert_eq!(reply.code(), 4);
        let socket = &h.sockets.sockets[0];
        assert_eq!(socket.written, b"abcd");
        assert!(!socket.pushed);
        assert!(!socket.close_after);
        assert_eq!(h.state.last_error(), None);
    }

    #[test]
    fn test_conn_close_and_abort() {
        let mut h = harness();
        let mut header = RequestHeader::new(Command::ConnClose);
        header.socket = 3;
        h.send(header, &[]);
        assert!(h.sockets.sockets[3].closed);

        let mut header = RequestHeader::new(Command::ConnAbort);
        header.socket = 4;
        h.send(header, &[]);
        assert!(h.sockets.sockets[4].terminated);
    }

    #[test]
    fn test_conn_get_status() {
        let mut h = harness();
        h.sockets.sockets[1].connect(Ipv4Addr::new(10, 0, 0, 9), 5000, 512);
        h.sockets.sockets[1].rx = vec![0; 10];

        let mut header = RequestHeader::new(Command::ConnGetStatus);
        header.socket = 1;
        let payload = h.send(header, &[]).payload();
        assert_eq!(payload.len(), CONN_STATUS_SIZE);
        assert_eq!(payload[1], 1);
        assert_eq!(&payload[2..4], &10u16.to_le_bytes());
        assert_eq!(&payload[12..16], &[10, 0, 0, 9]);
        assert_eq!(&payload[16..18], &[0b10, 0]);
    }

    // ==================== Enterprise Upload Tests ====================

    fn enterprise_op(op: EnterpriseOp, len: usize) -> RequestHeader {
        RequestHeader {
            flags: op.as_u8(),
            ..request(Command::AddEnterpriseSsid, len)
        }
    }

    #[test]
    fn test_enterprise_upload_commit() {
        let mut h = harness();
        let record =
            CredentialRecord::enterprise("Corp", Security::EapTls, "alice", "", [6, 4, 3]).unwrap();

        let reply = h.send(enterprise_op(EnterpriseOp::Begin, RECORD_SIZE), &record.to_bytes());
        assert_eq!(reply.code(), ResponseCode::Empty.code());
        assert!(h.store.is_staging());

        h.send(enterprise_op(EnterpriseOp::CaCertificate, 3), b"CA-");
        h.send(enterprise_op(EnterpriseOp::CaCertificate, 3), b"123");
        h.send(enterprise_op(EnterpriseOp::ClientCertificate, 4), b"CERT");
        h.send(enterprise_op(EnterpriseOp::PrivateKey, 3), b"KEY");
        assert_eq!(h.store.find_credential(b"Corp").unwrap(), None);

        let reply = h.send(enterprise_op(EnterpriseOp::Commit, 0), &[]);
        assert_eq!(reply.code(), ResponseCode::Empty.code());
        assert_eq!(h.state.last_error(), None);

        let (slot, _) = h.store.find_credential(b"Corp").unwrap().unwrap();
        let credentials = h.store.enterprise_credentials(slot).unwrap().unwrap();
        assert_eq!(credentials.ca_certificate, b"CA-123");
        assert_eq!(credentials.private_key, b"KEY");
        assert!(h.engine.buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_enterprise_commit_incomplete() {
        let mut h = harness();
        let record =
            CredentialRecord::enterprise("Corp", Security::EapTls, "alice", "", [6, 0, 0]).unwrap();
        h.send(enterprise_op(EnterpriseOp::Begin, RECORD_SIZE), &record.to_bytes());
        h.send(enterprise_op(EnterpriseOp::CaCertificate, 3), b"CA-");

        let reply = h.send(enterprise_op(EnterpriseOp::Commit, 0), &[]);
        assert_eq!(reply.code(), ResponseCode::BadParameter.code());
        assert!(h.state.last_error().is_some());
        assert!(!h.store.is_staging());
        assert_eq!(h.store.find_credential(b"Corp").unwrap(), None);
    }

    #[test]
    fn test_enterprise_cancel_without_upload() {
        let mut h = harness();
        let reply = h.send(enterprise_op(EnterpriseOp::Cancel, 0), &[]);
        assert_eq!(reply.code(), ResponseCode::BadParameter.code());
        assert!(h.state.last_error().is_some());
    }

    #[test]
    fn test_enterprise_request_validation() {
        let mut h = harness();
        let mut header = request(Command::AddEnterpriseSsid, 0);
        header.flags = 6;
        assert_eq!(h.send(header, &[]).code(), ResponseCode::BadParameter.code());

        let reply = h.send(enterprise_op(EnterpriseOp::PrivateKey, 0), &[]);
        assert_eq!(reply.code(), ResponseCode::BadDataLength.code());

        let reply = h.send(enterprise_op(EnterpriseOp::Begin, 8), &[0; 8]);
        assert_eq!(reply.code(), ResponseCode::BadDataLength.code());
        assert_eq!(h.state.last_error(), None);
    }

    #[test]
    fn test_enterprise_chunk_without_begin_sets_error() {
        let mut h = harness();
        let reply = h.send(enterprise_op(EnterpriseOp::CaCertificate, 3), b"abc");
        assert_eq!(reply.code(), ResponseCode::Empty.code());
        assert_eq!(h.state.last_error(), Some("no enterprise upload in progress"));
    }
}
