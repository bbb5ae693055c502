//! Control loop of the co-processor.
//!
//! [`Module`] owns every component and runs them in a fixed order on each
//! pass: reassert readiness, signal the host if needed, serve one bus
//! transaction when the host asks for it, advance the connection state
//! machine, and update the LED.

pub mod signal;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ModuleConfig};
use crate::platform::{
    GpioLines, HostBus, Listener, PlatformError, SocketTable, SystemServices,
};
use crate::protocol::{TransactionContext, TransactionEngine};
use crate::state::ModuleState;
use crate::wifi::{ConfigStore, ConnectionManager, RadioDriver, StoreError};

pub use signal::{AttentionSignal, StatusLed, TransferReadyFlag, PULSE_WIDTH_US};

/// Period of the control loop when driven by [`Module::run`].
pub const LOOP_PERIOD: Duration = Duration::from_millis(1);

/// Board collaborators other than the radio and storage.
pub struct Platform {
    pub bus: Box<dyn HostBus>,
    pub gpio: Box<dyn GpioLines>,
    pub sockets: Box<dyn SocketTable>,
    pub listener: Box<dyn Listener>,
    pub system: Box<dyn SystemServices>,
}

/// Startup failures.
#[derive(Debug)]
pub enum InitError {
    /// The module configuration was rejected.
    Config(ConfigError),
    /// The credential store could not be opened.
    Store(StoreError),
    /// A board peripheral could not be set up.
    Platform(PlatformError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid configuration: {}", e),
            Self::Store(e) => write!(f, "credential store unavailable: {}", e),
            Self::Platform(e) => write!(f, "platform setup failed: {}", e),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Platform(e) => Some(e),
        }
    }
}

impl From<ConfigError> for InitError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StoreError> for InitError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<PlatformError> for InitError {
    fn from(e: PlatformError) -> Self {
        Self::Platform(e)
    }
}

/// The co-processor: state, components and platform, driven one pass at a
/// time.
pub struct Module {
    config: ModuleConfig,
    state: ModuleState,
    store: Arc<ConfigStore>,
    wifi: ConnectionManager,
    engine: TransactionEngine,
    attention: AttentionSignal,
    led: StatusLed,
    transfer_ready: TransferReadyFlag,
    platform: Platform,
}

impl Module {
    /// Validate `config`, bring the radio to `Idle` and raise host-ready.
    pub fn new(
        config: ModuleConfig,
        store: Arc<ConfigStore>,
        radio: Box<dyn RadioDriver>,
        mut platform: Platform,
        transfer_ready: TransferReadyFlag,
    ) -> Result<Self, InitError> {
        config.validate()?;

        let now = Instant::now();
        let mut state = ModuleState::new(config.host_name.clone());
        let mut wifi = ConnectionManager::new(radio, Arc::clone(&store), &config);
        wifi.init(&mut state);

        platform.gpio.set_led(false);
        platform.gpio.set_select(false);
        platform.gpio.set_host_ready(true);

        let attention = AttentionSignal::new(&state, config.status_report_interval, now);
        let led = StatusLed::new(config.led_blink_interval);
        info!("Init completed (firmware {})", crate::config::FIRMWARE_VERSION);

        Ok(Self {
            config,
            state,
            store,
            wifi,
            engine: TransactionEngine::new(),
            attention,
            led,
            transfer_ready,
            platform,
        })
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn state(&self) -> &ModuleState {
        &self.state
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn wifi(&self) -> &ConnectionManager {
        &self.wifi
    }

    pub fn engine(&self) -> &TransactionEngine {
        &self.engine
    }

    fn transaction_due(&self, now: Instant) -> bool {
        self.state.last_transaction().map_or(true, |at| {
            now.saturating_duration_since(at) > self.config.transfer_ready_timeout
        })
    }

    /// One pass of the control loop.
    pub fn run_once(&mut self, now: Instant) {
        let platform = &mut self.platform;
        platform.gpio.set_host_ready(true);
        platform.system.feed_watchdog();

        self.attention
            .poll(&self.state, platform.gpio.as_mut(), now);

        // The interrupt can be missed if the host toggles the line quickly,
        // so a raised line is also served once the timeout has passed.
        if platform.gpio.transfer_ready() && (self.transfer_ready.take() || self.transaction_due(now))
        {
            let platform = &mut self.platform;
            let mut ctx = TransactionContext {
                bus: platform.bus.as_mut(),
                gpio: platform.gpio.as_mut(),
                state: &mut self.state,
                store: &self.store,
                wifi: &mut self.wifi,
                sockets: platform.sockets.as_mut(),
                listener: platform.listener.as_mut(),
                system: platform.system.as_mut(),
            };
            if let Err(e) = self.engine.process(&mut ctx, now) {
                warn!("Bus transaction failed: {}", e);
            }
            self.state.set_last_transaction(now);
        }

        self.wifi.poll(&mut self.state, now);
        self.led
            .update(self.state.wifi_state(), self.platform.gpio.as_mut(), now);
    }

    /// Run the control loop every [`LOOP_PERIOD`] until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(LOOP_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Control loop shutting down");
                    break;
                }
                _ = ticker.tick() => self.run_once(Instant::now()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::host::{
        HostGpio, HostSystem, MemoryKv, MemoryPartition, MemorySockets, RecordingListener,
        ScriptedBus, SimulatedRadio,
    };
    use crate::protocol::{Command, RequestHeader, ResponseCode};
    use crate::wifi::{WifiState, TABLE_SIZE};

    struct Rig {
        module: Module,
        bus: ScriptedBus,
        gpio: HostGpio,
        flag: TransferReadyFlag,
    }

    fn rig(config: ModuleConfig) -> Result<Rig, InitError> {
        let store = Arc::new(ConfigStore::open(
            Box::new(MemoryPartition::new(TABLE_SIZE)),
            Box::new(MemoryPartition::new(4096)),
            Box::new(MemoryKv::new()),
        )?);
        let bus = ScriptedBus::new();
        let gpio = HostGpio::new();
        let flag = TransferReadyFlag::new();
        let platform = Platform {
            bus: Box::new(bus.clone()),
            gpio: Box::new(gpio.clone()),
            sockets: Box::new(MemorySockets::new()),
            listener: Box::new(RecordingListener::new()),
            system: Box::new(HostSystem::instant()),
        };
        let module = Module::new(
            config,
            store,
            Box::new(SimulatedRadio::new()),
            platform,
            flag.clone(),
        )?;
        Ok(Rig {
            module,
            bus,
            gpio,
            flag,
        })
    }

    #[test]
    fn test_new_enters_idle() {
        let rig = rig(ModuleConfig::default()).unwrap();
        assert_eq!(rig.module.state().wifi_state(), WifiState::Idle);
        assert!(rig.gpio.host_ready());
        assert!(!rig.gpio.led_on());
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let config = ModuleConfig {
            default_ap_channel: 14,
            ..ModuleConfig::default()
        };
        assert!(matches!(rig(config), Err(InitError::Config(_))));
    }

    #[test]
    fn test_transaction_needs_ready_line() {
        let mut rig = rig(ModuleConfig::default()).unwrap();
        rig.bus
            .queue_words(&RequestHeader::new(Command::Null).to_words());
        rig.flag.signal();

        let now = Instant::now();
        rig.module.run_once(now);
        assert_eq!(rig.bus.transactions(), 0);

        rig.gpio.set_transfer_ready(true);
        rig.module.run_once(now);
        assert_eq!(rig.bus.transactions(), 1);
        let sent = rig.bus.take_sent();
        assert_eq!(sent[2] as i32, ResponseCode::Empty.code());
        assert_eq!(rig.module.state().last_transaction(), Some(now));
    }

    #[test]
    fn test_transaction_timeout_without_interrupt() {
        let mut rig = rig(ModuleConfig::default()).unwrap();
        rig.gpio.set_transfer_ready(true);
        let start = Instant::now();

        // Never transacted, so the first pass is due
        rig.module.run_once(start);
        assert_eq!(rig.bus.transactions(), 1);

        rig.module.run_once(start + Duration::from_millis(5));
        assert_eq!(rig.bus.transactions(), 1);

        rig.module.run_once(start + Duration::from_millis(11));
        assert_eq!(rig.bus.transactions(), 2);

        rig.flag.signal();
        rig.module.run_once(start + Duration::from_millis(12));
        assert_eq!(rig.bus.transactions(), 3);
        assert!(!rig.flag.is_set());
    }

    #[test]
    fn test_first_pass_signals_idle() {
        let mut rig = rig(ModuleConfig::default()).unwrap();
        let start = Instant::now();
        // Idle has not been reported yet
        rig.module.run_once(start + Duration::from_millis(250));
        assert_eq!(rig.gpio.pulses(), 1);
    }
}
