//! Network co-processor firmware binary.
//!
//! On ESP32 this wires the control loop to the HSPI host bus, the WiFi
//! driver and flash storage. On the host it runs the same loop over
//! in-memory storage, a simulated radio and real TCP sockets, which is
//! useful for watching the loop's logging without hardware.

use std::sync::Arc;

use log::{error, info};
use tokio_util::sync::CancellationToken;

use wifi_coprocessor::platform::net::TcpListeners;
use wifi_coprocessor::{ConfigStore, InitError, Module, ModuleConfig, Platform, TransferReadyFlag};

// ESP32: Initialize ESP-IDF before anything else
#[cfg(feature = "esp32")]
fn platform_init() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("ESP-IDF initialized");
}

// Host: Just initialize env_logger
#[cfg(not(feature = "esp32"))]
fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[cfg(feature = "esp32")]
fn build_module(config: ModuleConfig) -> Result<Module, InitError> {
    use esp_idf_hal::gpio::{InputPin, OutputPin};
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use wifi_coprocessor::platform::esp32::{
        EspGpioLines, EspHostBus, EspRadio, EspSystem, FlashPartition, NvsKvEngine,
        SCRATCH_PARTITION, SSID_PARTITION,
    };
    use wifi_coprocessor::platform::PlatformError;
    use wifi_coprocessor::wifi::StationStatusCell;

    let Peripherals {
        modem, spi2, pins, ..
    } = Peripherals::take().map_err(PlatformError::from)?;
    let sysloop = EspSystemEventLoop::take().map_err(PlatformError::from)?;
    let nvs = EspDefaultNvsPartition::take().map_err(PlatformError::from)?;

    let store = Arc::new(ConfigStore::open(
        Box::new(FlashPartition::find(SSID_PARTITION)?),
        Box::new(FlashPartition::find(SCRATCH_PARTITION)?),
        Box::new(NvsKvEngine::open(nvs).map_err(PlatformError::from)?),
    )?);
    let radio =
        EspRadio::new(modem, sysloop, StationStatusCell::new()).map_err(PlatformError::from)?;

    let transfer_ready = TransferReadyFlag::new();
    let bus = EspHostBus::new(spi2, pins.gpio14, pins.gpio13, pins.gpio12)
        .map_err(PlatformError::from)?;
    let gpio = EspGpioLines::new(
        pins.gpio0.downgrade_output(),
        pins.gpio4.downgrade_input(),
        pins.gpio15.downgrade_output(),
        pins.gpio2.downgrade_output(),
        transfer_ready.clone(),
    )
    .map_err(PlatformError::from)?;

    let listeners = TcpListeners::new();
    let platform = Platform {
        bus: Box::new(bus),
        gpio: Box::new(gpio),
        sockets: Box::new(listeners.sockets()),
        listener: Box::new(listeners),
        system: Box::new(EspSystem::new()),
    };
    Module::new(config, store, Box::new(radio), platform, transfer_ready)
}

#[cfg(not(feature = "esp32"))]
fn build_module(config: ModuleConfig) -> Result<Module, InitError> {
    use wifi_coprocessor::platform::host::{
        HostGpio, HostSystem, MemoryKv, MemoryPartition, ScriptedBus, SimulatedRadio,
    };
    use wifi_coprocessor::wifi::TABLE_SIZE;

    let store = Arc::new(ConfigStore::open(
        Box::new(MemoryPartition::new(TABLE_SIZE)),
        Box::new(MemoryPartition::new(64 * 1024)),
        Box::new(MemoryKv::new()),
    )?);

    let listeners = TcpListeners::new();
    let platform = Platform {
        bus: Box::new(ScriptedBus::new()),
        gpio: Box::new(HostGpio::new()),
        sockets: Box::new(listeners.sockets()),
        listener: Box::new(listeners),
        system: Box::new(HostSystem::new()),
    };
    Module::new(
        config,
        store,
        Box::new(SimulatedRadio::new()),
        platform,
        TransferReadyFlag::new(),
    )
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    platform_init();

    info!("=== Network co-processor starting ===");

    #[cfg(feature = "esp32")]
    info!("Platform: ESP32");
    #[cfg(not(feature = "esp32"))]
    info!("Platform: Host (simulated radio, no bus host attached)");

    let mut module = match build_module(ModuleConfig::default()) {
        Ok(module) => module,
        Err(e) => {
            error!("Startup failed: {}", e);
            return;
        }
    };

    let cancel = CancellationToken::new();

    #[cfg(not(feature = "esp32"))]
    {
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down...");
                shutdown.cancel();
            }
        });
    }

    module.run(cancel).await;
    info!("Shutdown complete");
}
