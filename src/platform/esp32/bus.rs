//! Host bus over HSPI, plus the handshake and LED GPIOs.
//!
//! The module is bus master. Chip select is driven by hand through
//! [`EspGpioLines::set_select`] so a whole transaction stays selected
//! across several transfers.

use esp_idf_hal::delay::Ets;
use esp_idf_hal::gpio::{
    AnyInputPin, AnyOutputPin, Gpio12, Gpio13, Gpio14, Input, InterruptType, Output, PinDriver,
};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::spi::config::{Config as SpiConfig, DriverConfig, MODE_1};
use esp_idf_hal::spi::{SpiDeviceDriver, SpiDriver, SPI2};
use esp_idf_hal::units::FromValueType;
use esp_idf_sys::EspError;
use log::{info, warn};

use crate::platform::{
    clock_frequency, GpioLines, HostBus, PlatformError, DEFAULT_CLOCK_REGISTER,
};
use crate::runtime::TransferReadyFlag;

type Device = SpiDeviceDriver<'static, &'static SpiDriver<'static>>;

/// Largest block exchanged in one SPI transfer.
const BLOCK_WORDS: usize = 64;

/// HSPI in mode 1, words sent little-endian.
pub struct EspHostBus {
    driver: &'static SpiDriver<'static>,
    device: Device,
    clock_register: u32,
}

impl EspHostBus {
    pub fn new(
        spi: impl Peripheral<P = SPI2> + 'static,
        sclk: impl Peripheral<P = Gpio14> + 'static,
        mosi: impl Peripheral<P = Gpio13> + 'static,
        miso: impl Peripheral<P = Gpio12> + 'static,
    ) -> Result<Self, EspError> {
        let driver = SpiDriver::new(spi, sclk, mosi, Some(miso), &DriverConfig::new())?;
        // The device is rebuilt on clock changes and must borrow the driver
        let driver: &'static SpiDriver<'static> = Box::leak(Box::new(driver));
        let device = Self::device(driver, DEFAULT_CLOCK_REGISTER)?;
        info!(
            "Host bus ready at {} Hz",
            clock_frequency(DEFAULT_CLOCK_REGISTER)
        );
        Ok(Self {
            driver,
            device,
            clock_register: DEFAULT_CLOCK_REGISTER,
        })
    }

    fn device(driver: &'static SpiDriver<'static>, register: u32) -> Result<Device, EspError> {
        let config = SpiConfig::new()
            .baudrate(clock_frequency(register).Hz().into())
            .data_mode(MODE_1);
        SpiDeviceDriver::new(driver, Option::<AnyOutputPin>::None, &config)
    }

    fn exchange(&mut self, tx: &[u32], rx: &mut [u32]) -> Result<(), PlatformError> {
        let mut out = [0u8; BLOCK_WORDS * 4];
        let mut inp = [0u8; BLOCK_WORDS * 4];
        for (tx_block, rx_block) in tx.chunks(BLOCK_WORDS).zip(rx.chunks_mut(BLOCK_WORDS)) {
            let len = tx_block.len() * 4;
            for (bytes, word) in out.chunks_exact_mut(4).zip(tx_block) {
                bytes.copy_from_slice(&word.to_le_bytes());
            }
            self.device
                .transfer(&mut inp[..len], &out[..len])
                .map_err(|e| {
                    warn!("SPI transfer failed: {}", e);
                    PlatformError::BusFault
                })?;
            for (word, bytes) in rx_block.iter_mut().zip(inp.chunks_exact(4)) {
                *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
        }
        Ok(())
    }
}

impl HostBus for EspHostBus {
    fn begin_transaction(&mut self) {}

    fn end_transaction(&mut self) {}

    fn transfer_word(&mut self, out: u32) -> Result<u32, PlatformError> {
        let mut word = [0u32];
        self.exchange(&[out], &mut word)?;
        Ok(word[0])
    }

    fn write_words(&mut self, tx: &[u32]) -> Result<(), PlatformError> {
        let mut discard = vec![0u32; tx.len()];
        self.exchange(tx, &mut discard)
    }

    fn read_words(&mut self, rx: &mut [u32]) -> Result<(), PlatformError> {
        let zeros = vec![0u32; rx.len()];
        self.exchange(&zeros, rx)
    }

    fn transfer_words(&mut self, tx: &[u32], rx: &mut [u32]) -> Result<(), PlatformError> {
        self.exchange(tx, rx)
    }

    fn set_clock_divider(&mut self, divider: u32) {
        match Self::device(self.driver, divider) {
            Ok(device) => {
                self.device = device;
                self.clock_register = divider;
                info!("Host bus clock now {} Hz", clock_frequency(divider));
            }
            Err(e) => warn!("Failed to change bus clock: {}", e),
        }
    }

    fn clock_register(&self) -> u32 {
        self.clock_register
    }
}

/// Handshake lines and the onboard LED (active low).
pub struct EspGpioLines {
    host_ready: PinDriver<'static, AnyOutputPin, Output>,
    transfer_ready: PinDriver<'static, AnyInputPin, Input>,
    select: PinDriver<'static, AnyOutputPin, Output>,
    led: PinDriver<'static, AnyOutputPin, Output>,
    led_on: bool,
}

fn drive(pin: &mut PinDriver<'static, AnyOutputPin, Output>, high: bool) {
    let result = if high { pin.set_high() } else { pin.set_low() };
    if let Err(e) = result {
        warn!("GPIO {} write failed: {}", pin.pin(), e);
    }
}

impl EspGpioLines {
    /// Configure the lines and route rising edges of transfer-ready to
    /// `flag`.
    pub fn new(
        host_ready: AnyOutputPin,
        transfer_ready: AnyInputPin,
        select: AnyOutputPin,
        led: AnyOutputPin,
        flag: TransferReadyFlag,
    ) -> Result<Self, EspError> {
        let mut transfer_ready = PinDriver::input(transfer_ready)?;
        transfer_ready.set_interrupt_type(InterruptType::PosEdge)?;
        // The callback only stores to an atomic
        unsafe {
            transfer_ready.subscribe(move || flag.signal())?;
        }
        transfer_ready.enable_interrupt()?;

        let mut lines = Self {
            host_ready: PinDriver::output(host_ready)?,
            transfer_ready,
            select: PinDriver::output(select)?,
            led: PinDriver::output(led)?,
            led_on: false,
        };
        drive(&mut lines.host_ready, false);
        drive(&mut lines.select, true);
        drive(&mut lines.led, true);
        Ok(lines)
    }
}

impl GpioLines for EspGpioLines {
    fn set_host_ready(&mut self, high: bool) {
        drive(&mut self.host_ready, high);
    }

    fn transfer_ready(&mut self) -> bool {
        // Interrupts are disabled after each edge until re-armed
        if let Err(e) = self.transfer_ready.enable_interrupt() {
            warn!("Failed to re-arm transfer-ready interrupt: {}", e);
        }
        self.transfer_ready.is_high()
    }

    fn set_select(&mut self, asserted: bool) {
        drive(&mut self.select, !asserted);
    }

    fn set_led(&mut self, on: bool) {
        drive(&mut self.led, !on);
        self.led_on = on;
    }

    fn led(&self) -> bool {
        self.led_on
    }

    fn delay_us(&mut self, us: u32) {
        Ets::delay_us(us);
    }
}
