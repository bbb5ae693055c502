//! Out-of-band signaling to the host: the transfer-ready interrupt flag,
//! the attention pulse on the ready line, and the status LED.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::platform::GpioLines;
use crate::state::ModuleState;
use crate::wifi::WifiState;

/// Time each side of the attention pulse is held.
pub const PULSE_WIDTH_US: u32 = 2;

/// Set from the transfer-ready interrupt, consumed by the control loop.
///
/// The interrupt side only ever calls [`TransferReadyFlag::signal`].
#[derive(Debug, Clone, Default)]
pub struct TransferReadyFlag(Arc<AtomicBool>);

impl TransferReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Pulses the host-ready line when the host has something to collect.
#[derive(Debug)]
pub struct AttentionSignal {
    interval: Duration,
    seen_generation: u32,
    seen_state: WifiState,
    last_pulse: Instant,
}

impl AttentionSignal {
    pub fn new(state: &ModuleState, interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            seen_generation: state.error_generation(),
            seen_state: state.wifi_state(),
            last_pulse: now,
        }
    }

    /// Pulse if the error or the state changed since the last call, or if
    /// the host has left something uncollected for a full interval.
    /// Returns whether a pulse was sent.
    pub fn poll(&mut self, state: &ModuleState, gpio: &mut dyn GpioLines, now: Instant) -> bool {
        let changed = state.error_generation() != self.seen_generation
            || state.wifi_state() != self.seen_state;
        let overdue = state.needs_attention()
            && now.saturating_duration_since(self.last_pulse) > self.interval;
        if !changed && !overdue {
            return false;
        }

        gpio.delay_us(PULSE_WIDTH_US);
        gpio.set_host_ready(false);
        gpio.delay_us(PULSE_WIDTH_US);
        gpio.set_host_ready(true);

        debug!(
            "Attention pulse (state {}, error pending: {})",
            state.wifi_state(),
            state.last_error().is_some()
        );
        self.seen_generation = state.error_generation();
        self.seen_state = state.wifi_state();
        self.last_pulse = now;
        true
    }
}

/// Onboard LED: solid when up, blinking while connecting, off otherwise.
#[derive(Debug)]
pub struct StatusLed {
    blink_interval: Duration,
    last_toggle: Option<Instant>,
}

impl StatusLed {
    pub fn new(blink_interval: Duration) -> Self {
        Self {
            blink_interval,
            last_toggle: None,
        }
    }

    pub fn update(&mut self, state: WifiState, gpio: &mut dyn GpioLines, now: Instant) {
        match state {
            WifiState::Connected | WifiState::RunningAsAccessPoint => {
                self.last_toggle = None;
                gpio.set_led(true);
            }
            WifiState::Connecting | WifiState::Reconnecting | WifiState::AutoReconnecting => {
                let due = self
                    .last_toggle
                    .map_or(true, |at| now.saturating_duration_since(at) > self.blink_interval);
                if due {
                    let lit = gpio.led();
                    gpio.set_led(!lit);
                    self.last_toggle = Some(now);
                }
            }
            WifiState::Disabled | WifiState::Idle => {
                self.last_toggle = None;
                gpio.set_led(false);
            }
        }
    }
}
