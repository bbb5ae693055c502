//! System information and services from ESP-IDF.

use esp_idf_hal::delay::FreeRtos;
use esp_idf_sys::{self as sys, esp};
use log::{info, warn};

use crate::platform::{ResetReason, SystemServices};

/// ESP-IDF system services. Subscribes the control task to the task
/// watchdog on creation.
pub struct EspSystem {
    watchdog: bool,
}

impl EspSystem {
    pub fn new() -> Self {
        let watchdog = match esp!(unsafe { sys::esp_task_wdt_add(std::ptr::null_mut()) }) {
            Ok(()) => true,
            Err(e) => {
                warn!("Task watchdog unavailable: {}", e);
                false
            }
        };
        Self { watchdog }
    }
}

impl Default for EspSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn reset_reason(raw: sys::esp_reset_reason_t) -> ResetReason {
    match raw {
        sys::esp_reset_reason_t_ESP_RST_POWERON => ResetReason::PowerOn,
        sys::esp_reset_reason_t_ESP_RST_WDT => ResetReason::HardwareWatchdog,
        sys::esp_reset_reason_t_ESP_RST_PANIC => ResetReason::Exception,
        sys::esp_reset_reason_t_ESP_RST_TASK_WDT | sys::esp_reset_reason_t_ESP_RST_INT_WDT => {
            ResetReason::SoftwareWatchdog
        }
        sys::esp_reset_reason_t_ESP_RST_SW | sys::esp_reset_reason_t_ESP_RST_FAST_SW => {
            ResetReason::SoftwareReset
        }
        sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => ResetReason::DeepSleepWake,
        sys::esp_reset_reason_t_ESP_RST_EXT => ResetReason::ExternalReset,
        _ => ResetReason::Unknown,
    }
}

impl SystemServices for EspSystem {
    fn free_heap(&self) -> u32 {
        unsafe { sys::esp_get_free_heap_size() }
    }

    fn reset_reason(&self) -> ResetReason {
        reset_reason(unsafe { sys::esp_reset_reason() })
    }

    fn flash_size(&self) -> u32 {
        let mut size = 0u32;
        match esp!(unsafe { sys::esp_flash_get_size(std::ptr::null_mut(), &mut size) }) {
            Ok(()) => size,
            Err(_) => 0,
        }
    }

    fn vcc(&self) -> u16 {
        0
    }

    fn sleep_mode(&self) -> u8 {
        let mut mode: sys::wifi_ps_type_t = 0;
        match esp!(unsafe { sys::esp_wifi_get_ps(&mut mode) }) {
            Ok(()) => mode as u8 + 1,
            Err(_) => 0,
        }
    }

    fn phy_mode(&self) -> u8 {
        let mut protocols = 0u8;
        if esp!(unsafe {
            sys::esp_wifi_get_protocol(sys::wifi_interface_t_WIFI_IF_STA, &mut protocols)
        })
        .is_err()
        {
            return 0;
        }
        // Highest enabled of 802.11b (1), g (2), n (3)
        if protocols & sys::WIFI_PROTOCOL_11N as u8 != 0 {
            3
        } else if protocols & sys::WIFI_PROTOCOL_11G as u8 != 0 {
            2
        } else if protocols & sys::WIFI_PROTOCOL_11B as u8 != 0 {
            1
        } else {
            0
        }
    }

    fn feed_watchdog(&mut self) {
        if self.watchdog {
            unsafe {
                sys::esp_task_wdt_reset();
            }
        }
    }

    fn dump_stats(&self) {
        info!(
            "Heap: {} bytes free, {} minimum",
            unsafe { sys::esp_get_free_heap_size() },
            unsafe { sys::esp_get_minimum_free_heap_size() }
        );
    }

    fn delay_ms(&mut self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }
}
