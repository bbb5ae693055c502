//! ESP-IDF WiFi driver.
//!
//! Configuration goes through [`EspWifi`]; station progress comes from a raw
//! event handler that writes the shared [`StationStatusCell`], so the
//! control loop never blocks on the driver.

use std::ffi::c_void;
use std::net::Ipv4Addr;
use std::sync::atomic::AtomicU8;

use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi,
};
use esp_idf_sys::{self as sys, esp, EspError};
use log::{debug, info, warn};

use crate::config::{CredentialRecord, Security};
use crate::wifi::{
    AccessPointSettings, EnterpriseCredentials, RadioDriver, RadioError, RadioMode, ScanResult,
    StationStatus, StationStatusCell,
};

fn driver_error(e: EspError) -> RadioError {
    RadioError::Driver(e.to_string())
}

fn lwip_addr(octets: [u8; 4]) -> sys::esp_ip4_addr_t {
    sys::esp_ip4_addr_t {
        addr: u32::from_ne_bytes(octets),
    }
}

fn ip_info(ip: [u8; 4], gateway: [u8; 4], netmask: [u8; 4]) -> sys::esp_netif_ip_info_t {
    sys::esp_netif_ip_info_t {
        ip: lwip_addr(ip),
        gw: lwip_addr(gateway),
        netmask: lwip_addr(netmask),
    }
}

/// Map a disconnect reason to the status the state machine understands.
fn disconnect_status(reason: u32) -> StationStatus {
    match reason {
        sys::wifi_err_reason_t_WIFI_REASON_AUTH_FAIL
        | sys::wifi_err_reason_t_WIFI_REASON_4WAY_HANDSHAKE_TIMEOUT => {
            StationStatus::WrongPassword
        }
        sys::wifi_err_reason_t_WIFI_REASON_NO_AP_FOUND => StationStatus::NoApFound,
        sys::wifi_err_reason_t_WIFI_REASON_ASSOC_LEAVE => StationStatus::Idle,
        _ => StationStatus::ConnectFail,
    }
}

unsafe extern "C" fn on_event(
    arg: *mut c_void,
    base: sys::esp_event_base_t,
    id: i32,
    data: *mut c_void,
) {
    let cell = arg as *const AtomicU8;
    if base == sys::WIFI_EVENT {
        match id as u32 {
            sys::wifi_event_t_WIFI_EVENT_STA_START => {
                StationStatusCell::store_raw(cell, StationStatus::Connecting);
            }
            sys::wifi_event_t_WIFI_EVENT_STA_DISCONNECTED if !data.is_null() => {
                let event = &*(data as *const sys::wifi_event_sta_disconnected_t);
                StationStatusCell::store_raw(cell, disconnect_status(event.reason as u32));
            }
            _ => {}
        }
    } else if base == sys::IP_EVENT && id as u32 == sys::ip_event_t_IP_EVENT_STA_GOT_IP {
        StationStatusCell::store_raw(cell, StationStatus::GotIp);
    }
}

/// [`RadioDriver`] over the ESP-IDF WiFi stack.
pub struct EspRadio {
    wifi: EspWifi<'static>,
    status: StationStatusCell,
    /// The supplicant keeps pointers to certificates, so they live here
    /// while enterprise mode is enabled.
    enterprise: Option<EnterpriseCredentials>,
}

impl EspRadio {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        status: StationStatusCell,
    ) -> Result<Self, EspError> {
        let wifi = EspWifi::new(modem, sysloop, None)?;

        let cell = status.leak_raw().cast_mut().cast::<c_void>();
        unsafe {
            esp!(sys::esp_event_handler_register(
                sys::WIFI_EVENT,
                sys::ESP_EVENT_ANY_ID,
                Some(on_event),
                cell,
            ))?;
            esp!(sys::esp_event_handler_register(
                sys::IP_EVENT,
                sys::ESP_EVENT_ANY_ID,
                Some(on_event),
                cell,
            ))?;
        }
        status.store(StationStatus::Idle);

        info!("WiFi driver initialised");
        Ok(Self {
            wifi,
            status,
            enterprise: None,
        })
    }

    fn ensure_started(&mut self) -> Result<(), EspError> {
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        Ok(())
    }

    fn configure_addressing(&mut self, record: &CredentialRecord) -> Result<(), EspError> {
        let netif = self.wifi.sta_netif().handle();
        if record.uses_dhcp() {
            // Already running is fine
            unsafe {
                sys::esp_netif_dhcpc_start(netif);
            }
            return Ok(());
        }
        let info = ip_info(record.ip, record.gateway, record.netmask);
        unsafe {
            sys::esp_netif_dhcpc_stop(netif);
            esp!(sys::esp_netif_set_ip_info(netif, &info))
        }
    }

    fn configure_enterprise(
        &mut self,
        record: &CredentialRecord,
        credentials: Option<&EnterpriseCredentials>,
    ) -> Result<(), RadioError> {
        let security = record
            .security()
            .map_err(|_| RadioError::InvalidConfig("security"))?;
        if !security.is_enterprise() {
            self.enterprise = None;
            unsafe {
                sys::esp_wifi_sta_enterprise_disable();
            }
            return Ok(());
        }

        let credentials = self.enterprise.insert(credentials.cloned().unwrap_or_default());
        let identity = record.eap_identity_bytes();
        let password = record.password_bytes();
        unsafe {
            esp!(sys::esp_eap_client_set_identity(
                identity.as_ptr(),
                identity.len() as i32
            ))
            .map_err(driver_error)?;

            match security {
                Security::EapTls => {
                    let cert = &credentials.client_certificate;
                    let key = &credentials.private_key;
                    esp!(sys::esp_eap_client_set_certificate_and_key(
                        cert.as_ptr(),
                        cert.len() as i32,
                        key.as_ptr(),
                        key.len() as i32,
                        std::ptr::null(),
                        0,
                    ))
                    .map_err(driver_error)?;
                }
                Security::EapPeap | Security::EapTtls => {
                    esp!(sys::esp_eap_client_set_username(
                        identity.as_ptr(),
                        identity.len() as i32
                    ))
                    .map_err(driver_error)?;
                    esp!(sys::esp_eap_client_set_password(
                        password.as_ptr(),
                        password.len() as i32
                    ))
                    .map_err(driver_error)?;
                }
                Security::Personal => {}
            }

            let ca = &credentials.ca_certificate;
            if ca.is_empty() {
                sys::esp_eap_client_clear_ca_cert();
            } else {
                esp!(sys::esp_eap_client_set_ca_cert(ca.as_ptr(), ca.len() as i32))
                    .map_err(driver_error)?;
            }

            esp!(sys::esp_wifi_sta_enterprise_enable()).map_err(driver_error)?;
        }
        debug!("Enterprise authentication configured ({:?})", security);
        Ok(())
    }

    fn netif(&self, mode: RadioMode) -> &esp_idf_svc::netif::EspNetif {
        match mode {
            RadioMode::Station => self.wifi.sta_netif(),
            RadioMode::AccessPoint => self.wifi.ap_netif(),
        }
    }
}

impl RadioDriver for EspRadio {
    fn connect_station(
        &mut self,
        record: &CredentialRecord,
        credentials: Option<&EnterpriseCredentials>,
        host_name: &str,
    ) -> Result<(), RadioError> {
        let auth_method = if record.is_enterprise() {
            AuthMethod::WPA2Enterprise
        } else if record.password_bytes().is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        let password = String::from_utf8_lossy(if record.is_enterprise() {
            &[]
        } else {
            record.password_bytes()
        });

        let config = Configuration::Client(ClientConfiguration {
            ssid: record
                .ssid()
                .as_ref()
                .try_into()
                .map_err(|_| RadioError::InvalidConfig("ssid"))?,
            password: password
                .as_ref()
                .try_into()
                .map_err(|_| RadioError::InvalidConfig("password"))?,
            auth_method,
            channel: (record.channel != 0).then_some(record.channel),
            ..Default::default()
        });

        self.wifi.set_configuration(&config).map_err(driver_error)?;
        self.configure_enterprise(record, credentials)?;
        self.configure_addressing(record).map_err(driver_error)?;
        if let Err(e) = self.wifi.sta_netif_mut().set_hostname(host_name) {
            warn!("Failed to set host name: {}", e);
        }

        self.status.store(StationStatus::Connecting);
        self.ensure_started().map_err(driver_error)?;
        self.wifi.connect().map_err(driver_error)?;
        info!("Connecting to {}", record.ssid());
        Ok(())
    }

    fn start_access_point(&mut self, settings: &AccessPointSettings) -> Result<(), RadioError> {
        let config = Configuration::AccessPoint(AccessPointConfiguration {
            ssid: settings
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidConfig("ssid"))?,
            password: settings
                .password
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidConfig("password"))?,
            auth_method: if settings.password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            },
            channel: settings.channel,
            ..Default::default()
        });
        self.wifi.set_configuration(&config).map_err(driver_error)?;

        let netif = self.wifi.ap_netif().handle();
        let info = ip_info(settings.ip, settings.gateway, settings.netmask);
        unsafe {
            sys::esp_netif_dhcps_stop(netif);
            esp!(sys::esp_netif_set_ip_info(netif, &info)).map_err(driver_error)?;
            esp!(sys::esp_netif_dhcps_start(netif)).map_err(driver_error)?;
        }

        self.wifi.start().map_err(driver_error)?;
        info!(
            "Access point {} up on channel {}",
            settings.ssid, settings.channel
        );
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<ScanResult>, RadioError> {
        let scan_error = |e: EspError| RadioError::ScanFailed(e.to_string());
        if !matches!(
            self.wifi.get_configuration().map_err(scan_error)?,
            Configuration::Client(_)
        ) {
            self.wifi
                .set_configuration(&Configuration::Client(ClientConfiguration::default()))
                .map_err(scan_error)?;
        }
        self.ensure_started().map_err(scan_error)?;

        let found = self.wifi.scan().map_err(scan_error)?;
        debug!("Scan found {} networks", found.len());
        Ok(found
            .into_iter()
            .map(|ap| ScanResult {
                ssid: ap.ssid.as_str().to_string(),
                rssi: ap.signal_strength,
                channel: ap.channel,
            })
            .collect())
    }

    fn disconnect(&mut self) {
        if let Err(e) = self.wifi.disconnect() {
            debug!("Disconnect: {}", e);
        }
    }

    fn stop(&mut self) {
        if let Err(e) = self.wifi.stop() {
            warn!("Failed to stop WiFi: {}", e);
        }
        if self.enterprise.take().is_some() {
            unsafe {
                sys::esp_wifi_sta_enterprise_disable();
            }
        }
        self.status.store(StationStatus::Idle);
    }

    fn status(&self) -> StationStatus {
        self.status.load()
    }

    fn rssi(&self) -> i8 {
        let mut info = sys::wifi_ap_record_t::default();
        match esp!(unsafe { sys::esp_wifi_sta_get_ap_info(&mut info) }) {
            Ok(()) => info.rssi,
            Err(_) => 0,
        }
    }

    fn client_count(&self) -> u8 {
        let mut list = sys::wifi_sta_list_t::default();
        match esp!(unsafe { sys::esp_wifi_ap_get_sta_list(&mut list) }) {
            Ok(()) => list.num.clamp(0, u8::MAX as i32) as u8,
            Err(_) => 0,
        }
    }

    fn mac_address(&self, mode: RadioMode) -> [u8; 6] {
        self.netif(mode).get_mac().unwrap_or([0; 6])
    }

    fn ip_address(&self, mode: RadioMode) -> Ipv4Addr {
        self.netif(mode)
            .get_ip_info()
            .map(|info| info.ip)
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    fn set_max_tx_power(&mut self, quarter_dbm: u8) -> Result<(), RadioError> {
        esp!(unsafe { sys::esp_wifi_set_max_tx_power(quarter_dbm as i8) }).map_err(driver_error)
    }
}
