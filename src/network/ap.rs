use anyhow::{anyhow, Result};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    ipv4::{self, Ipv4Addr, Mask, RouterConfiguration, Subnet},
    mdns::EspMdns,
    netif::{EspNetif, NetifConfiguration, NetifStack},
    nvs::EspDefaultNvsPartition,
    wifi::{AccessPointConfiguration, AuthMethod, BlockingWifi, Configuration, EspWifi, WifiDriver},
};

use crate::config::OtaConfig;

pub const AP_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const PORTAL_URL: &str = "http://10.0.0.1/";

/// Soft access point plus mDNS advertisement. Dropping it takes the network down.
pub struct AccessPoint {
    wifi: BlockingWifi<EspWifi<'static>>,
    _mdns: Option<EspMdns>,
    pub ssid: String,
}

impl AccessPoint {
    pub fn start(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        config: &OtaConfig,
    ) -> Result<Self> {
        log::info!("Starting access point '{}'", config.ap_ssid);

        let driver = WifiDriver::new(modem, sys_loop.clone(), Some(nvs))?;
        let ap_netif = EspNetif::new_with_conf(&NetifConfiguration {
            ip_configuration: Some(ipv4::Configuration::Router(RouterConfiguration {
                subnet: Subnet {
                    gateway: AP_ADDRESS,
                    mask: Mask(24),
                },
                dhcp_enabled: true,
                dns: Some(AP_ADDRESS),
                secondary_dns: None,
            })),
            ..NetifConfiguration::wifi_default_router()
        })?;
        let esp_wifi = EspWifi::wrap_all(driver, EspNetif::new(NetifStack::Sta)?, ap_netif)?;
        let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

        let auth_method = if config.is_open_network() {
            log::warn!("AP password is empty, running an open network");
            AuthMethod::None
        } else {
            log::info!("Using WPA2 authentication");
            AuthMethod::WPA2Personal
        };

        wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
            ssid: config
                .ap_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("Invalid SSID format: {}", config.ap_ssid))?,
            password: config
                .ap_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("Invalid password format"))?,
            auth_method,
            max_connections: config.max_connections,
            channel: 1,
            ..Default::default()
        }))?;

        wifi.start()?;
        wifi.wait_netif_up()?;
        log::info!("Access point up at {}", AP_ADDRESS);

        let mdns = match start_mdns(&config.hostname) {
            Ok(mdns) => {
                log::info!("mDNS service started: {}.local", config.hostname);
                Some(mdns)
            }
            Err(e) => {
                log::warn!("Failed to start mDNS: {:?}", e);
                None
            }
        };

        Ok(Self {
            wifi,
            _mdns: mdns,
            ssid: config.ap_ssid.clone(),
        })
    }

    pub fn stop(mut self) -> Result<()> {
        self.wifi.stop()?;
        log::info!("Access point '{}' stopped", self.ssid);
        Ok(())
    }
}

fn start_mdns(hostname: &str) -> Result<EspMdns> {
    let mut mdns = EspMdns::take()?;
    mdns.set_hostname(hostname)?;
    mdns.set_instance_name("Firmware update")?;
    mdns.add_service(None, "_http", "_tcp", 80, &[("path", "/")])?;
    Ok(mdns)
}
