use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "esp")]
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};

#[cfg(feature = "esp")]
const CONFIG_NAMESPACE: &str = "ap_ota";
#[cfg(feature = "esp")]
const CONFIG_KEY: &str = "config";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("AP SSID cannot be empty")]
    EmptySsid,
    #[error("AP SSID must be 32 characters or less")]
    SsidTooLong,
    #[error("AP SSID cannot contain control characters")]
    SsidControlChars,
    #[error("AP password must be empty (open network) or 8 to 63 characters")]
    PasswordLength,
    #[error("hostname must be 1 to 63 characters of letters, digits and '-'")]
    InvalidHostname,
    #[error("receive buffer size must be at least 1 byte")]
    ZeroBuffer,
    #[error("unknown log level '{0}'")]
    InvalidLogLevel(String),
    #[error("config blob is not valid JSON: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    // Access point
    pub ap_ssid: String,
    pub ap_password: String,
    pub hostname: String,
    pub max_connections: u16,

    // Update session
    pub idle_timeout_secs: u32,
    pub auto_reboot: bool,
    pub restart_delay_ms: u32,
    pub recv_buffer_size: usize,

    pub log_level: String,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "Simple OTA".to_string(),
            ap_password: String::new(),
            hostname: "simpleota".to_string(),
            max_connections: 1,
            idle_timeout_secs: 30 * 60,
            auto_reboot: true,
            restart_delay_ms: 2000,
            recv_buffer_size: 512,
            log_level: "info".to_string(),
        }
    }
}

impl OtaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_ssid(&self.ap_ssid)?;
        validate_password(&self.ap_password)?;
        validate_hostname(&self.hostname)?;
        if self.recv_buffer_size == 0 {
            return Err(ConfigError::ZeroBuffer);
        }
        if crate::logging::parse_level(&self.log_level).is_none() {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        Ok(())
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: OtaConfig =
            serde_json::from_slice(bytes).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// `None` when the session watchdog is disabled.
    pub fn idle_timeout(&self) -> Option<std::time::Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs as u64)),
        }
    }

    pub fn is_open_network(&self) -> bool {
        self.ap_password.is_empty()
    }

    #[cfg(feature = "esp")]
    pub fn save(&self, nvs_partition: EspDefaultNvsPartition) -> anyhow::Result<()> {
        let mut nvs = EspNvs::new(nvs_partition, CONFIG_NAMESPACE, true)?;
        let json = serde_json::to_vec(self)?;
        nvs.set_blob(CONFIG_KEY, &json)?;
        log::info!("Configuration saved to NVS");
        Ok(())
    }
}

pub fn validate_ssid(ssid: &str) -> Result<(), ConfigError> {
    if ssid.is_empty() {
        return Err(ConfigError::EmptySsid);
    }
    if ssid.len() > 32 {
        return Err(ConfigError::SsidTooLong);
    }
    if ssid.chars().any(|c| c.is_control()) {
        return Err(ConfigError::SsidControlChars);
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), ConfigError> {
    if password.is_empty() || (8..=63).contains(&password.len()) {
        Ok(())
    } else {
        Err(ConfigError::PasswordLength)
    }
}

pub fn validate_hostname(hostname: &str) -> Result<(), ConfigError> {
    let valid = (1..=63).contains(&hostname.len())
        && hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidHostname)
    }
}

/// Stored config if present and valid, defaults otherwise. Never fails the boot.
#[cfg(feature = "esp")]
pub fn load_or_default(nvs_partition: EspDefaultNvsPartition) -> OtaConfig {
    match load_from_nvs(nvs_partition.clone()) {
        Ok(Some(config)) => {
            log::info!("Loaded configuration from NVS");
            config
        }
        Ok(None) => {
            log::info!("No stored configuration, using defaults");
            let config = OtaConfig::default();
            if let Err(e) = config.save(nvs_partition) {
                log::warn!("Failed to save default config to NVS: {:?}", e);
            }
            config
        }
        Err(e) => {
            log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
            OtaConfig::default()
        }
    }
}

#[cfg(feature = "esp")]
fn load_from_nvs(nvs_partition: EspDefaultNvsPartition) -> anyhow::Result<Option<OtaConfig>> {
    let nvs = EspNvs::new(nvs_partition, CONFIG_NAMESPACE, true)?;

    let mut buf = vec![0u8; 1024];
    match nvs.get_blob(CONFIG_KEY, &mut buf)? {
        Some(data) => Ok(Some(OtaConfig::from_json(data)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OtaConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_open_network());
        assert_eq!(config.idle_timeout(), Some(std::time::Duration::from_secs(1800)));
    }

    #[test]
    fn test_validate_ssid() {
        assert!(validate_ssid("Simple OTA").is_ok());
        assert_eq!(validate_ssid(""), Err(ConfigError::EmptySsid));
        assert_eq!(validate_ssid(&"a".repeat(33)), Err(ConfigError::SsidTooLong));
        assert_eq!(validate_ssid("Network\0"), Err(ConfigError::SsidControlChars));
    }

    #[test]
    fn test_validate_password() {
        assert!(validate_password("").is_ok());
        assert!(validate_password("12345678").is_ok());
        assert_eq!(validate_password("short"), Err(ConfigError::PasswordLength));
        assert_eq!(validate_password(&"p".repeat(64)), Err(ConfigError::PasswordLength));
    }

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("simple-ota-2").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("has.dot").is_err());
        assert!(validate_hostname(&"h".repeat(64)).is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = OtaConfig::from_json(br#"{"ap_ssid":"Lab Node","idle_timeout_secs":0}"#).unwrap();
        assert_eq!(config.ap_ssid, "Lab Node");
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.hostname, "simpleota");
        assert_eq!(config.recv_buffer_size, 512);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn invalid_json_config_is_rejected() {
        assert!(matches!(OtaConfig::from_json(b"{"), Err(ConfigError::Parse(_))));
        assert_eq!(
            OtaConfig::from_json(br#"{"recv_buffer_size":0}"#),
            Err(ConfigError::ZeroBuffer)
        );
        assert_eq!(
            OtaConfig::from_json(br#"{"log_level":"chatty"}"#),
            Err(ConfigError::InvalidLogLevel("chatty".into()))
        );
    }
}
