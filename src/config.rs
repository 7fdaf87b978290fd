//! Configuration for the AMQP transport
//!
//! [`TransportConfig`] and [`DeviceConfig`] are what the upper client layer hands
//! to `create` and `register`. [`TransportOptions`] holds the tunables that can be
//! changed at runtime through `set_option`. [`FleetConfig`] is the TOML file
//! format consumed by the `amqp-fleet-sim` binary.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Maximum FQDN length per RFC 1035 (255 including the terminating dot).
pub const RFC1035_MAX_FQDN_LENGTH: usize = 255;

/// Default SAS token lifetime, in milliseconds.
pub const DEFAULT_SAS_TOKEN_LIFETIME_MS: u64 = 3_600_000;

/// Default CBS request timeout, in milliseconds.
pub const DEFAULT_CBS_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Hub-level configuration supplied at transport creation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// IoT hub name, first label of the host FQDN
    pub iot_hub_name: String,
    /// IoT hub suffix, e.g. "azure-devices.net"
    pub iot_hub_suffix: String,
    /// Explicit host override (protocol gateway); wins over name + suffix
    #[serde(default)]
    pub protocol_gateway_host_name: Option<String>,
}

impl TransportConfig {
    pub fn new<N: Into<String>, S: Into<String>>(iot_hub_name: N, iot_hub_suffix: S) -> Self {
        Self {
            iot_hub_name: iot_hub_name.into(),
            iot_hub_suffix: iot_hub_suffix.into(),
            protocol_gateway_host_name: None,
        }
    }

    pub fn with_gateway<G: Into<String>>(mut self, host_name: G) -> Self {
        self.protocol_gateway_host_name = Some(host_name.into());
        self
    }

    /// Host the transport connects to: the gateway override if present,
    /// otherwise `<iot_hub_name>.<iot_hub_suffix>`.
    pub fn host_fqdn(&self) -> String {
        match &self.protocol_gateway_host_name {
            Some(gateway) => gateway.clone(),
            None => format!("{}.{}", self.iot_hub_name, self.iot_hub_suffix),
        }
    }
}

/// Per-device configuration supplied at registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceConfig {
    pub device_id: String,
    /// Shared access key used to mint SAS tokens
    #[serde(default)]
    pub device_key: Option<String>,
    /// Pre-minted SAS token
    #[serde(default)]
    pub device_sas_token: Option<String>,
}

impl DeviceConfig {
    pub fn with_key<I: Into<String>, K: Into<String>>(device_id: I, key: K) -> Self {
        Self {
            device_id: device_id.into(),
            device_key: Some(key.into()),
            device_sas_token: None,
        }
    }

    pub fn with_sas_token<I: Into<String>, T: Into<String>>(device_id: I, token: T) -> Self {
        Self {
            device_id: device_id.into(),
            device_key: None,
            device_sas_token: Some(token.into()),
        }
    }

    /// Device authenticating with an X.509 certificate set through `set_option`
    pub fn x509<I: Into<String>>(device_id: I) -> Self {
        Self {
            device_id: device_id.into(),
            device_key: None,
            device_sas_token: None,
        }
    }

    /// True when the device carries a key or token, i.e. it authenticates over CBS.
    pub fn uses_cbs(&self) -> bool {
        self.device_key.is_some() || self.device_sas_token.is_some()
    }
}

/// Runtime tunables applied on the next authentication cycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportOptions {
    #[serde(default = "default_sas_token_lifetime")]
    pub sas_token_lifetime_ms: u64,
    #[serde(default = "default_sas_token_refresh_time")]
    pub sas_token_refresh_time_ms: u64,
    #[serde(default = "default_cbs_request_timeout")]
    pub cbs_request_timeout_ms: u64,
}

fn default_sas_token_lifetime() -> u64 {
    DEFAULT_SAS_TOKEN_LIFETIME_MS
}

fn default_sas_token_refresh_time() -> u64 {
    DEFAULT_SAS_TOKEN_LIFETIME_MS / 2
}

fn default_cbs_request_timeout() -> u64 {
    DEFAULT_CBS_REQUEST_TIMEOUT_MS
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            sas_token_lifetime_ms: default_sas_token_lifetime(),
            sas_token_refresh_time_ms: default_sas_token_refresh_time(),
            cbs_request_timeout_ms: default_cbs_request_timeout(),
        }
    }
}

/// Simulation knobs for the fleet simulator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationSection {
    /// Messages enqueued per device before the run starts
    #[serde(default = "default_messages_per_device")]
    pub messages_per_device: usize,
    /// Interval between `do_work` ticks
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Stop after this many ticks even if messages are still pending
    #[serde(default = "default_max_ticks")]
    pub max_ticks: u64,
    /// Subscribe every device to cloud-to-device messages
    #[serde(default)]
    pub receive_messages: bool,
    /// Subscribe every device to direct methods
    #[serde(default)]
    pub device_methods: bool,
    /// Turn on `logtrace` for the connection
    #[serde(default)]
    pub logtrace: bool,
}

fn default_messages_per_device() -> usize {
    10
}

fn default_tick_ms() -> u64 {
    100
}

fn default_max_ticks() -> u64 {
    200
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            messages_per_device: default_messages_per_device(),
            tick_ms: default_tick_ms(),
            max_ticks: default_max_ticks(),
            receive_messages: false,
            device_methods: false,
            logtrace: false,
        }
    }
}

/// Fleet configuration file: one transport, many devices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetConfig {
    pub transport: TransportConfig,
    #[serde(default)]
    pub options: TransportOptions,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub simulation: SimulationSection,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FleetConfig {
    /// Load a fleet configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a fleet configuration
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.iot_hub_name.is_empty() || self.transport.iot_hub_suffix.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "[transport] requires iot_hub_name and iot_hub_suffix".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            validate_device_id(&device.device_id)?;
            if !seen.insert(device.device_id.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "device '{}' is listed more than once",
                    device.device_id
                )));
            }
            if device.device_key.is_some() && device.device_sas_token.is_some() {
                return Err(ConfigError::InvalidConfig(format!(
                    "device '{}' must provide either device_key or device_sas_token, not both",
                    device.device_id
                )));
            }
        }

        if self.simulation.tick_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "simulation.tick_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Device identities are case-sensitive, up to 128 characters of
/// `[a-zA-Z0-9-.+%_#*?!(),=@;$']`.
pub fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    const EXTRA: &str = "-.+%_#*?!(),=@;$'";
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || EXTRA.contains(c));

    if device_id.is_empty() || device_id.len() > 128 || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must be 1-128 characters of [a-zA-Z0-9-.+%_#*?!(),=@;$']"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_fqdn_from_name_and_suffix() {
        let config = TransportConfig::new("servername", "domainname");
        assert_eq!(config.host_fqdn(), "servername.domainname");
    }

    #[test]
    fn test_gateway_overrides_host_fqdn() {
        let config = TransportConfig::new("servername", "domainname").with_gateway("gateway.local");
        assert_eq!(config.host_fqdn(), "gateway.local");
    }

    #[test]
    fn test_default_options() {
        let options = TransportOptions::default();
        assert_eq!(options.sas_token_lifetime_ms, 3_600_000);
        assert_eq!(options.sas_token_refresh_time_ms, 1_800_000);
        assert_eq!(options.cbs_request_timeout_ms, 30_000);
    }

    #[test]
    fn test_device_config_credential_helpers() {
        assert!(DeviceConfig::with_key("d", "k").uses_cbs());
        assert!(DeviceConfig::with_sas_token("d", "t").uses_cbs());
        assert!(!DeviceConfig::x509("d").uses_cbs());
    }

    #[test]
    fn test_fleet_config_parses() {
        let toml_content = r#"
[transport]
iot_hub_name = "contoso"
iot_hub_suffix = "azure-devices.net"

[options]
sas_token_lifetime_ms = 600000

[[devices]]
device_id = "thermostat-1"
device_key = "a2V5"

[[devices]]
device_id = "thermostat-2"
device_sas_token = "SharedAccessSignature sr=x&sig=y&se=1"

[simulation]
messages_per_device = 3
receive_messages = true
"#;

        let config = FleetConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.transport.host_fqdn(), "contoso.azure-devices.net");
        assert_eq!(config.options.sas_token_lifetime_ms, 600_000);
        // Unspecified fields keep their defaults
        assert_eq!(config.options.cbs_request_timeout_ms, 30_000);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.simulation.messages_per_device, 3);
        assert_eq!(config.simulation.tick_ms, 100);
        assert!(config.simulation.receive_messages);
        assert!(!config.simulation.device_methods);
    }

    #[test]
    fn test_fleet_config_rejects_duplicate_devices() {
        let toml_content = r#"
[transport]
iot_hub_name = "contoso"
iot_hub_suffix = "azure-devices.net"

[[devices]]
device_id = "dup"
device_key = "a"

[[devices]]
device_id = "dup"
device_key = "b"
"#;

        let result = FleetConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_fleet_config_rejects_key_and_token() {
        let toml_content = r#"
[transport]
iot_hub_name = "contoso"
iot_hub_suffix = "azure-devices.net"

[[devices]]
device_id = "both"
device_key = "a"
device_sas_token = "b"
"#;

        assert!(FleetConfig::from_toml_str(toml_content).is_err());
    }

    #[test]
    fn test_invalid_device_id() {
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("has space").is_err());
        assert!(validate_device_id(&"a".repeat(129)).is_err());
        assert!(validate_device_id("valid-device_1.test").is_ok());
    }
}
