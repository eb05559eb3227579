//! Gateway configuration: one JSON file, deserialized with per-field
//! defaults so a minimal `{}` runs with the stock timings. Validation
//! happens at load time, before anything is started; in particular a
//! plaintext broker URI with TLS enabled never makes it into a running
//! gateway.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_derive::Deserialize;

use crate::alerts::AlertThresholds;
use crate::error::{Error, Result};
use crate::mqtt::{validate_broker_uri, MqttSettings, TlsSettings};
use crate::poller::PollerSettings;
use crate::serial::engine::SerialSettings;
use crate::status::StatusSettings;
use crate::telemetry::PublisherSettings;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub device_id: String,
    pub serial: SerialSection,
    pub poll: PollSection,
    pub bus: BusSection,
    pub telemetry: TelemetrySection,
    pub mqtt: MqttSection,
    pub status: StatusSection,
    pub alerts: AlertThresholds,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_id: "bms0".into(),
            serial: SerialSection::default(),
            poll: PollSection::default(),
            bus: BusSection::default(),
            telemetry: TelemetrySection::default(),
            mqtt: MqttSection::default(),
            status: StatusSection::default(),
            alerts: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialSection {
    pub port: String,
    pub baud_rate: u32,
    pub response_timeout_ms: u64,
    pub retries: u32,
    pub queue_depth: usize,
    pub wake_after_ms: u64,
    pub wake_gap_ms: u64,
    pub restart_guard_ms: u64,
}

impl Default for SerialSection {
    fn default() -> Self {
        SerialSection {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            response_timeout_ms: 750,
            retries: 2,
            queue_depth: 16,
            wake_after_ms: 5000,
            wake_gap_ms: 20,
            restart_guard_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollSection {
    pub live_period_ms: u64,
    pub config_period_ms: u64,
    pub config_enabled: bool,
    pub inter_register_delay_ms: u64,
}

impl Default for PollSection {
    fn default() -> Self {
        PollSection {
            live_period_ms: 2000,
            config_period_ms: 30_000,
            config_enabled: false,
            inter_register_delay_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusSection {
    pub queue_capacity: usize,
    pub publish_timeout_ms: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        BusSection {
            queue_capacity: 32,
            publish_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySection {
    pub period_ms: u64,
    pub buffer_depth: usize,
    pub offline_buffering: bool,
    pub http_endpoint: Option<String>,
    pub http_timeout_ms: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        TelemetrySection {
            period_ms: 1000,
            buffer_depth: 64,
            offline_buffering: true,
            http_endpoint: None,
            http_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSection {
    pub enabled: bool,
    pub broker_uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive_secs: u64,
    pub qos: u8,
    pub retain: bool,
    pub tls: TlsSection,
}

impl Default for MqttSection {
    fn default() -> Self {
        MqttSection {
            enabled: false,
            broker_uri: "mqtt://localhost:1883".into(),
            username: None,
            password: None,
            keepalive_secs: 30,
            qos: 1,
            retain: false,
            tls: TlsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSection {
    pub enabled: bool,
    pub verify_server: bool,
    pub client_cert: bool,
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

impl Default for TlsSection {
    fn default() -> Self {
        TlsSection {
            enabled: false,
            verify_server: true,
            client_cert: false,
            ca_file: None,
            cert_file: None,
            key_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusSection {
    pub endpoint: Option<String>,
    pub period_secs: u64,
    pub http_timeout_ms: u64,
}

impl Default for StatusSection {
    fn default() -> Self {
        StatusSection {
            endpoint: None,
            period_secs: 60,
            http_timeout_ms: 10_000,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("could not read {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("could not parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            return Err(Error::Config("device_id must not be empty".into()));
        }
        if self.poll.live_period_ms == 0 || self.telemetry.period_ms == 0 {
            return Err(Error::Config("poll and publish periods must be nonzero".into()));
        }
        if self.telemetry.buffer_depth == 0 {
            return Err(Error::Config("telemetry buffer_depth must be nonzero".into()));
        }
        if self.mqtt.qos > 2 {
            return Err(Error::Config(format!("invalid QoS {}", self.mqtt.qos)));
        }
        if self.mqtt.enabled {
            validate_broker_uri(&self.mqtt.broker_uri, self.mqtt.tls.enabled)?;
        }
        Ok(())
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            response_timeout: Duration::from_millis(self.serial.response_timeout_ms),
            retries: self.serial.retries,
            queue_depth: self.serial.queue_depth,
            wake_after: Duration::from_millis(self.serial.wake_after_ms),
            wake_gap: Duration::from_millis(self.serial.wake_gap_ms),
            restart_guard: Duration::from_millis(self.serial.restart_guard_ms),
        }
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            live_period: Duration::from_millis(self.poll.live_period_ms),
            config_period: Duration::from_millis(self.poll.config_period_ms),
            config_enabled: self.poll.config_enabled,
            inter_register_delay: Duration::from_millis(self.poll.inter_register_delay_ms),
        }
    }

    pub fn publisher_settings(&self) -> PublisherSettings {
        PublisherSettings {
            period: Duration::from_millis(self.telemetry.period_ms),
            buffer_capacity: self.telemetry.buffer_depth,
            offline_buffering: self.telemetry.offline_buffering,
        }
    }

    pub fn status_settings(&self) -> StatusSettings {
        StatusSettings {
            endpoint: self.status.endpoint.clone(),
            period: Duration::from_secs(self.status.period_secs),
            http_timeout: Duration::from_millis(self.status.http_timeout_ms),
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.bus.publish_timeout_ms)
    }

    /// Freshness window for reassembling two-register values: one live
    /// poll period plus slack for the inter-register delays in a cycle.
    pub fn model_freshness(&self) -> Duration {
        Duration::from_millis(self.poll.live_period_ms * 2)
    }

    /// Builds the MQTT settings, loading any configured PEM files. The
    /// blobs are read once and shared from then on.
    pub fn mqtt_settings(&self) -> Result<MqttSettings> {
        let tls = TlsSettings {
            enabled: self.mqtt.tls.enabled,
            verify_server: self.mqtt.tls.verify_server,
            client_cert: self.mqtt.tls.client_cert,
            ca_pem: load_pem(self.mqtt.tls.ca_file.as_deref())?,
            cert_pem: load_pem(self.mqtt.tls.cert_file.as_deref())?,
            key_pem: load_pem(self.mqtt.tls.key_file.as_deref())?,
        };
        Ok(MqttSettings {
            broker_uri: self.mqtt.broker_uri.clone(),
            device_id: self.device_id.clone(),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            keepalive: Duration::from_secs(self.mqtt.keepalive_secs),
            default_qos: self.mqtt.qos,
            retain_default: self.mqtt.retain,
            tls,
        })
    }
}

fn load_pem(path: Option<&str>) -> Result<Option<Arc<Vec<u8>>>> {
    match path {
        Some(path) => {
            let blob = fs::read(path)
                .map_err(|e| Error::Config(format!("could not read PEM {path}: {e}")))?;
            Ok(Some(Arc::new(blob)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        config.validate().unwrap();
        assert_eq!(config.device_id, "bms0");
        assert_eq!(config.serial.response_timeout_ms, 750);
        assert_eq!(config.serial.retries, 2);
        assert_eq!(config.poll.live_period_ms, 2000);
        assert!(!config.poll.config_enabled);
        assert_eq!(config.poll.inter_register_delay_ms, 50);
        assert_eq!(config.bus.queue_capacity, 32);
        assert_eq!(config.telemetry.period_ms, 1000);
        assert_eq!(config.telemetry.buffer_depth, 64);
        assert_eq!(config.status.period_secs, 60);
        assert!(!config.mqtt.enabled);
    }

    #[test]
    fn sections_override_individually() {
        let config: Config = serde_json::from_str(
            r#"{
                "device_id": "pack7",
                "serial": { "port": "/dev/ttyACM0", "retries": 4 },
                "poll": { "config_enabled": true },
                "mqtt": {
                    "enabled": true,
                    "broker_uri": "mqtts://broker.example:8883",
                    "username": "gw",
                    "password": "secret",
                    "tls": { "enabled": true, "verify_server": true }
                }
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.device_id, "pack7");
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.retries, 4);
        // Unspecified fields keep their defaults.
        assert_eq!(config.serial.baud_rate, 115_200);
        assert!(config.poll.config_enabled);
        let settings = config.mqtt_settings().unwrap();
        assert_eq!(settings.device_id, "pack7");
        assert_eq!(settings.username.as_deref(), Some("gw"));
        assert!(settings.tls.enabled);
    }

    #[test]
    fn insecure_broker_uri_with_tls_fails_validation() {
        let config: Config = serde_json::from_str(
            r#"{
                "mqtt": {
                    "enabled": true,
                    "broker_uri": "mqtt://broker:1883",
                    "tls": { "enabled": true }
                }
            }"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::InsecureUri(_))));
    }

    #[test]
    fn empty_device_id_is_rejected() {
        let config: Config = serde_json::from_str(r#"{ "device_id": "" }"#).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_periods_are_rejected() {
        let config: Config =
            serde_json::from_str(r#"{ "poll": { "live_period_ms": 0 } }"#).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{ "devce_id": "typo" }"#).is_err());
    }

    #[test]
    fn duration_conversions() {
        let config = Config::default();
        assert_eq!(
            config.serial_settings().response_timeout,
            Duration::from_millis(750)
        );
        assert_eq!(config.poller_settings().live_period, Duration::from_secs(2));
        assert_eq!(config.publisher_settings().period, Duration::from_secs(1));
        assert_eq!(config.status_settings().period, Duration::from_secs(60));
        assert_eq!(config.model_freshness(), Duration::from_secs(4));
    }
}
