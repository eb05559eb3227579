//! MQTT gateway: owns the broker client lifecycle and turns bus events
//! into topic-, QoS- and retain-correct publications.
//!
//! The client starts on link-up and stops on link-down; a configuration
//! change stops, swaps settings and restarts. When TLS is required the
//! broker URI must use a secure scheme, rejected at configuration time
//! before any client state is touched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{Client, Event as ClientEvent, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde_json::json;

use crate::bus::{Event, Subscription};
use crate::error::{last_error_text, Error, Result};
use crate::telemetry::{Sample, SampleSink};

/// How long gateway entry points may wait for the state lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before the connection iterator retries after an error.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub verify_server: bool,
    pub client_cert: bool,
    /// PEM blobs are shared, not copied; the client gets its own copy only
    /// when the connection is built.
    pub ca_pem: Option<Arc<Vec<u8>>>,
    pub cert_pem: Option<Arc<Vec<u8>>>,
    pub key_pem: Option<Arc<Vec<u8>>>,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_uri: String,
    pub device_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: Duration,
    /// QoS for publications outside the fixed topic table.
    pub default_qos: u8,
    /// Retain flag for publications outside the fixed topic table.
    pub retain_default: bool,
    pub tls: TlsSettings,
}

impl Default for MqttSettings {
    fn default() -> Self {
        MqttSettings {
            broker_uri: "mqtt://localhost:1883".into(),
            device_id: "bms0".into(),
            username: None,
            password: None,
            keepalive: Duration::from_secs(30),
            default_qos: 1,
            retain_default: false,
            tls: TlsSettings::default(),
        }
    }
}

/// A parsed and policy-checked broker URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub websocket: bool,
}

/// Accepts `mqtt`, `tcp`, `ws` (plaintext) and `mqtts`, `ssl`, `wss`
/// (secure) URIs. With TLS enabled, plaintext schemes are a security
/// violation and are rejected before any client state changes.
pub fn validate_broker_uri(uri: &str, tls_required: bool) -> Result<BrokerAddress> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| Error::MalformedUri(uri.to_string()))?;

    let (secure, websocket, default_port) = match scheme {
        "mqtt" | "tcp" => (false, false, 1883),
        "ws" => (false, true, 80),
        "mqtts" | "ssl" => (true, false, 8883),
        "wss" => (true, true, 443),
        _ => return Err(Error::MalformedUri(uri.to_string())),
    };
    if tls_required && !secure {
        return Err(Error::InsecureUri(uri.to_string()));
    }

    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return Err(Error::MalformedUri(uri.to_string()));
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::MalformedUri(uri.to_string()))?;
            (host, port)
        }
        None => (authority, default_port),
    };
    if host.is_empty() {
        return Err(Error::MalformedUri(uri.to_string()));
    }

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        secure,
        websocket,
    })
}

/// The fixed topic table. Everything except alerts lives under the
/// `bms/<dev>/` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Status,
    Metrics,
    CanRaw,
    CanDecoded,
    CanReady,
    Config,
    Alerts,
}

impl TopicKind {
    pub fn qos(self) -> QoS {
        match self {
            TopicKind::Status | TopicKind::Config | TopicKind::Alerts => QoS::AtLeastOnce,
            TopicKind::Metrics | TopicKind::CanRaw | TopicKind::CanDecoded | TopicKind::CanReady => {
                QoS::AtMostOnce
            }
        }
    }

    pub fn retain(self) -> bool {
        matches!(self, TopicKind::Status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub status: String,
    pub metrics: String,
    pub can_raw: String,
    pub can_decoded: String,
    pub can_ready: String,
    pub config: String,
    pub alerts: String,
}

impl Topics {
    pub fn new(device_id: &str) -> Self {
        Topics {
            status: format!("bms/{device_id}/status"),
            metrics: format!("bms/{device_id}/metrics"),
            can_raw: format!("bms/{device_id}/can/raw"),
            can_decoded: format!("bms/{device_id}/can/decoded"),
            can_ready: format!("bms/{device_id}/can/ready"),
            config: format!("bms/{device_id}/config"),
            alerts: format!("{device_id}/alerts"),
        }
    }

    pub fn get(&self, kind: TopicKind) -> &str {
        match kind {
            TopicKind::Status => &self.status,
            TopicKind::Metrics => &self.metrics,
            TopicKind::CanRaw => &self.can_raw,
            TopicKind::CanDecoded => &self.can_decoded,
            TopicKind::CanReady => &self.can_ready,
            TopicKind::Config => &self.config,
            TopicKind::Alerts => &self.alerts,
        }
    }
}

/// Maps a bus event onto its topic and payload. Events that don't go to
/// the broker map to `None`; telemetry samples never appear here at all,
/// they reach the metrics topic synchronously through [`MetricsSink`].
pub fn event_publication(event: &Event) -> Option<(TopicKind, String)> {
    match event {
        Event::BatteryStatus(status) => Some((
            TopicKind::Status,
            serde_json::to_string(status).unwrap_or_default(),
        )),
        Event::ConfigUpdated(payload) => Some((TopicKind::Config, payload.clone())),
        Event::Alert { kind, message } => Some((
            TopicKind::Alerts,
            json!({ "kind": kind.as_str(), "message": message }).to_string(),
        )),
        Event::CanRaw(payload) => Some((TopicKind::CanRaw, payload.clone())),
        Event::CanDecoded(payload) => Some((TopicKind::CanDecoded, payload.clone())),
        Event::CanReady(payload) => Some((TopicKind::CanReady, payload.clone())),
        _ => None,
    }
}

#[derive(Debug, Default, Clone)]
pub struct MqttCounters {
    pub reconnects: u64,
    pub disconnects: u64,
    pub errors: u64,
    pub published: u64,
    pub last_error: String,
}

#[derive(Debug, Clone, serde_derive::Serialize)]
pub struct MqttStatusSnapshot {
    pub started: bool,
    pub connected: bool,
    pub reconnects: u64,
    pub disconnects: u64,
    pub errors: u64,
    pub published: u64,
    pub last_error: String,
}

/// State shared with the connection drain thread; deliberately separate
/// from the gateway mutex so the drain thread never contends with stop().
struct ConnShared {
    connected: AtomicBool,
    counters: Mutex<MqttCounters>,
}

struct Inner {
    settings: MqttSettings,
    topics: Topics,
    client: Option<Client>,
    conn_join: Option<JoinHandle<()>>,
    conn_stop: Option<Arc<AtomicBool>>,
    started: bool,
}

pub struct MqttGateway {
    inner: Mutex<Inner>,
    shared: Arc<ConnShared>,
}

impl MqttGateway {
    /// Validates the configuration and builds a stopped gateway. No client
    /// exists until [`start`](MqttGateway::start).
    pub fn new(settings: MqttSettings) -> Result<Self> {
        validate_broker_uri(&settings.broker_uri, settings.tls.enabled)?;
        let topics = Topics::new(&settings.device_id);
        Ok(MqttGateway {
            inner: Mutex::new(Inner {
                settings,
                topics,
                client: None,
                conn_join: None,
                conn_stop: None,
                started: false,
            }),
            shared: Arc::new(ConnShared {
                connected: AtomicBool::new(false),
                counters: Mutex::new(MqttCounters::default()),
            }),
        })
    }

    fn lock(&self) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        self.inner.try_lock_for(LOCK_TIMEOUT).ok_or_else(|| {
            log::warn!("mqtt gateway state is locked, giving up");
            Error::MutexTimeout("mqtt gateway")
        })
    }

    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.started {
            return Err(Error::AlreadyRunning("mqtt gateway"));
        }
        self.start_locked(&mut inner)
    }

    pub fn stop(&self) -> Result<()> {
        let mut inner = self.lock()?;
        Self::stop_locked(&mut inner, &self.shared);
        Ok(())
    }

    /// Applies a new configuration: validate, stop, swap, and restart if
    /// the gateway was running. An invalid configuration leaves the
    /// current client untouched.
    pub fn apply_configuration(&self, settings: MqttSettings) -> Result<()> {
        validate_broker_uri(&settings.broker_uri, settings.tls.enabled)?;
        let mut inner = self.lock()?;
        let was_started = inner.started;
        if was_started {
            Self::stop_locked(&mut inner, &self.shared);
        }
        inner.topics = Topics::new(&settings.device_id);
        inner.settings = settings;
        if was_started {
            self.start_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Publishes `payload` on the fixed topic table. The payload length is
    /// forwarded exactly as given.
    ///
    /// An unconnected client reports failure instead of queueing: the
    /// telemetry publisher needs a truthful result to drive its offline
    /// buffering, and `try_publish` keeps a full request queue from
    /// blocking the caller.
    pub fn publish(&self, kind: TopicKind, payload: &[u8]) -> Result<()> {
        let inner = self.lock()?;
        let client = inner
            .client
            .as_ref()
            .ok_or(Error::NotStarted("mqtt gateway"))?;
        if !self.shared.connected.load(Ordering::Relaxed) {
            return Err(Error::Publish {
                sink: "mqtt",
                reason: "not connected".into(),
            });
        }
        let topic = inner.topics.get(kind);
        client
            .try_publish(topic, kind.qos(), kind.retain(), payload.to_vec())
            .map_err(|e| Error::Publish {
                sink: "mqtt",
                reason: e.to_string(),
            })?;
        self.shared.counters.lock().published += 1;
        Ok(())
    }

    /// Publishes on an arbitrary topic with the configured default QoS and
    /// retain flag.
    pub fn publish_raw(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let inner = self.lock()?;
        let client = inner
            .client
            .as_ref()
            .ok_or(Error::NotStarted("mqtt gateway"))?;
        if !self.shared.connected.load(Ordering::Relaxed) {
            return Err(Error::Publish {
                sink: "mqtt",
                reason: "not connected".into(),
            });
        }
        let qos = qos_from_level(inner.settings.default_qos);
        client
            .try_publish(topic, qos, inner.settings.retain_default, payload.to_vec())
            .map_err(|e| Error::Publish {
                sink: "mqtt",
                reason: e.to_string(),
            })?;
        self.shared.counters.lock().published += 1;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> MqttStatusSnapshot {
        let started = self
            .inner
            .try_lock_for(LOCK_TIMEOUT)
            .map_or(false, |inner| inner.started);
        let counters = self.shared.counters.lock().clone();
        MqttStatusSnapshot {
            started,
            connected: self.shared.connected.load(Ordering::Relaxed),
            reconnects: counters.reconnects,
            disconnects: counters.disconnects,
            errors: counters.errors,
            published: counters.published,
            last_error: counters.last_error,
        }
    }

    pub fn broker_uri(&self) -> String {
        self.inner
            .try_lock_for(LOCK_TIMEOUT)
            .map_or_else(String::new, |inner| inner.settings.broker_uri.clone())
    }

    fn start_locked(&self, inner: &mut Inner) -> Result<()> {
        let address = validate_broker_uri(&inner.settings.broker_uri, inner.settings.tls.enabled)?;
        let mut options = MqttOptions::new(
            format!("bmsgw-{}", inner.settings.device_id),
            address.host.clone(),
            address.port,
        );
        options.set_keep_alive(inner.settings.keepalive);
        if let (Some(username), Some(password)) =
            (&inner.settings.username, &inner.settings.password)
        {
            options.set_credentials(username.clone(), password.clone());
        }

        if address.secure {
            let tls = build_tls_configuration(&inner.settings.tls)?;
            if address.websocket {
                options.set_transport(Transport::Wss(tls));
            } else {
                options.set_transport(Transport::Tls(tls));
            }
        } else if address.websocket {
            options.set_transport(Transport::Ws);
        }

        let (client, mut connection) = Client::new(options, 16);
        let conn_stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&conn_stop);
        let shared = Arc::clone(&self.shared);
        let uri = inner.settings.broker_uri.clone();
        let conn_join = thread::Builder::new()
            .name("mqtt-conn".into())
            .spawn(move || {
                log::info!("mqtt connecting to {uri}");
                for notification in connection.iter() {
                    if thread_stop.load(Ordering::Relaxed) {
                        break;
                    }
                    match notification {
                        Ok(ClientEvent::Incoming(Packet::ConnAck(_))) => {
                            log::info!("mqtt connected");
                            shared.connected.store(true, Ordering::Relaxed);
                            shared.counters.lock().reconnects += 1;
                        }
                        Ok(ClientEvent::Incoming(Packet::Disconnect)) => {
                            log::warn!("mqtt broker disconnected us");
                            shared.connected.store(false, Ordering::Relaxed);
                            shared.counters.lock().disconnects += 1;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            shared.connected.store(false, Ordering::Relaxed);
                            let mut counters = shared.counters.lock();
                            counters.errors += 1;
                            counters.last_error = last_error_text(&err);
                            drop(counters);
                            if thread_stop.load(Ordering::Relaxed) {
                                break;
                            }
                            thread::sleep(RECONNECT_PAUSE);
                        }
                    }
                }
                shared.connected.store(false, Ordering::Relaxed);
                log::debug!("mqtt connection thread stopped");
            })
            .expect("failed to spawn mqtt connection thread");

        inner.client = Some(client);
        inner.conn_join = Some(conn_join);
        inner.conn_stop = Some(conn_stop);
        inner.started = true;
        Ok(())
    }

    fn stop_locked(inner: &mut Inner, shared: &ConnShared) {
        if !inner.started {
            return;
        }
        if let Some(conn_stop) = inner.conn_stop.take() {
            conn_stop.store(true, Ordering::Relaxed);
        }
        if let Some(client) = inner.client.take() {
            let _ = client.disconnect();
        }
        if let Some(join) = inner.conn_join.take() {
            let _ = join.join();
        }
        shared.connected.store(false, Ordering::Relaxed);
        inner.started = false;
        log::info!("mqtt gateway stopped");
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn build_tls_configuration(tls: &TlsSettings) -> Result<TlsConfiguration> {
    let ca = tls
        .ca_pem
        .as_ref()
        .ok_or_else(|| Error::Config("TLS enabled but no CA certificate provided".into()))?;
    if !tls.verify_server {
        // rustls has no supported way to skip verification; flag it loudly
        // and verify anyway.
        log::warn!("verify_server=false is not honored, server certificate will be verified");
    }
    let client_auth = if tls.client_cert {
        match (&tls.cert_pem, &tls.key_pem) {
            (Some(cert), Some(key)) => Some((cert.as_ref().clone(), key.as_ref().clone())),
            _ => {
                return Err(Error::Config(
                    "client certificate enabled but cert/key missing".into(),
                ))
            }
        }
    } else {
        None
    };
    Ok(TlsConfiguration::Simple {
        ca: ca.as_ref().clone(),
        alpn: None,
        client_auth,
    })
}

/// Wraps the gateway as a telemetry sink publishing on the metrics topic.
pub struct MetricsSink {
    gateway: Arc<MqttGateway>,
}

impl MetricsSink {
    pub fn new(gateway: Arc<MqttGateway>) -> Self {
        MetricsSink { gateway }
    }
}

impl SampleSink for MetricsSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn publish(&self, _sample: &Sample, json: &str) -> Result<()> {
        self.gateway.publish(TopicKind::Metrics, json.as_bytes())
    }
}

/// Drains a bus subscription into the gateway: link events drive the client
/// lifecycle, everything else maps onto the topic table.
pub fn start_event_bridge(
    gateway: Arc<MqttGateway>,
    subscription: Subscription,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("mqtt-bridge".into())
        .spawn(move || {
            log::debug!("mqtt event bridge running");
            loop {
                if let Some(event) = subscription.receive(Duration::from_millis(200)) {
                    match &event {
                        Event::LinkUp => {
                            if let Err(err) = gateway.start() {
                                log::warn!("mqtt start failed: {err}");
                            }
                        }
                        Event::LinkDown => {
                            if let Err(err) = gateway.stop() {
                                log::warn!("mqtt stop failed: {err}");
                            }
                        }
                        other => {
                            if let Some((kind, payload)) = event_publication(other) {
                                if let Err(err) = gateway.publish(kind, payload.as_bytes()) {
                                    log::debug!("mqtt publish failed: {err}");
                                }
                            }
                        }
                    }
                }
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            log::debug!("mqtt event bridge stopped");
        })
        .expect("failed to spawn mqtt event bridge")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertKind;
    use crate::cache::BatteryStatus;

    fn secure_settings(uri: &str) -> MqttSettings {
        MqttSettings {
            broker_uri: uri.to_string(),
            tls: TlsSettings {
                enabled: true,
                verify_server: true,
                ..TlsSettings::default()
            },
            ..MqttSettings::default()
        }
    }

    #[test]
    fn secure_schemes_pass_with_tls_required() {
        for uri in [
            "mqtts://broker:8883",
            "ssl://broker.example.com",
            "wss://broker:443",
        ] {
            assert!(validate_broker_uri(uri, true).is_ok(), "{uri}");
        }
    }

    #[test]
    fn plaintext_schemes_are_rejected_with_tls_required() {
        for uri in ["mqtt://broker:1883", "tcp://broker", "ws://broker:80"] {
            assert!(
                matches!(validate_broker_uri(uri, true), Err(Error::InsecureUri(_))),
                "{uri}"
            );
        }
    }

    #[test]
    fn plaintext_schemes_pass_without_tls() {
        let address = validate_broker_uri("mqtt://broker:1883", false).unwrap();
        assert_eq!(address.host, "broker");
        assert_eq!(address.port, 1883);
        assert!(!address.secure);
    }

    #[test]
    fn default_ports_follow_the_scheme() {
        assert_eq!(validate_broker_uri("mqtt://b", false).unwrap().port, 1883);
        assert_eq!(validate_broker_uri("mqtts://b", true).unwrap().port, 8883);
        assert_eq!(validate_broker_uri("wss://b", true).unwrap().port, 443);
    }

    #[test]
    fn malformed_uris_are_rejected() {
        for uri in ["broker:1883", "http://broker", "mqtt://", "mqtt://host:notaport"] {
            assert!(
                matches!(validate_broker_uri(uri, false), Err(Error::MalformedUri(_))),
                "{uri}"
            );
        }
    }

    #[test]
    fn topic_layout_uses_the_device_prefix() {
        let topics = Topics::new("pack1");
        assert_eq!(topics.status, "bms/pack1/status");
        assert_eq!(topics.metrics, "bms/pack1/metrics");
        assert_eq!(topics.can_raw, "bms/pack1/can/raw");
        assert_eq!(topics.can_decoded, "bms/pack1/can/decoded");
        assert_eq!(topics.can_ready, "bms/pack1/can/ready");
        assert_eq!(topics.config, "bms/pack1/config");
        assert_eq!(topics.alerts, "pack1/alerts");
    }

    #[test]
    fn qos_and_retain_follow_the_table() {
        assert_eq!(TopicKind::Status.qos(), QoS::AtLeastOnce);
        assert!(TopicKind::Status.retain());
        assert_eq!(TopicKind::Metrics.qos(), QoS::AtMostOnce);
        assert!(!TopicKind::Metrics.retain());
        assert_eq!(TopicKind::Config.qos(), QoS::AtLeastOnce);
        assert!(!TopicKind::Config.retain());
        assert_eq!(TopicKind::Alerts.qos(), QoS::AtLeastOnce);
        assert!(!TopicKind::Alerts.retain());
        for kind in [TopicKind::CanRaw, TopicKind::CanDecoded, TopicKind::CanReady] {
            assert_eq!(kind.qos(), QoS::AtMostOnce);
            assert!(!kind.retain());
        }
    }

    #[test]
    fn insecure_uri_is_rejected_at_construction() {
        match MqttGateway::new(secure_settings("mqtt://broker:1883")).err() {
            Some(Error::InsecureUri(uri)) => assert_eq!(uri, "mqtt://broker:1883"),
            other => panic!("expected InsecureUri, got {other:?}"),
        }
    }

    #[test]
    fn apply_configuration_rejects_insecure_uri_and_keeps_old_settings() {
        let gateway = MqttGateway::new(secure_settings("mqtts://broker:8883")).unwrap();
        let result = gateway.apply_configuration(secure_settings("mqtt://broker:1883"));
        assert!(matches!(result, Err(Error::InsecureUri(_))));
        assert_eq!(gateway.broker_uri(), "mqtts://broker:8883");
    }

    #[test]
    fn apply_configuration_swaps_settings_when_valid() {
        let gateway = MqttGateway::new(secure_settings("mqtts://old:8883")).unwrap();
        gateway
            .apply_configuration(secure_settings("mqtts://new:8883"))
            .unwrap();
        assert_eq!(gateway.broker_uri(), "mqtts://new:8883");
    }

    #[test]
    fn publish_before_start_reports_not_started() {
        let gateway = MqttGateway::new(MqttSettings::default()).unwrap();
        assert!(matches!(
            gateway.publish(TopicKind::Metrics, b"{}"),
            Err(Error::NotStarted(_))
        ));
        assert!(!gateway.is_connected());
        assert!(!gateway.status().started);
    }

    #[test]
    fn event_publication_maps_events_onto_topics() {
        let status = BatteryStatus {
            voltage_v: 52.9,
            current_a: -3.1,
            power_w: -163.99,
            soc_pct: 55.5,
            soh_pct: 99.5,
            temperature_c: 23.1,
            temp_sensor_1_c: None,
            temp_sensor_2_c: None,
            temp_internal_c: Some(23.1),
            state: 2,
            state_label: "discharge".into(),
            balancing_bits: 0,
        };
        let (kind, payload) = event_publication(&Event::BatteryStatus(status)).unwrap();
        assert_eq!(kind, TopicKind::Status);
        assert!(payload.contains("\"soc_pct\":55.5"));

        let (kind, payload) = event_publication(&Event::ConfigUpdated("{\"a\":1}".into())).unwrap();
        assert_eq!(kind, TopicKind::Config);
        assert_eq!(payload, "{\"a\":1}");

        let (kind, payload) = event_publication(&Event::Alert {
            kind: AlertKind::CellOverVoltage,
            message: "cell 3 at 4355 mV".into(),
        })
        .unwrap();
        assert_eq!(kind, TopicKind::Alerts);
        assert!(payload.contains("cell_over_voltage"));

        let (kind, _) = event_publication(&Event::CanDecoded("{}".into())).unwrap();
        assert_eq!(kind, TopicKind::CanDecoded);

        assert!(event_publication(&Event::LinkUp).is_none());
        assert!(event_publication(&Event::RegisterUpdated {
            address: 0,
            key: "cell_0_v",
            raw: 0,
            user: 0.0,
        })
        .is_none());
    }

    #[test]
    fn tls_configuration_requires_a_ca() {
        let tls = TlsSettings {
            enabled: true,
            verify_server: true,
            ..TlsSettings::default()
        };
        assert!(matches!(
            build_tls_configuration(&tls),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn tls_configuration_requires_cert_and_key_for_client_auth() {
        let tls = TlsSettings {
            enabled: true,
            verify_server: true,
            client_cert: true,
            ca_pem: Some(Arc::new(b"ca".to_vec())),
            ..TlsSettings::default()
        };
        assert!(matches!(
            build_tls_configuration(&tls),
            Err(Error::Config(_))
        ));
    }
}
