//! Periodic status reporting: every minute the diagnostic counters of the
//! other components are folded into one compact JSON snapshot and POSTed
//! to the configured endpoint. A failed POST is logged and forgotten; the
//! next period gets a fresh snapshot anyway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_derive::Serialize;

use crate::bus::{EventBus, SubscriptionMetrics};
use crate::error::{Error, Result};
use crate::mqtt::{MqttGateway, MqttStatusSnapshot};
use crate::poller::{PollerCounters, PollerHandle};
use crate::serial::engine::{SerialCounters, SerialHandle};
use crate::telemetry::{PublisherHandle, PublisherSnapshot};

#[derive(Debug, Clone)]
pub struct StatusSettings {
    pub endpoint: Option<String>,
    pub period: Duration,
    pub http_timeout: Duration,
}

impl Default for StatusSettings {
    fn default() -> Self {
        StatusSettings {
            endpoint: None,
            period: Duration::from_secs(60),
            http_timeout: Duration::from_secs(10),
        }
    }
}

/// Handles onto every component that exposes counters. Optional parts are
/// simply absent from the snapshot.
pub struct StatusSources {
    pub bus: Arc<EventBus>,
    pub serial: SerialHandle,
    pub poller: Option<PollerHandle>,
    pub publisher: Option<PublisherHandle>,
    pub mqtt: Option<Arc<MqttGateway>>,
}

#[derive(Debug, Serialize)]
pub struct BusStatus {
    pub delivered: u64,
    pub dropped: u64,
    pub subscriptions: Vec<SubscriptionMetrics>,
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub uptime_s: u64,
    pub bus: BusStatus,
    pub serial: SerialCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poller: Option<PollerCounters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<PublisherSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<MqttStatusSnapshot>,
}

pub fn build_snapshot(sources: &StatusSources, started_at: Instant) -> StatusSnapshot {
    StatusSnapshot {
        uptime_s: started_at.elapsed().as_secs(),
        bus: BusStatus {
            delivered: sources.bus.delivered_total(),
            dropped: sources.bus.dropped_total(),
            subscriptions: sources.bus.metrics(),
        },
        serial: sources.serial.counters(),
        poller: sources.poller.as_ref().map(PollerHandle::counters),
        telemetry: sources.publisher.as_ref().map(PublisherHandle::snapshot),
        mqtt: sources.mqtt.as_ref().map(|gateway| gateway.status()),
    }
}

pub struct StatusReporter;

impl StatusReporter {
    pub fn start(
        sources: StatusSources,
        settings: StatusSettings,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        thread::Builder::new()
            .name("status".into())
            .spawn(move || {
                log::debug!("status reporter running");
                let started_at = Instant::now();
                let client = reqwest::blocking::Client::builder()
                    .timeout(settings.http_timeout)
                    .build()
                    .ok();
                let mut next_report = Instant::now() + settings.period;
                loop {
                    thread::sleep(Duration::from_millis(200));
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    if Instant::now() < next_report {
                        continue;
                    }
                    next_report = Instant::now() + settings.period;

                    let snapshot = build_snapshot(&sources, started_at);
                    match (&settings.endpoint, &client) {
                        (Some(endpoint), Some(client)) => {
                            if let Err(err) = post_snapshot(client, endpoint, &snapshot) {
                                log::warn!("status report failed: {err}");
                            }
                        }
                        _ => log::debug!(
                            "status: {}",
                            serde_json::to_string(&snapshot).unwrap_or_default()
                        ),
                    }
                }
                log::debug!("status reporter stopped");
            })
            .expect("failed to spawn status reporter")
    }
}

fn post_snapshot(
    client: &reqwest::blocking::Client,
    endpoint: &str,
    snapshot: &StatusSnapshot,
) -> Result<()> {
    let body = serde_json::to_string(snapshot)
        .map_err(|e| Error::Config(format!("status snapshot: {e}")))?;
    client
        .post(endpoint)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(|e| Error::Publish {
            sink: "status",
            reason: e.to_string(),
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RegisterCache;
    use crate::catalog::Catalog;
    use crate::serial::engine::{SerialEngine, SerialSettings};
    use crate::serial::link::SerialLink;

    struct DeadLink;

    impl SerialLink for DeadLink {
        fn write_frame(&mut self, _bytes: &[u8]) -> crate::error::Result<()> {
            Ok(())
        }

        fn read_some(&mut self, _buf: &mut [u8]) -> crate::error::Result<usize> {
            thread::sleep(Duration::from_millis(1));
            Ok(0)
        }
    }

    #[test]
    fn snapshot_serializes_the_expected_shape() {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(RegisterCache::new(
            Arc::new(Catalog::new()),
            Arc::clone(&bus),
            Duration::ZERO,
        ));
        let stop = Arc::new(AtomicBool::new(false));
        let (serial, join) = SerialEngine::start(
            Box::new(DeadLink),
            cache,
            SerialSettings::default(),
            Arc::clone(&stop),
        );
        let _sub = bus.subscribe("probe", 4);

        let sources = StatusSources {
            bus: Arc::clone(&bus),
            serial: serial.clone(),
            poller: None,
            publisher: None,
            mqtt: None,
        };
        let snapshot = build_snapshot(&sources, Instant::now());
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&snapshot).unwrap()).unwrap();

        assert!(value["uptime_s"].is_u64());
        assert!(value["bus"]["delivered"].is_u64());
        assert!(value["bus"]["dropped"].is_u64());
        assert_eq!(value["bus"]["subscriptions"][0]["name"], "probe");
        assert!(value["serial"]["requests"].is_u64());
        // Absent components stay out of the payload entirely.
        assert!(value.get("poller").is_none());
        assert!(value.get("telemetry").is_none());
        assert!(value.get("mqtt").is_none());

        stop.store(true, Ordering::Relaxed);
        drop(serial);
        drop(sources);
        join.join().unwrap();
    }
}
