//! Telemetry publisher: builds one sample per tick from the latest model
//! snapshots and pushes it to the configured sinks, buffering offline.
//!
//! The ring buffer is drop-oldest: when the link is down long enough, the
//! freshest N samples survive. On reconnect the backlog flushes in FIFO
//! order, so the receiving side sees time move forward.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_derive::Serialize;

use crate::bus::{Event, Subscription};
use crate::cache::{BatteryStatus, PackStatistics};
use crate::error::{last_error_text, Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub ts_ms: u64,
    pub soc: f64,
    pub soh: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
    pub temperature_c: f64,
    pub cell_min_mv: u16,
    pub cell_max_mv: u16,
    pub cell_delta_mv: u16,
}

/// Fixed-capacity FIFO of samples, drop-oldest on overflow.
#[derive(Debug)]
pub struct SampleRing {
    buf: VecDeque<Sample>,
    capacity: usize,
    dropped: u64,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        SampleRing {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, sample: Sample) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
            self.dropped += 1;
        }
        self.buf.push_back(sample);
    }

    pub fn front(&self) -> Option<&Sample> {
        self.buf.front()
    }

    pub fn pop_front(&mut self) -> Option<Sample> {
        self.buf.pop_front()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// A destination for samples. The publisher treats a tick as successful
/// only when every sink accepted it.
pub trait SampleSink: Send {
    fn name(&self) -> &'static str;
    fn publish(&self, sample: &Sample, json: &str) -> Result<()>;
}

/// Blocking HTTP POST of the sample JSON.
pub struct HttpSink {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(HttpSink { client, url })
    }
}

impl SampleSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    fn publish(&self, _sample: &Sample, json: &str) -> Result<()> {
        self.client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(json.to_string())
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::Publish {
                sink: "http",
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub period: Duration,
    pub buffer_capacity: usize,
    pub offline_buffering: bool,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        PublisherSettings {
            period: Duration::from_secs(1),
            buffer_capacity: 64,
            offline_buffering: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PublisherSnapshot {
    pub connected: bool,
    pub last_sample_ts_ms: Option<u64>,
    pub last_sync_ts_ms: Option<u64>,
    pub published: u64,
    pub publish_errors: u64,
    pub buffered: usize,
    pub buffer_capacity: usize,
    pub buffer_dropped: u64,
    pub last_publish_duration_ms: u64,
    pub last_error: String,
}

/// The publisher's whole mutable state; the periodic thread and the status
/// reporter both reach it through one short-lived lock.
pub struct PublisherCore {
    sinks: Vec<Box<dyn SampleSink>>,
    ring: SampleRing,
    settings: PublisherSettings,
    online: bool,
    latest_status: Option<BatteryStatus>,
    latest_statistics: Option<PackStatistics>,
    epoch: Instant,
    last_sample_ts_ms: Option<u64>,
    last_sync_ts_ms: Option<u64>,
    published: u64,
    publish_errors: u64,
    last_publish_duration: Duration,
    last_error: String,
}

impl PublisherCore {
    pub fn new(sinks: Vec<Box<dyn SampleSink>>, settings: PublisherSettings) -> Self {
        PublisherCore {
            sinks,
            ring: SampleRing::new(settings.buffer_capacity),
            settings,
            online: false,
            latest_status: None,
            latest_statistics: None,
            epoch: Instant::now(),
            last_sample_ts_ms: None,
            last_sync_ts_ms: None,
            published: 0,
            publish_errors: 0,
            last_publish_duration: Duration::ZERO,
            last_error: String::new(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn handle_event(&mut self, event: &Event) {
        match event {
            Event::BatteryStatus(status) => self.latest_status = Some(status.clone()),
            Event::PackStatistics(statistics) => {
                self.latest_statistics = Some(statistics.clone());
            }
            Event::LinkUp => {
                log::info!("link up, flushing {} buffered samples", self.ring.len());
                self.online = true;
                self.flush();
            }
            Event::LinkDown => {
                self.online = false;
            }
            _ => {}
        }
    }

    /// One publish tick. Without a battery status there is nothing worth
    /// saying yet, so the tick is skipped entirely.
    pub fn tick(&mut self) {
        let Some(status) = &self.latest_status else {
            return;
        };
        let sample = build_sample(self.now_ms(), status, self.latest_statistics.as_ref());
        self.last_sample_ts_ms = Some(sample.ts_ms);

        if self.online {
            if self.publish_sample(&sample) {
                self.flush();
                return;
            }
            log::warn!("publish failed, going offline: {}", self.last_error);
            self.online = false;
        }
        if self.settings.offline_buffering {
            self.buffer(sample);
        }
    }

    fn buffer(&mut self, sample: Sample) {
        self.ring.push(sample);
    }

    /// Publishes buffered samples oldest-first until the buffer is empty or
    /// a sink refuses one; the refused sample stays buffered.
    fn flush(&mut self) {
        while let Some(sample) = self.ring.front().cloned() {
            if !self.publish_sample(&sample) {
                self.online = false;
                return;
            }
            self.ring.pop_front();
        }
    }

    fn publish_sample(&mut self, sample: &Sample) -> bool {
        let json = match serde_json::to_string(sample) {
            Ok(json) => json,
            Err(e) => {
                // A sample that doesn't serialize will never serialize;
                // count it and move on.
                self.publish_errors += 1;
                self.last_error = last_error_text(&e);
                return true;
            }
        };

        let started = Instant::now();
        for sink in &self.sinks {
            if let Err(err) = sink.publish(sample, &json) {
                self.publish_errors += 1;
                self.last_error = last_error_text(&err);
                self.last_publish_duration = started.elapsed();
                return false;
            }
        }
        self.last_publish_duration = started.elapsed();
        self.published += 1;
        self.last_sync_ts_ms = Some(self.now_ms());
        true
    }

    pub fn snapshot(&self) -> PublisherSnapshot {
        PublisherSnapshot {
            connected: self.online,
            last_sample_ts_ms: self.last_sample_ts_ms,
            last_sync_ts_ms: self.last_sync_ts_ms,
            published: self.published,
            publish_errors: self.publish_errors,
            buffered: self.ring.len(),
            buffer_capacity: self.ring.capacity(),
            buffer_dropped: self.ring.dropped(),
            last_publish_duration_ms: self.last_publish_duration.as_millis() as u64,
            last_error: self.last_error.clone(),
        }
    }
}

fn build_sample(ts_ms: u64, status: &BatteryStatus, statistics: Option<&PackStatistics>) -> Sample {
    Sample {
        ts_ms,
        soc: status.soc_pct,
        soh: status.soh_pct,
        voltage_v: status.voltage_v,
        current_a: status.current_a,
        power_w: status.power_w,
        temperature_c: status.temperature_c,
        cell_min_mv: statistics.map_or(0, |s| s.cell_min_mv),
        cell_max_mv: statistics.map_or(0, |s| s.cell_max_mv),
        cell_delta_mv: statistics.map_or(0, |s| s.cell_delta_mv),
    }
}

#[derive(Clone)]
pub struct PublisherHandle {
    core: Arc<Mutex<PublisherCore>>,
}

impl PublisherHandle {
    pub fn snapshot(&self) -> PublisherSnapshot {
        self.core.lock().snapshot()
    }
}

pub struct Publisher;

impl Publisher {
    /// Spawns the periodic publish thread. `subscription` must be
    /// subscribed to the bus before any model snapshots of interest are
    /// published.
    pub fn start(
        subscription: Subscription,
        core: PublisherCore,
        stop: Arc<AtomicBool>,
    ) -> (PublisherHandle, JoinHandle<()>) {
        let period = core.settings.period;
        let core = Arc::new(Mutex::new(core));
        let handle = PublisherHandle {
            core: Arc::clone(&core),
        };
        let join_handle = thread::Builder::new()
            .name("telemetry".into())
            .spawn(move || {
                log::debug!("telemetry publisher running");
                let mut next_tick = Instant::now() + period;
                loop {
                    let wait = next_tick.saturating_duration_since(Instant::now());
                    if let Some(event) = subscription.receive(wait) {
                        core.lock().handle_event(&event);
                    }
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    if Instant::now() >= next_tick {
                        core.lock().tick();
                        next_tick = Instant::now() + period;
                    }
                }
                log::debug!("telemetry publisher stopped");
            })
            .expect("failed to spawn telemetry publisher");
        (handle, join_handle)
    }
}
