//! Periodic register polling.
//!
//! Two fixed address sets cycle at different rates: the live set feeds the
//! telemetry model every couple of seconds, the configuration set refreshes
//! the writable window rarely (off by default). Each individual read goes
//! through the shared serial queue with a pause in between, so on-demand
//! requests from other callers interleave instead of waiting out a burst.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::cache::ModelBuilder;
use crate::catalog::{CONFIG_ADDRESSES, LIVE_ADDRESSES};
use crate::serial::engine::SerialHandle;

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub live_period: Duration,
    pub config_period: Duration,
    pub config_enabled: bool,
    /// Pause between individual register reads within a cycle.
    pub inter_register_delay: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        PollerSettings {
            live_period: Duration::from_secs(2),
            config_period: Duration::from_secs(30),
            config_enabled: false,
            inter_register_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Default, Clone, serde_derive::Serialize)]
pub struct PollerCounters {
    pub cycles: u64,
    pub ok_reads: u64,
    pub failed_reads: u64,
}

#[derive(Clone)]
pub struct PollerHandle {
    trigger: Sender<()>,
    counters: Arc<Mutex<PollerCounters>>,
}

impl PollerHandle {
    /// Forces one immediate poll cycle. A cycle already pending makes this
    /// a no-op.
    pub fn trigger_now(&self) {
        let _ = self.trigger.try_send(());
    }

    pub fn counters(&self) -> PollerCounters {
        self.counters.lock().clone()
    }
}

pub struct Poller;

impl Poller {
    pub fn start(
        serial: SerialHandle,
        model: Arc<ModelBuilder>,
        settings: PollerSettings,
        stop: Arc<AtomicBool>,
    ) -> (PollerHandle, JoinHandle<()>) {
        let (trigger, trigger_receiver) = bounded(1);
        let counters = Arc::new(Mutex::new(PollerCounters::default()));
        let runner = PollerThread {
            serial,
            model,
            settings,
            stop,
            trigger: trigger_receiver,
            counters: Arc::clone(&counters),
        };
        let join_handle = thread::Builder::new()
            .name("poller".into())
            .spawn(move || runner.run())
            .expect("failed to spawn poller");
        (PollerHandle { trigger, counters }, join_handle)
    }
}

struct PollerThread {
    serial: SerialHandle,
    model: Arc<ModelBuilder>,
    settings: PollerSettings,
    stop: Arc<AtomicBool>,
    trigger: Receiver<()>,
    counters: Arc<Mutex<PollerCounters>>,
}

impl PollerThread {
    fn run(self) {
        log::debug!("poller running");
        let mut next_live = Instant::now();
        let mut next_config = Instant::now();
        loop {
            let wait = next_live.saturating_duration_since(Instant::now());
            match self.trigger.recv_timeout(wait) {
                // Forced cycle: poll everything now.
                Ok(()) => next_config = Instant::now(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            self.counters.lock().cycles += 1;
            self.poll_set(LIVE_ADDRESSES);
            next_live = Instant::now() + self.settings.live_period;

            if self.settings.config_enabled && Instant::now() >= next_config {
                self.poll_set(CONFIG_ADDRESSES);
                next_config = Instant::now() + self.settings.config_period;
            }

            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            self.model.publish_snapshots();
        }
        log::debug!("poller stopped");
    }

    fn poll_set(&self, addresses: &[u16]) {
        for &address in addresses {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            match self.serial.read(address) {
                Ok(_) => self.counters.lock().ok_reads += 1,
                Err(err) => {
                    self.counters.lock().failed_reads += 1;
                    log::debug!("poll of 0x{address:04X} failed: {err}");
                }
            }
            thread::sleep(self.settings.inter_register_delay);
        }
    }
}
