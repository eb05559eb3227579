//! Threshold alerts derived from model snapshots.
//!
//! Each alert kind latches when its condition trips and rearms only after
//! the value has come back past the release margin, so a battery sitting
//! right on a threshold produces one alert, not one per poll cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_derive::Deserialize;

use crate::bus::{Event, EventBus, Subscription};
use crate::cache::{BatteryStatus, PackStatistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    CellOverVoltage,
    CellUnderVoltage,
    OverTemperature,
    SocLow,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::CellOverVoltage => "cell_over_voltage",
            AlertKind::CellUnderVoltage => "cell_under_voltage",
            AlertKind::OverTemperature => "over_temperature",
            AlertKind::SocLow => "soc_low",
        }
    }
}

const ALL_KINDS: [AlertKind; 4] = [
    AlertKind::CellOverVoltage,
    AlertKind::CellUnderVoltage,
    AlertKind::OverTemperature,
    AlertKind::SocLow,
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub cell_over_mv: u16,
    pub cell_under_mv: u16,
    pub over_temp_c: f64,
    pub soc_low_pct: f64,
    /// Cell voltage must come back this far past the threshold to rearm.
    pub rearm_mv: u16,
    pub rearm_temp_c: f64,
    pub rearm_soc_pct: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        AlertThresholds {
            cell_over_mv: 4250,
            cell_under_mv: 2800,
            over_temp_c: 55.0,
            soc_low_pct: 10.0,
            rearm_mv: 50,
            rearm_temp_c: 5.0,
            rearm_soc_pct: 5.0,
        }
    }
}

/// Pure threshold evaluator; the task shell around it only moves events.
pub struct AlertEvaluator {
    thresholds: AlertThresholds,
    active: [bool; ALL_KINDS.len()],
}

impl AlertEvaluator {
    pub fn new(thresholds: AlertThresholds) -> Self {
        AlertEvaluator {
            thresholds,
            active: [false; ALL_KINDS.len()],
        }
    }

    /// Returns the alerts newly tripped by this pair of snapshots.
    pub fn evaluate(
        &mut self,
        status: Option<&BatteryStatus>,
        statistics: Option<&PackStatistics>,
    ) -> Vec<(AlertKind, String)> {
        let mut tripped = Vec::new();
        for (index, kind) in ALL_KINDS.iter().enumerate() {
            let Some(check) = self.check(*kind, status, statistics) else {
                continue;
            };
            match check {
                Condition::Tripped(message) => {
                    if !self.active[index] {
                        self.active[index] = true;
                        tripped.push((*kind, message));
                    }
                }
                Condition::Released => self.active[index] = false,
                Condition::Holding => {}
            }
        }
        tripped
    }

    fn check(
        &self,
        kind: AlertKind,
        status: Option<&BatteryStatus>,
        statistics: Option<&PackStatistics>,
    ) -> Option<Condition> {
        let t = &self.thresholds;
        match kind {
            AlertKind::CellOverVoltage => {
                let max = statistics?.cell_max_mv;
                Some(if max > t.cell_over_mv {
                    Condition::Tripped(format!("cell voltage {max} mV above {} mV", t.cell_over_mv))
                } else if max <= t.cell_over_mv.saturating_sub(t.rearm_mv) {
                    Condition::Released
                } else {
                    Condition::Holding
                })
            }
            AlertKind::CellUnderVoltage => {
                let min = statistics?.cell_min_mv;
                Some(if min < t.cell_under_mv {
                    Condition::Tripped(format!(
                        "cell voltage {min} mV below {} mV",
                        t.cell_under_mv
                    ))
                } else if min >= t.cell_under_mv.saturating_add(t.rearm_mv) {
                    Condition::Released
                } else {
                    Condition::Holding
                })
            }
            AlertKind::OverTemperature => {
                let temp = status?.temperature_c;
                Some(if temp > t.over_temp_c {
                    Condition::Tripped(format!("temperature {temp} °C above {} °C", t.over_temp_c))
                } else if temp <= t.over_temp_c - t.rearm_temp_c {
                    Condition::Released
                } else {
                    Condition::Holding
                })
            }
            AlertKind::SocLow => {
                let soc = status?.soc_pct;
                Some(if soc < t.soc_low_pct {
                    Condition::Tripped(format!("SOC {soc} % below {} %", t.soc_low_pct))
                } else if soc >= t.soc_low_pct + t.rearm_soc_pct {
                    Condition::Released
                } else {
                    Condition::Holding
                })
            }
        }
    }
}

enum Condition {
    Tripped(String),
    Released,
    Holding,
}

pub struct AlertTask;

impl AlertTask {
    /// Watches model snapshots on `subscription` and publishes alert
    /// events back onto the bus.
    pub fn start(
        bus: Arc<EventBus>,
        subscription: Subscription,
        thresholds: AlertThresholds,
        publish_timeout: Duration,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        thread::Builder::new()
            .name("alerts".into())
            .spawn(move || {
                log::debug!("alert task running");
                let mut evaluator = AlertEvaluator::new(thresholds);
                let mut latest_status: Option<BatteryStatus> = None;
                let mut latest_statistics: Option<PackStatistics> = None;
                loop {
                    match subscription.receive(Duration::from_millis(200)) {
                        Some(Event::BatteryStatus(status)) => latest_status = Some(status),
                        Some(Event::PackStatistics(statistics)) => {
                            latest_statistics = Some(statistics);
                        }
                        _ => {}
                    }
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    for (kind, message) in
                        evaluator.evaluate(latest_status.as_ref(), latest_statistics.as_ref())
                    {
                        log::warn!("alert {}: {message}", kind.as_str());
                        let _ = bus.publish(&Event::Alert { kind, message }, publish_timeout);
                    }
                }
                log::debug!("alert task stopped");
            })
            .expect("failed to spawn alert task")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_with(temp: f64, soc: f64) -> BatteryStatus {
        BatteryStatus {
            voltage_v: 52.9,
            current_a: 0.0,
            power_w: 0.0,
            soc_pct: soc,
            soh_pct: 100.0,
            temperature_c: temp,
            temp_sensor_1_c: None,
            temp_sensor_2_c: None,
            temp_internal_c: Some(temp),
            state: 0,
            state_label: "standby".into(),
            balancing_bits: 0,
        }
    }

    fn statistics_with(min: u16, max: u16) -> PackStatistics {
        PackStatistics {
            cell_mv: vec![min, max],
            cell_min_mv: min,
            cell_max_mv: max,
            cell_delta_mv: max - min,
            cell_avg_mv: (min + max) / 2,
        }
    }

    #[test]
    fn no_snapshots_no_alerts() {
        let mut evaluator = AlertEvaluator::new(AlertThresholds::default());
        assert!(evaluator.evaluate(None, None).is_empty());
    }

    #[test]
    fn over_voltage_trips_once_until_rearmed() {
        let mut evaluator = AlertEvaluator::new(AlertThresholds::default());
        let hot = statistics_with(3300, 4300);

        let first = evaluator.evaluate(None, Some(&hot));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].0, AlertKind::CellOverVoltage);

        // Still over: no repeat.
        assert!(evaluator.evaluate(None, Some(&hot)).is_empty());

        // Just under the threshold but inside the rearm band: still quiet.
        let holding = statistics_with(3300, 4240);
        assert!(evaluator.evaluate(None, Some(&holding)).is_empty());

        // Below the rearm point, then over again: a fresh alert.
        let released = statistics_with(3300, 4150);
        assert!(evaluator.evaluate(None, Some(&released)).is_empty());
        assert_eq!(evaluator.evaluate(None, Some(&hot)).len(), 1);
    }

    #[test]
    fn under_voltage_and_soc_low_trip_independently() {
        let mut evaluator = AlertEvaluator::new(AlertThresholds::default());
        let status = status_with(25.0, 5.0);
        let statistics = statistics_with(2700, 3400);

        let tripped = evaluator.evaluate(Some(&status), Some(&statistics));
        let kinds: Vec<AlertKind> = tripped.iter().map(|(kind, _)| *kind).collect();
        assert!(kinds.contains(&AlertKind::CellUnderVoltage));
        assert!(kinds.contains(&AlertKind::SocLow));
        assert!(!kinds.contains(&AlertKind::OverTemperature));
    }

    #[test]
    fn dead_cell_at_zero_trips_under_voltage() {
        let mut evaluator = AlertEvaluator::new(AlertThresholds::default());
        let statistics = statistics_with(0, 3300);
        let tripped = evaluator.evaluate(None, Some(&statistics));
        assert_eq!(tripped.len(), 1);
        assert_eq!(tripped[0].0, AlertKind::CellUnderVoltage);
        assert!(tripped[0].1.contains("0 mV"));
    }

    #[test]
    fn over_temperature_uses_the_release_margin() {
        let mut evaluator = AlertEvaluator::new(AlertThresholds::default());
        assert_eq!(
            evaluator
                .evaluate(Some(&status_with(56.0, 50.0)), None)
                .len(),
            1
        );
        // 51 °C is inside the 5 °C rearm band.
        assert!(evaluator
            .evaluate(Some(&status_with(51.0, 50.0)), None)
            .is_empty());
        assert!(evaluator
            .evaluate(Some(&status_with(56.0, 50.0)), None)
            .is_empty());
        // Drop below 50 °C, rearm, trip again.
        assert!(evaluator
            .evaluate(Some(&status_with(49.0, 50.0)), None)
            .is_empty());
        assert_eq!(
            evaluator
                .evaluate(Some(&status_with(56.0, 50.0)), None)
                .len(),
            1
        );
    }
}
