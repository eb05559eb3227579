//! Register cache and the derived telemetry model.
//!
//! The serial worker is the only writer; everyone else takes short-lock
//! snapshots. Each successful read or write lands here and fans out as a
//! `register_updated` event. The model composes pack-level snapshots from
//! the cached words, reassembling the two-register f32/u32 quantities only
//! when both halves are fresh.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_derive::Serialize;

use crate::bus::{Event, EventBus};
use crate::catalog::{
    Catalog, ADDR_BALANCING_BITS, ADDR_BMS_STATE, ADDR_CELL_FIRST, ADDR_CELL_LAST,
    ADDR_CELL_MAX_MV, ADDR_CELL_MIN_MV, ADDR_PACK_CURRENT, ADDR_PACK_VOLTAGE, ADDR_SOC, ADDR_SOH,
    ADDR_TEMP_INTERNAL, ADDR_TEMP_SENSOR_1, ADDR_TEMP_SENSOR_2,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub raw: u16,
    pub user: f64,
    pub updated_at: Instant,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.updated_at.elapsed()
    }
}

pub struct RegisterCache {
    catalog: Arc<Catalog>,
    bus: Arc<EventBus>,
    publish_timeout: Duration,
    entries: Mutex<FxHashMap<u16, CacheEntry>>,
}

impl RegisterCache {
    pub fn new(catalog: Arc<Catalog>, bus: Arc<EventBus>, publish_timeout: Duration) -> Self {
        RegisterCache {
            catalog,
            bus,
            publish_timeout,
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Records a successfully read or written raw word and emits
    /// `register_updated`. Words without a catalog descriptor (the high
    /// halves of two-register quantities) are cached raw-only and emit
    /// nothing; the model publishes them as part of its snapshots instead.
    pub fn store(&self, address: u16, raw: u16) {
        let descriptor = self.catalog.by_address(address);
        let user = descriptor.map_or(f64::from(raw), |d| d.raw_to_user(raw));
        let entry = CacheEntry {
            raw,
            user,
            updated_at: Instant::now(),
        };
        self.entries.lock().insert(address, entry);

        // The bus lock is taken only after the entries lock is released.
        if let Some(descriptor) = descriptor {
            let _ = self.bus.publish(
                &Event::RegisterUpdated {
                    address,
                    key: descriptor.key,
                    raw,
                    user,
                },
                self.publish_timeout,
            );
        }
    }

    /// `None` means the register was never read; a present entry may still
    /// be arbitrarily old, which is the caller's call to judge via
    /// [`CacheEntry::age`].
    pub fn get(&self, address: u16) -> Option<CacheEntry> {
        self.entries.lock().get(&address).cloned()
    }

    pub fn get_fresh(&self, address: u16, max_age: Duration) -> Option<CacheEntry> {
        self.get(address).filter(|entry| entry.age() <= max_age)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Pack-level snapshot composed from the live register set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryStatus {
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
    pub soc_pct: f64,
    pub soh_pct: f64,
    /// Average over the temperature sensors that answered.
    pub temperature_c: f64,
    pub temp_sensor_1_c: Option<f64>,
    pub temp_sensor_2_c: Option<f64>,
    pub temp_internal_c: Option<f64>,
    pub state: u16,
    pub state_label: String,
    pub balancing_bits: u16,
}

/// Per-cell snapshot composed from the live register set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackStatistics {
    /// Fresh cell voltages in cell order, millivolts.
    pub cell_mv: Vec<u16>,
    pub cell_min_mv: u16,
    pub cell_max_mv: u16,
    pub cell_delta_mv: u16,
    pub cell_avg_mv: u16,
}

/// Derives [`BatteryStatus`] and [`PackStatistics`] from the cache.
pub struct ModelBuilder {
    cache: Arc<RegisterCache>,
    bus: Arc<EventBus>,
    /// Cache entries older than this are ignored; two-register values
    /// additionally require both halves within it.
    freshness: Duration,
    publish_timeout: Duration,
}

impl ModelBuilder {
    pub fn new(
        cache: Arc<RegisterCache>,
        bus: Arc<EventBus>,
        freshness: Duration,
        publish_timeout: Duration,
    ) -> Self {
        ModelBuilder {
            cache,
            bus,
            freshness,
            publish_timeout,
        }
    }

    fn fresh_raw(&self, address: u16) -> Option<u16> {
        self.cache
            .get_fresh(address, self.freshness)
            .map(|entry| entry.raw)
    }

    /// IEEE-754 f32 spanning `base` (low word) and `base + 1` (high word).
    fn f32_pair(&self, base: u16) -> Option<f64> {
        let lo = self.fresh_raw(base)?;
        let hi = self.fresh_raw(base + 1)?;
        let bits = u32::from(lo) | (u32::from(hi) << 16);
        Some(f64::from(f32::from_bits(bits)))
    }

    fn u32_pair(&self, base: u16) -> Option<u32> {
        let lo = self.fresh_raw(base)?;
        let hi = self.fresh_raw(base + 1)?;
        Some(u32::from(lo) | (u32::from(hi) << 16))
    }

    pub fn battery_status(&self) -> Option<BatteryStatus> {
        let voltage_v = round2(self.f32_pair(ADDR_PACK_VOLTAGE)?);
        let current_a = round2(self.f32_pair(ADDR_PACK_CURRENT)?);
        let soc_pct = round2(f64::from(self.u32_pair(ADDR_SOC)?) * 1e-6);
        let soh_pct = round2(f64::from(self.fresh_raw(ADDR_SOH)?) * 0.01);

        let temp_sensor_1_c = self.fresh_temp(ADDR_TEMP_SENSOR_1);
        let temp_sensor_2_c = self.fresh_temp(ADDR_TEMP_SENSOR_2);
        let temp_internal_c = self.fresh_temp(ADDR_TEMP_INTERNAL);
        let temps: Vec<f64> = [temp_sensor_1_c, temp_sensor_2_c, temp_internal_c]
            .into_iter()
            .flatten()
            .collect();
        if temps.is_empty() {
            return None;
        }
        let temperature_c = round1(temps.iter().sum::<f64>() / temps.len() as f64);

        let state = self.fresh_raw(ADDR_BMS_STATE).unwrap_or(0);
        let state_label = self
            .cache
            .catalog()
            .by_address(ADDR_BMS_STATE)
            .and_then(|d| d.enum_items.iter().find(|item| item.value == state))
            .map_or_else(|| "unknown".to_string(), |item| item.label.to_string());

        Some(BatteryStatus {
            voltage_v,
            current_a,
            power_w: round2(voltage_v * current_a),
            soc_pct,
            soh_pct,
            temperature_c,
            temp_sensor_1_c,
            temp_sensor_2_c,
            temp_internal_c,
            state,
            state_label,
            balancing_bits: self.fresh_raw(ADDR_BALANCING_BITS).unwrap_or(0),
        })
    }

    fn fresh_temp(&self, address: u16) -> Option<f64> {
        let raw = self.fresh_raw(address)?;
        Some(f64::from(raw as i16) * 0.1)
    }

    /// Every fresh cell register counts, a reading of zero included: a
    /// dead or disconnected cell reports 0 V and must drag `cell_min_mv`
    /// down where the under-voltage alert can see it.
    pub fn pack_statistics(&self) -> Option<PackStatistics> {
        let mut cell_mv = Vec::new();
        for address in ADDR_CELL_FIRST..=ADDR_CELL_LAST {
            if let Some(raw) = self.fresh_raw(address) {
                // 0.0001 V per LSB is a tenth of a millivolt.
                cell_mv.push(raw / 10);
            }
        }
        if cell_mv.is_empty() {
            return None;
        }

        let computed_min = cell_mv.iter().copied().min().unwrap_or(0);
        let computed_max = cell_mv.iter().copied().max().unwrap_or(0);
        let cell_min_mv = self.fresh_raw(ADDR_CELL_MIN_MV).unwrap_or(computed_min);
        let cell_max_mv = self.fresh_raw(ADDR_CELL_MAX_MV).unwrap_or(computed_max);
        let cell_avg_mv =
            (cell_mv.iter().map(|&mv| u32::from(mv)).sum::<u32>() / cell_mv.len() as u32) as u16;

        Some(PackStatistics {
            cell_min_mv,
            cell_max_mv,
            cell_delta_mv: cell_max_mv.saturating_sub(cell_min_mv),
            cell_avg_mv,
            cell_mv,
        })
    }

    /// Publishes the current snapshots; called by the poller after each
    /// completed live cycle. Incomplete snapshots are skipped quietly,
    /// they'll be complete once a full cycle has landed.
    pub fn publish_snapshots(&self) {
        if let Some(status) = self.battery_status() {
            let _ = self
                .bus
                .publish(&Event::BatteryStatus(status), self.publish_timeout);
        }
        if let Some(statistics) = self.pack_statistics() {
            let _ = self
                .bus
                .publish(&Event::PackStatistics(statistics), self.publish_timeout);
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RESTART_ADDRESS;

    fn cache_and_bus() -> (Arc<RegisterCache>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(RegisterCache::new(
            Arc::new(Catalog::new()),
            Arc::clone(&bus),
            Duration::ZERO,
        ));
        (cache, bus)
    }

    fn model(cache: &Arc<RegisterCache>, bus: &Arc<EventBus>) -> ModelBuilder {
        ModelBuilder::new(
            Arc::clone(cache),
            Arc::clone(bus),
            Duration::from_secs(2),
            Duration::ZERO,
        )
    }

    fn store_f32(cache: &RegisterCache, base: u16, value: f32) {
        let bits = value.to_bits();
        cache.store(base, (bits & 0xFFFF) as u16);
        cache.store(base + 1, (bits >> 16) as u16);
    }

    fn store_full_live_set(cache: &RegisterCache) {
        for cell in 0..16u16 {
            cache.store(cell, 33000 + cell * 10); // 3300.0 .. 3315.0 mV
        }
        store_f32(cache, ADDR_PACK_VOLTAGE, 52.9);
        store_f32(cache, ADDR_PACK_CURRENT, -12.5);
        cache.store(ADDR_CELL_MIN_MV, 3300);
        cache.store(ADDR_CELL_MAX_MV, 3315);
        cache.store(ADDR_TEMP_SENSOR_1, 215); // 21.5 °C
        cache.store(ADDR_TEMP_SENSOR_2, 225); // 22.5 °C
        cache.store(ADDR_SOH, 9950); // 99.50 %
        cache.store(ADDR_SOC, (55_500_000u32 & 0xFFFF) as u16);
        cache.store(ADDR_SOC + 1, (55_500_000u32 >> 16) as u16);
        cache.store(ADDR_TEMP_INTERNAL, 253); // 25.3 °C
        cache.store(ADDR_BMS_STATE, 2);
        cache.store(ADDR_BALANCING_BITS, 0b101);
    }

    #[test]
    fn uncached_register_reads_as_none() {
        let (cache, _bus) = cache_and_bus();
        assert!(cache.get(0).is_none());
    }

    #[test]
    fn store_emits_register_updated_with_scaled_value() {
        let (cache, bus) = cache_and_bus();
        let sub = bus.subscribe("test", 8);
        cache.store(0, 0x1068);
        match sub.try_receive().unwrap() {
            Event::RegisterUpdated {
                address,
                key,
                raw,
                user,
            } => {
                assert_eq!(address, 0);
                assert_eq!(key, "cell_0_v");
                assert_eq!(raw, 0x1068);
                assert_eq!(user, 0.42);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn high_half_words_are_cached_without_events() {
        let (cache, bus) = cache_and_bus();
        let sub = bus.subscribe("test", 8);
        cache.store(ADDR_PACK_VOLTAGE + 1, 0x4253);
        assert!(sub.try_receive().is_none());
        assert_eq!(cache.get(ADDR_PACK_VOLTAGE + 1).unwrap().raw, 0x4253);
    }

    #[test]
    fn events_preserve_store_order() {
        let (cache, bus) = cache_and_bus();
        let sub = bus.subscribe("test", 16);
        for cell in 0..4u16 {
            cache.store(cell, 33000 + cell);
        }
        for expected in 0..4u16 {
            match sub.try_receive().unwrap() {
                Event::RegisterUpdated { address, .. } => assert_eq!(address, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn stale_entries_are_distinguished_from_uncached() {
        let (cache, _bus) = cache_and_bus();
        cache.store(5, 100);
        assert!(cache.get(5).is_some());
        assert!(cache.get_fresh(5, Duration::from_secs(60)).is_some());
        assert!(cache.get_fresh(5, Duration::ZERO).is_none());
    }

    #[test]
    fn f32_pair_requires_both_halves_fresh() {
        let (cache, bus) = cache_and_bus();
        let model = model(&cache, &bus);
        let bits = 52.9f32.to_bits();
        cache.store(ADDR_PACK_VOLTAGE, (bits & 0xFFFF) as u16);
        // High half missing: no value.
        assert!(model.f32_pair(ADDR_PACK_VOLTAGE).is_none());
        cache.store(ADDR_PACK_VOLTAGE + 1, (bits >> 16) as u16);
        let voltage = model.f32_pair(ADDR_PACK_VOLTAGE).unwrap();
        assert!((voltage - 52.9).abs() < 1e-4);
    }

    #[test]
    fn battery_status_composes_the_live_set() {
        let (cache, bus) = cache_and_bus();
        let model = model(&cache, &bus);
        assert!(model.battery_status().is_none());

        store_full_live_set(&cache);
        let status = model.battery_status().unwrap();
        assert_eq!(status.voltage_v, 52.9);
        assert_eq!(status.current_a, -12.5);
        assert_eq!(status.power_w, round2(52.9 * -12.5));
        assert_eq!(status.soc_pct, 55.5);
        assert_eq!(status.soh_pct, 99.5);
        // Mean of 21.5, 22.5 and 25.3.
        assert_eq!(status.temperature_c, 23.1);
        assert_eq!(status.state, 2);
        assert_eq!(status.state_label, "discharge");
        assert_eq!(status.balancing_bits, 0b101);
    }

    #[test]
    fn pack_statistics_compose_cells_and_extremes() {
        let (cache, bus) = cache_and_bus();
        let model = model(&cache, &bus);
        assert!(model.pack_statistics().is_none());

        store_full_live_set(&cache);
        let stats = model.pack_statistics().unwrap();
        assert_eq!(stats.cell_mv.len(), 16);
        assert_eq!(stats.cell_mv[0], 3300);
        assert_eq!(stats.cell_min_mv, 3300);
        assert_eq!(stats.cell_max_mv, 3315);
        assert_eq!(stats.cell_delta_mv, 15);
        assert!(stats.cell_avg_mv >= 3300 && stats.cell_avg_mv <= 3315);
    }

    #[test]
    fn zero_reading_cell_is_counted_not_hidden() {
        let (cache, bus) = cache_and_bus();
        let model = model(&cache, &bus);
        // Cell 3 is dead and reads exactly 0; the extremes registers are
        // not cached, so the statistics fall back to the computed values.
        for cell in 0..16u16 {
            cache.store(cell, if cell == 3 { 0 } else { 33000 });
        }
        let stats = model.pack_statistics().unwrap();
        assert_eq!(stats.cell_mv.len(), 16);
        assert_eq!(stats.cell_mv[3], 0);
        assert_eq!(stats.cell_min_mv, 0);
        assert_eq!(stats.cell_max_mv, 3300);
        assert_eq!(stats.cell_delta_mv, 3300);
    }

    #[test]
    fn negative_temperature_sign_extends() {
        let (cache, bus) = cache_and_bus();
        let model = model(&cache, &bus);
        cache.store(ADDR_TEMP_SENSOR_1, (-73i16) as u16);
        assert_eq!(model.fresh_temp(ADDR_TEMP_SENSOR_1).unwrap(), -7.3);
    }

    #[test]
    fn publish_snapshots_emits_both_events_when_complete() {
        let (cache, bus) = cache_and_bus();
        let model = model(&cache, &bus);
        let sub = bus.subscribe("snapshots", 8);

        model.publish_snapshots();
        assert!(sub.try_receive().is_none());

        store_full_live_set(&cache);
        // Drain the register_updated noise first.
        while sub.try_receive().is_some() {}

        model.publish_snapshots();
        assert!(matches!(sub.try_receive(), Some(Event::BatteryStatus(_))));
        assert!(matches!(sub.try_receive(), Some(Event::PackStatistics(_))));
    }

    #[test]
    fn restart_register_never_reaches_the_model() {
        let (cache, bus) = cache_and_bus();
        let model = model(&cache, &bus);
        cache.store(RESTART_ADDRESS, 0xA55A);
        assert!(model.battery_status().is_none());
    }
}
