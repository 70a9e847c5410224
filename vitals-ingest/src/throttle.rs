//! Per-device time-window gate for stored records and alerts.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use vitals_core::{AlertKind, PipelineConfig, VitalsSample};

/// What a throttle window guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Vitals,
    Sleep,
    Alert(AlertKind),
    /// Short window collapsing one fall reported by consecutive frames.
    FallFrame,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Vitals => f.write_str("vitals"),
            RecordKind::Sleep => f.write_str("sleep"),
            RecordKind::Alert(kind) => write!(f, "alert:{kind}"),
            RecordKind::FallFrame => f.write_str("fall_frame"),
        }
    }
}

/// Proof of an admission; hand it back to [`ThrottleGate::revert`] if the
/// guarded record was never handed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    previous: Option<DateTime<Utc>>,
    committed: DateTime<Utc>,
}

impl Permit {
    pub fn committed_at(&self) -> DateTime<Utc> {
        self.committed
    }
}

#[derive(Debug)]
pub struct ThrottleGate {
    vitals: Duration,
    sleep: Duration,
    alert: Duration,
    fall_frame: Duration,
    last: DashMap<(String, RecordKind), DateTime<Utc>>,
}

impl ThrottleGate {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            vitals: config.vitals_interval(),
            sleep: config.sleep_interval(),
            alert: config.alert_interval(),
            fall_frame: config.fall_dedup_window(),
            last: DashMap::new(),
        }
    }

    pub fn window(&self, kind: RecordKind) -> Duration {
        match kind {
            RecordKind::Vitals => self.vitals,
            RecordKind::Sleep => self.sleep,
            RecordKind::Alert(_) => self.alert,
            RecordKind::FallFrame => self.fall_frame,
        }
    }

    /// Read-only check: has the window elapsed since the last commit?
    pub fn admit(&self, device_id: &str, kind: RecordKind, now: DateTime<Utc>) -> bool {
        match self.last.get(&(device_id.to_string(), kind)) {
            Some(last) => now - *last >= self.window(kind),
            None => true,
        }
    }

    /// Samples without finger contact are never stored.
    pub fn admit_vitals(&self, sample: &VitalsSample, now: DateTime<Utc>) -> bool {
        sample.finger_present && self.admit(&sample.device_id, RecordKind::Vitals, now)
    }

    /// Record `now` unconditionally, returning the timestamp it replaced.
    pub fn commit(
        &self,
        device_id: &str,
        kind: RecordKind,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.last.insert((device_id.to_string(), kind), now)
    }

    /// Admit and commit in one step under the entry lock.
    pub fn try_acquire(
        &self,
        device_id: &str,
        kind: RecordKind,
        now: DateTime<Utc>,
    ) -> Option<Permit> {
        let window = self.window(kind);
        match self.last.entry((device_id.to_string(), kind)) {
            Entry::Occupied(mut entry) => {
                if now - *entry.get() < window {
                    return None;
                }
                let previous = entry.insert(now);
                Some(Permit {
                    previous: Some(previous),
                    committed: now,
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                Some(Permit {
                    previous: None,
                    committed: now,
                })
            }
        }
    }

    /// [`Self::try_acquire`] for the vitals kind, honouring finger contact.
    pub fn try_acquire_vitals(&self, sample: &VitalsSample, now: DateTime<Utc>) -> Option<Permit> {
        if !sample.finger_present {
            return None;
        }
        self.try_acquire(&sample.device_id, RecordKind::Vitals, now)
    }

    /// Undo a permit whose record was dropped. A later commit wins.
    pub fn revert(&self, device_id: &str, kind: RecordKind, permit: Permit) {
        if let Entry::Occupied(mut entry) = self.last.entry((device_id.to_string(), kind)) {
            if *entry.get() != permit.committed {
                return;
            }
            match permit.previous {
                Some(previous) => {
                    entry.insert(previous);
                }
                None => {
                    entry.remove();
                }
            }
        }
    }

    pub fn last_committed(&self, device_id: &str, kind: RecordKind) -> Option<DateTime<Utc>> {
        self.last
            .get(&(device_id.to_string(), kind))
            .map(|last| *last)
    }

    /// Forget every window held for a device.
    pub fn clear_device(&self, device_id: &str) {
        self.last.retain(|(device, _), _| device != device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vitals_core::Acceleration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn sample(finger_present: bool) -> VitalsSample {
        VitalsSample {
            device_id: "esp".into(),
            patient_id: "p".into(),
            heart_rate: 70,
            spo2: 98,
            temperature_c: 36.6,
            finger_present,
            signal_quality: 90.0,
            acceleration: Acceleration::default(),
            fall_detected: false,
            is_sleeping: false,
            sleep_quality: 0,
            step_count: 0,
            timestamp: t0(),
        }
    }

    #[test]
    fn vitals_window_boundary() {
        let gate = ThrottleGate::new(&PipelineConfig::default());
        assert!(gate.try_acquire("esp", RecordKind::Vitals, t0()).is_some());
        assert!(gate
            .try_acquire("esp", RecordKind::Vitals, t0() + Duration::milliseconds(9_900))
            .is_none());
        assert!(gate
            .try_acquire("esp", RecordKind::Vitals, t0() + Duration::milliseconds(10_100))
            .is_some());
    }

    #[test]
    fn admit_does_not_commit() {
        let gate = ThrottleGate::new(&PipelineConfig::default());
        assert!(gate.admit("esp", RecordKind::Sleep, t0()));
        assert!(gate.admit("esp", RecordKind::Sleep, t0()));
        gate.commit("esp", RecordKind::Sleep, t0());
        assert!(!gate.admit("esp", RecordKind::Sleep, t0() + Duration::seconds(299)));
        assert!(gate.admit("esp", RecordKind::Sleep, t0() + Duration::seconds(300)));
    }

    #[test]
    fn vitals_require_finger_contact() {
        let gate = ThrottleGate::new(&PipelineConfig::default());
        assert!(!gate.admit_vitals(&sample(false), t0()));
        assert!(gate.try_acquire_vitals(&sample(false), t0()).is_none());
        assert!(gate.try_acquire_vitals(&sample(true), t0()).is_some());
    }

    #[test]
    fn alert_conditions_and_devices_are_independent() {
        let gate = ThrottleGate::new(&PipelineConfig::default());
        let low = RecordKind::Alert(AlertKind::LowSpo2);
        let high = RecordKind::Alert(AlertKind::HighHeartRate);
        assert!(gate.try_acquire("a", low, t0()).is_some());
        assert!(gate.try_acquire("a", high, t0()).is_some());
        assert!(gate.try_acquire("b", low, t0()).is_some());
        assert!(gate.try_acquire("a", low, t0() + Duration::seconds(59)).is_none());
    }

    #[test]
    fn revert_restores_previous_window() {
        let gate = ThrottleGate::new(&PipelineConfig::default());
        let first = gate.try_acquire("esp", RecordKind::Vitals, t0()).unwrap();
        gate.revert("esp", RecordKind::Vitals, first);
        assert_eq!(gate.last_committed("esp", RecordKind::Vitals), None);

        gate.commit("esp", RecordKind::Vitals, t0());
        let later = t0() + Duration::seconds(20);
        let second = gate.try_acquire("esp", RecordKind::Vitals, later).unwrap();
        gate.revert("esp", RecordKind::Vitals, second);
        assert_eq!(gate.last_committed("esp", RecordKind::Vitals), Some(t0()));
    }

    #[test]
    fn revert_ignores_superseded_permit() {
        let gate = ThrottleGate::new(&PipelineConfig::default());
        let stale = gate.try_acquire("esp", RecordKind::Vitals, t0()).unwrap();
        let newer = t0() + Duration::seconds(30);
        gate.commit("esp", RecordKind::Vitals, newer);
        gate.revert("esp", RecordKind::Vitals, stale);
        assert_eq!(gate.last_committed("esp", RecordKind::Vitals), Some(newer));
    }

    #[test]
    fn clear_device_drops_only_that_device() {
        let gate = ThrottleGate::new(&PipelineConfig::default());
        gate.commit("a", RecordKind::Vitals, t0());
        gate.commit("a", RecordKind::Alert(AlertKind::Fall), t0());
        gate.commit("b", RecordKind::Vitals, t0());
        gate.clear_device("a");
        assert!(gate.admit("a", RecordKind::Vitals, t0()));
        assert!(!gate.admit("b", RecordKind::Vitals, t0()));
    }

    #[test]
    fn kinds_render_like_storage_keys() {
        assert_eq!(RecordKind::Alert(AlertKind::LowSpo2).to_string(), "alert:low_spo2");
        assert_eq!(RecordKind::Vitals.to_string(), "vitals");
    }
}
