//! Boundaries to the persistence, alert, patient and zone collaborators.
//!
//! The pipeline only hands records off through these traits. [`MemoryStore`]
//! implements all four in process and backs the replay tool and the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::RwLock;
use uuid::Uuid;
use vitals_core::{
    AlertEvent, FallEventRecord, Geofence, LocationRecord, Patient, RecordId, SinkError,
    SleepRecord, VitalsSample,
};

#[async_trait::async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save_vitals(&self, sample: &VitalsSample) -> Result<RecordId, SinkError>;

    async fn save_fall_event(&self, event: &FallEventRecord) -> Result<RecordId, SinkError>;

    /// Insert or overwrite the row for `(patient_id, date)`.
    async fn upsert_sleep(&self, record: &SleepRecord) -> Result<RecordId, SinkError>;

    async fn save_location(&self, record: &LocationRecord) -> Result<RecordId, SinkError>;
}

#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn save_alert(&self, alert: &AlertEvent) -> Result<RecordId, SinkError>;

    /// Push or local notification. Fire and forget.
    async fn notify_user(&self, alert: &AlertEvent);
}

#[async_trait::async_trait]
pub trait PatientDirectory: Send + Sync {
    /// Case-insensitive substring match of `token` against patient notes.
    async fn find_patient_by_token(&self, token: &str) -> Result<Option<Patient>, SinkError>;

    async fn any_patient(&self) -> Result<Option<Patient>, SinkError>;
}

#[async_trait::async_trait]
pub trait ZoneDirectory: Send + Sync {
    async fn load_active_zones(&self, patient_id: Option<&str>)
        -> Result<Vec<Geofence>, SinkError>;

    async fn save_zone(&self, zone: &Geofence) -> Result<(), SinkError>;

    async fn deactivate_zone(&self, zone_id: Uuid) -> Result<(), SinkError>;
}

/// The collaborators one pipeline talks to.
#[derive(Clone)]
pub struct Sinks {
    pub persistence: Arc<dyn PersistenceSink>,
    pub alerts: Arc<dyn AlertSink>,
    pub patients: Arc<dyn PatientDirectory>,
    pub zones: Arc<dyn ZoneDirectory>,
}

impl Sinks {
    /// Use one backend for every boundary.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: PersistenceSink + AlertSink + PatientDirectory + ZoneDirectory + 'static,
    {
        Self {
            persistence: store.clone(),
            alerts: store.clone(),
            patients: store.clone(),
            zones: store,
        }
    }
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks").finish_non_exhaustive()
    }
}

/// In-process store with switches for simulating outages.
#[derive(Debug, Default)]
pub struct MemoryStore {
    vitals: RwLock<Vec<VitalsSample>>,
    falls: RwLock<Vec<FallEventRecord>>,
    sleep: RwLock<HashMap<(String, NaiveDate), SleepRecord>>,
    locations: RwLock<Vec<(RecordId, LocationRecord)>>,
    alerts: RwLock<Vec<AlertEvent>>,
    notifications: RwLock<Vec<AlertEvent>>,
    patients: RwLock<Vec<Patient>>,
    zones: RwLock<HashMap<Uuid, Geofence>>,
    offline: AtomicBool,
    directory_offline: AtomicBool,
    alert_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_patient(&self, patient: Patient) {
        self.patients.write().push(patient);
    }

    pub fn add_zone(&self, zone: Geofence) {
        self.zones.write().insert(zone.id, zone);
    }

    /// Fail every persistence and alert write while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail patient lookups while set.
    pub fn set_directory_offline(&self, offline: bool) {
        self.directory_offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` alert saves.
    pub fn fail_next_alerts(&self, count: u32) {
        self.alert_failures.store(count, Ordering::SeqCst);
    }

    pub fn vitals(&self) -> Vec<VitalsSample> {
        self.vitals.read().clone()
    }

    pub fn fall_events(&self) -> Vec<FallEventRecord> {
        self.falls.read().clone()
    }

    pub fn sleep_records(&self) -> Vec<SleepRecord> {
        let mut records: Vec<SleepRecord> = self.sleep.read().values().cloned().collect();
        records.sort_by(|a, b| (&a.patient_id, a.date).cmp(&(&b.patient_id, b.date)));
        records
    }

    pub fn locations(&self) -> Vec<LocationRecord> {
        self.locations
            .read()
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.alerts.read().clone()
    }

    pub fn notifications(&self) -> Vec<AlertEvent> {
        self.notifications.read().clone()
    }

    pub fn zones(&self) -> Vec<Geofence> {
        self.zones.read().values().cloned().collect()
    }

    fn ensure_online(&self) -> Result<(), SinkError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

fn new_id() -> RecordId {
    Uuid::new_v4().to_string()
}

#[async_trait::async_trait]
impl PersistenceSink for MemoryStore {
    async fn save_vitals(&self, sample: &VitalsSample) -> Result<RecordId, SinkError> {
        self.ensure_online()?;
        self.vitals.write().push(sample.clone());
        Ok(new_id())
    }

    async fn save_fall_event(&self, event: &FallEventRecord) -> Result<RecordId, SinkError> {
        self.ensure_online()?;
        self.falls.write().push(event.clone());
        Ok(new_id())
    }

    async fn upsert_sleep(&self, record: &SleepRecord) -> Result<RecordId, SinkError> {
        self.ensure_online()?;
        let key = (record.patient_id.clone(), record.date);
        self.sleep.write().insert(key, record.clone());
        Ok(format!("{}:{}", record.patient_id, record.date))
    }

    async fn save_location(&self, record: &LocationRecord) -> Result<RecordId, SinkError> {
        self.ensure_online()?;
        let id = new_id();
        self.locations.write().push((id.clone(), record.clone()));
        Ok(id)
    }
}

#[async_trait::async_trait]
impl AlertSink for MemoryStore {
    async fn save_alert(&self, alert: &AlertEvent) -> Result<RecordId, SinkError> {
        self.ensure_online()?;
        let pending = self.alert_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.alert_failures.store(pending - 1, Ordering::SeqCst);
            return Err(SinkError::Unavailable("injected alert failure".into()));
        }
        self.alerts.write().push(alert.clone());
        Ok(new_id())
    }

    async fn notify_user(&self, alert: &AlertEvent) {
        self.notifications.write().push(alert.clone());
    }
}

#[async_trait::async_trait]
impl PatientDirectory for MemoryStore {
    async fn find_patient_by_token(&self, token: &str) -> Result<Option<Patient>, SinkError> {
        if self.directory_offline.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("patient directory offline".into()));
        }
        let needle = token.to_lowercase();
        Ok(self
            .patients
            .read()
            .iter()
            .find(|p| {
                p.notes
                    .as_deref()
                    .is_some_and(|notes| notes.to_lowercase().contains(&needle))
            })
            .cloned())
    }

    async fn any_patient(&self) -> Result<Option<Patient>, SinkError> {
        if self.directory_offline.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("patient directory offline".into()));
        }
        Ok(self.patients.read().first().cloned())
    }
}

#[async_trait::async_trait]
impl ZoneDirectory for MemoryStore {
    async fn load_active_zones(
        &self,
        patient_id: Option<&str>,
    ) -> Result<Vec<Geofence>, SinkError> {
        Ok(self
            .zones
            .read()
            .values()
            .filter(|z| z.active && patient_id.map_or(true, |p| z.patient_id == p))
            .cloned()
            .collect())
    }

    async fn save_zone(&self, zone: &Geofence) -> Result<(), SinkError> {
        self.ensure_online()?;
        self.zones.write().insert(zone.id, zone.clone());
        Ok(())
    }

    async fn deactivate_zone(&self, zone_id: Uuid) -> Result<(), SinkError> {
        self.ensure_online()?;
        match self.zones.write().get_mut(&zone_id) {
            Some(zone) => {
                zone.active = false;
                Ok(())
            }
            None => Err(SinkError::Rejected(format!("unknown zone {zone_id}"))),
        }
    }
}
