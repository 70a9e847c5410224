//! Owns one instance of every stage and the background hand-off workers.
//!
//! Ingestion calls finish normalization and alert evaluation before they
//! return and never wait on a sink. Vitals and sleep rows go through a
//! bounded queue and are dropped (their throttle window released) when it is
//! full. Fall, location and zone writes go through an unbounded queue that
//! the same writer task drains first. Alert delivery has its own unbounded
//! queue and task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;
use vitals_core::{
    AlertEvent, AlertKind, FallEventRecord, FallNotice, FallbackReason, GeoPoint, Geofence,
    IngestError, LiveEvent, LocationKind, LocationNotice, LocationRecord, Patient,
    PatientResolution, PipelineConfig, SleepQuality, SleepRecord, SmsError, TelemetryEvent,
    TelemetryKind, TelemetrySource, VitalsSample,
};

use crate::alerts::{sms_fall_alert, AlertEngine};
use crate::geofence::GeofenceEngine;
use crate::normalizer::{normalize, SampleContext};
use crate::reassembler::{FrameReassembler, RawFragment};
use crate::sinks::{AlertSink, PersistenceSink, Sinks, ZoneDirectory};
use crate::sms::{SmsDeduplicator, SmsParser};
use crate::throttle::{Permit, RecordKind, ThrottleGate};

/// Confidence recorded with every fall event.
pub const FALL_CONFIDENCE: f64 = 95.0;
/// Accuracy assumed for SMS-reported GPS fixes.
pub const SMS_LOCATION_ACCURACY_M: f64 = 10.0;

#[derive(Debug, Clone)]
struct DeviceSession {
    patient_id: String,
    connected_at: DateTime<Utc>,
}

#[derive(Debug)]
enum WriteJob {
    Vitals {
        sample: VitalsSample,
        permit: Permit,
    },
    Sleep {
        device_id: String,
        record: SleepRecord,
        permit: Permit,
    },
    Fall {
        location: Option<LocationRecord>,
        event: FallEventRecord,
    },
    Location(LocationRecord),
    SaveZone(Geofence),
    DeactivateZone(Uuid),
}

/// What one BLE fragment produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BleReport {
    pub frames: usize,
    pub samples: Vec<VitalsSample>,
    pub alerts: Vec<AlertEvent>,
    pub vitals_queued: usize,
    pub vitals_dropped: usize,
    pub sleep_queued: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SmsReport {
    pub event: TelemetryEvent,
    pub resolution: PatientResolution,
    pub alerts: Vec<AlertEvent>,
    pub zone_created: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub enum SmsOutcome {
    Accepted(Box<SmsReport>),
    /// Same sender and text accepted inside the dedup window.
    Duplicate,
    Rejected(SmsError),
}

pub struct IngestOrchestrator {
    config: PipelineConfig,
    sinks: Sinks,
    sessions: DashMap<String, DeviceSession>,
    reassembler: FrameReassembler,
    gate: Arc<ThrottleGate>,
    alert_engine: AlertEngine,
    sms_parser: SmsParser,
    sms_dedup: SmsDeduplicator,
    geofences: Mutex<GeofenceEngine>,
    live: broadcast::Sender<LiveEvent>,
    writes: Mutex<Option<mpsc::Sender<WriteJob>>>,
    records: Mutex<Option<mpsc::UnboundedSender<WriteJob>>>,
    alerts: Mutex<Option<mpsc::UnboundedSender<AlertEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl IngestOrchestrator {
    /// Build the pipeline and spawn its workers. Must be called inside a
    /// Tokio runtime.
    pub fn new(config: PipelineConfig, sinks: Sinks) -> Result<Self, IngestError> {
        config.validate()?;

        let gate = Arc::new(ThrottleGate::new(&config));
        let (write_tx, write_rx) = mpsc::channel(config.write_queue_capacity);
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let (live, _) = broadcast::channel(config.live_channel_capacity);

        let writer = tokio::spawn(run_writer(
            record_rx,
            write_rx,
            sinks.persistence.clone(),
            sinks.zones.clone(),
            gate.clone(),
        ));
        let dispatcher = tokio::spawn(run_alert_dispatcher(
            alert_rx,
            sinks.alerts.clone(),
            config.fall_alert_retries,
            StdDuration::from_millis(config.fall_alert_backoff_millis),
        ));

        tracing::info!(
            write_queue = config.write_queue_capacity,
            vitals_interval_secs = config.vitals_interval_secs,
            "ingest pipeline started"
        );

        Ok(Self {
            reassembler: FrameReassembler::new(config.frame_buffer_bytes),
            alert_engine: AlertEngine::new(gate.clone()),
            sms_parser: SmsParser::new(&config),
            sms_dedup: SmsDeduplicator::new(config.sms_dedup_window()),
            geofences: Mutex::new(GeofenceEngine::new()),
            sessions: DashMap::new(),
            gate,
            live,
            writes: Mutex::new(Some(write_tx)),
            records: Mutex::new(Some(record_tx)),
            alerts: Mutex::new(Some(alert_tx)),
            workers: Mutex::new(vec![writer, dispatcher]),
            closed: AtomicBool::new(false),
            config,
            sinks,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Live stream of falls and locations, ahead of persistence.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.live.subscribe()
    }

    pub fn connect_device(&self, device_id: &str, patient_id: &str) {
        self.connect_device_at(device_id, patient_id, Utc::now());
    }

    pub fn connect_device_at(&self, device_id: &str, patient_id: &str, now: DateTime<Utc>) {
        let previous = self.sessions.insert(
            device_id.to_string(),
            DeviceSession {
                patient_id: patient_id.to_string(),
                connected_at: now,
            },
        );
        if let Some(previous) = previous {
            if previous.patient_id != patient_id {
                self.reassembler.reset(device_id);
            }
        }
        tracing::info!(device_id, patient_id, "device connected");
    }

    /// Forget a device. Its partial frame is always discarded; throttle
    /// windows survive unless `reset_throttle` is set.
    pub fn disconnect_device(&self, device_id: &str, reset_throttle: bool) -> bool {
        let session = self.sessions.remove(device_id);
        self.reassembler.reset(device_id);
        if reset_throttle {
            self.gate.clear_device(device_id);
        }
        if let Some((_, session)) = &session {
            let connected_for = Utc::now() - session.connected_at;
            tracing::info!(
                device_id,
                patient_id = %session.patient_id,
                connected_secs = connected_for.num_seconds(),
                reset_throttle,
                "device disconnected"
            );
        }
        session.is_some()
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.sessions.contains_key(device_id)
    }

    pub async fn ingest_ble(
        &self,
        device_id: &str,
        fragment: RawFragment,
    ) -> Result<BleReport, IngestError> {
        self.ingest_ble_at(device_id, fragment, Utc::now()).await
    }

    /// Feed one BLE notification for a connected device.
    pub async fn ingest_ble_at(
        &self,
        device_id: &str,
        fragment: RawFragment,
        now: DateTime<Utc>,
    ) -> Result<BleReport, IngestError> {
        self.ensure_open()?;
        let patient_id = self
            .sessions
            .get(device_id)
            .map(|session| session.patient_id.clone())
            .ok_or_else(|| IngestError::UnknownDevice(device_id.to_string()))?;

        let mut report = BleReport::default();
        for frame in self.reassembler.feed(device_id, fragment) {
            report.frames += 1;
            let ctx = SampleContext {
                device_id,
                patient_id: &patient_id,
                timestamp: now,
            };
            let sample = match normalize(&frame, &ctx) {
                Ok(sample) => sample,
                Err(err) => {
                    tracing::warn!(device_id, error = %err, "frame discarded");
                    continue;
                }
            };
            self.process_sample(&sample, now, &mut report);
            report.samples.push(sample);
        }
        Ok(report)
    }

    fn process_sample(&self, sample: &VitalsSample, now: DateTime<Utc>, report: &mut BleReport) {
        let device_id = sample.device_id.as_str();

        if sample.fall_detected {
            self.publish(LiveEvent::FallDetected(FallNotice {
                patient_id: sample.patient_id.clone(),
                source: TelemetrySource::Ble,
                impact_force_g: sample.acceleration.magnitude,
                location: None,
                device: device_id.to_string(),
                raw_message: None,
                timestamp: sample.timestamp,
            }));
        }

        if let Some(permit) = self.gate.try_acquire_vitals(sample, now) {
            let job = WriteJob::Vitals {
                sample: sample.clone(),
                permit,
            };
            match self.try_write(job) {
                Ok(()) => report.vitals_queued += 1,
                Err(job) => {
                    self.release(job);
                    report.vitals_dropped += 1;
                }
            }
        }

        let alerts = self.alert_engine.evaluate(sample, now);
        let fall_alerted = alerts.iter().any(|alert| alert.kind == AlertKind::Fall);
        for alert in &alerts {
            self.dispatch_alert(alert.clone());
        }
        report.alerts.extend(alerts);

        if fall_alerted {
            let magnitude = sample.acceleration.magnitude;
            self.write(WriteJob::Fall {
                location: None,
                event: FallEventRecord {
                    patient_id: sample.patient_id.clone(),
                    location_id: None,
                    impact_force_g: magnitude,
                    confidence: FALL_CONFIDENCE,
                    note: format!("Device: {device_id} | Accel: {magnitude:.2}g"),
                    occurred_at: sample.timestamp,
                },
            });
        }

        if let Some(permit) = self.gate.try_acquire(device_id, RecordKind::Sleep, now) {
            let status = if sample.is_sleeping { "Sleeping" } else { "Awake" };
            let record = SleepRecord {
                patient_id: sample.patient_id.clone(),
                date: sample.timestamp.date_naive(),
                quality: SleepQuality::from_score(sample.sleep_quality),
                score: sample.sleep_quality,
                is_sleeping: sample.is_sleeping,
                note: format!(
                    "Device: {device_id} | Sleep Score: {} | Status: {status}",
                    sample.sleep_quality
                ),
            };
            let job = WriteJob::Sleep {
                device_id: device_id.to_string(),
                record,
                permit,
            };
            match self.try_write(job) {
                Ok(()) => report.sleep_queued += 1,
                Err(job) => self.release(job),
            }
        }
    }

    pub async fn ingest_sms(&self, message: &str, sender: &str) -> Result<SmsOutcome, IngestError> {
        self.ingest_sms_at(message, sender, Utc::now()).await
    }

    /// Handle one incoming SMS. Malformed and duplicate messages are
    /// reported, not raised.
    pub async fn ingest_sms_at(
        &self,
        message: &str,
        sender: &str,
        now: DateTime<Utc>,
    ) -> Result<SmsOutcome, IngestError> {
        self.ensure_open()?;

        let event = match self.sms_parser.parse(message, sender, now) {
            Ok(event) => event,
            Err(reason) => {
                tracing::debug!(sender, error = %reason, "sms ignored");
                return Ok(SmsOutcome::Rejected(reason));
            }
        };
        if !self.sms_dedup.try_accept(sender, message, now) {
            tracing::debug!(sender, "duplicate sms dropped");
            return Ok(SmsOutcome::Duplicate);
        }

        let resolution = self.resolve_patient(&event.patient_identifier).await;
        let patient_id = resolution.patient().id.clone();
        tracing::info!(
            kind = event.kind.as_wire(),
            sender,
            patient_id = %patient_id,
            resolved = resolution.is_resolved(),
            has_location = event.location.is_some(),
            "sms telemetry accepted"
        );

        let is_fall = event.kind == TelemetryKind::FallAlert;
        let mut zone_created = None;
        if let (true, true, Some(point)) =
            (is_fall, self.config.auto_geofence_on_fall, event.location)
        {
            zone_created = self.create_fall_zone(&patient_id, point, &event, now);
        }

        let mut alerts = Vec::new();
        if let Some(point) = event.location {
            self.publish(LiveEvent::LocationUpdated(LocationNotice {
                patient_id: patient_id.clone(),
                source: TelemetrySource::Sms,
                location: point,
                gps_status: Some(event.gps_status.clone()),
                timestamp: event.timestamp,
            }));
            alerts.extend(self.check_geofences(&patient_id, point, now));
        }

        if is_fall {
            self.publish(LiveEvent::FallDetected(FallNotice {
                patient_id: patient_id.clone(),
                source: TelemetrySource::Sms,
                impact_force_g: event.impact_force_g,
                location: event.location,
                device: event.device_type.clone(),
                raw_message: Some(event.raw_message.clone()),
                timestamp: event.timestamp,
            }));

            let location = event.location.map(|point| LocationRecord {
                patient_id: patient_id.clone(),
                location: point,
                accuracy_m: SMS_LOCATION_ACCURACY_M,
                kind: LocationKind::FallIncident,
                note: format!("Fall detected via SMS from {}", event.device_type),
                recorded_at: event.timestamp,
            });
            self.write(WriteJob::Fall {
                location,
                event: FallEventRecord {
                    patient_id: patient_id.clone(),
                    location_id: None,
                    impact_force_g: event.impact_force_g,
                    confidence: FALL_CONFIDENCE,
                    note: format!(
                        "SMS Alert from {} | Impact: {}g | Sender: {}",
                        event.device_type, event.impact_force_g, event.sender
                    ),
                    occurred_at: event.timestamp,
                },
            });

            let alert = sms_fall_alert(&event, &resolution);
            self.dispatch_alert(alert.clone());
            alerts.push(alert);
        } else if let Some(point) = event.location {
            self.write(WriteJob::Location(LocationRecord {
                patient_id: patient_id.clone(),
                location: point,
                accuracy_m: SMS_LOCATION_ACCURACY_M,
                kind: LocationKind::Tracking,
                note: format!("Location update via SMS ({})", event.gps_status),
                recorded_at: event.timestamp,
            }));
        }

        Ok(SmsOutcome::Accepted(Box::new(SmsReport {
            event,
            resolution,
            alerts,
            zone_created,
        })))
    }

    pub fn ingest_location(
        &self,
        patient_id: &str,
        lat: f64,
        lon: f64,
    ) -> Result<Vec<AlertEvent>, IngestError> {
        self.ingest_location_at(patient_id, lat, lon, Utc::now())
    }

    /// Location from the caregiver device's own GPS.
    pub fn ingest_location_at(
        &self,
        patient_id: &str,
        lat: f64,
        lon: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertEvent>, IngestError> {
        self.ensure_open()?;
        if !((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)) {
            return Err(IngestError::InvalidLocation(format!("{lat}, {lon}")));
        }
        let point = GeoPoint { lat, lon };
        self.publish(LiveEvent::LocationUpdated(LocationNotice {
            patient_id: patient_id.to_string(),
            source: TelemetrySource::DeviceGps,
            location: point,
            gps_status: None,
            timestamp: now,
        }));
        Ok(self.check_geofences(patient_id, point, now))
    }

    pub async fn upsert_zone(
        &self,
        patient_id: &str,
        center_lat: f64,
        center_lon: f64,
        radius_meters: f64,
    ) -> Result<Uuid, IngestError> {
        self.upsert_zone_at(patient_id, center_lat, center_lon, radius_meters, Utc::now())
            .await
    }

    /// Create or resize a zone; the stored copy is updated in the background.
    pub async fn upsert_zone_at(
        &self,
        patient_id: &str,
        center_lat: f64,
        center_lon: f64,
        radius_meters: f64,
        now: DateTime<Utc>,
    ) -> Result<Uuid, IngestError> {
        self.ensure_open()?;
        if !(radius_meters.is_finite() && radius_meters > 0.0) {
            return Err(IngestError::InvalidZone(format!(
                "radius must be positive, got {radius_meters}"
            )));
        }
        if !((-90.0..=90.0).contains(&center_lat) && (-180.0..=180.0).contains(&center_lon)) {
            return Err(IngestError::InvalidZone(format!(
                "center out of range: {center_lat}, {center_lon}"
            )));
        }

        let (id, zone) = {
            let mut engine = self.geofences.lock();
            let id = engine.upsert_zone(patient_id, center_lat, center_lon, radius_meters, now);
            (id, engine.zone(id).cloned())
        };
        if let Some(zone) = zone {
            self.write(WriteJob::SaveZone(zone));
        }
        tracing::info!(patient_id, zone_id = %id, radius_meters, "zone saved");
        Ok(id)
    }

    /// Stop evaluating a zone and deactivate its stored row.
    pub async fn remove_zone(&self, zone_id: Uuid) -> Result<bool, IngestError> {
        self.ensure_open()?;
        let removed = self.geofences.lock().remove_zone(zone_id);
        match removed {
            Some(zone) => {
                tracing::info!(patient_id = %zone.patient_id, zone_id = %zone_id, "zone removed");
                self.write(WriteJob::DeactivateZone(zone_id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pull active zones from the zone directory into the engine.
    pub async fn load_zones(&self, patient_id: Option<&str>) -> Result<usize, IngestError> {
        let zones = self.sinks.zones.load_active_zones(patient_id).await?;
        let loaded = self.geofences.lock().load(zones);
        tracing::info!(patient_id, loaded, "zones loaded");
        Ok(loaded)
    }

    pub fn zones(&self, patient_id: &str) -> Vec<Geofence> {
        self.geofences.lock().zones(patient_id).to_vec()
    }

    /// Stop accepting input, drain both queues and wait for the workers.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.writes.lock().take();
        self.records.lock().take();
        self.alerts.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "pipeline worker failed");
            }
        }
        tracing::info!("ingest pipeline closed");
    }

    fn ensure_open(&self) -> Result<(), IngestError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IngestError::Closed);
        }
        Ok(())
    }

    async fn resolve_patient(&self, token: &str) -> PatientResolution {
        let token = token.trim();
        let mut lookup_error = None;
        if !token.is_empty() {
            match self.sinks.patients.find_patient_by_token(token).await {
                Ok(Some(patient)) => return PatientResolution::Resolved { patient },
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(token, error = %err, "patient lookup failed");
                    lookup_error = Some(err.to_string());
                }
            }
        }

        let reason = match lookup_error {
            Some(detail) => FallbackReason::LookupFailed(detail),
            None => FallbackReason::NoTokenMatch,
        };
        match self.sinks.patients.any_patient().await {
            Ok(Some(patient)) => {
                tracing::warn!(token, patient_id = %patient.id, ?reason, "sms attached to fallback patient");
                PatientResolution::Fallback { patient, reason }
            }
            Ok(None) => self.placeholder(token),
            Err(err) => {
                tracing::warn!(token, error = %err, "patient directory unavailable");
                self.placeholder(token)
            }
        }
    }

    fn placeholder(&self, token: &str) -> PatientResolution {
        let patient = Patient::placeholder(token);
        tracing::warn!(token, patient_id = %patient.id, "sms attached to placeholder patient");
        PatientResolution::Placeholder { patient }
    }

    fn create_fall_zone(
        &self,
        patient_id: &str,
        point: GeoPoint,
        event: &TelemetryEvent,
        now: DateTime<Utc>,
    ) -> Option<Uuid> {
        let zone = Geofence::new(
            patient_id,
            format!("Fall site {}", event.timestamp.format("%Y-%m-%d %H:%M")),
            point,
            self.config.default_geofence_radius_m,
            now,
        );
        let stored = {
            let mut engine = self.geofences.lock();
            let duplicate = engine.zones(patient_id).iter().any(|existing| {
                existing.center() == point && existing.radius_meters == zone.radius_meters
            });
            if duplicate {
                tracing::debug!(patient_id, "fall site already has a zone");
                return None;
            }
            let id = engine.insert(zone);
            engine.zone(id).cloned()
        };
        let zone = stored?;
        let id = zone.id;
        tracing::info!(patient_id, zone_id = %id, "zone created around fall");
        self.write(WriteJob::SaveZone(zone));
        Some(id)
    }

    fn check_geofences(&self, patient_id: &str, point: GeoPoint, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let alerts = self
            .geofences
            .lock()
            .check_membership(patient_id, point.lat, point.lon, now);
        for alert in &alerts {
            self.dispatch_alert(alert.clone());
        }
        alerts
    }

    fn publish(&self, event: LiveEvent) {
        if self.live.send(event).is_err() {
            tracing::trace!("no live subscribers");
        }
    }

    fn dispatch_alert(&self, alert: AlertEvent) {
        let sender = self.alerts.lock().clone();
        let Some(sender) = sender else {
            tracing::warn!(kind = %alert.kind, "alert queue closed, alert dropped");
            return;
        };
        if let Err(err) = sender.send(alert) {
            tracing::warn!(kind = %err.0.kind, "alert worker gone, alert dropped");
        }
    }

    fn try_write(&self, job: WriteJob) -> Result<(), WriteJob> {
        let sender = self.writes.lock().clone();
        let Some(sender) = sender else {
            return Err(job);
        };
        sender.try_send(job).map_err(|err| match err {
            TrySendError::Full(job) | TrySendError::Closed(job) => job,
        })
    }

    // Records that must not be dropped for lack of room.
    fn write(&self, job: WriteJob) {
        let sender = self.records.lock().clone();
        let Some(sender) = sender else {
            tracing::warn!("write queue closed");
            self.release(job);
            return;
        };
        if let Err(err) = sender.send(job) {
            tracing::warn!("write worker gone");
            self.release(err.0);
        }
    }

    // A job that never reached the worker gives its throttle window back.
    fn release(&self, job: WriteJob) {
        match job {
            WriteJob::Vitals { sample, permit } => {
                self.gate.revert(&sample.device_id, RecordKind::Vitals, permit);
                tracing::warn!(device_id = %sample.device_id, "write queue full, vitals dropped");
            }
            WriteJob::Sleep {
                device_id, permit, ..
            } => {
                self.gate.revert(&device_id, RecordKind::Sleep, permit);
                tracing::warn!(device_id = %device_id, "write queue full, sleep row dropped");
            }
            WriteJob::Fall { event, .. } => {
                tracing::error!(patient_id = %event.patient_id, "fall event not persisted");
            }
            other => tracing::warn!(job = ?other, "write dropped"),
        }
    }
}

impl std::fmt::Debug for IngestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestOrchestrator")
            .field("devices", &self.sessions.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

async fn run_writer(
    mut records: mpsc::UnboundedReceiver<WriteJob>,
    mut jobs: mpsc::Receiver<WriteJob>,
    store: Arc<dyn PersistenceSink>,
    zones: Arc<dyn ZoneDirectory>,
    gate: Arc<ThrottleGate>,
) {
    loop {
        let job = tokio::select! {
            biased;
            Some(job) = records.recv() => job,
            Some(job) = jobs.recv() => job,
            else => break,
        };
        match job {
            WriteJob::Vitals { sample, permit } => match store.save_vitals(&sample).await {
                Ok(id) => tracing::debug!(device_id = %sample.device_id, record_id = %id, "vitals stored"),
                Err(err) => {
                    gate.revert(&sample.device_id, RecordKind::Vitals, permit);
                    tracing::warn!(device_id = %sample.device_id, error = %err, "vitals not stored");
                }
            },
            WriteJob::Sleep {
                device_id,
                record,
                permit,
            } => match store.upsert_sleep(&record).await {
                Ok(id) => tracing::debug!(device_id = %device_id, record_id = %id, "sleep stored"),
                Err(err) => {
                    gate.revert(&device_id, RecordKind::Sleep, permit);
                    tracing::warn!(device_id = %device_id, error = %err, "sleep not stored");
                }
            },
            WriteJob::Fall {
                location,
                mut event,
            } => {
                if let Some(location) = location {
                    match store.save_location(&location).await {
                        Ok(id) => event.location_id = Some(id),
                        Err(err) => {
                            tracing::warn!(patient_id = %location.patient_id, error = %err, "fall location not stored");
                        }
                    }
                }
                match store.save_fall_event(&event).await {
                    Ok(id) => tracing::info!(patient_id = %event.patient_id, record_id = %id, "fall event stored"),
                    Err(err) => tracing::error!(patient_id = %event.patient_id, error = %err, "fall event not stored"),
                }
            }
            WriteJob::Location(record) => {
                if let Err(err) = store.save_location(&record).await {
                    tracing::warn!(patient_id = %record.patient_id, error = %err, "location not stored");
                }
            }
            WriteJob::SaveZone(zone) => {
                if let Err(err) = zones.save_zone(&zone).await {
                    tracing::warn!(zone_id = %zone.id, error = %err, "zone not stored");
                }
            }
            WriteJob::DeactivateZone(zone_id) => {
                if let Err(err) = zones.deactivate_zone(zone_id).await {
                    tracing::warn!(zone_id = %zone_id, error = %err, "zone not deactivated");
                }
            }
        }
    }
    tracing::debug!("write worker stopped");
}

async fn run_alert_dispatcher(
    mut alerts: mpsc::UnboundedReceiver<AlertEvent>,
    sink: Arc<dyn AlertSink>,
    fall_retries: u32,
    backoff: StdDuration,
) {
    while let Some(alert) = alerts.recv().await {
        deliver(sink.as_ref(), &alert, fall_retries, backoff).await;
    }
    tracing::debug!("alert worker stopped");
}

/// Hand an alert to the sink. Only falls get retries, with linear backoff.
/// The user is notified whether or not the record was stored.
async fn deliver(sink: &dyn AlertSink, alert: &AlertEvent, fall_retries: u32, backoff: StdDuration) {
    let budget = if alert.kind == AlertKind::Fall {
        fall_retries
    } else {
        0
    };
    let mut attempt = 0u32;
    loop {
        match sink.save_alert(alert).await {
            Ok(id) => {
                tracing::info!(
                    alert_id = %id,
                    patient_id = %alert.patient_id,
                    kind = %alert.kind,
                    priority = ?alert.priority,
                    "alert stored"
                );
                break;
            }
            Err(err) if attempt < budget => {
                attempt += 1;
                tracing::warn!(kind = %alert.kind, attempt, error = %err, "alert hand-off failed, retrying");
                tokio::time::sleep(backoff * attempt).await;
            }
            Err(err) => {
                tracing::error!(
                    patient_id = %alert.patient_id,
                    kind = %alert.kind,
                    attempts = attempt + 1,
                    error = %err,
                    "alert dropped"
                );
                break;
            }
        }
    }
    sink.notify_user(alert).await;
}
