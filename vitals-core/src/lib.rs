//! Shared domain types for caregiver telemetry: vitals samples, SMS telemetry
//! events, alerts, geofences and the pipeline configuration.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity attached to SMS events when no patient record can be found.
pub const PLACEHOLDER_PATIENT_ID: &str = "00000000-0000-0000-0000-000000000001";

/// Identifier handed back by a persistence collaborator.
pub type RecordId = String;

/// Tunables for the ingestion pipeline. Clinical thresholds are fixed and
/// deliberately absent from this struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound (bytes) of one device's reassembly buffer.
    pub frame_buffer_bytes: usize,
    /// Minimum seconds between two stored vitals rows for one device.
    pub vitals_interval_secs: u64,
    /// Minimum seconds between two sleep upserts for one device.
    pub sleep_interval_secs: u64,
    /// Minimum seconds between two alerts of one condition for one device.
    pub alert_interval_secs: u64,
    /// Window in which a repeated fall report is treated as the same frame.
    pub fall_dedup_millis: u64,
    /// Window in which an identical `(sender, text)` SMS is ignored.
    pub sms_dedup_secs: u64,
    /// Device type recorded when an SMS carries no `Device:` field.
    pub sms_default_device_type: String,
    /// Offset of the field device's wall clock, in minutes east of UTC.
    pub sms_utc_offset_minutes: i32,
    /// Radius of zones created around a fall location.
    pub default_geofence_radius_m: f64,
    /// Create a zone around every located fall.
    pub auto_geofence_on_fall: bool,
    /// Extra attempts granted to a fall alert whose hand-off fails.
    pub fall_alert_retries: u32,
    /// Linear backoff step between fall alert attempts.
    pub fall_alert_backoff_millis: u64,
    /// Capacity of the vitals and sleep write queue.
    pub write_queue_capacity: usize,
    /// Capacity of the live UI broadcast channel.
    pub live_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_buffer_bytes: 2000,
            vitals_interval_secs: 10,
            sleep_interval_secs: 300,
            alert_interval_secs: 60,
            fall_dedup_millis: 250,
            sms_dedup_secs: 5,
            sms_default_device_type: "PiZero".to_string(),
            sms_utc_offset_minutes: 0,
            default_geofence_radius_m: GeofenceRadius::Medium.meters(),
            auto_geofence_on_fall: true,
            fall_alert_retries: 3,
            fall_alert_backoff_millis: 200,
            write_queue_capacity: 256,
            live_channel_capacity: 100,
        }
    }
}

impl PipelineConfig {
    pub fn vitals_interval(&self) -> Duration {
        seconds(self.vitals_interval_secs)
    }

    pub fn sleep_interval(&self) -> Duration {
        seconds(self.sleep_interval_secs)
    }

    pub fn alert_interval(&self) -> Duration {
        seconds(self.alert_interval_secs)
    }

    pub fn fall_dedup_window(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.fall_dedup_millis).unwrap_or(i64::MAX))
    }

    pub fn sms_dedup_window(&self) -> Duration {
        seconds(self.sms_dedup_secs)
    }

    /// Wall-clock offset used to date SMS time-of-day fields.
    pub fn sms_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.sms_utc_offset_minutes.checked_mul(60)?)
    }

    /// Reject values the runtime cannot work with (zero-sized channels,
    /// impossible offsets, non-positive radii).
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.frame_buffer_bytes == 0 {
            return Err(IngestError::Config("frame_buffer_bytes must be > 0".into()));
        }
        if self.write_queue_capacity == 0 {
            return Err(IngestError::Config("write_queue_capacity must be > 0".into()));
        }
        if self.live_channel_capacity == 0 {
            return Err(IngestError::Config("live_channel_capacity must be > 0".into()));
        }
        if self.sms_offset().is_none() {
            return Err(IngestError::Config(format!(
                "sms_utc_offset_minutes out of range: {}",
                self.sms_utc_offset_minutes
            )));
        }
        if !(self.default_geofence_radius_m.is_finite() && self.default_geofence_radius_m > 0.0) {
            return Err(IngestError::Config(
                "default_geofence_radius_m must be a positive number".into(),
            ));
        }
        Ok(())
    }
}

fn seconds(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

/// Alert priority. Ordered so that sorting puts the most urgent first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    Critical,
    High,
    Medium,
    Low,
}

/// Condition that raised an alert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Fall,
    LowHeartRate,
    HighHeartRate,
    LowSpo2,
    HighTemperature,
    LowTemperature,
    GeofenceEntry,
    GeofenceExit,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Fall => "fall",
            AlertKind::LowHeartRate => "low_heart_rate",
            AlertKind::HighHeartRate => "high_heart_rate",
            AlertKind::LowSpo2 => "low_spo2",
            AlertKind::HighTemperature => "high_temperature",
            AlertKind::LowTemperature => "low_temperature",
            AlertKind::GeofenceEntry => "geofence_entry",
            AlertKind::GeofenceExit => "geofence_exit",
        }
    }

    pub fn priority(self) -> AlertPriority {
        match self {
            AlertKind::Fall | AlertKind::LowSpo2 => AlertPriority::Critical,
            AlertKind::LowHeartRate
            | AlertKind::HighHeartRate
            | AlertKind::HighTemperature
            | AlertKind::LowTemperature
            | AlertKind::GeofenceExit => AlertPriority::High,
            AlertKind::GeofenceEntry => AlertPriority::Low,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            AlertKind::Fall => "Fall Detected",
            AlertKind::LowHeartRate => "Low Heart Rate",
            AlertKind::HighHeartRate => "High Heart Rate",
            AlertKind::LowSpo2 => "Low Oxygen Level",
            AlertKind::HighTemperature => "High Temperature",
            AlertKind::LowTemperature => "Low Temperature",
            AlertKind::GeofenceEntry => "Geofence Entry",
            AlertKind::GeofenceExit => "Geofence Exit",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert ready to be handed to the alert sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEvent {
    pub patient_id: String,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub priority: AlertPriority,
    pub title: String,
    pub message: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    /// Build an alert using the kind's default title and priority.
    pub fn new(
        patient_id: impl Into<String>,
        kind: AlertKind,
        message: impl Into<String>,
        metadata: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            kind,
            priority: kind.priority(),
            title: kind.title().to_string(),
            message: message.into(),
            metadata,
            timestamp,
        }
    }
}

/// Accelerometer reading; `magnitude` is always derived from the axes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Acceleration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub magnitude: f64,
}

impl Acceleration {
    pub fn from_axes(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            magnitude: (x * x + y * y + z * z).sqrt(),
        }
    }
}

/// Canonical vitals record produced from one BLE frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VitalsSample {
    pub device_id: String,
    pub patient_id: String,
    pub heart_rate: i32,
    pub spo2: i32,
    pub temperature_c: f64,
    pub finger_present: bool,
    pub signal_quality: f64,
    pub acceleration: Acceleration,
    pub fall_detected: bool,
    pub is_sleeping: bool,
    pub sleep_quality: i32,
    pub step_count: i32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Message type of the SMS telemetry protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelemetryKind {
    FallAlert,
    LocationUpdate,
}

impl TelemetryKind {
    /// Exact match against the wire token.
    pub fn from_wire(token: &str) -> Option<Self> {
        match token {
            "FALL_ALERT" => Some(TelemetryKind::FallAlert),
            "LOCATION_UPDATE" => Some(TelemetryKind::LocationUpdate),
            _ => None,
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            TelemetryKind::FallAlert => "FALL_ALERT",
            TelemetryKind::LocationUpdate => "LOCATION_UPDATE",
        }
    }
}

/// Event decoded from one SMS. Carries no vitals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEvent {
    pub kind: TelemetryKind,
    /// Free-text identifier embedded by the field device; not a database key.
    pub patient_identifier: String,
    pub location: Option<GeoPoint>,
    pub gps_status: String,
    pub impact_force_g: f64,
    pub device_type: String,
    pub sender: String,
    pub raw_message: String,
    pub timestamp: DateTime<Utc>,
}

/// Last observed membership of a patient in a zone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MembershipState {
    /// No location evaluated yet; treated as outside.
    #[default]
    Unobserved,
    Outside,
    Inside,
}

/// Circular safe zone around a point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Geofence {
    pub id: Uuid,
    pub patient_id: String,
    pub name: String,
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_meters: f64,
    #[serde(default)]
    pub state: MembershipState,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Geofence {
    pub fn new(
        patient_id: impl Into<String>,
        name: impl Into<String>,
        center: GeoPoint,
        radius_meters: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id: patient_id.into(),
            name: name.into(),
            center_lat: center.lat,
            center_lon: center.lon,
            radius_meters,
            state: MembershipState::Unobserved,
            active: true,
            created_at,
        }
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            lat: self.center_lat,
            lon: self.center_lon,
        }
    }

    pub fn is_inside(&self) -> bool {
        self.state == MembershipState::Inside
    }
}

/// Radius presets offered to caregivers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceRadius {
    Small,
    Medium,
    Large,
    XLarge,
}

impl GeofenceRadius {
    pub fn meters(self) -> f64 {
        match self {
            GeofenceRadius::Small => 100.0,
            GeofenceRadius::Medium => 250.0,
            GeofenceRadius::Large => 500.0,
            GeofenceRadius::XLarge => 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Patient {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    /// Free-text annotation; field devices' identifiers are matched here.
    pub notes: Option<String>,
}

impl Patient {
    /// Synthesized identity for an SMS that matches no patient at all.
    pub fn placeholder(token: &str) -> Self {
        let label = if token.trim().is_empty() {
            "Unidentified"
        } else {
            token.trim()
        };
        Self {
            id: PLACEHOLDER_PATIENT_ID.to_string(),
            first_name: "Patient".to_string(),
            last_name: format!("({label})"),
            notes: Some(format!("Fallback for {label}")),
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Why an SMS was attached to a patient other than a direct token match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum FallbackReason {
    NoTokenMatch,
    LookupFailed(String),
}

/// Outcome of resolving an SMS patient token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "resolution")]
pub enum PatientResolution {
    Resolved { patient: Patient },
    Fallback { patient: Patient, reason: FallbackReason },
    Placeholder { patient: Patient },
}

impl PatientResolution {
    pub fn patient(&self) -> &Patient {
        match self {
            PatientResolution::Resolved { patient }
            | PatientResolution::Fallback { patient, .. }
            | PatientResolution::Placeholder { patient } => patient,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, PatientResolution::Resolved { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    FallIncident,
    Tracking,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationRecord {
    pub patient_id: String,
    pub location: GeoPoint,
    pub accuracy_m: f64,
    pub kind: LocationKind,
    pub note: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallEventRecord {
    pub patient_id: String,
    pub location_id: Option<RecordId>,
    pub impact_force_g: f64,
    pub confidence: f64,
    pub note: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SleepQuality {
    Good,
    Fair,
}

impl SleepQuality {
    pub fn from_score(score: i32) -> Self {
        if score > 80 {
            SleepQuality::Good
        } else {
            SleepQuality::Fair
        }
    }
}

/// One row per patient and calendar date; later samples overwrite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SleepRecord {
    pub patient_id: String,
    pub date: NaiveDate,
    pub quality: SleepQuality,
    pub score: i32,
    pub is_sleeping: bool,
    pub note: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TelemetrySource {
    Ble,
    Sms,
    DeviceGps,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallNotice {
    pub patient_id: String,
    pub source: TelemetrySource,
    pub impact_force_g: f64,
    pub location: Option<GeoPoint>,
    pub device: String,
    pub raw_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationNotice {
    pub patient_id: String,
    pub source: TelemetrySource,
    pub location: GeoPoint,
    pub gps_status: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// In-process event for immediate on-screen reaction, ahead of persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload")]
pub enum LiveEvent {
    FallDetected(FallNotice),
    LocationUpdated(LocationNotice),
}

/// Errors surfaced to callers of the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("telemetry frame is not a JSON object")]
    NotAnObject,
    #[error("device {0} is not connected")]
    UnknownDevice(String),
    #[error("pipeline is closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid zone: {0}")]
    InvalidZone(String),
    #[error("invalid location: {0}")]
    InvalidLocation(String),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Reasons an SMS is not a telemetry message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SmsError {
    #[error("expected at least 5 pipe-delimited fields, got {0}")]
    TooFewFields(usize),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("record rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_sort_most_urgent_first() {
        let mut priorities = vec![
            AlertPriority::Low,
            AlertPriority::Critical,
            AlertPriority::Medium,
            AlertPriority::High,
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![
                AlertPriority::Critical,
                AlertPriority::High,
                AlertPriority::Medium,
                AlertPriority::Low
            ]
        );
    }

    #[test]
    fn alert_kind_serializes_as_wire_name() {
        for kind in [
            AlertKind::Fall,
            AlertKind::LowHeartRate,
            AlertKind::HighHeartRate,
            AlertKind::LowSpo2,
            AlertKind::HighTemperature,
            AlertKind::LowTemperature,
            AlertKind::GeofenceEntry,
            AlertKind::GeofenceExit,
        ] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, Value::String(kind.as_str().to_string()));
        }
    }

    #[test]
    fn alert_event_uses_type_key() {
        let alert = AlertEvent::new(
            "p1",
            AlertKind::LowSpo2,
            "SpO2 is 85% (below 90%)",
            Value::Null,
            Utc::now(),
        );
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "low_spo2");
        assert_eq!(json["priority"], "critical");
        assert_eq!(json["title"], "Low Oxygen Level");
    }

    #[test]
    fn acceleration_magnitude_is_euclidean() {
        let accel = Acceleration::from_axes(3.0, 4.0, 12.0);
        assert!((accel.magnitude - 13.0).abs() < 1e-9);
    }

    #[test]
    fn placeholder_patient_names_the_token() {
        let patient = Patient::placeholder("PATIENT_001");
        assert_eq!(patient.id, PLACEHOLDER_PATIENT_ID);
        assert_eq!(patient.display_name(), "Patient (PATIENT_001)");

        let anonymous = Patient::placeholder("  ");
        assert_eq!(anonymous.last_name, "(Unidentified)");
    }

    #[test]
    fn live_event_is_kind_payload_tagged() {
        let event = LiveEvent::LocationUpdated(LocationNotice {
            patient_id: "p1".into(),
            source: TelemetrySource::Sms,
            location: GeoPoint { lat: 1.0, lon: 2.0 },
            gps_status: Some("GPS_OK".into()),
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "LocationUpdated");
        assert_eq!(json["payload"]["patient_id"], "p1");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"vitals_interval_secs": 30}"#).unwrap();
        assert_eq!(cfg.vitals_interval_secs, 30);
        assert_eq!(cfg.sleep_interval_secs, 300);
        assert_eq!(cfg.sms_default_device_type, "PiZero");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_rejects_zero_capacity() {
        let cfg = PipelineConfig {
            write_queue_capacity: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(IngestError::Config(_))));
    }

    #[test]
    fn sleep_quality_threshold() {
        assert_eq!(SleepQuality::from_score(81), SleepQuality::Good);
        assert_eq!(SleepQuality::from_score(80), SleepQuality::Fair);
    }
}
