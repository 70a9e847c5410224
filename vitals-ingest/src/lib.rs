//! Telemetry ingestion and alerting for caregiver monitoring.
//!
//! BLE notifications pass through [`reassembler`] and [`normalizer`]; SMS
//! messages through [`sms`]. Both feed the [`throttle`] gate, the
//! [`alerts`] rules and the [`geofence`] engine, wired together by
//! [`orchestrator::IngestOrchestrator`].

pub mod alerts;
pub mod geofence;
pub mod normalizer;
pub mod orchestrator;
pub mod reassembler;
pub mod sinks;
pub mod sms;
pub mod throttle;

pub use alerts::{check_thresholds, sms_fall_alert, AlertEngine};
pub use geofence::{haversine_m, GeofenceEngine};
pub use normalizer::{normalize, SampleContext};
pub use orchestrator::{BleReport, IngestOrchestrator, SmsOutcome, SmsReport};
pub use reassembler::{DecoderState, FrameDecoder, FrameReassembler, RawFragment};
pub use sinks::{AlertSink, MemoryStore, PatientDirectory, PersistenceSink, Sinks, ZoneDirectory};
pub use sms::{SmsDeduplicator, SmsParser};
pub use throttle::{Permit, RecordKind, ThrottleGate};
