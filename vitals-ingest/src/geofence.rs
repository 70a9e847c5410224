//! Circular safe zones and the per-zone membership state machine.
//!
//! The first observation of a zone only establishes whether the patient is
//! inside; alerts fire on later transitions, `geofence_entry` when moving in
//! and `geofence_exit` when moving out.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;
use vitals_core::{AlertEvent, AlertKind, GeoPoint, Geofence, MembershipState};

/// Mean Earth radius used by the great-circle distance.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub const DEFAULT_ZONE_NAME: &str = "Safe Zone";

/// Great-circle distance in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Active zones grouped by patient.
#[derive(Debug, Default)]
pub struct GeofenceEngine {
    zones: HashMap<String, Vec<Geofence>>,
}

impl GeofenceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zone, or resize the patient's existing zone at the same center.
    pub fn upsert_zone(
        &mut self,
        patient_id: &str,
        center_lat: f64,
        center_lon: f64,
        radius_meters: f64,
        now: DateTime<Utc>,
    ) -> Uuid {
        if let Some(existing) = self
            .zones
            .get_mut(patient_id)
            .and_then(|zones| {
                zones
                    .iter_mut()
                    .find(|z| z.center_lat == center_lat && z.center_lon == center_lon)
            })
        {
            existing.radius_meters = radius_meters;
            return existing.id;
        }
        let center = GeoPoint {
            lat: center_lat,
            lon: center_lon,
        };
        self.insert(Geofence::new(
            patient_id,
            DEFAULT_ZONE_NAME,
            center,
            radius_meters,
            now,
        ))
    }

    /// Add a fully built zone, or refresh the zone with the same id. Zones
    /// sharing a center stay distinct. Returns the id that is now active.
    pub fn insert(&mut self, zone: Geofence) -> Uuid {
        let zones = self.zones.entry(zone.patient_id.clone()).or_default();
        if let Some(existing) = zones.iter_mut().find(|z| z.id == zone.id) {
            existing.center_lat = zone.center_lat;
            existing.center_lon = zone.center_lon;
            existing.radius_meters = zone.radius_meters;
            existing.name = zone.name;
            return existing.id;
        }
        let id = zone.id;
        zones.push(zone);
        id
    }

    /// Replace-or-add zones loaded from storage. Inactive rows are skipped and
    /// known zones keep their observed membership.
    pub fn load(&mut self, zones: impl IntoIterator<Item = Geofence>) -> usize {
        let mut loaded = 0;
        for zone in zones.into_iter().filter(|z| z.active) {
            self.insert(zone);
            loaded += 1;
        }
        loaded
    }

    /// Stop evaluating a zone. Returns the zone, marked inactive.
    pub fn remove_zone(&mut self, zone_id: Uuid) -> Option<Geofence> {
        for zones in self.zones.values_mut() {
            if let Some(index) = zones.iter().position(|z| z.id == zone_id) {
                let mut zone = zones.remove(index);
                zone.active = false;
                return Some(zone);
            }
        }
        None
    }

    pub fn zones(&self, patient_id: &str) -> &[Geofence] {
        self.zones.get(patient_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn zone(&self, zone_id: Uuid) -> Option<&Geofence> {
        self.zones.values().flatten().find(|z| z.id == zone_id)
    }

    /// Evaluate one location against the patient's zones. A non-finite fix
    /// leaves every membership untouched.
    pub fn check_membership(
        &mut self,
        patient_id: &str,
        lat: f64,
        lon: f64,
        now: DateTime<Utc>,
    ) -> Vec<AlertEvent> {
        if !(lat.is_finite() && lon.is_finite()) {
            return Vec::new();
        }
        let Some(zones) = self.zones.get_mut(patient_id) else {
            return Vec::new();
        };
        let point = GeoPoint { lat, lon };
        let mut alerts = Vec::new();

        for zone in zones.iter_mut() {
            let distance = haversine_m(point, zone.center());
            let inside = distance <= zone.radius_meters;
            let next = if inside {
                MembershipState::Inside
            } else {
                MembershipState::Outside
            };

            let transition = match (zone.state, next) {
                (MembershipState::Outside, MembershipState::Inside) => Some(AlertKind::GeofenceEntry),
                (MembershipState::Inside, MembershipState::Outside) => Some(AlertKind::GeofenceExit),
                _ => None,
            };
            zone.state = next;

            let Some(kind) = transition else {
                continue;
            };
            let message = match kind {
                AlertKind::GeofenceExit => format!(
                    "Patient has left the safe zone \"{}\" ({}m radius)",
                    zone.name, zone.radius_meters
                ),
                _ => format!("Patient has entered the safe zone \"{}\"", zone.name),
            };
            tracing::info!(
                patient_id,
                geofence_id = %zone.id,
                event = %kind,
                distance_m = distance,
                "geofence transition"
            );
            alerts.push(AlertEvent::new(
                patient_id,
                kind,
                message,
                json!({
                    "geofence_id": zone.id,
                    "zone_name": zone.name,
                    "event_type": if inside { "entry" } else { "exit" },
                    "distance_m": distance,
                    "latitude": lat,
                    "longitude": lon,
                }),
                now,
            ));
        }
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use vitals_core::AlertPriority;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    // Latitude offset (degrees) for a northward move of `meters`.
    fn north(meters: f64) -> f64 {
        (meters / EARTH_RADIUS_M).to_degrees()
    }

    #[test]
    fn haversine_known_distance() {
        let d = haversine_m(GeoPoint { lat: 0.0, lon: 0.0 }, GeoPoint { lat: 0.0, lon: 1.0 });
        assert!((d - 111_194.93).abs() < 1.0, "{d}");
        let d = haversine_m(GeoPoint { lat: 0.0, lon: 0.0 }, GeoPoint { lat: north(150.0), lon: 0.0 });
        assert!((d - 150.0).abs() < 1e-6, "{d}");
    }

    #[test]
    fn first_observation_then_single_exit() {
        let mut engine = GeofenceEngine::new();
        engine.upsert_zone("p1", 0.0, 0.0, 100.0, t0());

        assert!(engine.check_membership("p1", 0.0, 0.0, t0()).is_empty());

        let alerts = engine.check_membership("p1", north(150.0), 0.0, t0() + Duration::minutes(1));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::GeofenceExit);
        assert_eq!(alerts[0].priority, AlertPriority::High);
        assert_eq!(alerts[0].metadata["event_type"], "exit");

        assert!(engine
            .check_membership("p1", north(150.0), 0.0, t0() + Duration::minutes(2))
            .is_empty());
    }

    #[test]
    fn reentry_is_low_priority() {
        let mut engine = GeofenceEngine::new();
        engine.upsert_zone("p1", 0.0, 0.0, 100.0, t0());
        engine.check_membership("p1", north(500.0), 0.0, t0());
        let alerts = engine.check_membership("p1", north(50.0), 0.0, t0());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::GeofenceEntry);
        assert_eq!(alerts[0].priority, AlertPriority::Low);
    }

    #[test]
    fn just_inside_radius_is_inside() {
        let mut engine = GeofenceEngine::new();
        let id = engine.upsert_zone("p1", 0.0, 0.0, 100.0, t0());
        engine.check_membership("p1", north(99.9), 0.0, t0());
        assert_eq!(engine.zone(id).map(|z| z.state), Some(MembershipState::Inside));
    }

    #[test]
    fn upsert_same_center_resizes_in_place() {
        let mut engine = GeofenceEngine::new();
        let first = engine.upsert_zone("p1", 1.0, 2.0, 100.0, t0());
        let second = engine.upsert_zone("p1", 1.0, 2.0, 500.0, t0());
        assert_eq!(first, second);
        assert_eq!(engine.zones("p1").len(), 1);
        assert_eq!(engine.zones("p1")[0].radius_meters, 500.0);

        let other = engine.upsert_zone("p1", 1.5, 2.0, 100.0, t0());
        assert_ne!(first, other);
        assert_eq!(engine.zones("p1").len(), 2);
    }

    #[test]
    fn removed_zone_stops_evaluating() {
        let mut engine = GeofenceEngine::new();
        let id = engine.upsert_zone("p1", 0.0, 0.0, 100.0, t0());
        engine.check_membership("p1", 0.0, 0.0, t0());
        let removed = engine.remove_zone(id).unwrap();
        assert!(!removed.active);
        assert!(engine
            .check_membership("p1", north(1000.0), 0.0, t0())
            .is_empty());
        assert!(engine.remove_zone(id).is_none());
    }

    #[test]
    fn zones_are_per_patient() {
        let mut engine = GeofenceEngine::new();
        engine.upsert_zone("p1", 0.0, 0.0, 100.0, t0());
        engine.check_membership("p2", 0.0, 0.0, t0());
        assert_eq!(engine.zones("p1")[0].state, MembershipState::Unobserved);
    }

    #[test]
    fn load_skips_inactive_and_keeps_state() {
        let mut engine = GeofenceEngine::new();
        let id = engine.upsert_zone("p1", 0.0, 0.0, 100.0, t0());
        engine.check_membership("p1", 0.0, 0.0, t0());

        let mut stored = engine.zone(id).cloned().unwrap();
        stored.state = MembershipState::Unobserved;
        let mut retired = Geofence::new("p1", "old", GeoPoint { lat: 5.0, lon: 5.0 }, 100.0, t0());
        retired.active = false;

        assert_eq!(engine.load(vec![stored, retired]), 1);
        assert_eq!(engine.zones("p1").len(), 1);
        assert!(engine.zone(id).unwrap().is_inside());
    }

    #[test]
    fn non_finite_fix_keeps_membership() {
        let mut engine = GeofenceEngine::new();
        let id = engine.upsert_zone("p1", 0.0, 0.0, 100.0, t0());
        engine.check_membership("p1", 0.0, 0.0, t0());

        assert!(engine.check_membership("p1", f64::NAN, f64::NAN, t0()).is_empty());
        assert!(engine.check_membership("p1", 0.0, f64::INFINITY, t0()).is_empty());
        assert!(engine.zone(id).unwrap().is_inside());
        assert!(engine.check_membership("p1", 0.0, 0.0, t0()).is_empty());
    }

    #[test]
    fn inserted_zone_at_same_center_does_not_replace_caregiver_zone() {
        let mut engine = GeofenceEngine::new();
        let home = engine.upsert_zone("p1", 1.0, 2.0, 500.0, t0());
        let fall_site = Geofence::new("p1", "Fall site", GeoPoint { lat: 1.0, lon: 2.0 }, 250.0, t0());
        let fall_id = engine.insert(fall_site);

        assert_ne!(home, fall_id);
        assert_eq!(engine.zones("p1").len(), 2);
        let home = engine.zone(home).unwrap();
        assert_eq!(home.radius_meters, 500.0);
        assert_eq!(home.name, DEFAULT_ZONE_NAME);
    }
}
