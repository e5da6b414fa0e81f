//! Entity model - sessions, health entries, routines and the dataset bundling them

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Pounds to kilograms
pub const LB_TO_KG: f64 = 0.453592;

/// Id carried by the one in-progress session. Never persisted.
pub const ACTIVE_SESSION_ID: &str = "active";

/// Fresh stable identifier for a record
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    #[default]
    Kg,
    Lb,
}

impl WeightUnit {
    /// Convert a weight expressed in this unit to kilograms
    pub fn to_kg(self, weight: f64) -> f64 {
        match self {
            WeightUnit::Kg => weight,
            WeightUnit::Lb => weight * LB_TO_KG,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WeightUnit::Kg => "kg",
            WeightUnit::Lb => "lb",
        }
    }
}

impl std::str::FromStr for WeightUnit {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "kg" | "kgs" => Ok(WeightUnit::Kg),
            "lb" | "lbs" => Ok(WeightUnit::Lb),
            other => Err(ValidationError::InvalidValue {
                field: "unit",
                reason: format!("unknown unit '{}'", other),
            }),
        }
    }
}

/// One logged exercise row inside a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Exercise {
    pub id: String,
    pub name: String,
    pub sets: u32,
    pub reps: u32,
    pub weight: f64,
    #[serde(default)]
    pub unit: WeightUnit,
}

impl Exercise {
    pub fn weight_kg(&self) -> f64 {
        self.unit.to_kg(self.weight)
    }

    /// sets * reps * kg. Bodyweight-only rows (weight 0) contribute nothing.
    pub fn volume_kg(&self) -> f64 {
        if self.weight == 0.0 {
            return 0.0;
        }
        self.sets as f64 * self.reps as f64 * self.weight_kg()
    }

    /// Merge key used while logging: same name, weight, unit and reps
    pub fn same_load(&self, spec: &ExerciseSpec) -> bool {
        self.name == spec.name
            && self.weight == spec.weight
            && self.unit == spec.unit
            && self.reps == spec.reps
    }
}

/// What the user asks to log; becomes an [`Exercise`] once it has an id
#[derive(Debug, Clone, PartialEq)]
pub struct ExerciseSpec {
    pub name: String,
    pub sets: u32,
    pub reps: u32,
    pub weight: f64,
    pub unit: WeightUnit,
}

impl ExerciseSpec {
    pub fn new(name: &str, sets: u32, reps: u32, weight: f64, unit: WeightUnit) -> Self {
        Self {
            name: name.trim().to_string(),
            sets,
            reps,
            weight,
            unit,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(invalid("name", "must not be empty"));
        }
        if self.sets == 0 {
            return Err(invalid("sets", "must be greater than zero"));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(invalid("weight", "must be zero or positive"));
        }
        Ok(())
    }

    pub fn into_exercise(self) -> Exercise {
        Exercise {
            id: new_id(),
            name: self.name,
            sets: self.sets,
            reps: self.reps,
            weight: self.weight,
            unit: self.unit,
        }
    }
}

/// Workout session. `id == "active"` only while it is being logged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub warmup: bool,
    #[serde(default)]
    pub equipment: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub exercises: Vec<Exercise>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
}

impl Session {
    /// Fresh in-progress session with default equipment and notes
    pub fn active(timestamp: DateTime<Utc>) -> Self {
        Self {
            id: ACTIVE_SESSION_ID.to_string(),
            timestamp,
            name: None,
            warmup: false,
            equipment: String::new(),
            notes: String::new(),
            exercises: Vec::new(),
            duration_minutes: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.id == ACTIVE_SESSION_ID
    }

    pub fn volume_kg(&self) -> f64 {
        self.exercises.iter().map(Exercise::volume_kg).sum()
    }
}

/// Partial update applied to the active session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub notes: Option<String>,
    pub equipment: Option<String>,
    pub warmup: Option<bool>,
    pub timestamp: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
}

/// Body measurements. Every field is optional but at least one must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bodyweight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bodyweight_unit: Option<WeightUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_fat_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub water_intake_liters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resting_heart_rate: Option<u32>,
}

impl HealthEntry {
    pub fn has_measurement(&self) -> bool {
        self.bodyweight.is_some()
            || self.body_fat_percentage.is_some()
            || self.sleep_hours.is_some()
            || self.water_intake_liters.is_some()
            || self.resting_heart_rate.is_some()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.has_measurement() {
            return Err(ValidationError::NoMeasurement);
        }

        let checks = [
            ("bodyweight", self.bodyweight),
            ("bodyFatPercentage", self.body_fat_percentage),
            ("sleepHours", self.sleep_hours),
            ("waterIntakeLiters", self.water_intake_liters),
        ];
        for (field, value) in checks {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(invalid(field, "must be zero or positive"));
                }
            }
        }
        if let Some(pct) = self.body_fat_percentage {
            if pct > 100.0 {
                return Err(invalid("bodyFatPercentage", "must not exceed 100"));
            }
        }
        Ok(())
    }

    /// Bodyweight in kg; a missing unit means kg
    pub fn bodyweight_kg(&self) -> Option<f64> {
        self.bodyweight
            .map(|w| self.bodyweight_unit.unwrap_or_default().to_kg(w))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutineExercise {
    pub name: String,
    pub sets: u32,
    pub reps: u32,
}

/// Reusable session template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Routine {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub exercises: Vec<RoutineExercise>,
}

impl Routine {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() || self.exercises.is_empty() {
            return Err(ValidationError::EmptyRoutine);
        }
        if self.exercises.iter().any(|e| e.name.trim().is_empty() || e.sets == 0) {
            return Err(ValidationError::EmptyRoutine);
        }
        Ok(())
    }
}

/// Everything a user has logged
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub health_entries: Vec<HealthEntry>,
    #[serde(default)]
    pub routines: Vec<Routine>,
}

impl Dataset {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.health_entries.is_empty() && self.routines.is_empty()
    }

    /// Replace the session with the same id, or append it
    pub fn upsert_session(&mut self, session: Session) {
        match self.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn remove_session(&mut self, id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != id);
        self.sessions.len() != before
    }

    pub fn remove_health_entry(&mut self, id: &str) -> bool {
        let before = self.health_entries.len();
        self.health_entries.retain(|h| h.id != id);
        self.health_entries.len() != before
    }

    pub fn remove_routine(&mut self, id: &str) -> bool {
        let before = self.routines.len();
        self.routines.retain(|r| r.id != id);
        self.routines.len() != before
    }

    /// Sessions newest first, for display
    pub fn sessions_by_recency(&self) -> Vec<&Session> {
        let mut sessions: Vec<_> = self.sessions.iter().collect();
        sessions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        sessions
    }

    /// Health entries newest first, for display
    pub fn health_by_recency(&self) -> Vec<&HealthEntry> {
        let mut entries: Vec<_> = self.health_entries.iter().collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries
    }
}

/// Per-profile preferences
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub default_exercise_name: String,
    pub default_reps: u32,
    pub default_weight: f64,
    pub default_unit: WeightUnit,
    /// Sets added per logging action
    pub default_sets: u32,
    pub session_timeout_minutes: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_exercise_name: "Bench Press".to_string(),
            default_reps: 10,
            default_weight: 20.0,
            default_unit: WeightUnit::Kg,
            default_sets: 3,
            session_timeout_minutes: 30,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.session_timeout_minutes == 0 {
            return Err(invalid("sessionTimeoutMinutes", "must be greater than zero"));
        }
        if self.default_sets == 0 {
            return Err(invalid("defaultSets", "must be greater than zero"));
        }
        if !self.default_weight.is_finite() || self.default_weight < 0.0 {
            return Err(invalid("defaultWeight", "must be zero or positive"));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.session_timeout_minutes) * 60)
    }
}

fn invalid(field: &'static str, reason: &str) -> ValidationError {
    ValidationError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_exercise(weight: f64, unit: WeightUnit) -> Exercise {
        ExerciseSpec::new("Squat", 3, 5, weight, unit).into_exercise()
    }

    #[test]
    fn test_volume_in_kg() {
        let ex = create_exercise(100.0, WeightUnit::Kg);
        assert_eq!(ex.volume_kg(), 1500.0);
    }

    #[test]
    fn test_volume_converts_pounds() {
        let ex = create_exercise(100.0, WeightUnit::Lb);
        assert!((ex.volume_kg() - 1500.0 * LB_TO_KG).abs() < 1e-9);
    }

    #[test]
    fn test_bodyweight_exercise_has_no_volume() {
        let ex = create_exercise(0.0, WeightUnit::Lb);
        assert_eq!(ex.volume_kg(), 0.0);
    }

    #[test]
    fn test_same_load_requires_matching_unit() {
        let ex = create_exercise(100.0, WeightUnit::Kg);
        assert!(ex.same_load(&ExerciseSpec::new("Squat", 1, 5, 100.0, WeightUnit::Kg)));
        assert!(!ex.same_load(&ExerciseSpec::new("Squat", 1, 5, 100.0, WeightUnit::Lb)));
        assert!(!ex.same_load(&ExerciseSpec::new("Squat", 1, 6, 100.0, WeightUnit::Kg)));
    }

    #[test]
    fn test_spec_validation() {
        assert!(ExerciseSpec::new("Row", 0, 5, 10.0, WeightUnit::Kg).validate().is_err());
        assert!(ExerciseSpec::new("  ", 1, 5, 10.0, WeightUnit::Kg).validate().is_err());
        assert!(ExerciseSpec::new("Row", 1, 5, -1.0, WeightUnit::Kg).validate().is_err());
        assert!(ExerciseSpec::new("Row", 1, 0, 0.0, WeightUnit::Kg).validate().is_ok());
    }

    #[test]
    fn test_health_entry_needs_measurement() {
        let entry = HealthEntry {
            id: new_id(),
            timestamp: Utc::now(),
            ..Default::default()
        };
        assert_eq!(entry.validate(), Err(ValidationError::NoMeasurement));

        let entry = HealthEntry {
            sleep_hours: Some(7.5),
            ..entry
        };
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn test_bodyweight_defaults_to_kg() {
        let entry = HealthEntry {
            bodyweight: Some(180.0),
            ..Default::default()
        };
        assert_eq!(entry.bodyweight_kg(), Some(180.0));

        let entry = HealthEntry {
            bodyweight_unit: Some(WeightUnit::Lb),
            ..entry
        };
        assert!((entry.bodyweight_kg().unwrap_or_default() - 81.64656).abs() < 1e-6);
    }

    #[test]
    fn test_upsert_session_replaces_by_id() {
        let mut dataset = Dataset::default();
        let mut session = Session::active(Utc::now());
        session.id = "100".to_string();
        dataset.upsert_session(session.clone());

        session.notes = "edited".to_string();
        dataset.upsert_session(session);

        assert_eq!(dataset.sessions.len(), 1);
        assert_eq!(dataset.sessions[0].notes, "edited");
    }

    #[test]
    fn test_sessions_by_recency() {
        let mut dataset = Dataset::default();
        let now = Utc::now();
        for (id, days) in [("a", 3), ("b", 1), ("c", 2)] {
            let mut s = Session::active(now - chrono::Duration::days(days));
            s.id = id.to_string();
            dataset.sessions.push(s);
        }
        let ids: Vec<_> = dataset.sessions_by_recency().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_dataset_serializes_camel_case() {
        let mut dataset = Dataset::default();
        dataset.health_entries.push(HealthEntry {
            id: "h1".to_string(),
            timestamp: Utc::now(),
            resting_heart_rate: Some(55),
            ..Default::default()
        });
        let json = serde_json::to_string(&dataset).unwrap();
        assert!(json.contains("healthEntries"));
        assert!(json.contains("restingHeartRate"));
        assert!(!json.contains("bodyweight"));
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());
        settings.session_timeout_minutes = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_routine_validation() {
        let routine = Routine {
            id: new_id(),
            name: "Push".to_string(),
            exercises: vec![],
        };
        assert_eq!(routine.validate(), Err(ValidationError::EmptyRoutine));
    }
}
