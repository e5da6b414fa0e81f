//! Stats module - volume and frequency figures for the history and chart views
//!
//! All weights are normalised to kg before aggregating.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::model::{HealthEntry, Session};

/// Training analytics
pub struct Analytics {
    sessions: Vec<Session>,
}

impl Analytics {
    /// Sessions in any order; they are sorted newest first
    pub fn new(mut sessions: Vec<Session>) -> Self {
        sessions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Self { sessions }
    }

    fn matching<'a>(&'a self, exercise: &'a str) -> impl Iterator<Item = &'a crate::model::Exercise> + 'a {
        let needle = exercise.to_lowercase();
        self.sessions
            .iter()
            .flat_map(|s| s.exercises.iter())
            .filter(move |e| e.name.to_lowercase().contains(&needle))
    }

    /// Calculate total volume (sets * reps * kg) for an exercise
    pub fn total_volume(&self, exercise: &str) -> f64 {
        self.matching(exercise).map(|e| e.volume_kg()).sum()
    }

    /// Volume of every session, summed per calendar day (UTC)
    pub fn volume_by_day(&self) -> BTreeMap<NaiveDate, f64> {
        let mut days = BTreeMap::new();
        for session in &self.sessions {
            *days.entry(session.timestamp.date_naive()).or_insert(0.0) += session.volume_kg();
        }
        days
    }

    /// Get training frequency (sessions per week)
    pub fn weekly_frequency(&self) -> f64 {
        if self.sessions.len() < 2 {
            return 0.0;
        }

        let last = self.sessions[0].timestamp.date_naive();
        let first = self.sessions[self.sessions.len() - 1].timestamp.date_naive();
        let days = (last - first).num_days() as f64;

        if days == 0.0 {
            return self.sessions.len() as f64;
        }

        (self.sessions.len() as f64 / days) * 7.0
    }

    /// Suggest the next sets/reps from the last five logged rows
    pub fn predict_next_load(&self, exercise: &str) -> Option<(u32, u32)> {
        let recent: Vec<_> = self.matching(exercise).take(5).collect();
        if recent.is_empty() {
            return None;
        }

        let count = recent.len() as u64;
        let avg_sets = recent.iter().map(|e| u64::from(e.sets)).sum::<u64>() / count;
        let avg_reps = recent.iter().map(|e| u64::from(e.reps)).sum::<u64>() / count;

        // Slight progression suggestion
        let sets = u32::try_from(avg_sets).unwrap_or(u32::MAX);
        let reps = u32::try_from(avg_reps).unwrap_or(u32::MAX);
        Some((sets, reps.saturating_add(1)))
    }

    /// Heaviest single-row weight in kg
    pub fn best_weight_kg(&self, exercise: &str) -> Option<f64> {
        self.matching(exercise)
            .map(|e| e.weight_kg())
            .fold(None, |best, w| Some(best.map_or(w, |b: f64| b.max(w))))
    }
}

/// Most recent bodyweight reading, in kg
pub fn latest_bodyweight_kg(entries: &[HealthEntry]) -> Option<f64> {
    entries
        .iter()
        .filter(|e| e.bodyweight.is_some())
        .max_by_key(|e| e.timestamp)
        .and_then(HealthEntry::bodyweight_kg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExerciseSpec, WeightUnit, new_id};
    use chrono::{Duration, Utc};

    fn create_session(exercise: &str, sets: u32, reps: u32, weight: f64, unit: WeightUnit, days_ago: i64) -> Session {
        let mut s = Session::active(Utc::now() - Duration::days(days_ago));
        s.id = new_id();
        s.exercises
            .push(ExerciseSpec::new(exercise, sets, reps, weight, unit).into_exercise());
        s
    }

    #[test]
    fn test_total_volume_single_exercise() {
        let analytics = Analytics::new(vec![create_session("Bench Press", 3, 10, 50.0, WeightUnit::Kg, 0)]);
        assert_eq!(analytics.total_volume("bench"), 1500.0);
    }

    #[test]
    fn test_total_volume_mixed_units() {
        let analytics = Analytics::new(vec![
            create_session("Bench Press", 1, 10, 100.0, WeightUnit::Kg, 1),
            create_session("Bench Press", 1, 10, 100.0, WeightUnit::Lb, 0),
        ]);
        let expected = 1000.0 + 1000.0 * crate::model::LB_TO_KG;
        assert!((analytics.total_volume("Bench Press") - expected).abs() < 1e-9);
    }

    #[test]
    fn test_total_volume_bodyweight_is_zero() {
        let analytics = Analytics::new(vec![create_session("Push-ups", 3, 10, 0.0, WeightUnit::Kg, 0)]);
        assert_eq!(analytics.total_volume("push"), 0.0);
    }

    #[test]
    fn test_total_volume_empty() {
        let analytics = Analytics::new(vec![]);
        assert_eq!(analytics.total_volume("squat"), 0.0);
    }

    #[test]
    fn test_weekly_frequency_empty() {
        let analytics = Analytics::new(vec![]);
        assert_eq!(analytics.weekly_frequency(), 0.0);
    }

    #[test]
    fn test_weekly_frequency_over_week() {
        let analytics = Analytics::new(vec![
            create_session("Squat", 3, 5, 100.0, WeightUnit::Kg, 7),
            create_session("Squat", 3, 5, 100.0, WeightUnit::Kg, 0),
        ]);
        let freq = analytics.weekly_frequency();
        assert!((freq - 2.0).abs() < 0.1, "Expected ~2, got {}", freq);
    }

    #[test]
    fn test_volume_by_day() {
        let analytics = Analytics::new(vec![
            create_session("Squat", 1, 5, 100.0, WeightUnit::Kg, 1),
            create_session("Squat", 1, 5, 100.0, WeightUnit::Kg, 1),
            create_session("Squat", 1, 5, 100.0, WeightUnit::Kg, 0),
        ]);
        let days = analytics.volume_by_day();
        assert!(days.len() <= 3 && !days.is_empty());
        assert_eq!(days.values().sum::<f64>(), 1500.0);
    }

    #[test]
    fn test_predict_next_load() {
        let analytics = Analytics::new(vec![
            create_session("Row", 3, 10, 40.0, WeightUnit::Kg, 2),
            create_session("Row", 3, 12, 40.0, WeightUnit::Kg, 1),
            create_session("Row", 3, 14, 40.0, WeightUnit::Kg, 0),
        ]);
        assert_eq!(analytics.predict_next_load("row"), Some((3, 13)));
        assert!(analytics.predict_next_load("curl").is_none());
    }

    #[test]
    fn test_predict_next_load_large_counts() {
        let analytics = Analytics::new(vec![
            create_session("Row", u32::MAX, u32::MAX, 40.0, WeightUnit::Kg, 1),
            create_session("Row", u32::MAX, u32::MAX, 40.0, WeightUnit::Kg, 0),
        ]);
        assert_eq!(analytics.predict_next_load("row"), Some((u32::MAX, u32::MAX)));
    }

    #[test]
    fn test_best_weight_kg() {
        let analytics = Analytics::new(vec![
            create_session("Deadlift", 1, 5, 140.0, WeightUnit::Kg, 1),
            create_session("Deadlift", 1, 5, 330.0, WeightUnit::Lb, 0),
        ]);
        let best = analytics.best_weight_kg("deadlift").unwrap();
        assert!((best - 330.0 * crate::model::LB_TO_KG).abs() < 1e-9);
    }

    #[test]
    fn test_latest_bodyweight() {
        let entries = vec![
            HealthEntry {
                id: "old".to_string(),
                timestamp: Utc::now() - Duration::days(3),
                bodyweight: Some(80.0),
                ..Default::default()
            },
            HealthEntry {
                id: "new".to_string(),
                timestamp: Utc::now(),
                bodyweight: Some(176.0),
                bodyweight_unit: Some(WeightUnit::Lb),
                ..Default::default()
            },
            HealthEntry {
                id: "sleep".to_string(),
                timestamp: Utc::now() + Duration::hours(1),
                sleep_hours: Some(8.0),
                ..Default::default()
            },
        ];
        let kg = latest_bodyweight_kg(&entries).unwrap();
        assert!((kg - 176.0 * crate::model::LB_TO_KG).abs() < 1e-9);
    }
}
