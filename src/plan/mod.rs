//! Workout plan generation - external generator in, routines out

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExternalServiceError;
use crate::model::{Routine, RoutineExercise, new_id};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExperienceLevel {
    Beginner,
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub goal: String,
    pub experience_level: ExperienceLevel,
    pub days_per_week: u8,
    pub equipment: Vec<String>,
}

impl PlanRequest {
    fn check(&self) -> Result<(), ExternalServiceError> {
        if self.goal.trim().is_empty() {
            return Err(ExternalServiceError::PlanGenerator("goal is empty".to_string()));
        }
        if !(1..=7).contains(&self.days_per_week) {
            return Err(ExternalServiceError::PlanGenerator(format!(
                "days per week must be 1-7, got {}",
                self.days_per_week
            )));
        }
        Ok(())
    }
}

/// One day of a generated plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanDay {
    pub day: String,
    pub focus: String,
    pub exercises: Vec<RoutineExercise>,
}

/// Opaque plan generator (typically an AI service)
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(&self, request: &PlanRequest) -> Result<Vec<PlanDay>, ExternalServiceError>;
}

/// One routine per plan day; days without exercises are skipped
pub fn routines_from_plan(days: &[PlanDay]) -> Vec<Routine> {
    days.iter()
        .filter(|d| d.exercises.iter().any(|e| !e.name.trim().is_empty() && e.sets > 0))
        .map(|d| Routine {
            id: new_id(),
            name: format!("{} - {}", d.day, d.focus),
            exercises: d
                .exercises
                .iter()
                .filter(|e| !e.name.trim().is_empty() && e.sets > 0)
                .cloned()
                .collect(),
        })
        .collect()
}

/// Ask the generator for a plan and turn it into routines
pub async fn generate_routines(
    generator: &dyn PlanGenerator,
    request: &PlanRequest,
) -> Result<Vec<Routine>, ExternalServiceError> {
    request.check()?;
    let days = generator.generate(request).await?;
    let routines = routines_from_plan(&days);
    if routines.is_empty() {
        return Err(ExternalServiceError::PlanGenerator("plan has no exercises".to_string()));
    }
    Ok(routines)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct FixedPlan(pub Result<Vec<PlanDay>, ExternalServiceError>);

    #[async_trait]
    impl PlanGenerator for FixedPlan {
        async fn generate(&self, _request: &PlanRequest) -> Result<Vec<PlanDay>, ExternalServiceError> {
            self.0.clone()
        }
    }

    pub(crate) fn create_request(days: u8) -> PlanRequest {
        PlanRequest {
            goal: "strength".to_string(),
            experience_level: ExperienceLevel::Beginner,
            days_per_week: days,
            equipment: vec!["barbell".to_string()],
        }
    }

    pub(crate) fn create_day(day: &str, focus: &str, exercises: &[(&str, u32, u32)]) -> PlanDay {
        PlanDay {
            day: day.to_string(),
            focus: focus.to_string(),
            exercises: exercises
                .iter()
                .map(|(name, sets, reps)| RoutineExercise {
                    name: name.to_string(),
                    sets: *sets,
                    reps: *reps,
                })
                .collect(),
        }
    }

    #[test]
    fn test_routines_from_plan() {
        let days = vec![
            create_day("Monday", "Push", &[("Bench Press", 3, 5), ("Dips", 3, 10)]),
            create_day("Wednesday", "Rest", &[]),
            create_day("Friday", "Legs", &[("Squat", 5, 5)]),
        ];
        let routines = routines_from_plan(&days);
        assert_eq!(routines.len(), 2);
        assert_eq!(routines[0].name, "Monday - Push");
        assert_eq!(routines[0].exercises.len(), 2);
        assert_eq!(routines[1].name, "Friday - Legs");
        assert!(routines.iter().all(|r| r.validate().is_ok()));
    }

    #[tokio::test]
    async fn test_generate_routines() {
        let generator = FixedPlan(Ok(vec![create_day("Day 1", "Full body", &[("Squat", 3, 8)])]));
        let routines = generate_routines(&generator, &create_request(3)).await.unwrap();
        assert_eq!(routines.len(), 1);
    }

    #[tokio::test]
    async fn test_generator_failure_passes_through() {
        let generator = FixedPlan(Err(ExternalServiceError::PlanGenerator("quota".to_string())));
        let err = generate_routines(&generator, &create_request(3)).await.unwrap_err();
        assert_eq!(err, ExternalServiceError::PlanGenerator("quota".to_string()));
    }

    #[tokio::test]
    async fn test_request_is_checked_before_calling() {
        let generator = FixedPlan(Ok(vec![create_day("Day 1", "Full body", &[("Squat", 3, 8)])]));
        assert!(generate_routines(&generator, &create_request(0)).await.is_err());
        assert!(generate_routines(&generator, &create_request(8)).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_plan_is_an_error() {
        let generator = FixedPlan(Ok(vec![]));
        assert!(generate_routines(&generator, &create_request(3)).await.is_err());
    }
}
