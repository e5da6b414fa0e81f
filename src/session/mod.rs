//! Active session lifecycle
//!
//! `Idle -> Active(New)` on start or on the first logged exercise,
//! `Idle -> Active(Editing)` when a stored session is opened for editing,
//! back to `Idle` on commit or cancel. New sessions auto-commit after
//! `session_timeout_minutes` without activity; editing sessions never do.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

use crate::error::ValidationError;
use crate::model::{Dataset, Exercise, ExerciseSpec, Routine, Session, SessionPatch, Settings, new_id};

/// Wall clock used for timestamps and durations
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    New,
    Editing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSession {
    pub session: Session,
    pub mode: SessionMode,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum SessionState {
    #[default]
    Idle,
    Active(ActiveSession),
}

/// Delivered to the event loop by the inactivity timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    InactivityTimeout { generation: u64 },
}

/// A session that just landed in the dataset
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub session: Session,
    /// false when an existing session was edited
    pub is_new: bool,
}

/// Single pending timer. Re-arming aborts the previous task and bumps the
/// generation, so a late event from an aborted task is ignored.
struct InactivityTimer {
    events: UnboundedSender<SessionEvent>,
    timeout: Duration,
    pending: Option<JoinHandle<()>>,
    generation: u64,
    last_activity: Option<Instant>,
}

impl InactivityTimer {
    fn new(events: UnboundedSender<SessionEvent>, timeout: Duration) -> Self {
        Self {
            events,
            timeout,
            pending: None,
            generation: 0,
            last_activity: None,
        }
    }

    /// Record activity now and schedule the timeout from here
    fn touch(&mut self) {
        let now = Instant::now();
        self.last_activity = Some(now);
        self.schedule(now + self.timeout);
    }

    fn schedule(&mut self, deadline: Instant) {
        self.cancel_pending();
        self.generation += 1;
        let generation = self.generation;
        let events = self.events.clone();
        self.pending = Some(tokio::spawn(async move {
            sleep_until(deadline).await;
            let _ = events.send(SessionEvent::InactivityTimeout { generation });
        }));
    }

    /// New timeout applied to the wait that is already running
    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        if let (Some(_), Some(last)) = (&self.pending, self.last_activity) {
            self.schedule(last + timeout);
        }
    }

    fn disarm(&mut self) {
        self.cancel_pending();
        self.generation += 1;
        self.last_activity = None;
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.pending.is_some() && self.generation == generation
    }

    fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        self.last_activity.map(|last| last + self.timeout)
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

/// Owns the in-progress session and its inactivity timer
pub struct SessionController {
    state: SessionState,
    clock: Arc<dyn Clock>,
    timer: InactivityTimer,
}

impl SessionController {
    pub fn new(events: UnboundedSender<SessionEvent>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            state: SessionState::Idle,
            clock,
            timer: InactivityTimer::new(events, timeout),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        match &self.state {
            SessionState::Active(active) => Some(active),
            SessionState::Idle => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, SessionState::Idle)
    }

    /// When the pending auto-commit will fire, if one is armed
    pub fn auto_commit_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Open an empty new session, committing any active one first
    pub fn start_empty(&mut self, dataset: &mut Dataset) -> Option<Committed> {
        let displaced = self.commit(dataset);
        self.begin_new(Vec::new());
        displaced
    }

    /// Open a new session seeded from a routine template
    pub fn start_from_routine(
        &mut self,
        routine: &Routine,
        settings: &Settings,
        dataset: &mut Dataset,
    ) -> Option<Committed> {
        let displaced = self.commit(dataset);
        let exercises = routine
            .exercises
            .iter()
            .map(|e| Exercise {
                id: new_id(),
                name: e.name.clone(),
                sets: e.sets,
                reps: e.reps,
                weight: settings.default_weight,
                unit: settings.default_unit,
            })
            .collect();
        self.begin_new(exercises);
        if let SessionState::Active(active) = &mut self.state {
            active.session.name = Some(routine.name.clone());
        }
        displaced
    }

    fn begin_new(&mut self, exercises: Vec<Exercise>) {
        let now = self.clock.now();
        let mut session = Session::active(now);
        session.exercises = exercises;
        self.state = SessionState::Active(ActiveSession {
            session,
            mode: SessionMode::New,
            started_at: now,
        });
        self.timer.touch();
        info!("Session started");
    }

    /// Log an exercise. Starts a new session when idle; a row with the same
    /// name, weight, unit and reps gets its sets bumped instead of a new row.
    pub fn add_exercise(&mut self, spec: ExerciseSpec) -> Result<(), ValidationError> {
        spec.validate()?;

        if self.is_idle() {
            self.begin_new(vec![spec.into_exercise()]);
            return Ok(());
        }

        if let SessionState::Active(active) = &mut self.state {
            match active.session.exercises.iter_mut().find(|e| e.same_load(&spec)) {
                Some(row) => row.sets = row.sets.saturating_add(spec.sets),
                None => active.session.exercises.push(spec.into_exercise()),
            }
            if active.mode == SessionMode::New {
                self.timer.touch();
            }
        }
        Ok(())
    }

    /// Shallow-merge fields into the active session. Returns false when idle.
    pub fn update_fields(&mut self, patch: SessionPatch) -> bool {
        let SessionState::Active(active) = &mut self.state else {
            return false;
        };

        let session = &mut active.session;
        if let Some(name) = patch.name {
            session.name = Some(name).filter(|n| !n.trim().is_empty());
        }
        if let Some(notes) = patch.notes {
            session.notes = notes;
        }
        if let Some(equipment) = patch.equipment {
            session.equipment = equipment;
        }
        if let Some(warmup) = patch.warmup {
            session.warmup = warmup;
        }
        if let Some(timestamp) = patch.timestamp {
            session.timestamp = timestamp;
        }
        // new sessions get their duration stamped at commit
        if active.mode == SessionMode::Editing {
            if let Some(minutes) = patch.duration_minutes {
                session.duration_minutes = Some(minutes.max(0));
            }
        }

        if active.mode == SessionMode::New {
            self.timer.touch();
        }
        true
    }

    /// Remove one exercise row from the active session
    pub fn remove_exercise(&mut self, exercise_id: &str) -> bool {
        let SessionState::Active(active) = &mut self.state else {
            return false;
        };
        let before = active.session.exercises.len();
        active.session.exercises.retain(|e| e.id != exercise_id);
        let removed = active.session.exercises.len() != before;
        if removed && active.mode == SessionMode::New {
            self.timer.touch();
        }
        removed
    }

    /// Load a stored session for editing. Whatever is active is committed first.
    pub fn start_editing(
        &mut self,
        session_id: &str,
        dataset: &mut Dataset,
    ) -> Result<Option<Committed>, ValidationError> {
        if dataset.session(session_id).is_none() {
            return Err(ValidationError::InvalidValue {
                field: "sessionId",
                reason: format!("no session with id {}", session_id),
            });
        }

        let displaced = self.commit(dataset);
        let Some(session) = dataset.session(session_id).cloned() else {
            return Ok(displaced);
        };

        self.timer.disarm();
        self.state = SessionState::Active(ActiveSession {
            started_at: session.timestamp,
            session,
            mode: SessionMode::Editing,
        });
        info!("Editing session {}", session_id);
        Ok(displaced)
    }

    /// Finalize the active session into the dataset. An empty session is dropped.
    pub fn commit(&mut self, dataset: &mut Dataset) -> Option<Committed> {
        let SessionState::Active(active) = std::mem::take(&mut self.state) else {
            return None;
        };
        self.timer.disarm();

        if active.session.exercises.is_empty() {
            debug!("Discarded empty session");
            return None;
        }

        let mut session = active.session;
        let is_new = active.mode == SessionMode::New;
        if is_new {
            let elapsed_ms = (self.clock.now() - active.started_at).num_milliseconds();
            session.duration_minutes = Some((elapsed_ms as f64 / 60_000.0).round().max(0.0) as i64);
            session.id = new_id();
        }

        dataset.upsert_session(session.clone());
        info!(
            "Session {} committed ({} exercises, {} min)",
            session.id,
            session.exercises.len(),
            session.duration_minutes.unwrap_or(0)
        );
        Some(Committed { session, is_new })
    }

    /// Drop the active session without saving it
    pub fn cancel(&mut self) -> Option<Session> {
        let SessionState::Active(active) = std::mem::take(&mut self.state) else {
            return None;
        };
        self.timer.disarm();
        info!("Session cancelled");
        Some(active.session)
    }

    /// Change the inactivity timeout. A running wait is re-armed from the
    /// last activity with the new value.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timer.set_timeout(timeout);
    }

    /// Feed a timer event back in. Stale events are ignored.
    pub fn handle_event(&mut self, event: SessionEvent, dataset: &mut Dataset) -> Option<Committed> {
        match event {
            SessionEvent::InactivityTimeout { generation } => {
                let is_new = matches!(
                    &self.state,
                    SessionState::Active(ActiveSession { mode: SessionMode::New, .. })
                );
                if !self.timer.is_current(generation) || !is_new {
                    debug!("Ignoring stale inactivity timeout {}", generation);
                    return None;
                }
                info!("Session inactive, auto-committing");
                self.commit(dataset)
            }
        }
    }
}
