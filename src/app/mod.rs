//! App state - which dataset is current, and where its mutations go
//!
//! Exactly one mode is active. Switching modes replaces the dataset
//! wholesale; the active session is committed into the old mode first.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::db::{read_json, write_json};
use crate::error::{AuthError, Result, SyncError, ValidationError};
use crate::merge;
use crate::model::{ACTIVE_SESSION_ID, Dataset, ExerciseSpec, HealthEntry, Routine, RoutineExercise, Session, SessionPatch, Settings, new_id};
use crate::plan::{PlanGenerator, PlanRequest, generate_routines};
use crate::profile::{Profile, ProfileStore, RecoveryKit};
use crate::session::{Clock, Committed, SessionController, SessionEvent};
use crate::sync::{FirstSyncChoice, FitnessSink, RemoteStore, SyncOrchestrator, SyncStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Unauthenticated,
    LocalProfile { profile_id: String },
    CloudAccount { account: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInOutcome {
    SignedIn,
    /// Local data exists; ask whether to merge it or let the remote overwrite it
    ChoiceRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    Replace,
    /// Current data is local, the file is remote
    Merge,
}

/// Cloud account to show cached data for on the next start
const CLOUD_ACCOUNT_KEY: &str = "cloud_account";

fn cloud_cache_key(account: &str) -> String {
    format!("cloud_cache:{}", account)
}

fn cloud_settings_key(account: &str) -> String {
    format!("cloud_settings:{}", account)
}

// Imported files are untrusted: every record must be one the app could have
// committed itself. Duplicate ids keep their last occurrence.
fn checked_import(dataset: Dataset) -> Result<Dataset, ValidationError> {
    for session in &dataset.sessions {
        if session.id.trim().is_empty() || session.id == ACTIVE_SESSION_ID {
            return Err(ValidationError::InvalidValue {
                field: "sessions",
                reason: format!("invalid session id '{}'", session.id),
            });
        }
        if session.exercises.is_empty() {
            return Err(ValidationError::EmptySession);
        }
    }
    for entry in &dataset.health_entries {
        if entry.id.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "healthEntries",
                reason: "missing id".to_string(),
            });
        }
        entry.validate()?;
    }
    for routine in &dataset.routines {
        if routine.id.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "routines",
                reason: "missing id".to_string(),
            });
        }
        routine.validate()?;
    }
    Ok(merge::merge(&Dataset::default(), &dataset))
}

pub struct App {
    profiles: ProfileStore,
    mode: Mode,
    dataset: Dataset,
    settings: Settings,
    sessions: SessionController,
    cloud: Option<SyncOrchestrator>,
    // orchestrators of cloud sessions left during this run, still draining
    retired: Vec<SyncOrchestrator>,
}

impl App {
    /// Resumes the active local profile if one is recorded, otherwise the
    /// cached data of the last cloud account (offline until it signs in again)
    pub fn new(profiles: ProfileStore, events: UnboundedSender<SessionEvent>, clock: Arc<dyn Clock>) -> Self {
        let settings = Settings::default();
        let sessions = SessionController::new(events, clock, settings.session_timeout());
        let mut app = Self {
            profiles,
            mode: Mode::Unauthenticated,
            dataset: Dataset::default(),
            settings,
            sessions,
            cloud: None,
            retired: Vec::new(),
        };
        if let Some(profile) = app.profiles.active().cloned() {
            app.load_profile(profile);
        } else if let Err(e) = app.resume_cloud_cache() {
            warn!("Could not restore cached cloud data: {}", e);
        }
        app
    }

    fn resume_cloud_cache(&mut self) -> Result<()> {
        let Some(account) = read_json::<String>(self.profiles.map(), CLOUD_ACCOUNT_KEY)? else {
            return Ok(());
        };
        let dataset: Dataset = read_json(self.profiles.map(), &cloud_cache_key(&account))?.unwrap_or_default();
        let settings: Settings = read_json(self.profiles.map(), &cloud_settings_key(&account))?.unwrap_or_default();
        info!("Showing cached cloud data until the account reconnects");
        self.mode = Mode::CloudAccount { account };
        self.dataset = dataset;
        self.apply_settings(settings);
        Ok(())
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn session(&self) -> &SessionController {
        &self.sessions
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    /// `None` unless signed in to a cloud account
    pub fn sync_status(&self) -> Option<SyncStatus> {
        self.cloud.as_ref().map(SyncOrchestrator::status)
    }

    pub fn subscribe_sync(&self) -> Option<tokio::sync::watch::Receiver<SyncStatus>> {
        self.cloud.as_ref().map(SyncOrchestrator::subscribe)
    }

    fn load_profile(&mut self, profile: Profile) {
        info!("Using local profile {}", profile.id);
        self.mode = Mode::LocalProfile { profile_id: profile.id };
        self.dataset = profile.dataset;
        self.apply_settings(profile.settings);
    }

    fn apply_settings(&mut self, settings: Settings) {
        self.sessions.set_timeout(settings.session_timeout());
        self.settings = settings;
    }

    /// Write the current dataset and settings wherever the mode keeps them
    fn persist(&mut self) -> Result<()> {
        match &self.mode {
            Mode::Unauthenticated => {}
            Mode::LocalProfile { profile_id } => {
                let dataset = self.dataset.clone();
                let settings = self.settings.clone();
                let found = self.profiles.update(profile_id, |p| Profile {
                    dataset,
                    settings,
                    ..p
                })?;
                if !found {
                    warn!("Active profile {} no longer exists", profile_id);
                }
            }
            Mode::CloudAccount { account } => {
                let map = self.profiles.map();
                write_json(map, &cloud_cache_key(account), &self.dataset)?;
                write_json(map, &cloud_settings_key(account), &self.settings)?;
                if let Some(cloud) = &self.cloud {
                    cloud.push(&self.dataset);
                }
            }
        }
        Ok(())
    }

    /// Replace in-memory state if another tab or process changed storage
    pub fn refresh_from_storage(&mut self) -> Result<bool> {
        if !self.profiles.refresh_if_changed()? {
            return Ok(false);
        }
        let Mode::LocalProfile { profile_id } = self.mode.clone() else {
            return Ok(true);
        };

        match self.profiles.active().cloned() {
            Some(profile) if profile.id == profile_id => {
                self.dataset = profile.dataset;
                self.apply_settings(profile.settings);
            }
            Some(profile) => {
                self.commit_into_stored_profile(&profile_id)?;
                self.load_profile(profile);
            }
            None => {
                info!("Profile left in another window, signing out");
                self.commit_into_stored_profile(&profile_id)?;
                self.mode = Mode::Unauthenticated;
                self.dataset = Dataset::default();
                self.apply_settings(Settings::default());
            }
        }
        Ok(true)
    }

    // The in-memory dataset may be stale here, so the session is committed
    // onto what storage holds. A profile deleted elsewhere takes it along.
    fn commit_into_stored_profile(&mut self, profile_id: &str) -> Result<()> {
        let Some(mut dataset) = self.profiles.get(profile_id).map(|p| p.dataset.clone()) else {
            self.sessions.cancel();
            return Ok(());
        };
        if let Some(committed) = self.sessions.commit(&mut dataset) {
            self.profiles.update(profile_id, |p| Profile { dataset, ..p })?;
            info!("Saved session {} before leaving profile {}", committed.session.id, profile_id);
        }
        Ok(())
    }

    fn on_committed(&mut self, committed: Option<Committed>) -> Result<Option<Session>> {
        let Some(committed) = committed else {
            return Ok(None);
        };
        self.persist()?;
        if committed.is_new {
            if let Some(cloud) = &self.cloud {
                cloud.notify_session(&committed.session);
            }
        }
        Ok(Some(committed.session))
    }

    // ---- profiles ----

    /// Create a profile and switch to it. The kit is the only copy of the code.
    pub fn register(&mut self, username: &str, password: &str) -> Result<RecoveryKit> {
        self.refresh_from_storage()?;
        let registration = self.profiles.register(username, password)?;
        self.enter_profile(registration.profile)?;
        Ok(registration.recovery_kit)
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.refresh_from_storage()?;
        let profile = self.profiles.authenticate(username, password)?;
        self.enter_profile(profile)
    }

    fn enter_profile(&mut self, profile: Profile) -> Result<()> {
        self.leave_current_mode()?;
        self.profiles.set_active(&profile.id)?;
        self.load_profile(profile);
        Ok(())
    }

    // commits into the outgoing mode so nothing logged is lost
    fn leave_current_mode(&mut self) -> Result<()> {
        let committed = self.sessions.commit(&mut self.dataset);
        self.on_committed(committed)?;
        if matches!(self.mode, Mode::CloudAccount { .. }) {
            self.profiles.map().remove(CLOUD_ACCOUNT_KEY)?;
        }
        self.retire_cloud();
        Ok(())
    }

    // queued pushes still land; see `flush_sync`
    fn retire_cloud(&mut self) {
        if let Some(cloud) = self.cloud.take() {
            self.retired.push(cloud);
        }
    }

    /// Wait for queued uploads, including those of cloud accounts left during
    /// this run. Returns the last status seen.
    pub async fn flush_sync(&mut self) -> Option<SyncStatus> {
        let mut last = None;
        for cloud in std::mem::take(&mut self.retired) {
            last = Some(cloud.shutdown().await);
        }
        if let Some(cloud) = &self.cloud {
            last = Some(cloud.settle().await);
        }
        last
    }

    pub fn logout(&mut self) -> Result<()> {
        self.leave_current_mode()?;
        if matches!(self.mode, Mode::LocalProfile { .. }) {
            self.profiles.sign_out()?;
        }
        self.mode = Mode::Unauthenticated;
        self.dataset = Dataset::default();
        self.apply_settings(Settings::default());
        info!("Signed out");
        Ok(())
    }

    pub fn reset_password(&mut self, username: &str, code: &str, new_password: &str) -> Result<()> {
        if !self.profiles.reset_password(username, code, new_password)? {
            return Err(AuthError::InvalidRecoveryCode.into());
        }
        Ok(())
    }

    pub fn reset_password_with_kit(&mut self, kit_text: &str, new_password: &str) -> Result<()> {
        if !self.profiles.reset_password_with_kit(kit_text, new_password)? {
            return Err(AuthError::InvalidRecoveryCode.into());
        }
        Ok(())
    }

    /// Delete the active local profile and everything it owns
    pub fn delete_active_profile(&mut self) -> Result<bool> {
        let Mode::LocalProfile { profile_id } = self.mode.clone() else {
            return Ok(false);
        };
        self.sessions.cancel();
        let deleted = self.profiles.delete(&profile_id)?;
        self.mode = Mode::Unauthenticated;
        self.dataset = Dataset::default();
        self.apply_settings(Settings::default());
        Ok(deleted)
    }

    /// Full application reset
    pub fn reset_app(&mut self) -> Result<()> {
        self.sessions.cancel();
        self.retire_cloud();
        self.profiles.reset_all()?;
        self.mode = Mode::Unauthenticated;
        self.dataset = Dataset::default();
        self.apply_settings(Settings::default());
        Ok(())
    }

    // ---- cloud ----

    /// Sign in to a cloud account and reconcile with its remote document.
    /// With local data present and no `choice`, nothing changes and
    /// [`SignInOutcome::ChoiceRequired`] is returned. The account's cached
    /// dataset is always merged in, so changes made offline reach the remote.
    pub async fn sign_in_cloud(
        &mut self,
        account: &str,
        remote: Arc<dyn RemoteStore>,
        sink: Arc<dyn FitnessSink>,
        choice: Option<FirstSyncChoice>,
    ) -> Result<SignInOutcome> {
        self.refresh_from_storage()?;
        let committed = self.sessions.commit(&mut self.dataset);
        self.on_committed(committed)?;

        let resuming = matches!(&self.mode, Mode::CloudAccount { account: current } if current.as_str() == account);
        let guest = match self.mode {
            Mode::CloudAccount { .. } => Dataset::default(),
            _ => self.dataset.clone(),
        };
        if !guest.is_empty() && choice.is_none() {
            return Ok(SignInOutcome::ChoiceRequired);
        }

        let cached: Option<Dataset> = if resuming {
            Some(self.dataset.clone())
        } else {
            read_json(self.profiles.map(), &cloud_cache_key(account))?
        };
        let choice = choice.unwrap_or(FirstSyncChoice::Merge);
        let (local, choice) = match (cached, choice) {
            (Some(cached), FirstSyncChoice::Merge) => (merge::merge(&cached, &guest), FirstSyncChoice::Merge),
            (Some(cached), FirstSyncChoice::Overwrite) => (cached, FirstSyncChoice::Merge),
            (None, choice) => (guest, choice),
        };

        let orchestrator = SyncOrchestrator::new(remote, sink);
        let reconciled = orchestrator.sign_in(&local, choice).await?;

        self.retire_cloud();
        if matches!(self.mode, Mode::LocalProfile { .. }) {
            self.profiles.sign_out()?;
        }
        let settings: Settings = read_json(self.profiles.map(), &cloud_settings_key(account))?.unwrap_or_default();
        self.mode = Mode::CloudAccount {
            account: account.to_string(),
        };
        self.dataset = reconciled;
        self.apply_settings(settings);
        write_json(self.profiles.map(), &cloud_cache_key(account), &self.dataset)?;
        write_json(self.profiles.map(), CLOUD_ACCOUNT_KEY, account)?;
        self.cloud = Some(orchestrator);
        info!("Signed in to cloud account");
        Ok(SignInOutcome::SignedIn)
    }

    /// Manual sync: reconcile with the remote document and push the result
    pub async fn sync_now(&mut self) -> Result<()> {
        let (Mode::CloudAccount { account }, Some(cloud)) = (&self.mode, &self.cloud) else {
            return Err(SyncError::NotSignedIn.into());
        };
        let reconciled = cloud.sync_now(&self.dataset).await?;
        write_json(self.profiles.map(), &cloud_cache_key(account), &reconciled)?;
        self.dataset = reconciled;
        Ok(())
    }

    // ---- active session ----

    pub fn start_session(&mut self) -> Result<Option<Session>> {
        self.refresh_from_storage()?;
        let displaced = self.sessions.start_empty(&mut self.dataset);
        self.on_committed(displaced)
    }

    pub fn start_routine(&mut self, routine_id: &str) -> Result<Option<Session>> {
        self.refresh_from_storage()?;
        let Some(routine) = self.dataset.routines.iter().find(|r| r.id == routine_id).cloned() else {
            return Err(ValidationError::InvalidValue {
                field: "routineId",
                reason: format!("no routine with id {}", routine_id),
            }
            .into());
        };
        let displaced = self
            .sessions
            .start_from_routine(&routine, &self.settings, &mut self.dataset);
        self.on_committed(displaced)
    }

    pub fn add_exercise(&mut self, spec: ExerciseSpec) -> Result<()> {
        self.refresh_from_storage()?;
        self.sessions.add_exercise(spec)?;
        Ok(())
    }

    /// Log one round of `name` using the default set count
    pub fn log_exercise(&mut self, name: &str, reps: u32, weight: f64) -> Result<()> {
        let spec = ExerciseSpec::new(name, self.settings.default_sets, reps, weight, self.settings.default_unit);
        self.add_exercise(spec)
    }

    pub fn update_session(&mut self, patch: SessionPatch) -> bool {
        self.sessions.update_fields(patch)
    }

    pub fn remove_exercise(&mut self, exercise_id: &str) -> bool {
        self.sessions.remove_exercise(exercise_id)
    }

    pub fn edit_session(&mut self, session_id: &str) -> Result<Option<Session>> {
        self.refresh_from_storage()?;
        let displaced = self.sessions.start_editing(session_id, &mut self.dataset)?;
        self.on_committed(displaced)
    }

    pub fn commit_session(&mut self) -> Result<Option<Session>> {
        self.refresh_from_storage()?;
        let committed = self.sessions.commit(&mut self.dataset);
        self.on_committed(committed)
    }

    pub fn cancel_session(&mut self) -> Option<Session> {
        self.sessions.cancel()
    }

    /// Feed a timer event from the event loop
    pub fn handle_session_event(&mut self, event: SessionEvent) -> Result<Option<Session>> {
        self.refresh_from_storage()?;
        let committed = self.sessions.handle_event(event, &mut self.dataset);
        self.on_committed(committed)
    }

    // ---- dataset ----

    pub fn delete_session(&mut self, session_id: &str) -> Result<bool> {
        self.refresh_from_storage()?;
        if self.sessions.active().is_some_and(|a| a.session.id == session_id) {
            self.sessions.cancel();
        }
        if !self.dataset.remove_session(session_id) {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    pub fn add_health_entry(&mut self, mut entry: HealthEntry) -> Result<HealthEntry> {
        self.refresh_from_storage()?;
        entry.validate()?;
        if entry.id.is_empty() {
            entry.id = new_id();
        }
        self.dataset.health_entries.push(entry.clone());
        self.persist()?;
        if let Some(cloud) = &self.cloud {
            cloud.notify_health(&entry);
        }
        Ok(entry)
    }

    pub fn delete_health_entry(&mut self, entry_id: &str) -> Result<bool> {
        self.refresh_from_storage()?;
        if !self.dataset.remove_health_entry(entry_id) {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    pub fn add_routine(&mut self, name: &str, exercises: Vec<RoutineExercise>) -> Result<Routine> {
        self.refresh_from_storage()?;
        let routine = Routine {
            id: new_id(),
            name: name.trim().to_string(),
            exercises,
        };
        routine.validate()?;
        self.dataset.routines.push(routine.clone());
        self.persist()?;
        Ok(routine)
    }

    pub fn delete_routine(&mut self, routine_id: &str) -> Result<bool> {
        self.refresh_from_storage()?;
        if !self.dataset.remove_routine(routine_id) {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    /// Generate a plan and store it as routines. Generator failures leave state alone.
    pub async fn add_generated_plan(
        &mut self,
        generator: &dyn PlanGenerator,
        request: &PlanRequest,
    ) -> Result<Vec<Routine>> {
        let routines = generate_routines(generator, request).await?;
        self.refresh_from_storage()?;
        self.dataset.routines.extend(routines.iter().cloned());
        self.persist()?;
        Ok(routines)
    }

    pub fn update_settings(&mut self, settings: Settings) -> Result<()> {
        self.refresh_from_storage()?;
        settings.validate()?;
        self.apply_settings(settings);
        self.persist()
    }

    /// Pretty JSON backup of the current dataset
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.dataset)?)
    }

    pub fn import_json(&mut self, json: &str, mode: ImportMode) -> Result<()> {
        let imported = checked_import(serde_json::from_str(json)?)?;
        self.refresh_from_storage()?;
        self.dataset = match mode {
            ImportMode::Replace => merge::replace(&self.dataset, &imported),
            ImportMode::Merge => merge::merge(&self.dataset, &imported),
        };
        info!("Imported {} sessions", imported.sessions.len());
        self.persist()
    }

    /// Drop every record of the current dataset (the profile itself stays)
    pub fn wipe_data(&mut self) -> Result<()> {
        self.refresh_from_storage()?;
        self.sessions.cancel();
        self.dataset = Dataset::default();
        self.persist()
    }
}
