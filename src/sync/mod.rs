//! Cloud sync - remote document store, fitness log sink and the orchestration between them
//!
//! The in-memory dataset is always updated first. Pushing it to the remote
//! store and notifying the fitness sink happen in the background; their
//! failures only show up in [`SyncStatus`] and the log.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{ExternalServiceError, SyncError};
use crate::merge;
use crate::model::{Dataset, HealthEntry, Session};

/// Per-account document holding the whole dataset
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// `None` means there is no backup yet
    async fn read(&self) -> Result<Option<Dataset>, SyncError>;

    async fn write(&self, dataset: &Dataset) -> Result<(), SyncError>;
}

/// Fitness platform log. Best effort only.
#[async_trait]
pub trait FitnessSink: Send + Sync {
    async fn log_weight(&self, entry: &WeightLog) -> Result<(), ExternalServiceError>;

    async fn log_session(&self, session: &SessionLog) -> Result<(), ExternalServiceError>;
}

/// Bodyweight reading, always in kg
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeightLog {
    pub timestamp: DateTime<Utc>,
    pub kilograms: f64,
}

impl WeightLog {
    pub fn from_entry(entry: &HealthEntry) -> Option<Self> {
        Some(Self {
            timestamp: entry.timestamp,
            kilograms: entry.bodyweight_kg()?,
        })
    }
}

/// Finished workout as the fitness platform sees it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionLog {
    pub id: String,
    pub name: String,
    pub start: DateTime<Utc>,
    pub duration_minutes: i64,
    pub total_volume_kg: f64,
    pub exercise_count: usize,
}

impl SessionLog {
    /// Sessions without a positive duration are not logged
    pub fn from_session(session: &Session) -> Option<Self> {
        let duration_minutes = session.duration_minutes.filter(|m| *m > 0)?;
        Some(Self {
            id: session.id.clone(),
            name: session.name.clone().unwrap_or_else(|| "Workout".to_string()),
            start: session.timestamp,
            duration_minutes,
            total_volume_kg: session.volume_kg(),
            exercise_count: session.exercises.len(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Synced { at: DateTime<Utc> },
    Failed { reason: String },
}

/// What to do with a non-empty local dataset at cloud sign-in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstSyncChoice {
    /// Keep both, remote wins on collisions
    Merge,
    /// Local data is throwaway; take the remote document as is
    Overwrite,
}

/// Routes committed mutations to the remote store and the fitness sink
pub struct SyncOrchestrator {
    remote: Arc<dyn RemoteStore>,
    sink: Arc<dyn FitnessSink>,
    status: Arc<watch::Sender<SyncStatus>>,
    pushes: mpsc::UnboundedSender<(u64, Dataset)>,
    // sequence number of the newest queued snapshot
    pushed: Arc<AtomicU64>,
    writer: JoinHandle<()>,
}

impl SyncOrchestrator {
    /// Must be called inside a tokio runtime; spawns the writer task
    pub fn new(remote: Arc<dyn RemoteStore>, sink: Arc<dyn FitnessSink>) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        let status = Arc::new(status);
        let (pushes, rx) = mpsc::unbounded_channel();
        let pushed = Arc::new(AtomicU64::new(0));
        let writer = tokio::spawn(writer_task(remote.clone(), status.clone(), pushed.clone(), rx));
        Self {
            remote,
            sink,
            status,
            pushes,
            pushed,
            writer,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Queue the full dataset for upload. Never blocks.
    pub fn push(&self, dataset: &Dataset) {
        let seq = self.pushed.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_replace(SyncStatus::Syncing);
        if self.pushes.send((seq, dataset.clone())).is_err() {
            warn!("Sync writer is gone, dropping push");
            self.status.send_replace(SyncStatus::Failed {
                reason: "sync writer stopped".to_string(),
            });
        }
    }

    /// Fetch the remote document and reconcile it with `local`. The result
    /// is pushed back so both sides converge.
    pub async fn sign_in(&self, local: &Dataset, choice: FirstSyncChoice) -> Result<Dataset, SyncError> {
        self.status.send_replace(SyncStatus::Syncing);

        let remote = match self.remote.read().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Failed to fetch remote dataset: {}", e);
                self.status.send_replace(SyncStatus::Failed { reason: e.to_string() });
                return Err(e);
            }
        };

        let reconciled = match (remote, choice) {
            (Some(remote), FirstSyncChoice::Merge) => merge::merge(local, &remote),
            (Some(remote), FirstSyncChoice::Overwrite) => merge::replace(local, &remote),
            (None, FirstSyncChoice::Merge) => local.clone(),
            (None, FirstSyncChoice::Overwrite) => Dataset::default(),
        };
        info!(
            "Reconciled with remote: {} sessions, {} health entries, {} routines",
            reconciled.sessions.len(),
            reconciled.health_entries.len(),
            reconciled.routines.len()
        );

        self.push(&reconciled);
        Ok(reconciled)
    }

    /// Wait until nothing is queued or in flight
    pub async fn settle(&self) -> SyncStatus {
        let mut status = self.status.subscribe();
        match status.wait_for(|s| !matches!(s, SyncStatus::Syncing)).await {
            Ok(settled) => (*settled).clone(),
            Err(_) => self.status(),
        }
    }

    /// Stop accepting pushes and wait for the writer to drain the queue
    pub async fn shutdown(self) -> SyncStatus {
        let Self {
            status,
            pushes,
            writer,
            ..
        } = self;
        drop(pushes);
        if let Err(e) = writer.await {
            warn!("Sync writer ended abnormally: {}", e);
        }
        status.borrow().clone()
    }

    /// Manual "sync now"
    pub async fn sync_now(&self, local: &Dataset) -> Result<Dataset, SyncError> {
        self.sign_in(local, FirstSyncChoice::Merge).await
    }

    /// Forward a finished session to the fitness sink in the background
    pub fn notify_session(&self, session: &Session) {
        let Some(log) = SessionLog::from_session(session) else {
            return;
        };
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.log_session(&log).await {
                warn!("Fitness sink rejected session {}: {}", log.id, e);
            }
        });
    }

    /// Forward a new bodyweight reading to the fitness sink in the background
    pub fn notify_health(&self, entry: &HealthEntry) {
        let Some(log) = WeightLog::from_entry(entry) else {
            return;
        };
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.log_weight(&log).await {
                warn!("Fitness sink rejected weight entry: {}", e);
            }
        });
    }
}

// Writes are serialised and queued snapshots collapse to the newest one.
// An outcome is only published if no newer push arrived meanwhile; the
// check runs under the watch lock that `push` also takes to set Syncing.
async fn writer_task(
    remote: Arc<dyn RemoteStore>,
    status: Arc<watch::Sender<SyncStatus>>,
    pushed: Arc<AtomicU64>,
    mut rx: mpsc::UnboundedReceiver<(u64, Dataset)>,
) {
    while let Some(mut latest) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            latest = newer;
        }
        let (seq, dataset) = latest;

        let outcome = match remote.write(&dataset).await {
            Ok(()) => SyncStatus::Synced { at: Utc::now() },
            Err(e) => {
                warn!("Failed to push dataset: {}", e);
                SyncStatus::Failed { reason: e.to_string() }
            }
        };
        status.send_if_modified(|current| {
            if pushed.load(Ordering::SeqCst) != seq {
                return false;
            }
            *current = outcome;
            true
        });
    }
}

/// Remote document kept as `<dir>/<account>.json`
pub struct FileRemoteStore {
    path: PathBuf,
}

impl FileRemoteStore {
    pub fn new(dir: impl AsRef<Path>, account: &str) -> Self {
        let file: String = account
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self {
            path: dir.as_ref().join(format!("{}.json", file)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RemoteStore for FileRemoteStore {
    async fn read(&self) -> Result<Option<Dataset>, SyncError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Unreachable(e.to_string())),
        }
    }

    async fn write(&self, dataset: &Dataset) -> Result<(), SyncError> {
        let bytes = serde_json::to_vec_pretty(dataset)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::Rejected(e.to_string()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SyncError::Rejected(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SyncError::Rejected(e.to_string()))?;
        Ok(())
    }
}

/// In-process remote, handy for tests and demos
#[derive(Default)]
pub struct MemoryRemoteStore {
    document: Mutex<Option<Dataset>>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn with_document(dataset: Dataset) -> Self {
        Self {
            document: Mutex::new(Some(dataset)),
            ..Default::default()
        }
    }

    pub fn document(&self) -> Option<Dataset> {
        self.document.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make every call fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn read(&self) -> Result<Option<Dataset>, SyncError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Unreachable("remote offline".to_string()));
        }
        Ok(self.document())
    }

    async fn write(&self, dataset: &Dataset) -> Result<(), SyncError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Rejected("remote offline".to_string()));
        }
        *self.document.lock().unwrap_or_else(|e| e.into_inner()) = Some(dataset.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Writes forwarded events to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl FitnessSink for TracingSink {
    async fn log_weight(&self, entry: &WeightLog) -> Result<(), ExternalServiceError> {
        info!("Fitness log: bodyweight {:.1} kg at {}", entry.kilograms, entry.timestamp);
        Ok(())
    }

    async fn log_session(&self, session: &SessionLog) -> Result<(), ExternalServiceError> {
        info!(
            "Fitness log: {} - {} min, {:.0} kg volume",
            session.name, session.duration_minutes, session.total_volume_kg
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl FitnessSink for NoopSink {
    async fn log_weight(&self, _entry: &WeightLog) -> Result<(), ExternalServiceError> {
        Ok(())
    }

    async fn log_session(&self, _session: &SessionLog) -> Result<(), ExternalServiceError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{ExerciseSpec, WeightUnit};
    use std::time::Duration;

    /// Records everything it is sent; optionally fails every call
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sessions: Mutex<Vec<SessionLog>>,
        pub weights: Mutex<Vec<WeightLog>>,
        pub failing: bool,
    }

    #[async_trait]
    impl FitnessSink for RecordingSink {
        async fn log_weight(&self, entry: &WeightLog) -> Result<(), ExternalServiceError> {
            self.weights.lock().unwrap().push(entry.clone());
            if self.failing {
                return Err(ExternalServiceError::FitnessSink("offline".to_string()));
            }
            Ok(())
        }

        async fn log_session(&self, session: &SessionLog) -> Result<(), ExternalServiceError> {
            self.sessions.lock().unwrap().push(session.clone());
            if self.failing {
                return Err(ExternalServiceError::FitnessSink("offline".to_string()));
            }
            Ok(())
        }
    }

    pub(crate) async fn settled(rx: &mut watch::Receiver<SyncStatus>) -> SyncStatus {
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| !matches!(s, SyncStatus::Syncing)),
        )
        .await
        .unwrap()
        .unwrap();
        (*status).clone()
    }

    fn create_session(id: &str, notes: &str, duration: Option<i64>) -> Session {
        let mut s = Session::active(Utc::now());
        s.id = id.to_string();
        s.notes = notes.to_string();
        s.duration_minutes = duration;
        s.exercises
            .push(ExerciseSpec::new("Deadlift", 1, 5, 225.0, WeightUnit::Lb).into_exercise());
        s
    }

    fn dataset_with(sessions: Vec<Session>) -> Dataset {
        Dataset {
            sessions,
            ..Default::default()
        }
    }

    #[test]
    fn test_session_log_requires_positive_duration() {
        assert!(SessionLog::from_session(&create_session("a", "", None)).is_none());
        assert!(SessionLog::from_session(&create_session("a", "", Some(0))).is_none());
        let log = SessionLog::from_session(&create_session("a", "", Some(45))).unwrap();
        assert_eq!(log.duration_minutes, 45);
        assert!((log.total_volume_kg - 5.0 * 225.0 * crate::model::LB_TO_KG).abs() < 1e-9);
    }

    #[test]
    fn test_weight_log_converts_to_kg() {
        let entry = HealthEntry {
            bodyweight: Some(200.0),
            bodyweight_unit: Some(WeightUnit::Lb),
            ..Default::default()
        };
        let log = WeightLog::from_entry(&entry).unwrap();
        assert!((log.kilograms - 90.7184).abs() < 1e-6);

        let no_weight = HealthEntry {
            sleep_hours: Some(8.0),
            ..Default::default()
        };
        assert!(WeightLog::from_entry(&no_weight).is_none());
    }

    #[tokio::test]
    async fn test_sign_in_merges_and_pushes_back() {
        let remote = Arc::new(MemoryRemoteStore::with_document(dataset_with(vec![
            create_session("100", "remote", Some(30)),
            create_session("200", "", Some(30)),
        ])));
        let orchestrator = SyncOrchestrator::new(remote.clone(), Arc::new(NoopSink));
        let mut status = orchestrator.subscribe();

        let local = dataset_with(vec![create_session("100", "local", Some(30))]);
        let merged = orchestrator.sign_in(&local, FirstSyncChoice::Merge).await.unwrap();

        assert_eq!(merged.sessions.len(), 2);
        assert_eq!(merged.session("100").unwrap().notes, "remote");
        assert!(matches!(settled(&mut status).await, SyncStatus::Synced { .. }));
        assert_eq!(remote.document(), Some(merged));
    }

    #[tokio::test]
    async fn test_sign_in_overwrite_drops_guest_data() {
        let remote = Arc::new(MemoryRemoteStore::with_document(dataset_with(vec![create_session(
            "mine", "", Some(30),
        )])));
        let orchestrator = SyncOrchestrator::new(remote, Arc::new(NoopSink));

        let guest = dataset_with(vec![create_session("guest", "", Some(30))]);
        let result = orchestrator.sign_in(&guest, FirstSyncChoice::Overwrite).await.unwrap();
        assert_eq!(result.sessions.len(), 1);
        assert_eq!(result.sessions[0].id, "mine");
    }

    #[tokio::test]
    async fn test_sign_in_without_backup_keeps_local() {
        let remote = Arc::new(MemoryRemoteStore::default());
        let orchestrator = SyncOrchestrator::new(remote.clone(), Arc::new(NoopSink));
        let mut status = orchestrator.subscribe();

        let local = dataset_with(vec![create_session("a", "", Some(10))]);
        let result = orchestrator.sync_now(&local).await.unwrap();
        assert_eq!(result, local);
        settled(&mut status).await;
        assert_eq!(remote.document(), Some(local));
    }

    /// Holds every write until a permit is released
    struct GatedRemote {
        inner: MemoryRemoteStore,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl RemoteStore for GatedRemote {
        async fn read(&self) -> Result<Option<Dataset>, SyncError> {
            self.inner.read().await
        }

        async fn write(&self, dataset: &Dataset) -> Result<(), SyncError> {
            self.gate.acquire().await.unwrap().forget();
            self.inner.write(dataset).await
        }
    }

    #[tokio::test]
    async fn test_synced_only_after_newest_push_lands() {
        let remote = Arc::new(GatedRemote {
            inner: MemoryRemoteStore::default(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let orchestrator = SyncOrchestrator::new(remote.clone(), Arc::new(NoopSink));
        let mut status = orchestrator.subscribe();

        let first = dataset_with(vec![create_session("a", "", Some(10))]);
        let second = dataset_with(vec![create_session("a", "", Some(10)), create_session("b", "", Some(5))]);

        orchestrator.push(&first);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        // the writer is now blocked on the first snapshot
        orchestrator.push(&second);

        remote.gate.add_permits(1);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(remote.inner.document(), Some(first));
        assert_eq!(orchestrator.status(), SyncStatus::Syncing);

        remote.gate.add_permits(1);
        assert!(matches!(settled(&mut status).await, SyncStatus::Synced { .. }));
        assert_eq!(remote.inner.document(), Some(second));
        assert_eq!(remote.inner.write_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_pushes() {
        let remote = Arc::new(MemoryRemoteStore::default());
        let orchestrator = SyncOrchestrator::new(remote.clone(), Arc::new(NoopSink));

        let local = dataset_with(vec![create_session("a", "", Some(10))]);
        orchestrator.push(&Dataset::default());
        orchestrator.push(&local);

        let last = orchestrator.shutdown().await;
        assert!(matches!(last, SyncStatus::Synced { .. }));
        assert_eq!(remote.document(), Some(local));
    }

    #[tokio::test]
    async fn test_unreachable_remote_reports_failure() {
        let remote = Arc::new(MemoryRemoteStore::default());
        remote.set_failing(true);
        let orchestrator = SyncOrchestrator::new(remote, Arc::new(NoopSink));

        let result = orchestrator.sync_now(&Dataset::default()).await;
        assert!(matches!(result, Err(SyncError::Unreachable(_))));
        assert!(matches!(orchestrator.status(), SyncStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_failed_push_then_recovery() {
        let remote = Arc::new(MemoryRemoteStore::default());
        let orchestrator = SyncOrchestrator::new(remote.clone(), Arc::new(NoopSink));
        let mut status = orchestrator.subscribe();

        remote.set_failing(true);
        orchestrator.push(&dataset_with(vec![create_session("a", "", Some(10))]));
        assert!(matches!(settled(&mut status).await, SyncStatus::Failed { .. }));

        remote.set_failing(false);
        let latest = dataset_with(vec![
            create_session("a", "", Some(10)),
            create_session("b", "", Some(10)),
        ]);
        orchestrator.push(&latest);
        assert!(matches!(settled(&mut status).await, SyncStatus::Synced { .. }));
        assert_eq!(remote.document(), Some(latest));
    }

    #[tokio::test]
    async fn test_sink_failure_is_isolated() {
        let sink = Arc::new(RecordingSink {
            failing: true,
            ..Default::default()
        });
        let orchestrator = SyncOrchestrator::new(Arc::new(MemoryRemoteStore::default()), sink.clone());

        orchestrator.notify_session(&create_session("a", "", Some(20)));
        orchestrator.notify_session(&create_session("b", "", None));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.sessions.lock().unwrap().len(), 1);
        assert_eq!(orchestrator.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_file_remote_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRemoteStore::new(dir.path(), "alice@example.com");
        assert!(store.path().ends_with("alice_example_com.json"));
        assert_eq!(store.read().await.unwrap(), None);

        let dataset = dataset_with(vec![create_session("a", "notes", Some(10))]);
        store.write(&dataset).await.unwrap();
        assert_eq!(store.read().await.unwrap(), Some(dataset));
    }

    #[tokio::test]
    async fn test_file_remote_store_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRemoteStore::new(dir.path(), "bob");
        tokio::fs::write(store.path(), b"{not json").await.unwrap();
        assert!(matches!(store.read().await, Err(SyncError::Corrupt(_))));
    }
}
