//! Reconciliation - combine a local and a remote dataset without losing records
//!
//! Each record list is merged on its own:
//! - records only one side knows about are kept
//! - on an id collision the remote copy wins
//! - sessions and health entries come out newest first; routines keep
//!   first-seen order (local ones before remote-only ones)

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::model::{Dataset, HealthEntry, Routine, Session};

/// Anything stored in a dataset list
pub trait Record: Clone {
    fn id(&self) -> &str;

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        None
    }
}

impl Record for Session {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        Some(self.timestamp)
    }
}

impl Record for HealthEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        Some(self.timestamp)
    }
}

impl Record for Routine {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Counts for one merged list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub local_only: usize,
    pub remote_only: usize,
    pub overwritten_by_remote: usize,
}

impl MergeReport {
    fn absorb(&mut self, other: MergeReport) {
        self.local_only += other.local_only;
        self.remote_only += other.remote_only;
        self.overwritten_by_remote += other.overwritten_by_remote;
    }
}

/// Merge two datasets, remote wins on id collision
pub fn merge(local: &Dataset, remote: &Dataset) -> Dataset {
    merge_with_report(local, remote).0
}

/// Plain replacement: the remote dataset overwrites local wholesale
pub fn replace(_local: &Dataset, remote: &Dataset) -> Dataset {
    remote.clone()
}

pub fn merge_with_report(local: &Dataset, remote: &Dataset) -> (Dataset, MergeReport) {
    let mut report = MergeReport::default();

    let (mut sessions, r) = merge_records(&local.sessions, &remote.sessions);
    report.absorb(r);
    sort_newest_first(&mut sessions);

    let (mut health_entries, r) = merge_records(&local.health_entries, &remote.health_entries);
    report.absorb(r);
    sort_newest_first(&mut health_entries);

    let (routines, r) = merge_records(&local.routines, &remote.routines);
    report.absorb(r);

    debug!(
        "Merged datasets: {} local-only, {} remote-only, {} overwritten by remote",
        report.local_only, report.remote_only, report.overwritten_by_remote
    );

    (
        Dataset {
            sessions,
            health_entries,
            routines,
        },
        report,
    )
}

/// Insert local records, then overwrite with remote ones of the same id.
/// Within one side a repeated id keeps the last occurrence.
pub fn merge_records<T: Record>(local: &[T], remote: &[T]) -> (Vec<T>, MergeReport) {
    let mut order: Vec<String> = Vec::with_capacity(local.len() + remote.len());
    let mut by_id: HashMap<String, T> = HashMap::with_capacity(local.len() + remote.len());

    for record in local {
        if by_id.insert(record.id().to_string(), record.clone()).is_none() {
            order.push(record.id().to_string());
        }
    }

    let local_ids: HashSet<&str> = local.iter().map(Record::id).collect();
    let mut seen_remote: HashSet<&str> = HashSet::new();
    let mut report = MergeReport::default();
    for record in remote {
        let id = record.id();
        let first_in_remote = seen_remote.insert(id);
        if by_id.insert(id.to_string(), record.clone()).is_none() {
            order.push(id.to_string());
            report.remote_only += 1;
        } else if first_in_remote && local_ids.contains(id) {
            report.overwritten_by_remote += 1;
        }
    }
    report.local_only = local_ids.len() - report.overwritten_by_remote;

    let merged = order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect();
    (merged, report)
}

// Ties on timestamp fall back to id so both argument orders agree.
fn sort_newest_first<T: Record>(records: &mut [T]) {
    records.sort_by(|a, b| {
        b.timestamp()
            .cmp(&a.timestamp())
            .then_with(|| a.id().cmp(b.id()))
    });
}
