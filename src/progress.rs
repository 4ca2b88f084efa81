//! In-memory progress state backed by the durable log
//!
//! [`ProgressStore`] holds one table per scope (App, Variant, Image) plus
//! the run and error histories. Every mutator appends to the
//! [`DurableLog`] before updating memory and returning, so a crash loses at
//! most the record being written.
//!
//! ## Transitions
//!
//! ```text
//! absent ──mark_started──▶ running ──mark_completed──▶ completed
//!                            │  ▲
//!                 mark_failed│  │mark_started (next run)
//!                            ▼  │
//!                           failed
//! ```
//!
//! `completed` is terminal unless force-reprocess is configured. Records are
//! never deleted. Marking an already-completed key completed again is a
//! no-op and performs no write.

use crate::config::{CompactionPolicy, EngineConfig};
use crate::error::Result;
use crate::journal::{DurableLog, JournalEvent, Stream};
use crate::types::{
    ErrorContext, ErrorEntry, ProgressKey, ProgressRecord, ProgressStatus, RunEntry, Scope,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info, trace};

/// Counts of records per status in one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Records in `running`
    pub running: usize,
    /// Records in `completed`
    pub completed: usize,
    /// Records in `failed`
    pub failed: usize,
}

/// Hierarchical completion state with run and error history
#[derive(Debug)]
pub struct ProgressStore {
    agent: String,
    log: DurableLog,
    apps: DashMap<String, ProgressRecord>,
    variants: DashMap<String, ProgressRecord>,
    images: DashMap<String, ProgressRecord>,
    runs: Mutex<Vec<RunEntry>>,
    errors: Mutex<Vec<ErrorEntry>>,
    policy: CompactionPolicy,
    force_reprocess: bool,
    mutations: AtomicUsize,
    last_compaction: Mutex<Instant>,
}

impl ProgressStore {
    /// Open the store for the configured agent and logs directory
    pub fn open(config: &EngineConfig) -> Result<Self> {
        Self::open_at(
            &config.logs_dir,
            &config.agent,
            config.compaction.clone(),
            config.force_reprocess,
            config.sync_writes,
        )
    }

    /// Open the store at `logs_dir`
    ///
    /// Loads every snapshot, then replays the append streams on top of them
    /// in arrival order.
    pub fn open_at(
        logs_dir: &Path,
        agent: &str,
        policy: CompactionPolicy,
        force_reprocess: bool,
        sync_writes: bool,
    ) -> Result<Self> {
        let log = DurableLog::open(logs_dir, sync_writes)?;

        let store = Self {
            agent: agent.to_string(),
            log,
            apps: DashMap::new(),
            variants: DashMap::new(),
            images: DashMap::new(),
            runs: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            policy,
            force_reprocess,
            mutations: AtomicUsize::new(0),
            last_compaction: Mutex::new(Instant::now()),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<()> {
        let mut replayed = 0;

        for scope in [Scope::App, Scope::Variant, Scope::Image] {
            let stream = Stream::for_scope(scope);
            let table = self.table(scope);
            let snapshot = self
                .log
                .load_snapshot::<BTreeMap<String, ProgressRecord>>(stream)?;
            let after = snapshot.as_ref().map_or(0, |s| s.last_seq);
            if let Some(snapshot) = snapshot {
                for (key, record) in snapshot.data {
                    table.insert(key, record);
                }
            }

            for event in self.log.replay(stream, after)?.events {
                if let JournalEvent::Progress { key, record } = event {
                    table.insert(key, record);
                    replayed += 1;
                }
            }
        }

        let runs_snapshot = self.log.load_snapshot::<Vec<RunEntry>>(Stream::Runs)?;
        let after = runs_snapshot.as_ref().map_or(0, |s| s.last_seq);
        let mut runs = runs_snapshot.map(|s| s.data).unwrap_or_default();
        for event in self.log.replay(Stream::Runs, after)?.events {
            if let JournalEvent::Run(entry) = event {
                runs.push(entry);
                replayed += 1;
            }
        }
        *self.runs.lock() = runs;

        let errors_snapshot = self.log.load_snapshot::<Vec<ErrorEntry>>(Stream::Errors)?;
        let after = errors_snapshot.as_ref().map_or(0, |s| s.last_seq);
        let mut errors = errors_snapshot.map(|s| s.data).unwrap_or_default();
        for event in self.log.replay(Stream::Errors, after)?.events {
            if let JournalEvent::Error(entry) = event {
                errors.push(entry);
                replayed += 1;
            }
        }
        *self.errors.lock() = errors;

        // Outstanding records count toward the next compaction
        self.mutations.store(replayed, Ordering::SeqCst);

        info!(
            "Loaded progress: {} apps, {} variants, {} images, {} runs, {} errors ({} replayed)",
            self.apps.len(),
            self.variants.len(),
            self.images.len(),
            self.runs.lock().len(),
            self.errors.lock().len(),
            replayed
        );
        Ok(())
    }

    fn table(&self, scope: Scope) -> &DashMap<String, ProgressRecord> {
        match scope {
            Scope::App => &self.apps,
            Scope::Variant => &self.variants,
            Scope::Image => &self.images,
        }
    }

    /// Agent this store writes for
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Whether completed keys are reprocessed
    pub fn force_reprocess(&self) -> bool {
        self.force_reprocess
    }

    /// Current record of a key
    pub fn record(&self, key: &ProgressKey) -> Option<ProgressRecord> {
        self.table(key.scope())
            .get(key.as_str())
            .map(|r| r.value().clone())
    }

    /// Current status of a key; `None` means absent
    pub fn status(&self, key: &ProgressKey) -> Option<ProgressStatus> {
        self.table(key.scope()).get(key.as_str()).map(|r| r.status)
    }

    /// Whether the key has a `completed` record
    pub fn is_completed(&self, key: &ProgressKey) -> bool {
        self.status(key) == Some(ProgressStatus::Completed)
    }

    /// Append a new record for `key` and apply it
    fn write(&self, key: &ProgressKey, record: ProgressRecord) -> Result<()> {
        let stream = Stream::for_scope(key.scope());
        {
            let mut writer = self.log.writer(stream);
            writer.append(&JournalEvent::Progress {
                key: key.as_str().to_string(),
                record: record.clone(),
            })?;
            self.table(key.scope())
                .insert(key.as_str().to_string(), record);
        }
        trace!("Recorded {}", key);
        self.after_mutation()
    }

    /// `absent|failed|running → running`
    ///
    /// Returns `false` without writing if the key is completed and
    /// force-reprocess is off.
    pub fn mark_started(&self, key: &ProgressKey) -> Result<bool> {
        let previous = self.record(key);
        if previous.as_ref().is_some_and(|r| r.is_completed()) && !self.force_reprocess {
            return Ok(false);
        }

        let now = Utc::now();
        let record = ProgressRecord {
            agent: self.agent.clone(),
            status: ProgressStatus::Running,
            started_at: Some(now),
            completed_at: None,
            updated_at: now,
            error: None,
            attempts: previous.map_or(0, |r| r.attempts) + 1,
        };
        self.write(key, record)?;
        debug!("Started {}", key);
        Ok(true)
    }

    /// `→ completed`
    ///
    /// Returns `false` without writing if the key is already completed.
    pub fn mark_completed(&self, key: &ProgressKey) -> Result<bool> {
        let previous = self.record(key);
        if previous.as_ref().is_some_and(|r| r.is_completed()) {
            return Ok(false);
        }

        let now = Utc::now();
        let record = ProgressRecord {
            agent: self.agent.clone(),
            status: ProgressStatus::Completed,
            started_at: previous.as_ref().and_then(|r| r.started_at).or(Some(now)),
            completed_at: Some(now),
            updated_at: now,
            error: None,
            attempts: previous.map_or(1, |r| r.attempts.max(1)),
        };
        self.write(key, record)?;
        debug!("Completed {}", key);
        Ok(true)
    }

    /// `→ failed` with an error message; the key stays eligible
    ///
    /// Returns `false` without writing if the key is completed and
    /// force-reprocess is off.
    pub fn mark_failed(&self, key: &ProgressKey, error: &str) -> Result<bool> {
        let previous = self.record(key);
        if previous.as_ref().is_some_and(|r| r.is_completed()) && !self.force_reprocess {
            return Ok(false);
        }

        let now = Utc::now();
        let record = ProgressRecord {
            agent: self.agent.clone(),
            status: ProgressStatus::Failed,
            started_at: previous.as_ref().and_then(|r| r.started_at),
            completed_at: None,
            updated_at: now,
            error: Some(error.to_string()),
            attempts: previous.map_or(1, |r| r.attempts.max(1)),
        };
        self.write(key, record)?;
        debug!("Failed {}: {}", key, error);
        Ok(true)
    }

    /// Append a run history entry
    pub fn add_run_entry(&self, entry: RunEntry) -> Result<()> {
        {
            let mut writer = self.log.writer(Stream::Runs);
            writer.append(&JournalEvent::Run(entry.clone()))?;
            self.runs.lock().push(entry);
        }
        self.after_mutation()
    }

    /// Append an error history entry
    pub fn log_error(
        &self,
        message: impl Into<String>,
        detail: Option<String>,
        context: ErrorContext,
    ) -> Result<()> {
        let entry = ErrorEntry {
            timestamp: Utc::now(),
            agent: self.agent.clone(),
            message: message.into(),
            detail,
            context,
        };
        {
            let mut writer = self.log.writer(Stream::Errors);
            writer.append(&JournalEvent::Error(entry.clone()))?;
            self.errors.lock().push(entry);
        }
        self.after_mutation()
    }

    /// Run history in arrival order
    pub fn runs(&self) -> Vec<RunEntry> {
        self.runs.lock().clone()
    }

    /// Error history in arrival order
    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.errors.lock().clone()
    }

    /// Per-status record counts of one scope, across agents
    pub fn counts(&self, scope: Scope) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.table(scope).iter() {
            match record.status {
                ProgressStatus::Running => counts.running += 1,
                ProgressStatus::Completed => counts.completed += 1,
                ProgressStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Mutations since the last compaction
    pub fn pending_mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn after_mutation(&self) -> Result<()> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.maybe_compact()?;
        Ok(())
    }

    /// Compact if either trigger fired
    pub fn maybe_compact(&self) -> Result<bool> {
        let pending = self.pending_mutations();
        if pending == 0 {
            return Ok(false);
        }
        let due_by_count = pending >= self.policy.max_mutations;
        let due_by_time = self.last_compaction.lock().elapsed() >= self.policy.interval;
        if !(due_by_count || due_by_time) {
            return Ok(false);
        }
        self.compact()?;
        Ok(true)
    }

    /// Fold every stream into its snapshot
    pub fn compact(&self) -> Result<()> {
        for scope in [Scope::App, Scope::Variant, Scope::Image] {
            let mut writer = self.log.writer(Stream::for_scope(scope));
            let data: BTreeMap<String, ProgressRecord> = self
                .table(scope)
                .iter()
                .map(|r| (r.key().clone(), r.value().clone()))
                .collect();
            writer.compact(&data)?;
        }
        {
            let mut writer = self.log.writer(Stream::Runs);
            let runs = self.runs.lock().clone();
            writer.compact(&runs)?;
        }
        {
            let mut writer = self.log.writer(Stream::Errors);
            let errors = self.errors.lock().clone();
            writer.compact(&errors)?;
        }

        let folded = self.mutations.swap(0, Ordering::SeqCst);
        *self.last_compaction.lock() = Instant::now();
        debug!("Compaction folded {} mutations", folded);
        Ok(())
    }

    /// Final compaction before the store is dropped
    pub fn close(&self) -> Result<()> {
        self.compact()?;
        info!("Progress store closed at seq {}", self.log.current_seq());
        Ok(())
    }
}
