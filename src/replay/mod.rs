//! Persisted partial state for resumable studies.
//!
//! A state file holds a header identifying the study and one record per
//! condition, in grid order. Each record is an explicit state machine:
//!
//! ```text
//! Pending ──(condition aggregated)──▶ Completed { seed, elapsed, summary }
//! ```
//!
//! On resume, completed rows are replayed from disk and only pending rows
//! are recomputed. The header carries a blake3 fingerprint over the grid,
//! base seed, replication count, retry bound and study context; any
//! difference rejects the file instead of silently mixing two studies.
//!
//! The file is rewritten atomically (temp file + rename) after every
//! completed condition, so an interrupted run never leaves a torn file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::design::{Condition, ConditionGrid};
use crate::engine::rng::derive_seed;
use crate::error::{SimError, SimResult};
use crate::results::{ConditionSummary, ResultsTable};

/// State file format version.
pub const STATE_VERSION: u32 = 1;

/// Parameters that together identify a study run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyIdentity {
    /// Base seed of the study.
    pub base_seed: u64,
    /// Replications per condition.
    pub replications: u32,
    /// Retry bound per replication.
    pub max_retries: u32,
    /// Free-form description of the data-generation and fitting setup.
    pub context: String,
}

impl StudyIdentity {
    /// Hex-encoded blake3 fingerprint of this identity over `grid`.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails.
    pub fn fingerprint(&self, grid: &ConditionGrid) -> SimResult<String> {
        let bytes = bincode::serialize(&(grid.conditions(), self))
            .map_err(|e| SimError::serialization(e.to_string()))?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    /// Seed of the condition at `index`.
    #[must_use]
    pub const fn condition_seed(&self, index: usize) -> u64 {
        derive_seed(self.base_seed, index as u64)
    }
}

/// State file header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHeader {
    /// Format version.
    pub version: u32,
    /// Study fingerprint.
    pub fingerprint: String,
    /// Base seed.
    pub base_seed: u64,
    /// Replications per condition.
    pub replications: u32,
    /// Retry bound per replication.
    pub max_retries: u32,
}

/// Lifecycle of one condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionStatus {
    /// Not yet computed.
    Pending,
    /// Aggregated and persisted.
    Completed,
}

/// Per-condition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRecord {
    /// Row index in the grid.
    pub index: usize,
    /// The condition.
    pub condition: Condition,
    /// Current status.
    pub status: ConditionStatus,
    /// Condition seed.
    pub seed: u64,
    /// Time spent, once completed.
    #[serde(default)]
    pub elapsed: Option<Duration>,
    /// Aggregated row, once completed.
    #[serde(default)]
    pub summary: Option<ConditionSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    header: StateHeader,
    records: Vec<ConditionRecord>,
}

/// Per-condition progress of a study, optionally backed by a state file.
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    header: StateHeader,
    records: Vec<ConditionRecord>,
}

impl StateStore {
    /// All-pending store that is never written to disk.
    ///
    /// # Errors
    ///
    /// Returns error if the fingerprint cannot be computed.
    pub fn in_memory(grid: &ConditionGrid, identity: &StudyIdentity) -> SimResult<Self> {
        Ok(Self {
            path: None,
            header: Self::header_for(grid, identity)?,
            records: Self::pending_records(grid, identity),
        })
    }

    /// Discard any state at `path` and start a fresh all-pending file.
    ///
    /// # Errors
    ///
    /// Returns error if the old state cannot be removed or the new file
    /// cannot be written.
    pub fn create<P: AsRef<Path>>(
        path: P,
        grid: &ConditionGrid,
        identity: &StudyIdentity,
    ) -> SimResult<Self> {
        let path = path.as_ref();
        Self::discard(path)?;
        let store = Self {
            path: Some(path.to_path_buf()),
            header: Self::header_for(grid, identity)?,
            records: Self::pending_records(grid, identity),
        };
        store.persist()?;
        Ok(store)
    }

    /// Resume from the state file at `path`, or start fresh if none exists.
    ///
    /// # Errors
    ///
    /// Returns a resume-state error if the file is unreadable, has an
    /// unsupported version, belongs to a different study, or contains a
    /// record out of place.
    pub fn resume<P: AsRef<Path>>(
        path: P,
        grid: &ConditionGrid,
        identity: &StudyIdentity,
    ) -> SimResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no state file, starting fresh");
            return Self::create(path, grid, identity);
        }

        let bytes = fs::read(path).map_err(|e| {
            SimError::resume_state(format!("cannot read {}: {e}", path.display()))
        })?;
        let file: StateFile = serde_json::from_slice(&bytes).map_err(|e| {
            SimError::resume_state(format!("cannot parse {}: {e}", path.display()))
        })?;

        let expected = Self::header_for(grid, identity)?;
        Self::check_header(&file.header, &expected)?;
        Self::check_records(&file.records, grid, identity)?;

        let store = Self {
            path: Some(path.to_path_buf()),
            header: file.header,
            records: file.records,
        };
        tracing::info!(
            path = %path.display(),
            completed = store.completed_count(),
            pending = store.records.len() - store.completed_count(),
            "resuming from state file"
        );
        Ok(store)
    }

    /// Remove the state file at `path` (and any leftover temp file).
    /// Returns whether a state file existed.
    ///
    /// # Errors
    ///
    /// Returns error if removal fails.
    pub fn discard<P: AsRef<Path>>(path: P) -> SimResult<bool> {
        let path = path.as_ref();
        let tmp = temp_path(path);
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        if path.exists() {
            fs::remove_file(path)?;
            tracing::debug!(path = %path.display(), "discarded state file");
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark the summary's condition completed and persist.
    ///
    /// # Errors
    ///
    /// Returns error if the summary does not belong to a pending record of
    /// this store, or the state file cannot be written.
    pub fn record_completed(&mut self, summary: ConditionSummary) -> SimResult<()> {
        let record = self.records.get_mut(summary.index).ok_or_else(|| {
            SimError::resume_state(format!("no condition at row {}", summary.index + 1))
        })?;
        if record.status == ConditionStatus::Completed {
            return Err(SimError::resume_state(format!(
                "condition #{} {} is already completed",
                record.index + 1,
                record.condition
            )));
        }
        if record.condition != summary.condition || record.seed != summary.seed {
            return Err(SimError::resume_state(format!(
                "summary for {} does not match condition #{} {}",
                summary.condition,
                record.index + 1,
                record.condition
            )));
        }

        record.status = ConditionStatus::Completed;
        record.elapsed = Some(summary.elapsed);
        record.summary = Some(summary);
        self.persist()
    }

    /// Check that every completed row was aggregated over `layout`.
    ///
    /// # Errors
    ///
    /// Returns a resume-state error naming the first row with other
    /// statistics.
    pub fn check_layout(&self, layout: &[String]) -> SimResult<()> {
        let foreign = self
            .records
            .iter()
            .filter_map(|r| r.summary.as_ref())
            .find(|s| s.statistics != layout);
        match foreign {
            Some(summary) => Err(SimError::resume_state(format!(
                "record #{} holds statistics [{}], study expects [{}]",
                summary.index + 1,
                summary.statistics.join(", "),
                layout.join(", ")
            ))),
            None => Ok(()),
        }
    }

    /// Header of this store.
    #[must_use]
    pub const fn header(&self) -> &StateHeader {
        &self.header
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// All records in grid order.
    #[must_use]
    pub fn records(&self) -> &[ConditionRecord] {
        &self.records
    }

    /// Pending records in grid order.
    pub fn pending(&self) -> impl Iterator<Item = &ConditionRecord> {
        self.records
            .iter()
            .filter(|r| r.status == ConditionStatus::Pending)
    }

    /// Number of completed conditions.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == ConditionStatus::Completed)
            .count()
    }

    /// Whether every condition is completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_count() == self.records.len()
    }

    /// Completed rows, in grid order.
    #[must_use]
    pub fn table(&self) -> ResultsTable {
        ResultsTable::new(
            self.records
                .iter()
                .filter_map(|r| r.summary.clone())
                .collect(),
        )
    }

    fn header_for(grid: &ConditionGrid, identity: &StudyIdentity) -> SimResult<StateHeader> {
        Ok(StateHeader {
            version: STATE_VERSION,
            fingerprint: identity.fingerprint(grid)?,
            base_seed: identity.base_seed,
            replications: identity.replications,
            max_retries: identity.max_retries,
        })
    }

    fn pending_records(grid: &ConditionGrid, identity: &StudyIdentity) -> Vec<ConditionRecord> {
        grid.iter()
            .map(|(index, condition)| ConditionRecord {
                index,
                condition: *condition,
                status: ConditionStatus::Pending,
                seed: identity.condition_seed(index),
                elapsed: None,
                summary: None,
            })
            .collect()
    }

    fn check_header(found: &StateHeader, expected: &StateHeader) -> SimResult<()> {
        if found.version != expected.version {
            return Err(SimError::resume_state(format!(
                "unsupported state version {} (expected {})",
                found.version, expected.version
            )));
        }
        if found.base_seed != expected.base_seed {
            return Err(SimError::resume_state(format!(
                "state was written with seed {}, study uses {}",
                found.base_seed, expected.base_seed
            )));
        }
        if found.replications != expected.replications {
            return Err(SimError::resume_state(format!(
                "state was written with {} replications, study uses {}",
                found.replications, expected.replications
            )));
        }
        if found.max_retries != expected.max_retries {
            return Err(SimError::resume_state(format!(
                "state was written with max_retries {}, study uses {}",
                found.max_retries, expected.max_retries
            )));
        }
        if found.fingerprint != expected.fingerprint {
            return Err(SimError::resume_state(
                "fingerprint mismatch: the condition grid or study setup changed",
            ));
        }
        Ok(())
    }

    fn check_records(
        records: &[ConditionRecord],
        grid: &ConditionGrid,
        identity: &StudyIdentity,
    ) -> SimResult<()> {
        if records.len() != grid.len() {
            return Err(SimError::resume_state(format!(
                "state has {} conditions, grid has {}",
                records.len(),
                grid.len()
            )));
        }

        for ((index, condition), record) in grid.iter().zip(records) {
            let row = index + 1;
            if record.index != index || record.condition != *condition {
                return Err(SimError::resume_state(format!(
                    "record #{row} is out of place: found #{} {}, expected {condition}",
                    record.index + 1,
                    record.condition
                )));
            }
            if record.seed != identity.condition_seed(index) {
                return Err(SimError::resume_state(format!("record #{row} has a foreign seed")));
            }
            match (record.status, &record.summary) {
                (ConditionStatus::Pending, None) => {}
                (ConditionStatus::Pending, Some(_)) => {
                    return Err(SimError::resume_state(format!(
                        "pending record #{row} carries a summary"
                    )));
                }
                (ConditionStatus::Completed, None) => {
                    return Err(SimError::resume_state(format!(
                        "completed record #{row} has no summary"
                    )));
                }
                (ConditionStatus::Completed, Some(summary)) => {
                    if summary.index != index
                        || summary.condition != *condition
                        || summary.seed != record.seed
                        || summary.replications != identity.replications
                    {
                        return Err(SimError::resume_state(format!(
                            "summary of record #{row} does not match its condition"
                        )));
                    }
                    if summary.means.len() != summary.statistics.len() {
                        return Err(SimError::resume_state(format!(
                            "summary of record #{row} has {} means for {} statistics",
                            summary.means.len(),
                            summary.statistics.len()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn persist(&self) -> SimResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = StateFile {
            header: self.header.clone(),
            records: self.records.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let tmp = temp_path(path);
        {
            let mut out = fs::File::create(&tmp)?;
            out.write_all(&json)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
