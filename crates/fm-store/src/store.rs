// store.rs — RecordStore: checksummed, version-counted board persistence.
//
// Layout: `<root>/<bucket>/<project_id>/project.json`, one bucket
// directory per lifecycle state. The project directory may hold other
// human-authored files (notes, transcripts); the store never touches
// them, and bucket relocation moves the whole directory so they travel
// with the record.
//
// Write discipline: serialize into an envelope carrying a SHA-256
// checksum of the record payload, write to a temp file in the same
// directory, flush + fsync, then atomically rename over `project.json`.
// Readers can never observe a half-written record; a torn write shows
// up as a parse failure or checksum mismatch and is reported as Corrupt.
//
// Every successful write bumps the record's version counter by exactly
// one; `write` refuses to proceed when the on-disk version no longer
// matches what the caller read (optimistic concurrency).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::error::StoreError;
use crate::project::{Project, ProjectState};

/// On-disk envelope: the record plus a checksum of its serialized form.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    checksum: String,
    record: Project,
}

/// Atomic persistence for project records.
///
/// The store owns no business logic: it reads, writes, relocates, and
/// validates integrity. Mutual exclusion across complex multi-step
/// logic belongs to the lock coordinator; the store's internal mutex
/// only serializes the version-check + rename critical section so two
/// in-process writers cannot interleave a single write.
pub struct RecordStore {
    root: PathBuf,
    write_gate: Mutex<()>,
}

impl RecordStore {
    /// Open a store rooted at the given board directory, creating the
    /// bucket directories if they don't exist.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        for state in ProjectState::ALL {
            let dir = root.join(state.bucket());
            fs::create_dir_all(&dir).map_err(|source| StoreError::IoError { path: dir, source })?;
        }
        Ok(Self {
            root,
            write_gate: Mutex::new(()),
        })
    }

    /// The board root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for a lifecycle bucket.
    pub fn bucket_dir(&self, state: ProjectState) -> PathBuf {
        self.root.join(state.bucket())
    }

    /// Directory for a project within a bucket.
    pub fn project_dir(&self, state: ProjectState, id: &str) -> PathBuf {
        self.bucket_dir(state).join(id)
    }

    fn record_path(&self, state: ProjectState, id: &str) -> PathBuf {
        self.project_dir(state, id).join("project.json")
    }

    /// Find which bucket currently holds the project, if any.
    ///
    /// The bucket is denormalized from the record's state; scanning all
    /// buckets keeps readers correct even if a crash separated a state
    /// write from its relocation.
    pub fn locate(&self, id: &str) -> Option<ProjectState> {
        ProjectState::ALL
            .into_iter()
            .find(|state| self.record_path(*state, id).exists())
    }

    /// Persist a brand-new record at version 1 in its state's bucket.
    ///
    /// Fails with `AlreadyExists` if any bucket already holds the id.
    pub fn create(&self, project: &Project) -> Result<Project, StoreError> {
        let _gate = self.gate();

        if self.locate(&project.project_id).is_some() {
            return Err(StoreError::AlreadyExists {
                id: project.project_id.clone(),
            });
        }

        let dir = self.project_dir(project.state, &project.project_id);
        fs::create_dir_all(&dir).map_err(|source| StoreError::IoError {
            path: dir.clone(),
            source,
        })?;

        let mut persisted = project.clone();
        persisted.version = 1;
        self.write_record(&dir, &persisted)?;
        Ok(persisted)
    }

    /// Read a record and its version, verifying the checksum.
    pub fn read(&self, id: &str) -> Result<(Project, u64), StoreError> {
        let state = self.locate(id).ok_or_else(|| StoreError::NotFound {
            id: id.to_string(),
        })?;
        let record = self.read_at(state, id)?;
        let version = record.version;
        Ok((record, version))
    }

    /// Write an updated record, but only if the on-disk version still
    /// equals `expected_version`. Returns the persisted copy with its
    /// version bumped by exactly one.
    ///
    /// The write lands in the bucket the record currently lives in;
    /// moving between buckets is a separate, explicit [`relocate`].
    ///
    /// [`relocate`]: RecordStore::relocate
    pub fn write(
        &self,
        id: &str,
        project: &Project,
        expected_version: u64,
    ) -> Result<Project, StoreError> {
        let _gate = self.gate();

        let state = self.locate(id).ok_or_else(|| StoreError::NotFound {
            id: id.to_string(),
        })?;
        let current = self.read_at(state, id)?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut persisted = project.clone();
        persisted.version = expected_version + 1;
        self.write_record(&self.project_dir(state, id), &persisted)?;
        Ok(persisted)
    }

    /// Atomically move a project directory between lifecycle buckets.
    ///
    /// A single rename, so readers see the project in exactly one
    /// bucket at all times, and sidecar files travel untouched.
    pub fn relocate(
        &self,
        id: &str,
        from: ProjectState,
        to: ProjectState,
    ) -> Result<(), StoreError> {
        let _gate = self.gate();

        let from_dir = self.project_dir(from, id);
        if !from_dir.join("project.json").exists() {
            return Err(StoreError::NotFound {
                id: id.to_string(),
            });
        }
        let to_dir = self.project_dir(to, id);
        fs::rename(&from_dir, &to_dir).map_err(|source| StoreError::IoError {
            path: to_dir,
            source,
        })?;
        Ok(())
    }

    /// List the records in one bucket, highest priority first.
    ///
    /// Corrupt records are logged and skipped — a concurrent writer may
    /// be mid-flight, and listing must not fail the whole bucket.
    pub fn list(&self, state: ProjectState) -> Result<Vec<Project>, StoreError> {
        let dir = self.bucket_dir(state);
        let entries = fs::read_dir(&dir).map_err(|source| StoreError::IoError {
            path: dir.clone(),
            source,
        })?;

        let mut projects = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::IoError {
                path: dir.clone(),
                source,
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.read_at(state, &id) {
                Ok(project) => projects.push(project),
                Err(err) => {
                    tracing::warn!(bucket = state.bucket(), %id, %err, "skipping unreadable record");
                }
            }
        }

        projects.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(projects)
    }

    /// List every record on the board across all buckets.
    pub fn list_all(&self) -> Result<Vec<Project>, StoreError> {
        let mut all = Vec::new();
        for state in ProjectState::ALL {
            all.extend(self.list(state)?);
        }
        Ok(all)
    }

    /// Read and verify the record at a known bucket location.
    fn read_at(&self, state: ProjectState, id: &str) -> Result<Project, StoreError> {
        let path = self.record_path(state, id);
        let raw = fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound {
                    id: id.to_string(),
                }
            } else {
                StoreError::IoError { path: path.clone(), source }
            }
        })?;

        let envelope: StoredRecord =
            serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
                id: id.to_string(),
                reason: format!("unparseable record envelope: {}", err),
            })?;

        let payload = serde_json::to_string(&envelope.record)?;
        if checksum::of_str(&payload) != envelope.checksum {
            return Err(StoreError::Corrupt {
                id: id.to_string(),
                reason: "checksum mismatch".to_string(),
            });
        }
        if envelope.record.project_id != id {
            return Err(StoreError::Corrupt {
                id: id.to_string(),
                reason: format!(
                    "record claims id '{}' but lives under '{}'",
                    envelope.record.project_id, id
                ),
            });
        }
        Ok(envelope.record)
    }

    /// Temp-file + fsync + rename write of an envelope into `dir`.
    fn write_record(&self, dir: &Path, project: &Project) -> Result<(), StoreError> {
        let payload = serde_json::to_string(project)?;
        let envelope = StoredRecord {
            checksum: checksum::of_str(&payload),
            record: project.clone(),
        };
        let json = serde_json::to_string_pretty(&envelope)?;

        let tmp_path = dir.join(".project.json.tmp");
        let final_path = dir.join("project.json");

        let mut file = File::create(&tmp_path).map_err(|source| StoreError::IoError {
            path: tmp_path.clone(),
            source,
        })?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|source| StoreError::IoError {
                path: tmp_path.clone(),
                source,
            })?;
        drop(file);

        fs::rename(&tmp_path, &final_path).map_err(|source| StoreError::IoError {
            path: final_path,
            source,
        })?;
        Ok(())
    }

    fn gate(&self) -> std::sync::MutexGuard<'_, ()> {
        // A poisoned gate only means another writer panicked; the store
        // itself holds no in-memory state to corrupt.
        self.write_gate.lock().unwrap_or_else(|e| e.into_inner())
    }
}
