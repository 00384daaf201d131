use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::{QuotaEntry, QuotaState};

/// Errors persisting quota state.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for quota persistence.
pub type QuotaResult<T> = Result<T, QuotaError>;

/// Capacity held by an in-flight dispatch, visible to every process sharing the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReservation {
    /// Tracker instance that holds the reservation.
    pub holder: String,
    pub id: u64,
    pub tokens: u64,
    /// Ignored after this instant, so a crashed holder cannot pin capacity.
    pub expires_at: DateTime<Utc>,
}

/// On-disk shape of one provider's quota file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaFile {
    pub provider: String,
    #[serde(flatten)]
    pub state: QuotaState,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<QuotaEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<PendingReservation>,
}

/// Exclusive lock on a provider's quota file, released on drop.
///
/// The lock lives on a sidecar `.lock` file because saves replace the data
/// file by rename.
#[derive(Debug)]
pub struct StoreLock {
    _file: fs::File,
}

/// What was found when reading a quota file.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(QuotaFile),
    Missing,
    /// The file exists but could not be read or parsed.
    Corrupt(String),
}

/// Directory of per-provider quota files.
#[derive(Debug, Clone)]
pub struct QuotaStore {
    dir: PathBuf,
}

impl QuotaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the quota file for `provider_id`. Registry ids are already
    /// file-name safe; anything else is mapped to `_`.
    pub fn path_for(&self, provider_id: &str) -> PathBuf {
        let safe: String = provider_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    fn lock_path_for(&self, provider_id: &str) -> PathBuf {
        self.path_for(provider_id).with_extension("lock")
    }

    /// Block until this process holds the provider's file lock.
    pub fn lock(&self, provider_id: &str) -> QuotaResult<StoreLock> {
        fs::create_dir_all(&self.dir)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path_for(provider_id))?;
        fs2::FileExt::lock_exclusive(&file)?;
        Ok(StoreLock { _file: file })
    }

    /// Read a provider's quota file. Never fails: problems are reported in the outcome.
    pub fn load(&self, provider_id: &str) -> LoadOutcome {
        let path = self.path_for(provider_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return LoadOutcome::Missing,
            Err(err) => {
                return LoadOutcome::Corrupt(format!("failed to read {}: {}", path.display(), err))
            }
        };

        match serde_json::from_str::<QuotaFile>(&content) {
            Ok(file) if file.provider == provider_id => LoadOutcome::Loaded(file),
            Ok(file) => LoadOutcome::Corrupt(format!(
                "{} belongs to provider '{}', expected '{}'",
                path.display(),
                file.provider,
                provider_id
            )),
            Err(err) => LoadOutcome::Corrupt(format!("failed to parse {}: {}", path.display(), err)),
        }
    }

    /// Write a provider's quota file atomically (temp file, then rename).
    pub fn save(&self, file: &QuotaFile) -> QuotaResult<()> {
        fs::create_dir_all(&self.dir)?;

        let json = serde_json::to_string_pretty(file)?;
        let final_path = self.path_for(&file.provider);
        let temp_path = final_path.with_extension(format!("json.{}.tmp", std::process::id()));

        let mut temp = fs::File::create(&temp_path)?;
        temp.write_all(json.as_bytes())?;
        temp.sync_all()?;
        drop(temp);

        if let Err(err) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(QuotaError::Io(err));
        }
        Ok(())
    }

    /// Delete a provider's quota file if present.
    pub fn remove(&self, provider_id: &str) -> QuotaResult<()> {
        match fs::remove_file(self.path_for(provider_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(QuotaError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::limits::WindowMode;
    use tempfile::TempDir;

    fn sample(provider: &str) -> QuotaFile {
        let now = Utc::now();
        let entries = vec![QuotaEntry::new(now, 42)];
        QuotaFile {
            provider: provider.to_string(),
            state: QuotaState::from_entries(&entries, now, WindowMode::Fixed),
            updated_at: now,
            entries,
            pending: Vec::new(),
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().expect("temp dir");
        let store = QuotaStore::new(dir.path().join("quota"));
        let file = sample("gemini");

        store.save(&file).expect("save");

        match store.load("gemini") {
            LoadOutcome::Loaded(loaded) => assert_eq!(loaded, file),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = TempDir::new().expect("temp dir");
        let store = QuotaStore::new(dir.path());
        store.save(&sample("gemini")).expect("save");

        let names: Vec<String> = fs::read_dir(dir.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["gemini.json".to_string()]);
    }

    #[test]
    fn test_pending_reservations_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let store = QuotaStore::new(dir.path());
        let mut file = sample("gemini");
        file.pending.push(PendingReservation {
            holder: "4242-0".to_string(),
            id: 7,
            tokens: 300,
            expires_at: file.updated_at,
        });
        store.save(&file).expect("save");

        match store.load("gemini") {
            LoadOutcome::Loaded(loaded) => assert_eq!(loaded.pending, file.pending),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_lock_is_exclusive_across_handles() {
        let dir = TempDir::new().expect("temp dir");
        let store = QuotaStore::new(dir.path());
        let held = store.lock("gemini").expect("lock");

        let other = fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("gemini.lock"))
            .expect("open lock file");
        assert!(fs2::FileExt::try_lock_exclusive(&other).is_err());

        drop(held);
        assert!(fs2::FileExt::try_lock_exclusive(&other).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().expect("temp dir");
        let store = QuotaStore::new(dir.path());
        assert!(matches!(store.load("gemini"), LoadOutcome::Missing));
    }

    #[test]
    fn test_malformed_file_is_corrupt() {
        let dir = TempDir::new().expect("temp dir");
        let store = QuotaStore::new(dir.path());
        fs::write(store.path_for("gemini"), "{ not json").expect("write");

        assert!(matches!(store.load("gemini"), LoadOutcome::Corrupt(_)));
    }

    #[test]
    fn test_file_for_other_provider_is_corrupt() {
        let dir = TempDir::new().expect("temp dir");
        let store = QuotaStore::new(dir.path());
        store.save(&sample("qwen")).expect("save");
        fs::rename(store.path_for("qwen"), store.path_for("gemini")).expect("rename");

        assert!(matches!(store.load("gemini"), LoadOutcome::Corrupt(_)));
    }

    #[test]
    fn test_path_sanitizes_provider_id() {
        let store = QuotaStore::new("/tmp/q");
        assert_eq!(store.path_for("../evil"), PathBuf::from("/tmp/q/.._evil.json"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let store = QuotaStore::new(dir.path());
        store.save(&sample("gemini")).expect("save");

        store.remove("gemini").expect("remove");
        store.remove("gemini").expect("remove again");
        assert!(matches!(store.load("gemini"), LoadOutcome::Missing));
    }
}
