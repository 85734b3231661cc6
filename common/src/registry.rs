// Job registry: a single JSON file mapping job id → JobRecord
//
// Every mutation re-reads the whole file, applies the change, and atomically
// replaces the file (write to a sibling temp file, then rename). Within one
// process mutations are serialized; across processes the last writer wins at
// whole-file granularity. This is not a transactional store.

use crate::errors::RegistryError;
use crate::models::{JobRecord, JobType, JobUpdate};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

type Snapshot = BTreeMap<String, JobRecord>;

/// Durable key/value store of job records
pub struct JobRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JobRegistry {
    /// Create a registry backed by `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full snapshot. Missing or corrupt files read as empty.
    async fn load(&self) -> Result<Snapshot, RegistryError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Snapshot::new()),
            Err(e) => {
                return Err(RegistryError::Unavailable(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Snapshot::new());
        }

        match serde_json::from_slice::<Snapshot>(&bytes) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Job registry is corrupt, treating it as empty"
                );
                Ok(Snapshot::new())
            }
        }
    }

    /// Replace the backing file with `snapshot`
    async fn save(&self, snapshot: &Snapshot) -> Result<(), RegistryError> {
        let data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| RegistryError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                RegistryError::Unavailable(format!(
                    "Failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let tmp_path = self.temp_path();
        fs::write(&tmp_path, &data).await.map_err(|e| {
            RegistryError::Unavailable(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;
        if let Err(e) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(RegistryError::Unavailable(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            )));
        }

        debug!(path = %self.path.display(), records = snapshot.len(), "Job registry saved");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "registry".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
    }

    /// Insert or replace a record; durable before returning
    #[instrument(skip(self, record), fields(job_id = %record.job_id, job_type = %record.job_type))]
    pub async fn put(&self, record: JobRecord) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.load().await?;
        snapshot.insert(record.job_id.clone(), record);
        self.save(&snapshot).await
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, RegistryError> {
        Ok(self.load().await?.remove(job_id))
    }

    /// Apply `update` to a record.
    ///
    /// Returns `Ok(None)` and logs a warning when the job is unknown. A target that
    /// is already set is never replaced, and disallowed status transitions are
    /// skipped; both are logged.
    #[instrument(skip(self, update), fields(job_id = %job_id))]
    pub async fn update(
        &self,
        job_id: &str,
        update: JobUpdate,
    ) -> Result<Option<JobRecord>, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.load().await?;

        let Some(record) = snapshot.get_mut(job_id) else {
            warn!(job_id = %job_id, "Job not found in registry, update ignored");
            return Ok(None);
        };

        let mut changed = false;

        if let Some(target) = update.target {
            match &record.target {
                None => {
                    record.target = Some(target);
                    changed = true;
                }
                Some(existing) if *existing == target => {}
                Some(existing) => {
                    warn!(
                        existing = %existing,
                        requested = %target,
                        "Job target already recorded, keeping existing target"
                    );
                }
            }
        }

        if let Some(status) = update.status {
            if record.status.can_transition_to(status) {
                changed |= record.status != status;
                record.status = status;
            } else {
                warn!(
                    from = %record.status,
                    to = %status,
                    "Ignoring disallowed job status transition"
                );
            }
        }

        let updated = record.clone();
        if changed {
            self.save(&snapshot).await?;
        }
        Ok(Some(updated))
    }

    /// All records, optionally filtered by type. Ordering is by job id and carries
    /// no meaning; sort if order matters.
    pub async fn list(&self, job_type: Option<JobType>) -> Result<Vec<JobRecord>, RegistryError> {
        Ok(self
            .load()
            .await?
            .into_values()
            .filter(|r| job_type.map_or(true, |t| r.job_type == t))
            .collect())
    }

    pub async fn all(&self) -> Result<Vec<JobRecord>, RegistryError> {
        self.list(None).await
    }

    pub async fn list_by_label(&self, label: &str) -> Result<Vec<JobRecord>, RegistryError> {
        Ok(self
            .load()
            .await?
            .into_values()
            .filter(|r| r.label == label)
            .collect())
    }

    /// Remove a record. Returns whether it existed.
    #[instrument(skip(self))]
    pub async fn remove(&self, job_id: &str) -> Result<bool, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.load().await?;
        if snapshot.remove(job_id).is_none() {
            return Ok(false);
        }
        self.save(&snapshot).await?;
        Ok(true)
    }

    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        self.save(&Snapshot::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use std::sync::Arc;

    fn service(job_id: &str) -> JobRecord {
        JobRecord::new(job_id, JobType::Service, "ollama", BTreeMap::new())
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path().join("jobs.json"));

        registry.put(service("1")).await.unwrap();
        let loaded = registry.get("1").await.unwrap().unwrap();
        assert_eq!(loaded.label, "ollama");
        assert_eq!(loaded.status, JobStatus::Submitted);
        assert!(registry.get("2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path().join("absent.json"));
        assert!(registry.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_reads_as_empty_and_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "{ not json").unwrap();

        let registry = JobRegistry::new(&path);
        assert!(registry.list(None).await.unwrap().is_empty());

        registry.put(service("9")).await.unwrap();
        assert_eq!(registry.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_target_is_never_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path().join("jobs.json"));
        registry.put(service("1")).await.unwrap();

        registry.update("1", JobUpdate::target("node01")).await.unwrap();
        let record = registry
            .update("1", JobUpdate::target("node02"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.target.as_deref(), Some("node01"));
    }

    #[tokio::test]
    async fn test_stopped_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path().join("jobs.json"));
        registry.put(service("1")).await.unwrap();

        registry.update("1", JobUpdate::status(JobStatus::Stopped)).await.unwrap();
        let record = registry
            .update("1", JobUpdate::status(JobStatus::Healthy))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn test_list_filters_by_type_and_label() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path().join("jobs.json"));
        registry.put(service("1")).await.unwrap();
        registry
            .put(JobRecord::new("2", JobType::Monitor, "ollama", BTreeMap::new()).with_parent("1"))
            .await
            .unwrap();
        registry
            .put(JobRecord::new("3", JobType::Service, "postgresql", BTreeMap::new()))
            .await
            .unwrap();

        assert_eq!(registry.list(Some(JobType::Service)).await.unwrap().len(), 2);
        assert_eq!(registry.list(Some(JobType::Monitor)).await.unwrap().len(), 1);
        assert_eq!(registry.list_by_label("ollama").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path().join("jobs.json"));
        registry.put(service("1")).await.unwrap();
        registry.put(service("2")).await.unwrap();

        assert!(registry.remove("1").await.unwrap());
        assert!(!registry.remove("1").await.unwrap());
        assert_eq!(registry.list(None).await.unwrap().len(), 1);

        registry.clear().await.unwrap();
        assert!(registry.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_updates_in_one_process_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new(dir.path().join("jobs.json")));

        let mut handles = Vec::new();
        for i in 0..20 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.put(service(&i.to_string())).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.list(None).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_write_failure_surfaces_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in place of the file makes the rename fail
        let path = dir.path().join("jobs.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), "x").unwrap();

        let registry = JobRegistry::new(&path);
        let result = registry.put(service("1")).await;
        assert!(matches!(result, Err(RegistryError::Unavailable(_))));
    }
}
