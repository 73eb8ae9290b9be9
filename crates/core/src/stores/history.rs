use crate::error::PipelineError;
use crate::models::{HistoryRecord, HistorySummary};
use crate::traits::HistoryStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: RwLock<HashMap<String, HistoryRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_most_recent_first(summaries: &mut [HistorySummary]) {
    summaries.sort_by(|left, right| {
        right
            .analyzed_at
            .cmp(&left.analyzed_at)
            .then_with(|| left.id.cmp(&right.id))
    });
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn save(&self, record: &HistoryRecord) -> Result<(), PipelineError> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<HistoryRecord>, PipelineError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<HistorySummary>, PipelineError> {
        let mut summaries: Vec<HistorySummary> = self
            .records
            .read()
            .await
            .values()
            .map(HistoryRecord::summary)
            .collect();
        sort_most_recent_first(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, id: &str) -> Result<bool, PipelineError> {
        Ok(self.records.write().await.remove(id).is_some())
    }
}

/// One pretty-printed JSON file per record. Writes go to a temporary file that is renamed into
/// place, so a record on disk is always complete.
pub struct JsonHistoryStore {
    directory: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonHistoryStore {
    pub async fn open(directory: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).await?;
        Ok(Self {
            directory,
            write_lock: Mutex::new(()),
        })
    }

    /// `None` for ids no record can have been saved under.
    fn record_path(&self, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|character| character.is_ascii_alphanumeric() || character == '_' || character == '-');
        valid.then(|| self.directory.join(format!("{id}.json")))
    }
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn save(&self, record: &HistoryRecord) -> Result<(), PipelineError> {
        let path = self.record_path(&record.id).ok_or_else(|| {
            PipelineError::InvalidArgument(format!(
                "history id contains unsupported characters: {}",
                record.id
            ))
        })?;
        let temporary = self.directory.join(format!(".{}.json.tmp", record.id));
        let payload = serde_json::to_vec_pretty(record)?;

        let _guard = self.write_lock.lock().await;
        fs::write(&temporary, payload).await?;
        fs::rename(&temporary, &path).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<HistoryRecord>, PipelineError> {
        let Some(path) = self.record_path(id) else {
            return Ok(None);
        };
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn list(&self) -> Result<Vec<HistorySummary>, PipelineError> {
        let mut entries = fs::read_dir(&self.directory).await?;
        let mut summaries = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().is_some_and(|extension| extension == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }

            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<HistoryRecord>(&bytes) {
                Ok(record) => summaries.push(record.summary()),
                Err(error) => tracing::warn!(path = %path.display(), error = %error, "skipping unreadable history record"),
            }
        }

        sort_most_recent_first(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, id: &str) -> Result<bool, PipelineError> {
        let Some(path) = self.record_path(id) else {
            return Ok(false);
        };
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}
