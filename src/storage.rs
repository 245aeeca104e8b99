//! File-backed container storage
//!
//! One JSON document per entity at `<root>/<container>/<key>.json` where
//! `<key>` is the url-safe encoding of the entity key. All operations are
//! asynchronous (`tokio::fs`). A per-container `RwLock` lets readers run
//! concurrently while writers are exclusive.

use crate::config::HubConfig;
use crate::container::{ContainerCapabilities, EntityContainer, QueryCollector, QueryPage};
use crate::context::SyncContext;
use crate::cursor::CursorTable;
use crate::database::ContainerFactory;
use crate::error::{EntityError, EntityErrorType, TaskExecuteError, TaskResult};
use crate::protocol::{CreateEntities, DeleteEntities, EntityErrors, QueryEntities, ReadEntities, UpsertEntities};
use crate::types::{EntityValue, JsonKey, JsonValue};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

const FILE_EXTENSION: &str = "json";
const EMPTY_KEY_STEM: &str = "%";

/// Encode a key as a file name stem.
///
/// `[A-Za-z0-9_-]` and non-leading `.` pass through, other bytes are `%XX`
/// escaped. String keys that look like integers get their first byte
/// escaped so they never collide with integer keys. The empty string maps
/// to the reserved stem `%`.
pub fn encode_key(key: &JsonKey) -> String {
    match key {
        JsonKey::Long(v) => v.to_string(),
        JsonKey::Str(s) if s.is_empty() => EMPTY_KEY_STEM.to_string(),
        JsonKey::Str(s) => {
            let force_first = s.parse::<i64>().is_ok();
            let mut out = String::with_capacity(s.len());
            for (i, b) in s.bytes().enumerate() {
                let plain = b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || (b == b'.' && i > 0);
                if plain && !(force_first && i == 0) {
                    out.push(b as char);
                } else {
                    out.push_str(&format!("%{:02X}", b));
                }
            }
            out
        }
    }
}

/// Decode a file name stem produced by `encode_key`
pub fn decode_key(stem: &str) -> Option<JsonKey> {
    if stem == EMPTY_KEY_STEM {
        return Some(JsonKey::Str(String::new()));
    }
    if !stem.contains('%') {
        if let Ok(v) = stem.parse::<i64>() {
            return Some(JsonKey::Long(v));
        }
    }
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok().map(JsonKey::Str)
}

pub struct FileContainer {
    name: String,
    key_name: String,
    dir: PathBuf,
    lock: RwLock<()>,
    cursors: CursorTable,
}

impl FileContainer {
    pub fn new(root: &Path, name: &str, key_name: &str, config: &HubConfig) -> Self {
        FileContainer {
            name: name.to_string(),
            key_name: key_name.to_string(),
            dir: root.join(name),
            lock: RwLock::new(()),
            cursors: CursorTable::new(config.cursors.ttl()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entity_path(&self, key: &JsonKey) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), FILE_EXTENSION))
    }

    async fn ensure_dir(&self) -> TaskResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TaskExecuteError::database(format!("cannot create {}: {}", self.dir.display(), e)))
    }

    /// Stored keys in ascending order
    async fn list_keys(&self) -> TaskResult<Vec<JsonKey>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TaskExecuteError::database(format!("cannot list {}: {}", self.dir.display(), e))),
        };
        let mut keys = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|e| TaskExecuteError::database(e.to_string()))?;
            let entry = match entry {
                Some(entry) => entry,
                None => break,
            };
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(key) = path.file_stem().and_then(|stem| stem.to_str()).and_then(decode_key) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn read_value(&self, key: &JsonKey) -> Result<Option<JsonValue>, EntityError> {
        match tokio::fs::read(self.entity_path(key)).await {
            Ok(bytes) => Ok(Some(JsonValue::from_bytes(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EntityError::new(key.clone(), EntityErrorType::ReadError, e.to_string())),
        }
    }

    async fn write_value(&self, key: &JsonKey, value: &JsonValue) -> Result<(), EntityError> {
        tokio::fs::write(self.entity_path(key), value.as_bytes())
            .await
            .map_err(|e| EntityError::new(key.clone(), EntityErrorType::WriteError, e.to_string()))
    }

    async fn remove_value(&self, key: &JsonKey) -> Result<(), EntityError> {
        match tokio::fs::remove_file(self.entity_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EntityError::new(key.clone(), EntityErrorType::DeleteError, e.to_string())),
        }
    }
}

#[async_trait]
impl EntityContainer for FileContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_name(&self) -> &str {
        &self.key_name
    }

    fn capabilities(&self) -> ContainerCapabilities {
        ContainerCapabilities {
            sync: false,
            native_count: true,
            native_merge: false,
        }
    }

    fn cursors(&self) -> &CursorTable {
        &self.cursors
    }

    async fn create_entities_async(&self, command: &CreateEntities, _ctx: &SyncContext) -> TaskResult<EntityErrors> {
        let _guard = self.lock.write().await;
        self.ensure_dir().await?;
        let mut errors = Vec::new();
        for entity in &command.entities {
            match tokio::fs::try_exists(self.entity_path(&entity.key)).await {
                Ok(false) => {}
                Ok(true) => {
                    errors.push(EntityError::new(
                        entity.key.clone(),
                        EntityErrorType::WriteError,
                        "entity already exists",
                    ));
                    continue;
                }
                Err(e) => {
                    errors.push(EntityError::new(
                        entity.key.clone(),
                        EntityErrorType::WriteError,
                        format!("cannot check existing entity: {}", e),
                    ));
                    continue;
                }
            }
            if let Err(error) = self.write_value(&entity.key, &entity.value).await {
                errors.push(error);
            }
        }
        Ok(EntityErrors { errors })
    }

    async fn upsert_entities_async(&self, command: &UpsertEntities, _ctx: &SyncContext) -> TaskResult<EntityErrors> {
        let _guard = self.lock.write().await;
        self.ensure_dir().await?;
        let mut errors = Vec::new();
        for entity in &command.entities {
            if let Err(error) = self.write_value(&entity.key, &entity.value).await {
                errors.push(error);
            }
        }
        Ok(EntityErrors { errors })
    }

    async fn read_entities_async(&self, command: &ReadEntities, _ctx: &SyncContext) -> TaskResult<Vec<EntityValue>> {
        let _guard = self.lock.read().await;
        let mut entities = Vec::with_capacity(command.ids.len());
        for key in &command.ids {
            let entity = match self.read_value(key).await {
                Ok(Some(value)) => EntityValue::with_value(key.clone(), value),
                Ok(None) => EntityValue::missing(key.clone()),
                Err(error) => EntityValue::with_error(key.clone(), error),
            };
            entities.push(entity);
        }
        Ok(entities)
    }

    async fn query_entities_async(&self, command: &QueryEntities, ctx: &SyncContext) -> TaskResult<QueryPage> {
        let mut collector = QueryCollector::new(command, &self.cursors, ctx.user_id())?;
        let _guard = self.lock.read().await;
        let keys = self.list_keys().await?;
        let start = collector.start_after().cloned();
        let mut remaining = keys
            .into_iter()
            .filter(|key| start.as_ref().map_or(true, |start| key > start))
            .peekable();
        let mut has_more = false;
        while let Some(key) = remaining.next() {
            let value = match self.read_value(&key).await {
                Ok(Some(value)) => value,
                // removed between listing and reading
                Ok(None) => continue,
                Err(error) => return Err(TaskExecuteError::database(error.to_string())),
            };
            if collector.accept(key, &value)?.is_some() {
                has_more = remaining.peek().is_some();
                break;
            }
        }
        Ok(collector.finish(has_more))
    }

    async fn delete_entities_async(&self, command: &DeleteEntities, _ctx: &SyncContext) -> TaskResult<EntityErrors> {
        let _guard = self.lock.write().await;
        let keys = if command.all {
            self.list_keys().await?
        } else {
            command.ids.clone()
        };
        let mut errors = Vec::new();
        for key in &keys {
            if let Err(error) = self.remove_value(key).await {
                errors.push(error);
            }
        }
        Ok(EntityErrors { errors })
    }

    async fn count_all_async(&self, _ctx: &SyncContext) -> TaskResult<usize> {
        let _guard = self.lock.read().await;
        Ok(self.list_keys().await?.len())
    }
}

/// Creates `FileContainer`s below a root directory
pub struct FileBackend {
    root: PathBuf,
    config: HubConfig,
}

impl FileBackend {
    pub fn new<P: AsRef<Path>>(root: P, config: &HubConfig) -> Self {
        FileBackend {
            root: root.as_ref().to_path_buf(),
            config: config.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ContainerFactory for FileBackend {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn create_container(&self, name: &str, key_name: &str) -> Arc<dyn EntityContainer> {
        Arc::new(FileContainer::new(&self.root, name, key_name, &self.config))
    }
}
