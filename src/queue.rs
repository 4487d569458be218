//! Single-slot task queues, one slot per agent id, plus the result sink.
//!
//! Contract: a slot holds at most one pending task, `enqueue` overwrites it,
//! and draining reads and clears it.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_AGENT_ID: &str = "a1_frontend";
pub const REGISTRY_FILE: &str = "config.json";
const INPUT_SUFFIX: &str = "_input.txt";
const OUTPUT_SUFFIX: &str = "_output.txt";

pub trait TaskStore: Send + Sync {
    /// Agent ids that own an input slot.
    fn agents(&self) -> Result<Vec<String>>;

    fn enqueue(&self, agent_id: &str, task: &str) -> Result<()>;

    /// The pending task, if the slot holds anything besides whitespace.
    fn peek(&self, agent_id: &str) -> Result<Option<String>>;

    /// Empty the slot. Clearing an empty slot is a no-op.
    fn clear(&self, agent_id: &str) -> Result<()>;

    /// Empty the slot only if it still holds `task`, so a task enqueued while
    /// `task` was being processed survives. Returns whether it cleared.
    fn clear_if(&self, agent_id: &str, task: &str) -> Result<bool>;

    fn drain(&self, agent_id: &str) -> Result<Option<String>> {
        let task = self.peek(agent_id)?;
        if task.is_some() {
            self.clear(agent_id)?;
        }
        Ok(task)
    }

    fn write_result(&self, agent_id: &str, summary: &str) -> Result<()>;

    fn read_result(&self, agent_id: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistry {
    pub agents: Vec<AgentEntry>,
}

fn validate_agent_id(agent_id: &str) -> Result<()> {
    let ok = !agent_id.is_empty()
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        bail!("invalid agent id {agent_id:?}");
    }
    Ok(())
}

/// Text files in one directory: `<id>_input.txt` is the slot,
/// `<id>_output.txt` holds the last result.
pub struct FileTaskStore {
    dir: PathBuf,
    // Serializes slot writes within this process.
    write_lock: Mutex<()>,
}

impl FileTaskStore {
    /// Open the agents directory, creating the registry and a default slot
    /// pair on first use.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        };
        std::fs::create_dir_all(&store.dir)
            .with_context(|| format!("creating agents dir {}", store.dir.display()))?;

        let registry = store.dir.join(REGISTRY_FILE);
        if !registry.exists() {
            let default = AgentRegistry {
                agents: vec![AgentEntry {
                    id: DEFAULT_AGENT_ID.to_string(),
                }],
            };
            write_file(&registry, &serde_json::to_string_pretty(&default)?)?;
        }

        if store.agents()?.is_empty() {
            write_file(&store.slot(DEFAULT_AGENT_ID, INPUT_SUFFIX)?, "")?;
            write_file(&store.slot(DEFAULT_AGENT_ID, OUTPUT_SUFFIX)?, "")?;
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn registry(&self) -> Result<AgentRegistry> {
        let file = std::fs::File::open(self.dir.join(REGISTRY_FILE))?;
        let registry = serde_json::from_reader(BufReader::new(file))?;
        Ok(registry)
    }

    fn slot(&self, agent_id: &str, suffix: &str) -> Result<PathBuf> {
        validate_agent_id(agent_id)?;
        Ok(self.dir.join(format!("{agent_id}{suffix}")))
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

fn read_trimmed(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let content = content.trim();
    Ok((!content.is_empty()).then(|| content.to_string()))
}

impl TaskStore for FileTaskStore {
    fn agents(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(INPUT_SUFFIX))
                    .map(String::from)
            })
            .filter(|id| validate_agent_id(id).is_ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn enqueue(&self, agent_id: &str, task: &str) -> Result<()> {
        let path = self.slot(agent_id, INPUT_SUFFIX)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_file(&path, task)
    }

    fn peek(&self, agent_id: &str) -> Result<Option<String>> {
        read_trimmed(&self.slot(agent_id, INPUT_SUFFIX)?)
    }

    fn clear(&self, agent_id: &str) -> Result<()> {
        let path = self.slot(agent_id, INPUT_SUFFIX)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if path.exists() {
            write_file(&path, "")?;
        }
        Ok(())
    }

    fn clear_if(&self, agent_id: &str, task: &str) -> Result<bool> {
        let path = self.slot(agent_id, INPUT_SUFFIX)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if read_trimmed(&path)?.as_deref() != Some(task.trim()) {
            return Ok(false);
        }
        write_file(&path, "")?;
        Ok(true)
    }

    fn write_result(&self, agent_id: &str, summary: &str) -> Result<()> {
        write_file(&self.slot(agent_id, OUTPUT_SUFFIX)?, summary)
    }

    fn read_result(&self, agent_id: &str) -> Result<Option<String>> {
        read_trimmed(&self.slot(agent_id, OUTPUT_SUFFIX)?)
    }
}

/// Volatile store for embedding and tests.
#[derive(Default)]
pub struct MemoryTaskStore {
    inputs: Mutex<HashMap<String, String>>,
    outputs: Mutex<HashMap<String, String>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn agents(&self) -> Result<Vec<String>> {
        let inputs = self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = inputs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn enqueue(&self, agent_id: &str, task: &str) -> Result<()> {
        validate_agent_id(agent_id)?;
        self.inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.to_string(), task.to_string());
        Ok(())
    }

    fn peek(&self, agent_id: &str) -> Result<Option<String>> {
        let inputs = self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inputs
            .get(agent_id)
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(String::from))
    }

    fn clear(&self, agent_id: &str) -> Result<()> {
        if let Some(slot) = self
            .inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(agent_id)
        {
            slot.clear();
        }
        Ok(())
    }

    fn clear_if(&self, agent_id: &str, task: &str) -> Result<bool> {
        let mut inputs = self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
        match inputs.get_mut(agent_id) {
            Some(slot) if slot.trim() == task.trim() => {
                slot.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn write_result(&self, agent_id: &str, summary: &str) -> Result<()> {
        validate_agent_id(agent_id)?;
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.to_string(), summary.to_string());
        Ok(())
    }

    fn read_result(&self, agent_id: &str) -> Result<Option<String>> {
        let outputs = self.outputs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(outputs.get(agent_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_drain_yields_task_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).unwrap();
        store.enqueue(DEFAULT_AGENT_ID, "browse jobs").unwrap();

        assert_eq!(
            store.drain(DEFAULT_AGENT_ID).unwrap().as_deref(),
            Some("browse jobs")
        );
        assert_eq!(store.drain(DEFAULT_AGENT_ID).unwrap(), None);
    }

    #[test]
    fn enqueue_overwrites_the_slot() {
        let store = MemoryTaskStore::new();
        store.enqueue("a1", "first").unwrap();
        store.enqueue("a1", "second").unwrap();
        assert_eq!(store.drain("a1").unwrap().as_deref(), Some("second"));
        assert_eq!(store.drain("a1").unwrap(), None);
    }

    #[test]
    fn clearing_an_empty_slot_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).unwrap();
        store.clear(DEFAULT_AGENT_ID).unwrap();
        store.clear(DEFAULT_AGENT_ID).unwrap();
        store.clear("never_created").unwrap();
        assert_eq!(store.peek(DEFAULT_AGENT_ID).unwrap(), None);
        assert!(!dir.path().join("never_created_input.txt").exists());
    }

    #[test]
    fn conditional_clear_keeps_a_newer_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).unwrap();
        store.enqueue(DEFAULT_AGENT_ID, "browse A").unwrap();
        store.enqueue(DEFAULT_AGENT_ID, "browse B").unwrap();

        assert!(!store.clear_if(DEFAULT_AGENT_ID, "browse A").unwrap());
        assert_eq!(
            store.peek(DEFAULT_AGENT_ID).unwrap().as_deref(),
            Some("browse B")
        );
        assert!(store.clear_if(DEFAULT_AGENT_ID, "browse B").unwrap());
        assert_eq!(store.peek(DEFAULT_AGENT_ID).unwrap(), None);

        let memory = MemoryTaskStore::new();
        memory.enqueue("a1", "browse B").unwrap();
        assert!(!memory.clear_if("a1", "browse A").unwrap());
        assert!(memory.clear_if("a1", " browse B ").unwrap());
        assert_eq!(memory.peek("a1").unwrap(), None);
    }

    #[test]
    fn open_lays_out_registry_and_default_slots() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).unwrap();
        assert_eq!(store.agents().unwrap(), vec![DEFAULT_AGENT_ID.to_string()]);
        assert_eq!(store.registry().unwrap().agents[0].id, DEFAULT_AGENT_ID);
        assert!(dir.path().join("a1_frontend_output.txt").exists());
    }

    #[test]
    fn results_round_trip_and_ids_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).unwrap();
        store.write_result(DEFAULT_AGENT_ID, "done").unwrap();
        assert_eq!(
            store.read_result(DEFAULT_AGENT_ID).unwrap().as_deref(),
            Some("done")
        );
        assert!(store.enqueue("../escape", "x").is_err());
    }
}
