//! Process-wide agent status shared by the control loop and the HTTP surface.
//!
//! The state sits behind a single mutex inside [`AgentHandle`]. Nothing holds
//! the lock across an `.await`; every accessor copies in or out and releases.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::types::LOG_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AgentStatus {
    #[default]
    Idle,
    Starting,
    Surfing,
    Stopping,
}

/// Bounded FIFO of log lines; the oldest entry is evicted first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: String) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.entries.iter()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

#[derive(Debug, Default)]
pub struct AgentState {
    pub active: bool,
    pub status: AgentStatus,
    pub log: LogBuffer,
    pub latest_screenshot: Option<Vec<u8>>,
    pub current_task: Option<String>,
}

/// Read-only view served to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub active: bool,
    pub status: AgentStatus,
    pub logs: Vec<String>,
    /// Base64-encoded PNG.
    pub latest_screenshot: Option<String>,
    pub current_task: Option<String>,
}

/// Write commands accepted from the control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { task: Option<String> },
    Stop,
}

/// Events streamed to live subscribers.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    Log { line: String },
    Status { status: AgentStatus },
    TaskComplete { summary: String },
    TaskError { message: String },
}

#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<Mutex<AgentState>>,
    events: broadcast::Sender<AgentEvent>,
}

impl Default for AgentHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentHandle {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            inner: Arc::new(Mutex::new(AgentState::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Append a timestamped line to the ring buffer and mirror it to tracing.
    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(target: "agent", "{message}");
        let line = format!("[{}] {message}", chrono::Local::now().format("%H:%M:%S"));
        self.lock().log.push(line.clone());
        self.emit(AgentEvent::Log { line });
    }

    pub fn apply(&self, command: &Command) {
        let status = {
            let mut state = self.lock();
            match command {
                Command::Start { .. } => {
                    state.active = true;
                    state.status = AgentStatus::Starting;
                }
                Command::Stop => {
                    state.active = false;
                    state.status = AgentStatus::Stopping;
                }
            }
            state.status
        };
        self.emit(AgentEvent::Status { status });
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn status(&self) -> AgentStatus {
        self.lock().status
    }

    pub fn set_status(&self, status: AgentStatus) {
        let changed = {
            let mut state = self.lock();
            std::mem::replace(&mut state.status, status) != status
        };
        if changed {
            self.emit(AgentEvent::Status { status });
        }
    }

    pub fn set_current_task(&self, task: Option<String>) {
        self.lock().current_task = task;
    }

    pub fn set_screenshot(&self, png: Vec<u8>) {
        if !png.is_empty() {
            self.lock().latest_screenshot = Some(png);
        }
    }

    pub fn logs(&self) -> Vec<String> {
        self.lock().log.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let state = self.lock();
        StateSnapshot {
            active: state.active,
            status: state.status,
            logs: state.log.iter().cloned().collect(),
            latest_screenshot: state.latest_screenshot.as_ref().map(|b| STANDARD.encode(b)),
            current_task: state.current_task.clone(),
        }
    }
}
