//! The agent control loop: poll task slots, classify, then either run the
//! observe/plan/act cycle or hand a generic reply to the patch applier.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::brain::Brain;
use crate::brain::api::ApiBrain;
use crate::brain::chat_ui::ChatUiBrain;
use crate::config::{AgentConfig, BrainMode};
use crate::hands::{BrowserOptions, ChromeSurfer, Surfer};
use crate::patcher::PatchApplier;
use crate::queue::TaskStore;
use crate::state::{AgentEvent, AgentHandle, AgentStatus};
use crate::types::{Action, DEFAULT_STEP_BUDGET, TaskKind, parse_action, truncate_chars};

/// Creates the reasoning backend and the surfer on first use.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch_brain(&self) -> Result<Box<dyn Brain>>;
    async fn launch_surfer(&self) -> Result<Box<dyn Surfer>>;
}

/// Production launcher: real Chrome sessions on per-persona profiles.
pub struct ChromeLauncher {
    config: AgentConfig,
}

impl ChromeLauncher {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn browser_options(&self, profile_dir: PathBuf) -> BrowserOptions {
        BrowserOptions {
            profile_dir,
            session: self.config.session_policy(),
            headless: self.config.headless,
            chrome_path: self.config.chrome_path.clone(),
        }
    }
}

#[async_trait]
impl Launcher for ChromeLauncher {
    async fn launch_brain(&self) -> Result<Box<dyn Brain>> {
        if self.config.resolved_brain() == BrainMode::Api {
            return Ok(Box::new(ApiBrain::new(&self.config.api)?));
        }
        let options = self.browser_options(self.config.brain_profile());
        let chat = self.config.chat.clone();
        let timings = self.config.timings.clone();
        let brain = tokio::task::spawn_blocking(move || ChatUiBrain::launch(&options, chat, timings))
            .await
            .map_err(|e| anyhow!("chat backend launch panicked: {e}"))??;
        Ok(Box::new(brain))
    }

    async fn launch_surfer(&self) -> Result<Box<dyn Surfer>> {
        let options = self.browser_options(self.config.surfer_profile());
        let start_url = self.config.start_url.clone();
        let timings = self.config.timings.clone();
        let surfer = tokio::task::spawn_blocking(move || {
            ChromeSurfer::launch(&options, start_url.as_deref(), timings)
        })
        .await
        .map_err(|e| anyhow!("surfer launch panicked: {e}"))??;
        Ok(Box::new(surfer))
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_steps: usize,
    pub active_poll: Duration,
    pub idle_poll: Duration,
    pub root_dir: PathBuf,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_STEP_BUDGET,
            active_poll: Duration::from_secs(2),
            idle_poll: Duration::from_secs(1),
            root_dir: PathBuf::from("."),
        }
    }
}

impl From<&AgentConfig> for LoopSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            active_poll: config.timings.active_poll,
            idle_poll: config.timings.idle_poll,
            root_dir: config.root_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEnding {
    Done { reason: String },
    BudgetExhausted,
    /// The backend's reply was missing or not a valid action.
    ProtocolError { message: String },
    Stopped,
}

impl fmt::Display for BrowseEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowseEnding::Done { reason } => write!(f, "completed: {reason}"),
            BrowseEnding::BudgetExhausted => write!(f, "step budget exhausted"),
            BrowseEnding::ProtocolError { message } => write!(f, "protocol error: {message}"),
            BrowseEnding::Stopped => write!(f, "stopped by operator"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseOutcome {
    /// Observe/plan cycles performed.
    pub steps: usize,
    pub ending: BrowseEnding,
    pub last_plan: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Browsed(BrowseOutcome),
    Generic { reply: Option<String>, files: usize },
}

impl TaskOutcome {
    /// Human-readable record persisted to the agent's result slot.
    pub fn summary(&self, task: &str) -> String {
        match self {
            TaskOutcome::Browsed(outcome) => format!(
                "BROWSER TASK: {task}\nOUTCOME: {}\nSTEPS: {}\nLAST PLAN: {}",
                outcome.ending,
                outcome.steps,
                outcome.last_plan.as_deref().unwrap_or("none")
            ),
            TaskOutcome::Generic { reply: Some(reply), .. } => reply.clone(),
            TaskOutcome::Generic { reply: None, .. } => "NO REPLY".to_string(),
        }
    }
}

pub struct Orchestrator {
    state: AgentHandle,
    store: Arc<dyn TaskStore>,
    launcher: Box<dyn Launcher>,
    patcher: Box<dyn PatchApplier>,
    settings: LoopSettings,
    brain: Option<Box<dyn Brain>>,
    surfer: Option<Box<dyn Surfer>>,
}

impl Orchestrator {
    pub fn new(
        state: AgentHandle,
        store: Arc<dyn TaskStore>,
        launcher: Box<dyn Launcher>,
        patcher: Box<dyn PatchApplier>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            state,
            store,
            launcher,
            patcher,
            settings,
            brain: None,
            surfer: None,
        }
    }

    /// Poll until `shutdown` resolves, then close any launched browsers.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        self.state.log("Orchestrator active. Waiting for command...");
        tokio::pin!(shutdown);

        loop {
            let delay = if self.state.is_active() {
                // Shutdown preempts an in-flight task.
                let interrupted = tokio::select! {
                    () = &mut shutdown => true,
                    _ = self.poll_once() => false,
                };
                if interrupted {
                    self.state.log("Shutdown requested mid-task; abandoning it.");
                    break;
                }
                self.settings.active_poll
            } else {
                if self.state.status() == AgentStatus::Stopping {
                    self.state.set_status(AgentStatus::Idle);
                }
                self.settings.idle_poll
            };

            tokio::select! {
                () = &mut shutdown => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.state.log("Shutting down.");
        self.shutdown().await;
    }

    /// Service every slot holding a task. Returns how many were processed.
    pub async fn poll_once(&mut self) -> usize {
        let agents = match self.store.agents() {
            Ok(agents) => agents,
            Err(e) => {
                self.state.log(format!("Error listing task slots: {e:#}"));
                return 0;
            }
        };

        let mut processed = 0;
        for agent_id in agents {
            if !self.state.is_active() {
                break;
            }
            match self.store.peek(&agent_id) {
                Ok(Some(task)) => {
                    self.handle_task(&agent_id, &task).await;
                    processed += 1;
                }
                Ok(None) => {}
                Err(e) => self.state.log(format!("Error reading task for {agent_id}: {e:#}")),
            }
        }
        processed
    }

    /// The task boundary: nothing that goes wrong in here escapes it, and the
    /// slot is cleared either way.
    async fn handle_task(&mut self, agent_id: &str, task: &str) {
        self.state.set_current_task(Some(task.to_string()));
        self.state
            .log(format!("Processing task: {}...", truncate_chars(task, 50)));

        let summary = match self.process(task).await {
            Ok(outcome) => {
                let summary = outcome.summary(task);
                self.state.emit(AgentEvent::TaskComplete {
                    summary: summary.clone(),
                });
                summary
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.state.log(format!("Error: {message}"));
                self.state.emit(AgentEvent::TaskError {
                    message: message.clone(),
                });
                format!("TASK FAILED: {task}\nERROR: {message}")
            }
        };

        if let Err(e) = self.store.write_result(agent_id, &summary) {
            self.state.log(format!("Failed to persist result: {e:#}"));
        }
        match self.store.clear_if(agent_id, task) {
            Ok(true) => {}
            Ok(false) => self.state.log("A new task arrived while working; keeping it queued."),
            Err(e) => self.state.log(format!("Failed to clear task slot: {e:#}")),
        }
        self.state.set_current_task(None);
        self.state.set_status(AgentStatus::Idle);
    }

    pub async fn process(&mut self, task: &str) -> Result<TaskOutcome> {
        match TaskKind::classify(task) {
            TaskKind::Browsing => {
                self.state.set_status(AgentStatus::Surfing);
                Ok(TaskOutcome::Browsed(self.run_browsing(task).await?))
            }
            TaskKind::Generic => {
                self.state.set_status(AgentStatus::Starting);
                self.run_generic(task).await
            }
        }
    }

    async fn ensure_brain(&mut self) -> Result<()> {
        if self.brain.is_none() {
            self.state.log("Launching reasoning backend...");
            let brain = self.launcher.launch_brain().await?;
            self.state
                .log(format!("Reasoning backend ready ({}).", brain.label()));
            self.brain = Some(brain);
        }
        Ok(())
    }

    async fn ensure_surfer(&mut self) -> Result<()> {
        if self.surfer.is_none() {
            self.state.log("Launching surfer browser...");
            self.surfer = Some(self.launcher.launch_surfer().await?);
        }
        Ok(())
    }

    /// Observe, ask, act; at most `max_steps` times.
    pub async fn run_browsing(&mut self, task: &str) -> Result<BrowseOutcome> {
        self.ensure_surfer().await?;
        self.ensure_brain().await?;

        let (Some(surfer), Some(brain)) = (self.surfer.as_deref_mut(), self.brain.as_deref_mut())
        else {
            return Err(anyhow!("browser sessions unavailable"));
        };
        let state = &self.state;
        let budget = self.settings.max_steps;
        let mut last_plan: Option<String> = None;

        for step in 1..=budget {
            if !state.is_active() {
                state.log("Stop requested; abandoning task.");
                return Ok(BrowseOutcome {
                    steps: step - 1,
                    ending: BrowseEnding::Stopped,
                    last_plan,
                });
            }

            state.log(format!("Step {step}/{budget}: capturing browser state..."));
            let observation = surfer.capture_state().await?;
            state.set_screenshot(observation.screenshot.clone());

            state.log(format!("Consulting reasoning backend ({})...", brain.label()));
            let Some(reply) = brain.ask(task, Some(&observation)).await else {
                state.log("Reasoning backend gave no usable reply.");
                return Ok(BrowseOutcome {
                    steps: step,
                    ending: BrowseEnding::ProtocolError {
                        message: "no reply from reasoning backend".to_string(),
                    },
                    last_plan,
                });
            };
            last_plan = Some(reply.clone());

            let action = match parse_action(&reply) {
                Ok(action) => action,
                Err(e) => {
                    state.log(format!(
                        "Failed to parse plan as an action ({e}): {}",
                        truncate_chars(&reply, 80)
                    ));
                    return Ok(BrowseOutcome {
                        steps: step,
                        ending: BrowseEnding::ProtocolError {
                            message: e.to_string(),
                        },
                        last_plan,
                    });
                }
            };

            if let Action::Done { reason } = action {
                state.log(format!("Task complete: {reason}"));
                return Ok(BrowseOutcome {
                    steps: step,
                    ending: BrowseEnding::Done { reason },
                    last_plan,
                });
            }

            state.log(format!("Executing: {}", action.describe()));
            if !surfer.execute_action(&action).await {
                state.log(format!("Action failed: {}", action.describe()));
            }
        }

        state.log(format!("Step budget of {budget} exhausted."));
        Ok(BrowseOutcome {
            steps: budget,
            ending: BrowseEnding::BudgetExhausted,
            last_plan,
        })
    }

    async fn run_generic(&mut self, task: &str) -> Result<TaskOutcome> {
        self.ensure_brain().await?;
        let brain = self
            .brain
            .as_deref_mut()
            .ok_or_else(|| anyhow!("reasoning backend unavailable"))?;

        self.state
            .log(format!("Consulting reasoning backend ({})...", brain.label()));
        let reply = brain
            .ask(task, None)
            .await
            .filter(|r| !r.trim().is_empty());

        let Some(reply) = reply else {
            self.state.log("Reasoning backend gave no reply.");
            return Ok(TaskOutcome::Generic {
                reply: None,
                files: 0,
            });
        };

        let files = self.patcher.apply(&reply, &self.settings.root_dir)?;
        self.state.log(format!("Applied changes to {files} file(s)."));
        Ok(TaskOutcome::Generic {
            reply: Some(reply),
            files,
        })
    }

    /// Close both browser sessions if they were ever launched.
    pub async fn shutdown(&mut self) {
        if let Some(surfer) = self.surfer.as_deref_mut() {
            surfer.close().await;
        }
        if let Some(brain) = self.brain.as_deref_mut() {
            brain.close().await;
        }
    }
}
