//! Startup configuration: command-line flags with environment fallbacks.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::profile::{SessionPolicy, UnknownProfilePolicy};
use crate::types::DEFAULT_STEP_BUDGET;

pub const DEFAULT_TASK: &str =
    "Browse https://testdevjobs.com/ for 'Software Engineer' jobs and apply.";
pub const DEFAULT_CHAT_URL: &str = "https://aistudio.google.com/app/prompts/new_chat";
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum BrainMode {
    /// Hosted API when a key is configured, chat UI otherwise.
    #[default]
    Auto,
    Api,
    ChatUi,
}

/// Every wait and retry bound the agent uses.
#[derive(Debug, Clone)]
pub struct Timings {
    pub active_poll: Duration,
    pub idle_poll: Duration,
    pub navigate_settle: Duration,
    pub action_pause: Duration,
    pub element_wait: Duration,
    pub element_poll: Duration,
    pub scroll_offset: i64,
    pub send_attempts: u32,
    pub send_poll: Duration,
    /// Attempt after which the composer gets an extra keystroke.
    pub send_nudge_at: u32,
    pub response_attempts: u32,
    pub response_poll: Duration,
    pub profile_retries: u32,
    pub profile_backoff: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            active_poll: Duration::from_secs(2),
            idle_poll: Duration::from_secs(1),
            navigate_settle: Duration::from_secs(3),
            action_pause: Duration::from_secs(1),
            element_wait: Duration::from_secs(5),
            element_poll: Duration::from_millis(250),
            scroll_offset: 500,
            send_attempts: 10,
            send_poll: Duration::from_millis(500),
            send_nudge_at: 5,
            response_attempts: 30,
            response_poll: Duration::from_secs(1),
            profile_retries: 3,
            profile_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub key: Option<String>,
    pub base_url: String,
    pub model: String,
}

/// Locators for the third-party chat page. All of them are guesses about
/// markup we do not control, so every one is overridable.
#[derive(Debug, Clone)]
pub struct ChatUiConfig {
    pub url: String,
    pub model_picker: Option<String>,
    pub model_option: Option<String>,
    pub input: String,
    pub send_buttons: Vec<String>,
    pub responses: Vec<String>,
}

impl Default for ChatUiConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CHAT_URL.to_string(),
            model_picker: Some("[data-testid='model-picker-button']".to_string()),
            model_option: Some("[data-testid^='model-card-']".to_string()),
            input: "textarea".to_string(),
            send_buttons: vec![
                "button[aria-label*='Run']".to_string(),
                "button[aria-label*='Send']".to_string(),
                "button.rt-IconButton".to_string(),
            ],
            responses: vec![
                ".response-content".to_string(),
                ".model-response-text".to_string(),
                "[data-text-content]".to_string(),
                ".message-content".to_string(),
                "ms-chat-turn .text-content".to_string(),
                ".markdown-content".to_string(),
                "div[class*='response']".to_string(),
                "div[class*='output']".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub port: u16,
    pub agents_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub root_dir: PathBuf,
    pub brain: BrainMode,
    pub api: ApiConfig,
    pub chat: ChatUiConfig,
    pub start_url: Option<String>,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub max_steps: usize,
    pub default_task: String,
    pub fresh_browser: bool,
    pub unknown_profile: UnknownProfilePolicy,
    pub timings: Timings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            agents_dir: PathBuf::from("agents"),
            profiles_dir: default_profiles_dir(),
            root_dir: PathBuf::from("."),
            brain: BrainMode::Auto,
            api: ApiConfig {
                key: None,
                base_url: DEFAULT_API_BASE.to_string(),
                model: DEFAULT_MODEL.to_string(),
            },
            chat: ChatUiConfig::default(),
            start_url: None,
            headless: false,
            chrome_path: None,
            max_steps: DEFAULT_STEP_BUDGET,
            default_task: DEFAULT_TASK.to_string(),
            fresh_browser: false,
            unknown_profile: UnknownProfilePolicy::Preserve,
            timings: Timings::default(),
        }
    }
}

impl AgentConfig {
    pub fn brain_profile(&self) -> PathBuf {
        self.profiles_dir.join("brain")
    }

    pub fn surfer_profile(&self) -> PathBuf {
        self.profiles_dir.join("surfer")
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            force_reset: self.fresh_browser,
            unknown: self.unknown_profile,
            delete_retries: self.timings.profile_retries,
            retry_backoff: self.timings.profile_backoff,
        }
    }

    /// `Auto` collapses to `Api` when a non-empty key is present.
    pub fn resolved_brain(&self) -> BrainMode {
        match self.brain {
            BrainMode::Auto if self.api.key.as_deref().is_some_and(|k| !k.is_empty()) => {
                BrainMode::Api
            }
            BrainMode::Auto => BrainMode::ChatUi,
            mode => mode,
        }
    }
}

fn default_profiles_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("surfer-agent").join("profiles"))
        .unwrap_or_else(|| PathBuf::from("data").join("profiles"))
}

#[derive(Debug, Parser)]
#[command(name = "agent", about = "Observe, plan and act on live web pages")]
pub struct Cli {
    /// Control surface port (the next nine are tried if busy)
    #[arg(long, env = "AGENT_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Directory holding the per-agent task slots
    #[arg(long, env = "AGENT_AGENTS_DIR", default_value = "agents")]
    pub agents_dir: PathBuf,

    /// Root for the persistent browser profiles
    #[arg(long, env = "AGENT_PROFILES_DIR")]
    pub profiles_dir: Option<PathBuf>,

    /// Root directory generic-task patches are written under
    #[arg(long, env = "AGENT_ROOT_DIR", default_value = ".")]
    pub root_dir: PathBuf,

    /// Wipe browser profiles before use
    #[arg(long, env = "FRESH_BROWSER")]
    pub fresh_browser: bool,

    /// What to do with a profile that has no identity metadata
    #[arg(long, env = "AGENT_UNKNOWN_PROFILE", value_enum, default_value_t = UnknownProfilePolicy::Preserve)]
    pub unknown_profile: UnknownProfilePolicy,

    #[arg(long, env = "AGENT_BRAIN", value_enum, default_value_t = BrainMode::Auto)]
    pub brain: BrainMode,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    #[arg(long, env = "AGENT_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Chat page driven in chat-ui mode
    #[arg(long, env = "AGENT_CHAT_URL", default_value = DEFAULT_CHAT_URL)]
    pub chat_url: String,

    /// Selector that opens the chat page's model menu
    #[arg(long, env = "AGENT_CHAT_MODEL_PICKER")]
    pub chat_model_picker: Option<String>,

    /// Selector of the model entry to pick from that menu
    #[arg(long, env = "AGENT_CHAT_MODEL_OPTION")]
    pub chat_model_option: Option<String>,

    #[arg(long, env = "AGENT_START_URL")]
    pub start_url: Option<String>,

    #[arg(long, env = "AGENT_HEADLESS")]
    pub headless: bool,

    #[arg(long, env = "CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,

    /// Hard ceiling on observe/plan/act cycles per browsing task
    #[arg(long, env = "AGENT_MAX_STEPS", default_value_t = DEFAULT_STEP_BUDGET)]
    pub max_steps: usize,

    /// Task seeded by `start` when the slot is empty
    #[arg(long, env = "AGENT_DEFAULT_TASK", default_value = DEFAULT_TASK)]
    pub default_task: String,

    #[arg(long, env = "AGENT_ACTIVE_POLL_MS", default_value_t = 2000)]
    pub active_poll_ms: u64,

    #[arg(long, env = "AGENT_IDLE_POLL_MS", default_value_t = 1000)]
    pub idle_poll_ms: u64,

    #[arg(long, env = "AGENT_SETTLE_MS", default_value_t = 3000)]
    pub settle_ms: u64,

    #[arg(long, env = "AGENT_PAUSE_MS", default_value_t = 1000)]
    pub pause_ms: u64,

    #[arg(long, env = "AGENT_ELEMENT_WAIT_MS", default_value_t = 5000)]
    pub element_wait_ms: u64,

    #[arg(long, env = "AGENT_RESPONSE_ATTEMPTS", default_value_t = 30)]
    pub response_attempts: u32,

    #[arg(long, env = "AGENT_RESPONSE_POLL_MS", default_value_t = 1000)]
    pub response_poll_ms: u64,
}

impl Cli {
    pub fn into_config(self) -> AgentConfig {
        let defaults = AgentConfig::default();
        let mut chat = ChatUiConfig {
            url: self.chat_url,
            ..ChatUiConfig::default()
        };
        if self.chat_model_picker.is_some() {
            chat.model_picker = self.chat_model_picker;
        }
        if self.chat_model_option.is_some() {
            chat.model_option = self.chat_model_option;
        }

        AgentConfig {
            port: self.port,
            agents_dir: self.agents_dir,
            profiles_dir: self.profiles_dir.unwrap_or(defaults.profiles_dir),
            root_dir: self.root_dir,
            brain: self.brain,
            api: ApiConfig {
                key: self.api_key,
                base_url: self.api_base,
                model: self.model,
            },
            chat,
            start_url: self.start_url,
            headless: self.headless,
            chrome_path: self.chrome_path,
            max_steps: self.max_steps,
            default_task: self.default_task,
            fresh_browser: self.fresh_browser,
            unknown_profile: self.unknown_profile,
            timings: Timings {
                active_poll: Duration::from_millis(self.active_poll_ms),
                idle_poll: Duration::from_millis(self.idle_poll_ms),
                navigate_settle: Duration::from_millis(self.settle_ms),
                action_pause: Duration::from_millis(self.pause_ms),
                element_wait: Duration::from_millis(self.element_wait_ms),
                response_attempts: self.response_attempts,
                response_poll: Duration::from_millis(self.response_poll_ms),
                ..defaults.timings
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_mode_prefers_api_when_key_present() {
        let mut config = AgentConfig::default();
        assert_eq!(config.resolved_brain(), BrainMode::ChatUi);

        config.api.key = Some(String::new());
        assert_eq!(config.resolved_brain(), BrainMode::ChatUi);

        config.api.key = Some("sk-test".into());
        assert_eq!(config.resolved_brain(), BrainMode::Api);

        config.brain = BrainMode::ChatUi;
        assert_eq!(config.resolved_brain(), BrainMode::ChatUi);
    }

    #[test]
    fn cli_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "agent",
            "--port",
            "6000",
            "--max-steps",
            "5",
            "--fresh-browser",
            "--unknown-profile",
            "purge",
            "--brain",
            "chat-ui",
            "--profiles-dir",
            "/tmp/profiles",
        ])
        .unwrap();
        let config = cli.into_config();
        assert_eq!(config.port, 6000);
        assert_eq!(config.max_steps, 5);
        assert!(config.session_policy().force_reset);
        assert_eq!(config.unknown_profile, UnknownProfilePolicy::Purge);
        assert_eq!(config.brain, BrainMode::ChatUi);
        assert_eq!(config.surfer_profile(), PathBuf::from("/tmp/profiles/surfer"));
        assert_eq!(config.timings.response_attempts, 30);
    }
}
