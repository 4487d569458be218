use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{info, warn};

use crate::config::Timings;
use crate::dom::{
    self, CURRENT_URL_JS, ElementFacts, VISIBLE_TEXT_JS, clear_value_script, interactable_probe,
    scroll_script,
};
use crate::profile::{self, ProfileOutcome, SessionPolicy};
use crate::types::{Action, MAX_VISIBLE_TEXT_CHARS, Observation, truncate_chars};

const WINDOW_SIZE: (u32, u32) = (1280, 900);
// Sessions sit idle between tasks; keep the CDP connection open regardless.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Observes the page and performs one primitive action per call.
#[async_trait]
pub trait Surfer: Send {
    /// Pure read of the current page.
    async fn capture_state(&mut self) -> Result<Observation>;

    /// Run one action. Resolution and timeout failures come back as `false`.
    async fn execute_action(&mut self, action: &Action) -> bool;

    /// Shut the browser down. Safe to call repeatedly.
    async fn close(&mut self);
}

/// How to start one browser persona.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub profile_dir: PathBuf,
    pub session: SessionPolicy,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
}

/// Check the persona's profile, then launch Chrome on it with one fresh tab.
pub fn launch_browser(options: &BrowserOptions) -> Result<(Browser, Arc<Tab>)> {
    let outcome = profile::ensure_compatible_with(
        &options.profile_dir,
        &options.session,
        &profile::HostIdentity::current(),
    );
    if outcome == ProfileOutcome::ResetFailed {
        warn!(profile = %options.profile_dir.display(), "profile reset failed; using it as is");
    }

    let launch = LaunchOptions {
        headless: options.headless,
        path: options.chrome_path.clone(),
        user_data_dir: Some(options.profile_dir.clone()),
        window_size: Some(WINDOW_SIZE),
        args: vec![
            OsStr::new("--no-first-run"),
            OsStr::new("--no-default-browser-check"),
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--password-store=basic"),
        ],
        idle_browser_timeout: IDLE_BROWSER_TIMEOUT,
        ..Default::default()
    };

    info!(profile = %options.profile_dir.display(), ?outcome, "starting Chrome");
    let browser = Browser::new(launch).map_err(|e| anyhow!("Browser launch failed: {e}"))?;
    let tab = browser.new_tab()?;
    Ok((browser, tab))
}

/// Evaluate `js` and return its string result, if any.
pub fn eval_string(tab: &Tab, js: &str) -> Result<Option<String>> {
    let result = tab.evaluate(js, false)?;
    Ok(result.value.and_then(|v| v.as_str().map(String::from)))
}

/// Poll until `selector` is present, rendered and enabled.
pub fn wait_until_interactable(
    tab: &Tab,
    selector: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    let probe = interactable_probe(selector);
    let deadline = Instant::now() + timeout;
    loop {
        let state = eval_string(tab, &probe)?.unwrap_or_else(|| "missing".to_string());
        match state.as_str() {
            "ready" => return Ok(()),
            "invalid" => bail!("invalid selector {selector:?}"),
            _ if Instant::now() >= deadline => {
                bail!("{selector:?} not interactable after {timeout:?} ({state})")
            }
            _ => std::thread::sleep(poll),
        }
    }
}

/// Sleep roughly `base`, jittered to +/-25% so actions don't land on a metronome.
pub fn human_pause(base: Duration) {
    let factor = 0.75 + rand::random::<f64>() * 0.5;
    std::thread::sleep(base.mul_f64(factor));
}

pub struct ChromeSurfer {
    browser: Option<Browser>,
    tab: Arc<Tab>,
    timings: Timings,
}

impl ChromeSurfer {
    /// Blocking: launches Chrome. Call from a blocking context.
    pub fn launch(
        options: &BrowserOptions,
        start_url: Option<&str>,
        timings: Timings,
    ) -> Result<Self> {
        let (browser, tab) = launch_browser(options)?;
        match start_url {
            Some(url) => {
                info!(url, "surfer starting page");
                tab.navigate_to(url)?.wait_until_navigated()?;
                std::thread::sleep(timings.navigate_settle);
            }
            None => {
                tab.navigate_to("about:blank")?;
            }
        }
        Ok(Self {
            browser: Some(browser),
            tab,
            timings,
        })
    }
}

fn capture_blocking(tab: &Tab) -> Result<Observation> {
    let screenshot = tab
        .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
        .context("screenshot failed")?;

    let url = eval_string(tab, CURRENT_URL_JS)?.unwrap_or_else(|| tab.get_url());
    let text = eval_string(tab, VISIBLE_TEXT_JS)?.unwrap_or_default();

    let raw = eval_string(tab, &dom::elements_script())?.unwrap_or_else(|| "[]".to_string());
    let facts: Vec<ElementFacts> =
        serde_json::from_str(&raw).context("element scan returned malformed data")?;

    Ok(Observation {
        url,
        screenshot,
        visible_text: truncate_chars(&text, MAX_VISIBLE_TEXT_CHARS),
        interactive_elements: dom::descriptors(facts),
    })
}

fn execute_blocking(tab: &Tab, action: &Action, timings: &Timings) -> Result<()> {
    match action {
        Action::Navigate { url } => {
            tab.navigate_to(url)?.wait_until_navigated()?;
            std::thread::sleep(timings.navigate_settle);
        }
        Action::Click { selector } => {
            wait_until_interactable(tab, selector, timings.element_wait, timings.element_poll)?;
            tab.find_element(selector)?.click()?;
        }
        Action::Type { selector, value } => {
            wait_until_interactable(tab, selector, timings.element_wait, timings.element_poll)?;
            tab.find_element(selector)?.click()?;
            tab.evaluate(&clear_value_script(selector), false)?;
            tab.type_str(value)?;
        }
        Action::Scroll => {
            tab.evaluate(&scroll_script(timings.scroll_offset), false)?;
        }
        Action::Done { .. } => {}
    }
    Ok(())
}

#[async_trait]
impl Surfer for ChromeSurfer {
    async fn capture_state(&mut self) -> Result<Observation> {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || capture_blocking(&tab))
            .await
            .map_err(|e| anyhow!("capture task panicked: {e}"))?
    }

    async fn execute_action(&mut self, action: &Action) -> bool {
        let tab = self.tab.clone();
        let timings = self.timings.clone();
        let owned = action.clone();
        let result = tokio::task::spawn_blocking(move || {
            let result = execute_blocking(&tab, &owned, &timings);
            human_pause(timings.action_pause);
            result
        })
        .await;

        match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(action = %action.describe(), error = %format!("{e:#}"), "action failed");
                false
            }
            Err(e) => {
                warn!(action = %action.describe(), error = %e, "action task panicked");
                false
            }
        }
    }

    async fn close(&mut self) {
        if let Some(browser) = self.browser.take() {
            info!("closing surfer browser");
            let _ = tokio::task::spawn_blocking(move || drop(browser)).await;
        }
    }
}
