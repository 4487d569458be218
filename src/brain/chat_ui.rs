//! Drives a third-party chat page as a reasoning backend.
//!
//! Everything here depends on markup we don't control, so no step is allowed
//! to fail the caller: a missing picker, composer, send button or response
//! region degrades to "no response".

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use headless_chrome::{Browser, Tab};
use regex::Regex;
use tracing::{debug, info, warn};

use super::{Brain, build_prompt, normalize_reply};
use crate::config::{ChatUiConfig, Timings};
use crate::dom::js_string;
use crate::hands::{BrowserOptions, eval_string, launch_browser, wait_until_interactable};
use crate::types::Observation;

/// A flat JSON object carrying an `"action"` key anywhere in page text.
static ACTION_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{[^{}]*"action"[^{}]*\}"#).unwrap());

const MIN_RESPONSE_CHARS: usize = 10;
const SEND_MARKER: &str = "data-agent-send";

pub struct ChatUiBrain {
    browser: Option<Browser>,
    tab: Arc<Tab>,
    config: ChatUiConfig,
    timings: Timings,
}

impl ChatUiBrain {
    /// Blocking: launches the persona browser and opens the chat page.
    pub fn launch(options: &BrowserOptions, config: ChatUiConfig, timings: Timings) -> Result<Self> {
        let (browser, tab) = launch_browser(options)?;
        tab.navigate_to(&config.url)?.wait_until_navigated()?;
        info!(url = %config.url, "chat backend ready (log in manually if prompted)");
        Ok(Self {
            browser: Some(browser),
            tab,
            config,
            timings,
        })
    }
}

/// Pick the configured model. Best effort: the page may already be on it.
fn select_model(tab: &Tab, config: &ChatUiConfig, timings: &Timings) {
    let (Some(picker), Some(option)) = (&config.model_picker, &config.model_option) else {
        return;
    };
    for selector in [picker, option] {
        let clicked = wait_until_interactable(tab, selector, timings.element_wait, timings.element_poll)
            .and_then(|()| {
                tab.find_element(selector)?.click()?;
                Ok(())
            });
        if let Err(e) = clicked {
            debug!(selector = %selector, error = %format!("{e:#}"), "model selection skipped");
            return;
        }
        std::thread::sleep(timings.send_poll);
    }
}

/// Set the composer's value the way a framework-controlled input expects.
fn fill_script(selector: &str, text: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return 'missing';
  el.focus();
  const proto = Object.getPrototypeOf(el);
  const desc = Object.getOwnPropertyDescriptor(proto, 'value');
  if (desc && desc.set) {{ desc.set.call(el, {text}); }} else {{ el.value = {text}; }}
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  return 'ok';
}})()"#,
        sel = js_string(selector),
        text = js_string(text)
    )
}

/// Mark the last enabled send control so a real click can target it.
fn mark_send_script(selectors: &[String]) -> String {
    format!(
        r#"(() => {{
  document.querySelectorAll('[{marker}]').forEach(e => e.removeAttribute('{marker}'));
  for (const s of {sels}) {{
    let nodes;
    try {{ nodes = Array.from(document.querySelectorAll(s)); }} catch (e) {{ continue; }}
    for (const el of nodes.reverse()) {{
      const off = el.disabled || el.getAttribute('data-disabled') === 'true'
        || el.getAttribute('aria-disabled') === 'true';
      if (!off && el.getClientRects().length > 0) {{
        el.setAttribute('{marker}', '1');
        return 'marked';
      }}
    }}
  }}
  return '';
}})()"#,
        marker = SEND_MARKER,
        sels = serde_json::to_string(selectors).unwrap_or_else(|_| "[]".to_string())
    )
}

/// Last substantial text under each response selector, in priority order.
fn response_script(selectors: &[String]) -> String {
    format!(
        r#"(() => {{
  const out = [];
  for (const s of {sels}) {{
    let nodes;
    try {{ nodes = document.querySelectorAll(s); }} catch (e) {{ continue; }}
    if (nodes.length) {{
      const t = (nodes[nodes.length - 1].innerText || '').trim();
      if (t.length > {min}) out.push(t);
    }}
  }}
  return JSON.stringify(out);
}})()"#,
        sels = serde_json::to_string(selectors).unwrap_or_else(|_| "[]".to_string()),
        min = MIN_RESPONSE_CHARS
    )
}

/// What the page shows before we send, so old answers are not mistaken for new.
#[derive(Debug, Default)]
struct Baseline {
    responses: HashSet<String>,
    action_objects: HashSet<String>,
}

fn scan_selectors(tab: &Tab, config: &ChatUiConfig) -> Vec<String> {
    eval_string(tab, &response_script(&config.responses))
        .ok()
        .flatten()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn scan_page_objects(tab: &Tab) -> Vec<String> {
    let text = eval_string(tab, "document.body ? document.body.innerText : ''")
        .ok()
        .flatten()
        .unwrap_or_default();
    ACTION_OBJECT
        .find_iter(&text)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn take_baseline(tab: &Tab, config: &ChatUiConfig) -> Baseline {
    Baseline {
        responses: scan_selectors(tab, config).into_iter().collect(),
        action_objects: scan_page_objects(tab).into_iter().collect(),
    }
}

fn squash_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The page renders our own turn too; any candidate that is just (part of)
/// the prompt is an echo, not a reply.
fn is_prompt_echo(candidate: &str, prompt: &str) -> bool {
    let candidate = squash_whitespace(candidate);
    !candidate.is_empty() && squash_whitespace(prompt).contains(&candidate)
}

/// Newest reply among the candidates: a response region first, then a fresh
/// action object from the page text. Baseline entries and echoes are skipped.
fn pick_response(
    regions: Vec<String>,
    objects: Vec<String>,
    baseline: &Baseline,
    prompt: &str,
) -> Option<String> {
    regions
        .into_iter()
        .find(|t| !baseline.responses.contains(t) && !is_prompt_echo(t, prompt))
        .or_else(|| {
            objects
                .into_iter()
                .rev()
                .find(|o| !baseline.action_objects.contains(o) && !is_prompt_echo(o, prompt))
        })
}

fn scan_response(tab: &Tab, config: &ChatUiConfig, baseline: &Baseline, prompt: &str) -> Option<String> {
    pick_response(scan_selectors(tab, config), scan_page_objects(tab), baseline, prompt)
}

fn click_send(tab: &Tab, config: &ChatUiConfig, timings: &Timings) -> Result<()> {
    let mark = mark_send_script(&config.send_buttons);
    for attempt in 1..=timings.send_attempts {
        if eval_string(tab, &mark)?.as_deref() == Some("marked") {
            tab.find_element(&format!("[{SEND_MARKER}]"))?.click()?;
            return Ok(());
        }
        debug!(attempt, "send control not active yet");
        if attempt == timings.send_nudge_at {
            tab.find_element(&config.input)?.click()?;
            tab.type_str(" ")?;
        }
        std::thread::sleep(timings.send_poll);
    }

    warn!("no active send control; submitting with Enter");
    tab.find_element(&config.input)?.click()?;
    tab.press_key("Enter")?;
    Ok(())
}

fn converse(tab: &Tab, config: &ChatUiConfig, timings: &Timings, prompt: &str) -> Result<Option<String>> {
    select_model(tab, config, timings);

    wait_until_interactable(tab, &config.input, timings.element_wait * 2, timings.element_poll)?;
    let baseline = take_baseline(tab, config);

    let filled = eval_string(tab, &fill_script(&config.input, prompt))?;
    if filled.as_deref() != Some("ok") {
        return Err(anyhow!("composer {:?} vanished before typing", config.input));
    }
    // A real keystroke so the page notices the field is non-empty.
    tab.find_element(&config.input)?.click()?;
    tab.type_str(" ")?;

    click_send(tab, config, timings)?;

    let mut previous: Option<String> = None;
    for _ in 0..timings.response_attempts {
        std::thread::sleep(timings.response_poll);
        let current = scan_response(tab, config, &baseline, prompt);
        // Streaming replies keep growing; accept one that held still for a poll.
        if current.is_some() && current == previous {
            return Ok(current);
        }
        previous = current;
    }
    Ok(previous)
}

#[async_trait]
impl Brain for ChatUiBrain {
    async fn ask(&mut self, prompt: &str, observation: Option<&Observation>) -> Option<String> {
        let full_prompt = build_prompt(prompt, observation);
        let tab = self.tab.clone();
        let config = self.config.clone();
        let timings = self.timings.clone();

        let result = tokio::task::spawn_blocking(move || converse(&tab, &config, &timings, &full_prompt)).await;
        let reply = match result {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) => {
                warn!("chat backend produced no response");
                return None;
            }
            Ok(Err(e)) => {
                warn!(error = %format!("{e:#}"), "chat backend interaction failed");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "chat backend task panicked");
                return None;
            }
        };
        debug!(preview = %crate::types::truncate_chars(&reply, 100), "chat backend responded");
        Some(normalize_reply(&reply, observation.is_some()))
    }

    async fn close(&mut self) {
        if let Some(browser) = self.browser.take() {
            info!("closing chat backend browser");
            let _ = tokio::task::spawn_blocking(move || drop(browser)).await;
        }
    }

    fn label(&self) -> &'static str {
        "chat-ui"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_pattern_finds_flat_objects_only() {
        let text = r##"You said: describe it. Model: {"action": "click", "selector": "#go"} and {"other": 1}"##;
        let found: Vec<&str> = ACTION_OBJECT.find_iter(text).map(|m| m.as_str()).collect();
        assert_eq!(found, vec![r##"{"action": "click", "selector": "#go"}"##]);
    }

    #[test]
    fn response_contract_does_not_trip_the_page_scan() {
        // The prompt is echoed into the page; its instructions must not look like a reply.
        assert!(!ACTION_OBJECT.is_match(super::super::RESPONSE_CONTRACT));
    }

    #[test]
    fn echoed_prompt_is_not_taken_as_the_reply() {
        let prompt = "apply to rust jobs\n\nCURRENT BROWSER STATE:\nURL: https://jobs.example\nTEXT: Apply now";
        let echo = "apply to rust jobs CURRENT BROWSER STATE: URL: https://jobs.example";
        let reply = r##"{"action":"click","selector":"#apply"}"##;

        assert!(is_prompt_echo(echo, prompt));
        assert!(!is_prompt_echo(reply, prompt));

        let baseline = Baseline::default();
        assert_eq!(pick_response(vec![echo.into()], vec![], &baseline, prompt), None);
        assert_eq!(
            pick_response(vec![echo.into(), reply.into()], vec![], &baseline, prompt).as_deref(),
            Some(reply)
        );
    }

    #[test]
    fn stale_regions_fall_back_to_fresh_action_objects() {
        let old = r#"{"action":"scroll"}"#;
        let fresh = r#"{"action":"done","reason":"applied"}"#;
        let baseline = Baseline {
            responses: HashSet::from(["Earlier answer text".to_string()]),
            action_objects: HashSet::from([old.to_string()]),
        };
        let picked = pick_response(
            vec!["Earlier answer text".into()],
            vec![old.into(), fresh.into()],
            &baseline,
            "browse",
        );
        assert_eq!(picked.as_deref(), Some(fresh));
    }

    #[test]
    fn scripts_embed_selectors_as_literals() {
        let js = response_script(&[".a".into(), "div[class*='b']".into()]);
        assert!(js.contains(r#"[".a","div[class*='b']"]"#));
        let fill = fill_script("textarea", "line \"1\"\nline 2");
        assert!(fill.contains(r#""line \"1\"\nline 2""#));
    }
}
