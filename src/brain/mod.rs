//! Reasoning backends: turn a task plus the current page into one action.
//!
//! [`Brain`] has two implementations: [`api::ApiBrain`] calls a hosted
//! chat-completions endpoint, [`chat_ui::ChatUiBrain`] scripts a chat web page
//! through its own browser session.

pub mod api;
pub mod chat_ui;

use async_trait::async_trait;

use crate::dom::render_elements;
use crate::types::{MAX_VISIBLE_TEXT_CHARS, Observation, truncate_chars};

/// Appended after the page block so the backend answers with exactly one action.
pub const RESPONSE_CONTRACT: &str = r#"INSTRUCTION: You are a browsing agent. Reply with exactly ONE JSON object describing the next action and nothing else: no prose before or after it, no markdown.
Allowed shapes:
- click: fields action="click", selector (a selector from the element list)
- type: fields action="type", selector, value (the text to enter)
- navigate: fields action="navigate", url
- scroll: field action="scroll"
- done: fields action="done", reason (why the task is finished)
Use the selectors exactly as listed. Reply with action="done" once the task is complete."#;

#[async_trait]
pub trait Brain: Send {
    /// Ask for the next step. `None` means the backend produced nothing usable.
    async fn ask(&mut self, prompt: &str, observation: Option<&Observation>) -> Option<String>;

    /// Release any browser the backend owns. Safe to call repeatedly.
    async fn close(&mut self) {}

    fn label(&self) -> &'static str;
}

/// Task text, then (with an observation) the page block and the reply contract.
pub fn build_prompt(prompt: &str, observation: Option<&Observation>) -> String {
    let Some(obs) = observation else {
        return prompt.to_string();
    };

    let mut full = format!(
        "{prompt}\n\nCURRENT BROWSER STATE:\nURL: {}\nTEXT: {}\n",
        obs.url,
        truncate_chars(&obs.visible_text, MAX_VISIBLE_TEXT_CHARS)
    );
    if obs.interactive_elements.is_empty() {
        full.push_str("\nINTERACTIVE ELEMENTS: none found\n");
    } else {
        full.push_str("\nINTERACTIVE ELEMENTS:\n");
        full.push_str(&render_elements(&obs.interactive_elements));
        full.push('\n');
    }
    full.push('\n');
    full.push_str(RESPONSE_CONTRACT);
    full
}

pub fn strip_code_fences(text: &str) -> String {
    text.replace("```json", "").replace("```", "").trim().to_string()
}

/// Clean a raw reply: drop code fences and, when an action object is
/// expected, cut the first `{...}` out of any surrounding prose.
pub fn normalize_reply(raw: &str, expect_action: bool) -> String {
    let text = strip_code_fences(raw);
    if !expect_action || text.starts_with('{') {
        return text;
    }
    extract_json_object(&text)
        .map(str::to_string)
        .unwrap_or(text)
}

/// First balanced `{...}` in `text`, honoring JSON string quoting. Falls
/// back to first `{` through last `}` when nothing balances.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }

    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementDescriptor;

    #[test]
    fn prompt_without_observation_is_the_task() {
        assert_eq!(build_prompt("refactor header", None), "refactor header");
    }

    #[test]
    fn prompt_renders_page_block_and_contract() {
        let obs = Observation {
            url: "https://jobs.example".into(),
            visible_text: "x".repeat(5000),
            interactive_elements: vec![ElementDescriptor {
                index: 1,
                tag: "button".into(),
                selector: "#apply".into(),
                visible_text: "Apply".into(),
                input_type: Some("submit".into()),
                link_target: None,
            }],
            ..Default::default()
        };
        let prompt = build_prompt("apply to rust jobs", Some(&obs));
        assert!(prompt.starts_with("apply to rust jobs\n\nCURRENT BROWSER STATE:\nURL: https://jobs.example"));
        assert!(prompt.contains("[1] <button> \"Apply\" selector: #apply type=submit"));
        assert!(prompt.ends_with(RESPONSE_CONTRACT));
        assert!(!prompt.contains(&"x".repeat(MAX_VISIBLE_TEXT_CHARS + 1)));
    }

    #[test]
    fn strips_fences() {
        let raw = "```json\n{\"action\":\"scroll\"}\n```";
        assert_eq!(normalize_reply(raw, true), r#"{"action":"scroll"}"#);
    }

    #[test]
    fn recovers_object_from_prose() {
        let raw = r##"Sure! Here you go: {"action":"click","selector":"a[title=\"}\"]"} hope it helps {"x":1}"##;
        assert_eq!(
            normalize_reply(raw, true),
            r##"{"action":"click","selector":"a[title=\"}\"]"}"##
        );
    }

    #[test]
    fn leaves_generic_replies_alone() {
        let raw = "<change><file>a.ts</file><content><![CDATA[const a = {};]]></content></change>";
        assert_eq!(normalize_reply(raw, false), raw);
        assert_eq!(normalize_reply("not json", true), "not json");
    }

    #[test]
    fn unbalanced_falls_back_to_outer_braces() {
        assert_eq!(extract_json_object("a { b { c }"), Some("{ b { c }"));
        assert_eq!(extract_json_object("no braces"), None);
    }
}
