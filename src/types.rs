use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_STEP_BUDGET: usize = 20;
pub const LOG_CAPACITY: usize = 50;
pub const MAX_VISIBLE_TEXT_CHARS: usize = 3000;
pub const MAX_INTERACTIVE_ELEMENTS: usize = 25;
pub const ELEMENT_TEXT_CHARS: usize = 40;
pub const LINK_TARGET_CHARS: usize = 60;

/// A single atomic step the reasoning backend asks the agent to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Action {
    Click {
        selector: String,
    },
    Type {
        selector: String,
        #[serde(alias = "text")]
        value: String,
    },
    Navigate {
        url: String,
    },
    Scroll,
    Done {
        #[serde(default)]
        reason: String,
    },
}

const KNOWN_ACTIONS: [&str; 5] = ["click", "type", "navigate", "scroll", "done"];

impl Action {
    pub fn is_done(&self) -> bool {
        matches!(self, Action::Done { .. })
    }

    /// Trim stray whitespace the backend tends to leave around locators.
    pub fn normalized(self) -> Self {
        match self {
            Action::Click { selector } => Action::Click {
                selector: selector.trim().to_string(),
            },
            Action::Type { selector, value } => Action::Type {
                selector: selector.trim().to_string(),
                value,
            },
            Action::Navigate { url } => Action::Navigate {
                url: url.trim().to_string(),
            },
            Action::Done { reason } => Action::Done {
                reason: reason.trim().to_string(),
            },
            Action::Scroll => Action::Scroll,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Action::Click { selector } => format!("click {selector}"),
            Action::Type { selector, value } => {
                format!("type {:?} into {selector}", truncate_chars(value, 40))
            }
            Action::Navigate { url } => format!("navigate to {url}"),
            Action::Scroll => "scroll".to_string(),
            Action::Done { reason } => format!("done: {reason}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ActionParseError {
    #[error("reply is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),
    #[error("reply is JSON but not an object")]
    NotObject,
    #[error("reply has no \"action\" field")]
    MissingAction,
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("malformed {action} action: {source}")]
    InvalidFields {
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Strictly parse a backend reply into an [`Action`].
///
/// The tag may arrive as `"action"` or `"type"` and in any letter case; every
/// other deviation from the action shapes is an error.
pub fn parse_action(raw: &str) -> Result<Action, ActionParseError> {
    let value: Value = serde_json::from_str(raw.trim()).map_err(ActionParseError::NotJson)?;
    let Value::Object(mut map) = value else {
        return Err(ActionParseError::NotObject);
    };

    let tag = match map.remove("action") {
        Some(tag) => tag,
        None => map.remove("type").ok_or(ActionParseError::MissingAction)?,
    };
    let tag = tag
        .as_str()
        .map(|t| t.trim().to_ascii_lowercase())
        .ok_or(ActionParseError::MissingAction)?;
    if !KNOWN_ACTIONS.contains(&tag.as_str()) {
        return Err(ActionParseError::UnknownAction(tag));
    }

    map.insert("action".to_string(), Value::String(tag.clone()));
    serde_json::from_value::<Action>(Value::Object(map))
        .map(Action::normalized)
        .map_err(|source| ActionParseError::InvalidFields {
            action: tag,
            source,
        })
}

/// What the agent sees of the page at one loop iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Observation {
    pub url: String,
    #[serde(skip)]
    pub screenshot: Vec<u8>,
    pub visible_text: String,
    pub interactive_elements: Vec<ElementDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    /// 1-based position in capture order.
    pub index: usize,
    pub tag: String,
    pub selector: String,
    pub visible_text: String,
    pub input_type: Option<String>,
    pub link_target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Browsing,
    Generic,
}

impl TaskKind {
    pub fn classify(task: &str) -> Self {
        let lower = task.to_lowercase();
        if ["browse", "apply", "job"].iter().any(|k| lower.contains(k)) {
            TaskKind::Browsing
        } else {
            TaskKind::Generic
        }
    }
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_action_shape() {
        assert_eq!(
            parse_action(r##"{"action":"click","selector":"#go"}"##).unwrap(),
            Action::Click {
                selector: "#go".into()
            }
        );
        assert_eq!(
            parse_action(r#"{"action":"type","selector":"input[name=\"q\"]","value":"rust"}"#)
                .unwrap(),
            Action::Type {
                selector: "input[name=\"q\"]".into(),
                value: "rust".into()
            }
        );
        assert_eq!(
            parse_action(r#"{"action":"navigate","url":" https://example.com "}"#).unwrap(),
            Action::Navigate {
                url: "https://example.com".into()
            }
        );
        assert_eq!(
            parse_action(r#"{"action":"scroll"}"#).unwrap(),
            Action::Scroll
        );
        assert_eq!(
            parse_action(r#"{"action":"done","reason":"applied"}"#).unwrap(),
            Action::Done {
                reason: "applied".into()
            }
        );
    }

    #[test]
    fn accepts_type_key_and_mixed_case_tag() {
        let action = parse_action(r#"{"type":"Click","selector":".apply"}"#).unwrap();
        assert_eq!(
            action,
            Action::Click {
                selector: ".apply".into()
            }
        );
    }

    #[test]
    fn accepts_text_alias_for_typed_value() {
        let action = parse_action(r##"{"action":"type","selector":"#q","text":"hello"}"##).unwrap();
        assert!(matches!(action, Action::Type { value, .. } if value == "hello"));
    }

    #[test]
    fn done_reason_is_optional() {
        assert_eq!(
            parse_action(r#"{"action":"done"}"#).unwrap(),
            Action::Done {
                reason: String::new()
            }
        );
    }

    #[test]
    fn rejects_malformed_replies() {
        assert!(matches!(
            parse_action("not json"),
            Err(ActionParseError::NotJson(_))
        ));
        assert!(matches!(
            parse_action("[1,2]"),
            Err(ActionParseError::NotObject)
        ));
        assert!(matches!(
            parse_action(r#"{"selector":"a"}"#),
            Err(ActionParseError::MissingAction)
        ));
        assert!(matches!(
            parse_action(r#"{"action":"hover","selector":"a"}"#),
            Err(ActionParseError::UnknownAction(tag)) if tag == "hover"
        ));
        assert!(matches!(
            parse_action(r#"{"action":"click"}"#),
            Err(ActionParseError::InvalidFields { action, .. }) if action == "click"
        ));
    }

    #[test]
    fn classifies_tasks_by_keyword() {
        assert_eq!(
            TaskKind::classify("Browse example.com for Rust roles"),
            TaskKind::Browsing
        );
        assert_eq!(
            TaskKind::classify("find a JOB posting"),
            TaskKind::Browsing
        );
        assert_eq!(
            TaskKind::classify("refactor the header component"),
            TaskKind::Generic
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
