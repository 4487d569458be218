//! Page-side scripts and the selector policy for captured elements.
//!
//! The browser only reports raw facts about each interactive element (its id,
//! name, first class, which of those are unique, and its structural path).
//! Choosing the locator happens here, in [`synthesize_selector`], so the
//! preference order is the same no matter which page produced the facts.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::types::{
    ELEMENT_TEXT_CHARS, ElementDescriptor, LINK_TARGET_CHARS, MAX_INTERACTIVE_ELEMENTS,
    truncate_chars,
};

/// NON-DESTRUCTIVE: reads the DOM without touching attributes, styles or layout.
///
/// Visits links, buttons, form fields, `role="button"` and `onclick` elements
/// in document order, skips anything without a layout box (form fields are
/// kept since they stay actionable off-screen) and stops at the element cap.
/// Returns a JSON string so the value survives the CDP round trip intact.
pub const ELEMENTS_JS: &str = r#"
(() => {
  const LIMIT = __LIMIT__;
  const FORM = new Set(['INPUT', 'TEXTAREA', 'SELECT']);
  const all = (t) => Array.from(document.getElementsByTagName(t || '*'));
  const countAttr = (attr, val, t) => all(t).filter(e => e.getAttribute(attr) === val).length;
  const nthOfType = (el) => {
    let n = 1;
    for (let s = el.previousElementSibling; s; s = s.previousElementSibling) {
      if (s.tagName === el.tagName) n++;
    }
    return n;
  };

  const out = [];
  const nodes = document.querySelectorAll('a, button, input, textarea, select, [role="button"], [onclick]');
  for (const el of nodes) {
    if (out.length >= LIMIT) break;
    if (el.getClientRects().length === 0 && !FORM.has(el.tagName)) continue;

    const tag = el.tagName.toLowerCase();
    const id = typeof el.id === 'string' && el.id ? el.id : null;
    const name = el.getAttribute('name') || null;
    const raw = typeof el.className === 'string' ? el.className : '';
    const cls = raw.split(/\s+/).find(c => c && !c.includes(':')) || null;

    const path = [];
    let anchor = null;
    for (let node = el; node && node.nodeType === 1; node = node.parentElement) {
      path.unshift({ tag: node.tagName.toLowerCase(), nth: nthOfType(node) });
      const parent = node.parentElement;
      if (parent && parent.id && countAttr('id', parent.id) === 1) {
        anchor = parent.id;
        break;
      }
    }

    out.push({
      tag,
      id,
      id_unique: !!id && countAttr('id', id) === 1,
      name,
      name_unique: !!name && countAttr('name', name, tag) === 1,
      class: cls,
      class_unique: !!cls && Array.from(document.getElementsByClassName(cls)).filter(e => e.tagName === el.tagName).length === 1,
      path,
      anchor_id: anchor,
      text: String(el.innerText || el.value || el.placeholder || el.getAttribute('aria-label') || '').trim(),
      input_type: typeof el.type === 'string' && el.type ? el.type : null,
      // SVG links expose href as an SVGAnimatedString.
      href: typeof el.href === 'string' ? el.href : (el.getAttribute('href') || null),
    });
  }
  return JSON.stringify(out);
})()
"#;

pub const VISIBLE_TEXT_JS: &str = "document.body ? document.body.innerText : ''";

pub const CURRENT_URL_JS: &str = "window.location.href";

/// The element scan script with the capture cap baked in.
pub fn elements_script() -> String {
    ELEMENTS_JS.replace("__LIMIT__", &MAX_INTERACTIVE_ELEMENTS.to_string())
}

/// Script reporting whether `selector` can be acted on right now:
/// `ready`, `missing`, `hidden`, `disabled` or `invalid`.
pub fn interactable_probe(selector: &str) -> String {
    format!(
        r#"(() => {{
  let el;
  try {{ el = document.querySelector({sel}); }} catch (e) {{ return 'invalid'; }}
  if (!el) return 'missing';
  const form = ['INPUT', 'TEXTAREA', 'SELECT'].includes(el.tagName);
  if (el.getClientRects().length === 0 && !form) return 'hidden';
  if (el.disabled) return 'disabled';
  return 'ready';
}})()"#,
        sel = js_string(selector)
    )
}

pub fn clear_value_script(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); if (el && 'value' in el) {{ el.value = ''; }} }})()",
        js_string(selector)
    )
}

pub fn scroll_script(offset: i64) -> String {
    format!("window.scrollBy(0, {offset});")
}

/// Quote a string as a JavaScript literal.
pub fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathSegment {
    pub tag: String,
    pub nth: usize,
}

/// Raw facts about one interactive element, as reported by [`ELEMENTS_JS`].
///
/// Page values are loosely typed, so every optional string tolerates numbers,
/// SVG `{baseVal, animVal}` pairs and other shapes instead of failing the scan.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ElementFacts {
    pub tag: String,
    #[serde(default, deserialize_with = "loose_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub id_unique: bool,
    #[serde(default, deserialize_with = "loose_string")]
    pub name: Option<String>,
    #[serde(default)]
    pub name_unique: bool,
    #[serde(default, deserialize_with = "loose_string")]
    pub class: Option<String>,
    #[serde(default)]
    pub class_unique: bool,
    #[serde(default)]
    pub path: Vec<PathSegment>,
    #[serde(default, deserialize_with = "loose_string")]
    pub anchor_id: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub text: String,
    #[serde(default, deserialize_with = "loose_string")]
    pub input_type: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub href: Option<String>,
}

fn loose_string<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(de)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => map
            .get("baseVal")
            .and_then(Value::as_str)
            .map(String::from),
        Value::Null | Value::Array(_) => None,
    })
}

fn loose_text<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    loose_string(de).map(Option::unwrap_or_default)
}

/// Pick a locator for an element: unique id, then unique name, then unique
/// first class, then the structural `nth-of-type` path.
pub fn synthesize_selector(facts: &ElementFacts) -> String {
    let tag = facts.tag.to_ascii_lowercase();

    if let Some(id) = facts.id.as_deref().filter(|_| facts.id_unique) {
        return id_selector(id);
    }
    if let Some(name) = facts.name.as_deref().filter(|_| facts.name_unique) {
        return format!("{tag}[name=\"{}\"]", escape_attr(name));
    }
    if let Some(class) = facts
        .class
        .as_deref()
        .filter(|c| facts.class_unique && is_css_ident(c))
    {
        return format!("{tag}.{class}");
    }
    structural_selector(facts)
}

fn structural_selector(facts: &ElementFacts) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(facts.path.len() + 1);
    if let Some(anchor) = &facts.anchor_id {
        parts.push(id_selector(anchor));
    }
    parts.extend(
        facts
            .path
            .iter()
            .map(|seg| format!("{}:nth-of-type({})", seg.tag, seg.nth.max(1))),
    );
    if parts.is_empty() {
        return facts.tag.to_ascii_lowercase();
    }
    parts.join(" > ")
}

fn id_selector(id: &str) -> String {
    if is_css_ident(id) {
        format!("#{id}")
    } else {
        format!("[id=\"{}\"]", escape_attr(id))
    }
}

fn is_css_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn escape_attr(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Turn captured facts into the bounded, 1-indexed descriptor list.
pub fn descriptors(facts: Vec<ElementFacts>) -> Vec<ElementDescriptor> {
    facts
        .into_iter()
        .take(MAX_INTERACTIVE_ELEMENTS)
        .enumerate()
        .map(|(i, f)| {
            let text = truncate_chars(f.text.trim(), ELEMENT_TEXT_CHARS);
            ElementDescriptor {
                index: i + 1,
                selector: synthesize_selector(&f),
                tag: f.tag.to_ascii_lowercase(),
                visible_text: if text.is_empty() {
                    "[no text]".to_string()
                } else {
                    text
                },
                input_type: f.input_type.filter(|t| !t.is_empty()),
                link_target: f
                    .href
                    .filter(|h| !h.is_empty())
                    .map(|h| truncate_chars(&h, LINK_TARGET_CHARS)),
            }
        })
        .collect()
}

/// One line per element, as shown to the reasoning backend.
pub fn render_elements(elements: &[ElementDescriptor]) -> String {
    elements
        .iter()
        .map(|el| {
            let mut line = format!(
                "[{}] <{}> \"{}\" selector: {}",
                el.index, el.tag, el.visible_text, el.selector
            );
            if let Some(t) = &el.input_type {
                line.push_str(&format!(" type={t}"));
            }
            if let Some(href) = &el.link_target {
                line.push_str(&format!(" href={href}"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(tag: &str, nth: usize) -> PathSegment {
        PathSegment {
            tag: tag.into(),
            nth,
        }
    }

    fn button() -> ElementFacts {
        ElementFacts {
            tag: "BUTTON".into(),
            path: vec![
                seg("html", 1),
                seg("body", 1),
                seg("form", 1),
                seg("button", 2),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn prefers_id_over_everything_else() {
        let facts = ElementFacts {
            id: Some("apply-now".into()),
            id_unique: true,
            name: Some("apply".into()),
            name_unique: true,
            class: Some("btn".into()),
            class_unique: true,
            ..button()
        };
        assert_eq!(synthesize_selector(&facts), "#apply-now");
    }

    #[test]
    fn falls_back_through_name_then_class() {
        let named = ElementFacts {
            name: Some("submit".into()),
            name_unique: true,
            class: Some("btn".into()),
            class_unique: true,
            ..button()
        };
        assert_eq!(synthesize_selector(&named), "button[name=\"submit\"]");

        let classed = ElementFacts {
            class: Some("btn-primary".into()),
            class_unique: true,
            ..button()
        };
        assert_eq!(synthesize_selector(&classed), "button.btn-primary");
    }

    #[test]
    fn positional_fallback_when_nothing_identifies_the_element() {
        assert_eq!(
            synthesize_selector(&button()),
            "html:nth-of-type(1) > body:nth-of-type(1) > form:nth-of-type(1) > button:nth-of-type(2)"
        );
    }

    #[test]
    fn non_unique_attributes_are_skipped() {
        let facts = ElementFacts {
            id: Some("dup".into()),
            id_unique: false,
            class: Some("btn".into()),
            class_unique: false,
            anchor_id: Some("signup".into()),
            path: vec![seg("div", 3), seg("button", 1)],
            ..button()
        };
        assert_eq!(
            synthesize_selector(&facts),
            "#signup > div:nth-of-type(3) > button:nth-of-type(1)"
        );
    }

    #[test]
    fn odd_ids_use_attribute_form() {
        let facts = ElementFacts {
            id: Some("1st\"item".into()),
            id_unique: true,
            ..button()
        };
        assert_eq!(synthesize_selector(&facts), "[id=\"1st\\\"item\"]");
    }

    #[test]
    fn descriptors_are_bounded_and_one_indexed() {
        let facts: Vec<ElementFacts> = (0..40)
            .map(|i| ElementFacts {
                tag: "a".into(),
                id: Some(format!("link{i}")),
                id_unique: true,
                href: Some(format!("https://example.com/{}", "x".repeat(100))),
                ..Default::default()
            })
            .collect();
        let out = descriptors(facts);
        assert_eq!(out.len(), MAX_INTERACTIVE_ELEMENTS);
        assert_eq!(out[0].index, 1);
        assert_eq!(out[0].selector, "#link0");
        assert_eq!(out[0].visible_text, "[no text]");
        assert_eq!(
            out[0].link_target.as_ref().map(|h| h.chars().count()),
            Some(LINK_TARGET_CHARS)
        );
    }

    #[test]
    fn facts_deserialize_from_script_output() {
        let raw = r#"[{"tag":"input","id":null,"id_unique":false,"name":"q","name_unique":true,
            "class":null,"class_unique":false,"path":[{"tag":"input","nth":1}],"anchor_id":"search",
            "text":"","input_type":"text","href":null}]"#;
        let facts: Vec<ElementFacts> = serde_json::from_str(raw).unwrap();
        let out = descriptors(facts);
        assert_eq!(out[0].selector, "input[name=\"q\"]");
        assert_eq!(out[0].input_type.as_deref(), Some("text"));
    }

    #[test]
    fn svg_links_and_numeric_values_do_not_break_the_scan() {
        let raw = r##"[
            {"tag":"a","id":null,"path":[{"tag":"a","nth":1}],"text":"Icon",
             "input_type":null,"href":{"baseVal":"#icon","animVal":"#icon"}},
            {"tag":"li","id":"step","id_unique":true,"text":3,"href":null}
        ]"##;
        let facts: Vec<ElementFacts> = serde_json::from_str(raw).unwrap();
        let out = descriptors(facts);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].link_target.as_deref(), Some("#icon"));
        assert_eq!(out[1].selector, "#step");
        assert_eq!(out[1].visible_text, "3");
    }

    #[test]
    fn interactable_check_quotes_selectors() {
        let js = interactable_probe("a[href='x\"y']");
        assert!(js.contains(r#""a[href='x\"y']""#));
        assert_eq!(scroll_script(500), "window.scrollBy(0, 500);");
    }
}
