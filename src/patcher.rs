use std::path::{Component, Path};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{info, warn};

/// Receives the backend's verbatim reply for generic tasks.
pub trait PatchApplier: Send + Sync {
    /// Apply whatever edits the reply describes under `root`, returning how
    /// many files were written.
    fn apply(&self, reply: &str, root: &Path) -> Result<usize>;
}

static CHANGE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<change>.*?</change>").unwrap());
static FILE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<file>(.*?)</file>").unwrap());
static CONTENT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<content><!\[CDATA\[(.*?)\]\]></content>").unwrap());

/// Writes `<change><file>PATH</file><content><![CDATA[...]]></content></change>`
/// blocks to disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlChangePatcher;

impl PatchApplier for XmlChangePatcher {
    fn apply(&self, reply: &str, root: &Path) -> Result<usize> {
        let mut applied = 0;
        for block in CHANGE_BLOCK.find_iter(reply) {
            let block = block.as_str();
            let (Some(file), Some(content)) = (FILE_TAG.captures(block), CONTENT_TAG.captures(block))
            else {
                continue;
            };
            let rel = file[1].trim();
            if let Err(e) = write_change(root, rel, &content[1]) {
                warn!(file = rel, error = %format!("{e:#}"), "skipping change");
                continue;
            }
            info!(file = rel, "updated file");
            applied += 1;
        }
        if applied == 0 {
            info!("no code changes found in reply");
        }
        Ok(applied)
    }
}

fn write_change(root: &Path, rel: &str, content: &str) -> Result<()> {
    let rel_path = Path::new(rel);
    if rel.is_empty()
        || rel_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        bail!("refusing path outside root: {rel:?}");
    }
    let full = root.join(rel_path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(&full, content).with_context(|| format!("writing {}", full.display()))?;
    Ok(())
}
