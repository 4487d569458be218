//! Persistent browser profiles and the machine-identity sidecar that decides
//! whether a profile may be reused.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const SIDECAR_FILE: &str = "profile_meta.json";

/// Who is running the browser. Two profiles match when both fields match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub host: String,
    pub user: String,
}

impl HostIdentity {
    pub fn current() -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok()
            .filter(|h| !h.trim().is_empty())
            .or_else(|| {
                fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
            })
            .unwrap_or_else(|| "unknown-host".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown-user".to_string());
        Self { host, user }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileMeta {
    pub hostname: String,
    pub user: String,
    pub last_used: DateTime<Utc>,
}

impl ProfileMeta {
    fn matches(&self, identity: &HostIdentity) -> bool {
        self.hostname == identity.host && self.user == identity.user
    }
}

/// What to do with a non-empty profile that carries no sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum UnknownProfilePolicy {
    /// Keep the data (it may hold a live login) and just adopt it.
    #[default]
    Preserve,
    /// Treat it as foreign and wipe it.
    Purge,
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub force_reset: bool,
    pub unknown: UnknownProfilePolicy,
    pub delete_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            force_reset: false,
            unknown: UnknownProfilePolicy::Preserve,
            delete_retries: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileOutcome {
    /// Matching sidecar; nothing touched.
    Reused,
    /// Empty or missing directory; sidecar written.
    Created,
    /// Non-empty directory without a sidecar, kept as is.
    Adopted,
    /// Profile wiped and recreated.
    Reset,
    /// Wipe was needed but the directory could not be removed.
    ResetFailed,
}

/// Make `profile` safe to hand to a browser on this machine.
///
/// Never fails hard: if the directory cannot be invalidated the caller gets
/// [`ProfileOutcome::ResetFailed`] and proceeds with the existing profile.
pub fn ensure_compatible(profile: &Path, force_reset: bool) -> ProfileOutcome {
    let policy = SessionPolicy {
        force_reset,
        ..SessionPolicy::default()
    };
    ensure_compatible_with(profile, &policy, &HostIdentity::current())
}

pub fn ensure_compatible_with(
    profile: &Path,
    policy: &SessionPolicy,
    identity: &HostIdentity,
) -> ProfileOutcome {
    let outcome = if policy.force_reset {
        info!(profile = %profile.display(), "forced profile reset requested");
        reset(profile, policy)
    } else {
        match read_meta(profile) {
            Ok(Some(meta)) if meta.matches(identity) => ProfileOutcome::Reused,
            Ok(Some(meta)) => {
                info!(
                    from = %format!("{}@{}", meta.user, meta.hostname),
                    to = %format!("{}@{}", identity.user, identity.host),
                    "profile belongs to another machine; resetting"
                );
                reset(profile, policy)
            }
            Ok(None) if is_non_empty_dir(profile) => match policy.unknown {
                UnknownProfilePolicy::Preserve => {
                    info!(profile = %profile.display(), "adopting profile without metadata");
                    ProfileOutcome::Adopted
                }
                UnknownProfilePolicy::Purge => {
                    info!(profile = %profile.display(), "purging profile without metadata");
                    reset(profile, policy)
                }
            },
            Ok(None) => ProfileOutcome::Created,
            Err(e) => {
                warn!(error = %e, "unreadable profile metadata; resetting");
                reset(profile, policy)
            }
        }
    };

    if let Err(e) = write_meta(profile, identity) {
        warn!(error = %format!("{e:#}"), "failed to write profile metadata");
    }
    outcome
}

fn reset(profile: &Path, policy: &SessionPolicy) -> ProfileOutcome {
    if invalidate(profile, policy.delete_retries, policy.retry_backoff) {
        ProfileOutcome::Reset
    } else {
        ProfileOutcome::ResetFailed
    }
}

/// Remove a profile directory. Renames it out of the way first so a lock
/// held on the live path cannot block progress, then deletes the copy
/// best-effort. Falls back to bounded delete retries when rename fails.
pub fn invalidate(profile: &Path, retries: u32, backoff: Duration) -> bool {
    if !profile.exists() {
        return true;
    }

    let trash = trash_path(profile);
    match fs::rename(profile, &trash) {
        Ok(()) => {
            info!(trash = %trash.display(), "moved profile aside");
            if let Err(e) = fs::remove_dir_all(&trash) {
                warn!(error = %e, trash = %trash.display(), "leaving trashed profile behind");
            }
            return true;
        }
        Err(e) => warn!(error = %e, "could not move profile (locked?)"),
    }

    for attempt in 1..=retries {
        match fs::remove_dir_all(profile) {
            Ok(()) => return true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(e) => {
                warn!(attempt, retries, error = %e, "profile delete failed");
                if attempt < retries {
                    std::thread::sleep(backoff);
                }
            }
        }
    }
    false
}

fn trash_path(profile: &Path) -> PathBuf {
    let name = profile
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "profile".to_string());
    profile.with_file_name(format!(
        "{name}_trash_{}",
        Utc::now().timestamp_millis()
    ))
}

fn is_non_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

pub fn read_meta(profile: &Path) -> Result<Option<ProfileMeta>> {
    let path = profile.join(SIDECAR_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let meta = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(meta))
}

pub fn write_meta(profile: &Path, identity: &HostIdentity) -> Result<()> {
    fs::create_dir_all(profile)
        .with_context(|| format!("creating profile dir {}", profile.display()))?;
    let meta = ProfileMeta {
        hostname: identity.host.clone(),
        user: identity.user.clone(),
        last_used: Utc::now(),
    };
    let file = fs::File::create(profile.join(SIDECAR_FILE))?;
    serde_json::to_writer_pretty(file, &meta)?;
    Ok(())
}
