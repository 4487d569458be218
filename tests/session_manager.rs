use std::fs;
use std::path::Path;
use std::time::Duration;

use surfer_agent::profile::{
    HostIdentity, ProfileOutcome, SIDECAR_FILE, SessionPolicy, UnknownProfilePolicy,
    ensure_compatible, ensure_compatible_with, invalidate, read_meta, write_meta,
};

fn identity(host: &str) -> HostIdentity {
    HostIdentity {
        host: host.to_string(),
        user: "dev".to_string(),
    }
}

fn quick_policy() -> SessionPolicy {
    SessionPolicy {
        retry_backoff: Duration::from_millis(1),
        ..SessionPolicy::default()
    }
}

fn seed_profile(dir: &Path) {
    fs::create_dir_all(dir.join("Default")).unwrap();
    fs::write(dir.join("Default").join("Cookies"), b"session").unwrap();
}

#[test]
fn foreign_sidecar_resets_profile() {
    let root = tempfile::tempdir().unwrap();
    let profile = root.path().join("surfer");
    seed_profile(&profile);
    write_meta(&profile, &identity("laptop")).unwrap();

    let outcome = ensure_compatible_with(&profile, &quick_policy(), &identity("desktop"));

    assert_eq!(outcome, ProfileOutcome::Reset);
    assert!(!profile.join("Default").exists());
    let meta = read_meta(&profile).unwrap().unwrap();
    assert_eq!(meta.hostname, "desktop");
}

#[test]
fn matching_sidecar_keeps_profile_data() {
    let root = tempfile::tempdir().unwrap();
    let profile = root.path().join("surfer");
    seed_profile(&profile);
    write_meta(&profile, &identity("laptop")).unwrap();

    let outcome = ensure_compatible_with(&profile, &quick_policy(), &identity("laptop"));

    assert_eq!(outcome, ProfileOutcome::Reused);
    assert_eq!(
        fs::read(profile.join("Default").join("Cookies")).unwrap(),
        b"session"
    );
}

#[test]
fn forced_reset_wipes_even_a_matching_profile() {
    let root = tempfile::tempdir().unwrap();
    let profile = root.path().join("brain");
    seed_profile(&profile);
    write_meta(&profile, &identity("laptop")).unwrap();

    let policy = SessionPolicy {
        force_reset: true,
        ..quick_policy()
    };
    let outcome = ensure_compatible_with(&profile, &policy, &identity("laptop"));

    assert_eq!(outcome, ProfileOutcome::Reset);
    assert!(!profile.join("Default").exists());
    assert!(profile.join(SIDECAR_FILE).exists());
}

#[test]
fn profile_without_sidecar_is_adopted_or_purged() {
    let root = tempfile::tempdir().unwrap();

    let kept = root.path().join("kept");
    seed_profile(&kept);
    let outcome = ensure_compatible_with(&kept, &quick_policy(), &identity("laptop"));
    assert_eq!(outcome, ProfileOutcome::Adopted);
    assert!(kept.join("Default").join("Cookies").exists());
    assert!(kept.join(SIDECAR_FILE).exists());

    let purged = root.path().join("purged");
    seed_profile(&purged);
    let policy = SessionPolicy {
        unknown: UnknownProfilePolicy::Purge,
        ..quick_policy()
    };
    let outcome = ensure_compatible_with(&purged, &policy, &identity("laptop"));
    assert_eq!(outcome, ProfileOutcome::Reset);
    assert!(!purged.join("Default").exists());
}

#[test]
fn missing_directory_is_created_with_sidecar() {
    let root = tempfile::tempdir().unwrap();
    let profile = root.path().join("profiles").join("surfer");

    let outcome = ensure_compatible_with(&profile, &quick_policy(), &identity("laptop"));

    assert_eq!(outcome, ProfileOutcome::Created);
    assert_eq!(read_meta(&profile).unwrap().unwrap().user, "dev");
}

#[test]
fn corrupt_sidecar_triggers_reset() {
    let root = tempfile::tempdir().unwrap();
    let profile = root.path().join("surfer");
    seed_profile(&profile);
    fs::write(profile.join(SIDECAR_FILE), "{ not json").unwrap();

    let outcome = ensure_compatible_with(&profile, &quick_policy(), &identity("laptop"));

    assert_eq!(outcome, ProfileOutcome::Reset);
    assert!(read_meta(&profile).unwrap().is_some());
}

#[test]
fn current_identity_round_trips() {
    let root = tempfile::tempdir().unwrap();
    let profile = root.path().join("surfer");

    assert_eq!(ensure_compatible(&profile, false), ProfileOutcome::Created);
    assert_eq!(ensure_compatible(&profile, false), ProfileOutcome::Reused);
}

#[test]
fn invalidate_leaves_no_trash_behind() {
    let root = tempfile::tempdir().unwrap();
    let profile = root.path().join("surfer");
    seed_profile(&profile);

    assert!(invalidate(&profile, 3, Duration::from_millis(1)));
    assert!(!profile.exists());
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);

    // Nothing to remove is still success.
    assert!(invalidate(&profile, 3, Duration::from_millis(1)));
}
