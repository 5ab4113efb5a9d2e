use std::path::PathBuf;

use tempfile::TempDir;

use ralph_loop::error::LoopError;
use ralph_loop::session::{
    Phase, SCHEMA_VERSION, ScheduleState, Session, SessionStatus, SessionStore, ValidatorSpec,
    decode_feedback, encode_feedback,
};
use ralph_loop::tasks;

fn sample_session(tasks_file: PathBuf, hash: String) -> Session {
    let mut session = Session::new(tasks_file, hash);
    session.iteration = 4;
    session.max_iterations = 20;
    session.phase = Phase::Validation;
    session.status = SessionStatus::InProgress;
    session.verdict = "NEEDS_MORE_WORK".to_string();
    session.ai_provider = "codex".to_string();
    session.impl_model = "gpt-5-codex".to_string();
    session.val_model = "o3".to_string();
    session.cross_validation = Some(ValidatorSpec {
        provider: "claude".to_string(),
        model: "opus".to_string(),
    });
    session.inadmissible_count = 1;
    session.set_feedback("fix the flaky test\nand the docs");
    session.retry_attempt = 2;
    session.retry_delay = 20;
    session.schedule = Some(ScheduleState {
        target_epoch: 1_900_000_000,
        human: "2030-03-17 02:46:40".to_string(),
    });
    session.github_issue = Some("1234".to_string());
    session
}

#[test]
fn round_trip_preserves_all_fields() {
    let dir = TempDir::new().unwrap();
    let tasks_file = dir.path().join("TASKS.md");
    std::fs::write(&tasks_file, "- [ ] a\n").unwrap();
    let hash = tasks::hash_file(&tasks_file).unwrap();

    let store = SessionStore::new(dir.path().join("state"));
    let mut session = sample_session(tasks_file, hash);
    store.save(&mut session).unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded, session);
}

#[test]
fn load_without_session_is_a_recognizable_error() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path().join("state"));
    assert!(matches!(store.load(), Err(LoopError::NoSession(_))));
}

#[test]
fn unknown_schema_version_is_refused() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path());
    let tasks_file = dir.path().join("TASKS.md");
    std::fs::write(&tasks_file, "- [ ] a\n").unwrap();

    let mut session = Session::new(tasks_file, "h".to_string());
    store.save(&mut session).unwrap();

    // Bump the version on disk; the loader must refuse, not upgrade.
    let path = store.session_path();
    let content = std::fs::read_to_string(&path).unwrap();
    let bumped = content.replace(
        &format!("\"schema_version\": {SCHEMA_VERSION}"),
        &format!("\"schema_version\": {}", SCHEMA_VERSION + 1),
    );
    assert_ne!(content, bumped, "version field not found in sidecar");
    std::fs::write(&path, bumped).unwrap();

    match store.load() {
        Err(LoopError::SchemaVersion { found, expected }) => {
            assert_eq!(found, SCHEMA_VERSION + 1);
            assert_eq!(expected, SCHEMA_VERSION);
        }
        other => panic!("expected schema version error, got {other:?}"),
    }
}

#[test]
fn hash_validation_passes_on_unchanged_file() {
    let dir = TempDir::new().unwrap();
    let tasks_file = dir.path().join("TASKS.md");
    std::fs::write(&tasks_file, "- [ ] a\n- [ ] b\n").unwrap();
    let hash = tasks::hash_file(&tasks_file).unwrap();

    let store = SessionStore::new(dir.path().join("state"));
    let session = Session::new(tasks_file, hash);
    store.validate_tasks_hash(&session, false).unwrap();
}

#[test]
fn hash_validation_fails_on_modified_file() {
    let dir = TempDir::new().unwrap();
    let tasks_file = dir.path().join("TASKS.md");
    std::fs::write(&tasks_file, "- [ ] a\n").unwrap();
    let hash = tasks::hash_file(&tasks_file).unwrap();

    let store = SessionStore::new(dir.path().join("state"));
    let session = Session::new(tasks_file.clone(), hash);

    std::fs::write(&tasks_file, "- [ ] a\n- [ ] sneaky extra\n").unwrap();
    assert!(matches!(
        store.validate_tasks_hash(&session, false),
        Err(LoopError::HashMismatch)
    ));
    // Force skips the check entirely.
    store.validate_tasks_hash(&session, true).unwrap();
}

#[test]
fn file_hash_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("f.md");
    std::fs::write(&file, "content").unwrap();
    let a = tasks::hash_file(&file).unwrap();
    let b = tasks::hash_file(&file).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
}

#[test]
fn feedback_survives_json_transport() {
    let text = "multi\nline\nwith \"quotes\" and \u{1f980}";
    let encoded = encode_feedback(text);
    let json = serde_json::to_string(&encoded).unwrap();
    let back: String = serde_json::from_str(&json).unwrap();
    assert_eq!(decode_feedback(&back), text);
}

#[test]
fn clean_wipes_state_directory() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path().join("state"));
    let mut session = Session::new(dir.path().join("TASKS.md"), "h".to_string());
    store.save(&mut session).unwrap();
    assert!(store.exists());

    store.clean().unwrap();
    assert!(!store.exists());
    // Cleaning an already-clean directory is fine.
    store.clean().unwrap();
}

#[test]
fn save_leaves_no_temp_files() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path().join("state"));
    let mut session = Session::new(dir.path().join("TASKS.md"), "h".to_string());
    store.save(&mut session).unwrap();
    store.save(&mut session).unwrap();

    let entries: Vec<_> = std::fs::read_dir(store.dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(entries, vec!["session.json"]);
}
