use super::{apply_env, apply_file, normalize_database_url, prepare_database_url, Settings};

use std::{
    collections::HashMap,
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

fn temp_root(label: &str) -> std::path::PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    env::temp_dir().join(format!("chat_bridge_{label}_{suffix}"))
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
}

#[test]
fn keeps_windows_absolute_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("sqlite:C:\\Users\\alice\\bridge.db"),
        "sqlite:C:/Users/alice/bridge.db"
    );
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/alice/bridge.db"),
        "sqlite:C:/Users/alice/bridge.db"
    );
}

#[test]
fn creates_parent_dir_for_sqlite_url() {
    let root = temp_root("config");
    let db_path = root.join("data").join("bridge.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(root.join("data").exists());

    fs::remove_dir_all(root).expect("cleanup");
}

#[test]
fn file_settings_override_defaults() {
    let mut settings = Settings::default();
    apply_file(
        &mut settings,
        r#"
bind_addr = "0.0.0.0:9000"
local_chat_token = "secret"

[bridge]
domain = "chat.example.com"
delivery_receipts = true

[bridge.backfill]
initial_history_fill = 5
"#,
    )
    .expect("parse");

    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.local_chat_token, "secret");
    assert_eq!(settings.database_url, Settings::default().database_url);
    assert_eq!(settings.bridge.domain, "chat.example.com");
    assert!(settings.bridge.delivery_receipts);
    assert_eq!(settings.bridge.backfill.initial_history_fill, 5);
    assert_eq!(settings.bridge.backfill.page_size, 50);
    assert_eq!(settings.bridge.reaction_key, "❤️");
}

#[test]
fn malformed_file_is_an_error() {
    let mut settings = Settings::default();
    assert!(apply_file(&mut settings, "bind_addr = [").is_err());
}

#[test]
fn environment_overrides_file() {
    let mut settings = Settings::default();
    apply_file(&mut settings, "database_url = \"sqlite://file.db\"").expect("parse");
    let vars: HashMap<&str, &str> = HashMap::from([
        ("APP__DATABASE_URL", "sqlite://env.db"),
        ("APP__LOCAL_CHAT_TOKEN", "from-env"),
        ("APP__BRIDGE__INITIAL_HISTORY_FILL", "not a number"),
        ("APP__BRIDGE__DELIVERY_RECEIPTS", "true"),
    ]);

    apply_env(&mut settings, |name| vars.get(name).map(|v| v.to_string()));

    assert_eq!(settings.database_url, "sqlite://env.db");
    assert_eq!(settings.local_chat_token, "from-env");
    assert!(settings.bridge.delivery_receipts);
    assert_eq!(settings.bridge.backfill.initial_history_fill, 20);
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let root = temp_root("open");
    let db_path = root.join("nested").join("bridge.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(root).expect("cleanup");
}
