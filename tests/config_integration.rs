use convo_search::config::AppConfig;
use serial_test::serial;
use std::env;
use std::fs;

// Helper to clear environment variables that might interfere with tests
fn clear_env_vars() {
    unsafe {
        env::remove_var("CONVO_SERVER__PORT");
        env::remove_var("CONVO_CREDENTIALS__SEARCH");
        env::remove_var("CONVO_RATE_LIMIT__MAX_REQUESTS");
        env::remove_var("CONFIG_FILE");
        env::remove_var("PORT");
        env::remove_var("RATE_LIMIT_ENABLED");
        env::remove_var("DATABASE_URL");
    }
}

fn load() -> AppConfig {
    AppConfig::load_from_args(["convo-search"]).expect("Failed to load config")
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = load();
    assert_eq!(config.server.port, 3000);
    assert_eq!(config.server.request_timeout_secs, 90);
    assert!(config.rate_limit.enabled);
    assert_eq!(config.rate_limit.max_requests, 10);
    assert_eq!(config.rate_limit.window_secs, 60);
    assert!(config.credentials.search.is_empty());
    assert!(config.persistence.database_url.is_none());
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("CONVO_SERVER__PORT", "9090");
        env::set_var("CONVO_RATE_LIMIT__MAX_REQUESTS", "3");
    }

    let config = load();
    assert_eq!(config.server.port, 9090);
    assert_eq!(config.rate_limit.max_requests, 3);

    clear_env_vars();
}

#[test]
#[serial]
fn test_credential_pool_from_env_list() {
    clear_env_vars();
    unsafe {
        env::set_var("CONVO_CREDENTIALS__SEARCH", "key-a,key-b,key-c");
    }

    let config = load();
    assert_eq!(config.credentials.search, vec!["key-a", "key-b", "key-c"]);

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load() {
    clear_env_vars();

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = dir.path().join("convo.yaml");
    fs::write(
        &file_path,
        r#"
server:
  port: 7070
session:
  max_searches: 5
"#,
    )
    .expect("Failed to write temp config");

    unsafe {
        env::set_var("CONFIG_FILE", &file_path);
    }

    let config = load();
    assert_eq!(config.server.port, 7070);
    assert_eq!(config.session.max_searches, 5);

    clear_env_vars();
}

#[test]
#[serial]
fn test_cli_flag_beats_file_and_env() {
    clear_env_vars();

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = dir.path().join("convo.yaml");
    fs::write(&file_path, "server:\n  port: 7070\n").expect("Failed to write temp config");
    let path = file_path.to_string_lossy().to_string();

    let config = AppConfig::load_from_args([
        "convo-search",
        "--config",
        path.as_str(),
        "--port",
        "5050",
        "--rate-limit-enabled",
        "false",
    ])
    .expect("Failed to load config");
    assert_eq!(config.server.port, 5050);
    assert!(!config.rate_limit.enabled);
}

#[test]
#[serial]
fn test_cwd_config_fallback() {
    clear_env_vars();

    let cwd_path = "config.yaml";
    fs::write(cwd_path, "server:\n  port: 6060\n").expect("Failed to write ./config.yaml");

    let port = AppConfig::load_from_args(["convo-search"])
        .ok()
        .map(|c| c.server.port);

    let result = std::panic::catch_unwind(|| {
        assert_eq!(port, Some(6060));
    });

    fs::remove_file(cwd_path).unwrap();

    if let Err(e) = result {
        std::panic::resume_unwind(e);
    }
}
