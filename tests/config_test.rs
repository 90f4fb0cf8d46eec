use dispatch_rs::config::Config;
use std::time::Duration;

// Env vars are process-global, so every case runs in one test.
#[test]
fn config_from_env() {
    unsafe {
        std::env::remove_var("DATABASE_URL");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("DATABASE_URL", "sqlite://dispatch-test.db");
        std::env::set_var("DISPATCH_WORKERS", "8");
        std::env::set_var("DISPATCH_DEDUP_WINDOW_SECS", "30");
        std::env::set_var("DISPATCH_RATE_CAPACITY", "3");
    }
    let config = Config::from_env().unwrap();
    assert!(!config.log_level.is_empty());
    assert_eq!(config.dispatch.worker_count, 8);
    assert_eq!(config.dispatch.dedup_window, Duration::from_secs(30));
    assert_eq!(config.dispatch.rate_limit.capacity, 3.0);
    assert_eq!(config.dispatch.default_max_attempts, 3);
    assert_eq!(config.scheduler.idle_poll, Duration::from_secs(300));

    unsafe {
        std::env::set_var("DISPATCH_WORKERS", "many");
    }
    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("DISPATCH_WORKERS"));

    unsafe {
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("DISPATCH_WORKERS");
        std::env::remove_var("DISPATCH_DEDUP_WINDOW_SECS");
        std::env::remove_var("DISPATCH_RATE_CAPACITY");
    }
}

#[test]
fn job_file_loads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.toml");
    std::fs::write(
        &path,
        r#"
[[job]]
id = "digest"
schedule = "*/5 * * * *"
payload = { text = "summary" }
"#,
    )
    .unwrap();

    let jobs = dispatch_rs::config::load_jobs_file(&path).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id.as_str(), "digest");

    assert!(dispatch_rs::config::load_jobs_file(&dir.path().join("missing.toml")).is_err());
}
