use std::io::Write;

use secrecy::ExposeSecret;
use taskq::config::{Config, WorkerFile};

// Environment variables are process-wide, so every env check lives in one
// test to keep parallel tests from racing.
#[test]
fn config_from_env() {
    unsafe {
        std::env::remove_var("TASKQ_STORE_URL");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("TASKQ_STORE_URL", "redis://:secret@localhost:6379/0");
        std::env::set_var("TASKQ_WORKER_ID", "worker-7");
        std::env::set_var("TASKQ_WORKER_CONFIG", "/etc/taskq/worker.toml");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(
        config.store_url.expose_secret(),
        "redis://:secret@localhost:6379/0"
    );
    assert!(!format!("{config:?}").contains("secret@"));
    assert_eq!(config.worker_id(), "worker-7");
    assert_eq!(
        config.worker_file.as_deref(),
        Some(std::path::Path::new("/etc/taskq/worker.toml"))
    );
    assert!(!config.log_level.is_empty());

    unsafe {
        std::env::remove_var("TASKQ_STORE_URL");
        std::env::remove_var("TASKQ_WORKER_ID");
        std::env::remove_var("TASKQ_WORKER_CONFIG");
    }
}

#[test]
fn worker_file_loads_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
buffer = false
retry_delay_ms = 250

[[queues.default]]
poll_interval = 10

[[queues.default]]

[[queues.reports]]
direction = "tail"
"#
    )
    .unwrap();

    let loaded = WorkerFile::load(file.path()).unwrap();
    assert!(!loaded.options.buffer);
    assert!(loaded.options.cron);
    assert_eq!(loaded.options.retry_delay_ms, 250);
    assert_eq!(loaded.queues.thread_count("default"), 2);
    assert_eq!(loaded.queues.0["default"][0].poll_interval, 10);
    assert_eq!(loaded.queues.0["default"][1].poll_interval, 30);
    assert_eq!(loaded.queues.total_threads(), 3);
}

#[test]
fn missing_worker_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = WorkerFile::load(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(taskq::Error::Config(_))));
}
