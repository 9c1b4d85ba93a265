//! End-to-end lifecycle scenarios against real processes.
//!
//! Each scenario spawns long-sleeping shell scripts with unique paths
//! under a temp directory, so process-table matching never touches
//! unrelated processes on the host.

#![cfg(unix)]

use shepherd::config::ServiceFile;
use shepherd::runtime::supervisor::pid_alive;
use shepherd::runtime::{Orchestrator, RetryPolicy};
use shepherd::state::{ServiceStatus, StateStore};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;

fn write_sleep_script(dir: &Path, file: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(file);
    std::fs::write(&path, "#!/bin/sh\nsleep 60\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_factor: 2.0,
    }
}

fn shutdown_channel() -> (watch::Sender<()>, watch::Receiver<()>) {
    watch::channel(())
}

#[tokio::test]
async fn test_start_all_then_stop_all_round_trip() {
    let home = tempfile::tempdir().unwrap();
    let script = write_sleep_script(home.path(), "svc_base.sh");

    let yaml = format!(
        r#"
external_services:
  base_services:
    - service_name: web
      command: {script}
  optional_services:
    - service_name: broken
      command: /nonexistent/binary/definitely-not-here
consul:
  enabled: false
"#,
        script = script.display()
    );
    let file = ServiceFile::from_yaml(&yaml).unwrap();
    let mut orchestrator = Orchestrator::with_home(&file, home.path().to_path_buf())
        .unwrap()
        .with_retry_policy(fast_retry());

    let (_tx, rx) = shutdown_channel();
    let report = orchestrator.start_all(&rx).await;

    assert_eq!(report.started, vec!["web".to_string()]);
    assert!(report.base_failures.is_empty());
    assert_eq!(report.optional_failures.len(), 1);
    assert_eq!(report.optional_failures[0].0, "broken");
    assert!(!report.success());

    let web = &orchestrator.records()["web"];
    let pid = web.pid.expect("base service must have a pid");
    assert!(pid > 0);
    assert_eq!(web.status, ServiceStatus::Running);
    assert!(pid_alive(pid));

    assert_eq!(orchestrator.records()["broken"].status, ServiceStatus::Failed);

    // The state file mirrors the in-memory records.
    let store = StateStore::new(home.path().join("service_state.json"));
    let persisted = store.load();
    assert_eq!(persisted["web"].pid, Some(pid));
    assert_eq!(persisted["web"].status, ServiceStatus::Running);

    let stop = orchestrator.stop_all().await;
    assert!(stop.success());
    assert!(orchestrator.records().is_empty());
    assert!(!pid_alive(pid));
    assert!(store.load().is_empty());
}

#[tokio::test]
async fn test_tcp_health_check_gates_running_state() {
    let home = tempfile::tempdir().unwrap();
    let script = write_sleep_script(home.path(), "svc_probed.sh");

    // Something already answers on the probe port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let yaml = format!(
        r#"
external_services:
  base_services:
    - service_name: probed
      command: {script}
      health_check_url: "tcp://127.0.0.1:{port}"
      startup_timeout: 5
consul:
  enabled: false
"#,
        script = script.display(),
        port = port
    );
    let file = ServiceFile::from_yaml(&yaml).unwrap();
    let mut orchestrator = Orchestrator::with_home(&file, home.path().to_path_buf())
        .unwrap()
        .with_retry_policy(fast_retry());

    let (_tx, rx) = shutdown_channel();
    let report = orchestrator.start_all(&rx).await;
    assert!(report.success(), "failures: {:?}", report);

    let record = &orchestrator.records()["probed"];
    assert_eq!(record.status, ServiceStatus::Running);
    assert_eq!(record.port, Some(port));
    assert!(record.pid.unwrap() > 0);

    orchestrator.stop_all().await;
}

#[tokio::test]
async fn test_failing_health_check_marks_base_service_failed() {
    let home = tempfile::tempdir().unwrap();
    let script = write_sleep_script(home.path(), "svc_unhealthy.sh");

    let yaml = format!(
        r#"
external_services:
  base_services:
    - service_name: unhealthy
      command: {script}
      health_check_url: "tcp://127.0.0.1:1"
      startup_timeout: 1
consul:
  enabled: false
"#,
        script = script.display()
    );
    let file = ServiceFile::from_yaml(&yaml).unwrap();
    let mut orchestrator = Orchestrator::with_home(&file, home.path().to_path_buf())
        .unwrap()
        .with_retry_policy(fast_retry());

    let (_tx, rx) = shutdown_channel();
    let report = orchestrator.start_all(&rx).await;

    assert_eq!(report.base_failures.len(), 1);
    assert_eq!(report.base_failures[0].0, "unhealthy");
    assert_eq!(
        orchestrator.records()["unhealthy"].status,
        ServiceStatus::Failed
    );

    // The spawned-but-unhealthy process must not leak.
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn test_stop_all_recovers_processes_from_state_file_only() {
    use std::os::unix::process::CommandExt;

    let home = tempfile::tempdir().unwrap();
    let script = write_sleep_script(home.path(), "svc_orphaned.sh");

    // A process from a "previous manager run": spawned outside any
    // orchestrator, remembered only in the state file.
    let mut child = std::process::Command::new(&script);
    child.process_group(0);
    let mut child = child.spawn().unwrap();
    let pid = child.id();
    assert!(pid_alive(pid));

    let store = StateStore::new(home.path().join("service_state.json"));
    let mut map = shepherd::state::StateMap::new();
    map.insert(
        "orphaned".to_string(),
        shepherd::state::RuntimeRecord {
            pid: Some(pid),
            start_time: shepherd::state::now_secs(),
            script: script.display().to_string(),
            args: vec![],
            cwd: None,
            port: None,
            status: ServiceStatus::Running,
            class: shepherd::state::ServiceClass::Base,
        },
    );
    store.save(&map).unwrap();

    // Fresh manager with no in-memory handles.
    let file = ServiceFile::from_yaml("external_services: {}\n").unwrap();
    let mut orchestrator = Orchestrator::with_home(&file, home.path().to_path_buf()).unwrap();
    assert_eq!(orchestrator.records().len(), 1);

    let report = orchestrator.stop_all().await;
    assert!(report.success());
    assert_eq!(report.stopped, 1);
    assert!(!pid_alive(pid));
    assert!(store.load().is_empty());

    let _ = child.wait();
}

#[tokio::test]
async fn test_stop_all_reaches_process_whose_pid_changed() {
    use std::os::unix::process::CommandExt;

    let home = tempfile::tempdir().unwrap();
    let script = write_sleep_script(home.path(), "svc_respawned.sh");

    let mut child = std::process::Command::new(&script);
    child.process_group(0);
    let mut child = child.spawn().unwrap();
    let pid = child.id();

    // The state file remembers a pid that no longer exists; only the
    // command line still identifies the process.
    let store = StateStore::new(home.path().join("service_state.json"));
    let mut map = shepherd::state::StateMap::new();
    map.insert(
        "respawned".to_string(),
        shepherd::state::RuntimeRecord {
            pid: Some(u32::MAX - 7),
            start_time: shepherd::state::now_secs(),
            script: script.display().to_string(),
            args: vec![],
            cwd: None,
            port: None,
            status: ServiceStatus::Running,
            class: shepherd::state::ServiceClass::Optional,
        },
    );
    store.save(&map).unwrap();

    let file = ServiceFile::from_yaml("external_services: {}\n").unwrap();
    let mut orchestrator = Orchestrator::with_home(&file, home.path().to_path_buf()).unwrap();

    let report = orchestrator.stop_all().await;
    assert!(report.success());
    assert!(!pid_alive(pid));
    assert!(store.load().is_empty());

    let _ = child.wait();
}

#[tokio::test]
async fn test_status_reflects_dead_processes_after_restart() {
    let home = tempfile::tempdir().unwrap();

    // Remembered service whose process is long gone.
    let store = StateStore::new(home.path().join("service_state.json"));
    let mut map = shepherd::state::StateMap::new();
    map.insert(
        "vanished".to_string(),
        shepherd::state::RuntimeRecord {
            pid: Some(u32::MAX - 9),
            start_time: shepherd::state::now_secs() - 120,
            script: "/nonexistent/vanished-service".to_string(),
            args: vec![],
            cwd: None,
            port: None,
            status: ServiceStatus::Running,
            class: shepherd::state::ServiceClass::Base,
        },
    );
    store.save(&map).unwrap();

    let file = ServiceFile::from_yaml("external_services: {}\n").unwrap();
    let mut orchestrator = Orchestrator::with_home(&file, home.path().to_path_buf()).unwrap();

    let report = orchestrator.status().await;
    assert_eq!(report.services.len(), 1);
    assert_eq!(report.services[0].name, "vanished");
    assert_eq!(report.services[0].status, ServiceStatus::Stopped);
    assert!(report.consul.is_none());
}

#[tokio::test]
async fn test_single_service_start_and_stop() {
    let home = tempfile::tempdir().unwrap();
    let script = write_sleep_script(home.path(), "svc_solo.sh");

    let yaml = format!(
        r#"
external_services:
  optional_services:
    - service_name: solo
      command: {script}
consul:
  enabled: false
"#,
        script = script.display()
    );
    let file = ServiceFile::from_yaml(&yaml).unwrap();
    let mut orchestrator = Orchestrator::with_home(&file, home.path().to_path_buf())
        .unwrap()
        .with_retry_policy(fast_retry());

    orchestrator.start_service("solo").await.unwrap();
    let pid = orchestrator.records()["solo"].pid.unwrap();
    assert!(pid_alive(pid));

    orchestrator.stop_service("solo").await.unwrap();
    assert!(!pid_alive(pid));
    assert!(orchestrator.records().is_empty());

    // Stopping again is a user-visible failure, not a crash.
    assert!(orchestrator.stop_service("solo").await.is_err());
}
