#![cfg(unix)]

use std::io::{Read as _, Write as _};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use berth_runtime::{
    pid_alive, LockInfo, RuntimeHome, Supervisor, SupervisorError, LOCK_SCHEMA_VERSION,
};

fn create_temp_dir(prefix: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let base = std::env::temp_dir();
    let pid = std::process::id();
    for _ in 0..10_000 {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("{prefix}_{pid}_{n}"));
        if std::fs::create_dir(&path).is_ok() {
            return path;
        }
    }
    panic!("failed to create temp dir under {}", base.display());
}

fn rm_rf(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

/// A target whose "venv python" is a shell stub that just sleeps, so start()
/// has a real long-running process without any toolchain present.
fn fake_python_target(dir: &Path) {
    use std::os::unix::fs::PermissionsExt as _;

    std::fs::create_dir_all(dir.join(".venv/bin")).expect("create venv bin");
    let py = dir.join(".venv/bin/python");
    std::fs::write(&py, b"#!/bin/sh\nexec sleep 30\n").expect("write python stub");
    std::fs::set_permissions(&py, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    std::fs::write(dir.join("server.py"), b"print('hi')\n").expect("write entry");
    std::fs::write(
        dir.join("runner.json"),
        br#"{"type": "python", "entry": "server.py"}"#,
    )
    .expect("write runner");
}

fn dead_pid() -> u32 {
    let mut child = Command::new("sh")
        .args(["-c", "exit 0"])
        .spawn()
        .expect("spawn sh");
    let pid = child.id();
    child.wait().expect("wait sh");
    pid
}

#[test]
fn start_twice_then_stop_lifecycle() {
    let root = create_temp_dir("berth_sup_life");
    let target = root.join("component");
    std::fs::create_dir_all(&target).expect("mkdir target");
    fake_python_target(&target);

    let supervisor = Supervisor::new(RuntimeHome::at(root.join("home"))).expect("supervisor");

    let info = supervisor
        .start(&target, Some("alpha"), None)
        .expect("first start");
    assert!(pid_alive(info.pid));
    assert!(info.port.is_some());
    assert_eq!(info.alias, "alpha");

    let err = supervisor.start(&target, Some("alpha"), None).unwrap_err();
    assert!(
        matches!(err, SupervisorError::AlreadyRunning { .. }),
        "expected already-running, got: {err}"
    );

    let listed = supervisor.status().expect("status");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].alias, "alpha");

    assert!(supervisor
        .stop("alpha", Duration::from_millis(200))
        .expect("stop"));
    assert!(supervisor.status().expect("status").is_empty());
    assert!(!supervisor
        .stop("alpha", Duration::from_millis(200))
        .expect("second stop"));

    rm_rf(&root);
}

#[test]
fn stop_absent_alias_is_false() {
    let root = create_temp_dir("berth_sup_absent");
    let supervisor = Supervisor::new(RuntimeHome::at(&root)).expect("supervisor");
    assert!(!supervisor
        .stop("nothing", Duration::from_millis(100))
        .expect("stop"));
    rm_rf(&root);
}

#[test]
fn start_without_runner_descriptor_fails() {
    let root = create_temp_dir("berth_sup_norunner");
    let target = root.join("component");
    std::fs::create_dir_all(&target).expect("mkdir");

    let supervisor = Supervisor::new(RuntimeHome::at(root.join("home"))).expect("supervisor");
    let err = supervisor.start(&target, Some("alpha"), None).unwrap_err();
    assert!(matches!(err, SupervisorError::RunnerMissing { .. }));
    rm_rf(&root);
}

#[test]
fn start_without_prepared_env_fails() {
    let root = create_temp_dir("berth_sup_noenv");
    let target = root.join("component");
    std::fs::create_dir_all(&target).expect("mkdir");
    std::fs::write(target.join("server.py"), b"print('hi')\n").expect("write entry");
    std::fs::write(
        target.join("runner.json"),
        br#"{"type": "python", "entry": "server.py"}"#,
    )
    .expect("write runner");

    let supervisor = Supervisor::new(RuntimeHome::at(root.join("home"))).expect("supervisor");
    let err = supervisor.start(&target, Some("alpha"), None).unwrap_err();
    assert!(
        matches!(err, SupervisorError::EnvNotPrepared { .. }),
        "got: {err}"
    );
    rm_rf(&root);
}

#[test]
fn requested_busy_port_scans_upward() {
    let root = create_temp_dir("berth_sup_port");
    let target = root.join("component");
    std::fs::create_dir_all(&target).expect("mkdir");
    fake_python_target(&target);

    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let busy = listener.local_addr().expect("addr").port();

    let supervisor = Supervisor::new(RuntimeHome::at(root.join("home"))).expect("supervisor");
    let info = supervisor
        .start(&target, Some("porter"), Some(busy))
        .expect("start");
    let picked = info.port.expect("port");
    assert_ne!(picked, busy);
    assert!(picked > busy);

    supervisor
        .stop("porter", Duration::from_millis(200))
        .expect("stop");
    drop(listener);
    rm_rf(&root);
}

#[test]
fn doctor_reports_dead_pid_and_status_clears_it() {
    let root = create_temp_dir("berth_sup_doctor");
    let supervisor = Supervisor::new(RuntimeHome::at(&root)).expect("supervisor");

    let pid = dead_pid();
    supervisor
        .registry()
        .write(&LockInfo {
            schema_version: LOCK_SCHEMA_VERSION.to_string(),
            alias: "ghost".to_string(),
            pid,
            port: Some(7399),
            target: root.clone(),
            started_at_unix_ms: 1,
            runner_path: root.join("runner.json"),
        })
        .expect("write record");

    let report = supervisor.doctor("ghost").expect("doctor");
    assert!(!report.is_ok());
    assert!(
        report.reason.contains(&pid.to_string()),
        "reason should name the dead pid: {}",
        report.reason
    );

    assert!(supervisor.status().expect("status").is_empty());
    assert!(supervisor.registry().peek("ghost").expect("peek").is_none());
    rm_rf(&root);
}

#[test]
fn doctor_absent_alias_is_fail_not_error() {
    let root = create_temp_dir("berth_sup_doc_absent");
    let supervisor = Supervisor::new(RuntimeHome::at(&root)).expect("supervisor");
    let report = supervisor.doctor("nobody").expect("doctor");
    assert!(!report.is_ok());
    assert!(report.reason.contains("not running"));
    rm_rf(&root);
}

#[test]
fn doctor_without_port_checks_pid_only() {
    let root = create_temp_dir("berth_sup_doc_noport");
    let supervisor = Supervisor::new(RuntimeHome::at(&root)).expect("supervisor");

    supervisor
        .registry()
        .write(&LockInfo {
            schema_version: LOCK_SCHEMA_VERSION.to_string(),
            alias: "portless".to_string(),
            pid: std::process::id(),
            port: None,
            target: root.clone(),
            started_at_unix_ms: 1,
            runner_path: root.join("runner.json"),
        })
        .expect("write record");

    let report = supervisor.doctor("portless").expect("doctor");
    assert!(report.is_ok());
    rm_rf(&root);
}

#[test]
fn doctor_probes_health_endpoint() {
    let root = create_temp_dir("berth_sup_doc_health");
    let supervisor = Supervisor::new(RuntimeHome::at(&root)).expect("supervisor");

    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let port = listener.local_addr().expect("addr").port();
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf);
        let body = b"ok";
        let resp = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(resp.as_bytes()).expect("write header");
        stream.write_all(body).expect("write body");
    });

    supervisor
        .registry()
        .write(&LockInfo {
            schema_version: LOCK_SCHEMA_VERSION.to_string(),
            alias: "healthy".to_string(),
            pid: std::process::id(),
            port: Some(port),
            target: root.clone(),
            started_at_unix_ms: 1,
            runner_path: root.join("runner.json"),
        })
        .expect("write record");

    let report = supervisor.doctor("healthy").expect("doctor");
    assert!(report.is_ok(), "expected ok, got: {}", report.reason);
    rm_rf(&root);
}

#[test]
fn tail_returns_what_the_file_has() {
    let root = create_temp_dir("berth_sup_tail");
    let supervisor = Supervisor::new(RuntimeHome::at(&root)).expect("supervisor");

    let log = supervisor.log_path("tailer");
    std::fs::write(&log, b"one\ntwo\nthree\n").expect("write log");

    let lines = supervisor.tail_logs("tailer", 5).expect("tail");
    assert_eq!(lines, vec!["one", "two", "three"]);

    let last_two = supervisor.tail_logs("tailer", 2).expect("tail");
    assert_eq!(last_two, vec!["two", "three"]);
    rm_rf(&root);
}

#[test]
fn tail_missing_log_is_empty() {
    let root = create_temp_dir("berth_sup_tail_none");
    let supervisor = Supervisor::new(RuntimeHome::at(&root)).expect("supervisor");
    assert!(supervisor.tail_logs("nobody", 5).expect("tail").is_empty());
    rm_rf(&root);
}

#[test]
fn supervised_process_logs_are_appended() {
    use std::os::unix::fs::PermissionsExt as _;

    let root = create_temp_dir("berth_sup_logs");
    let target = root.join("component");
    std::fs::create_dir_all(target.join(".venv/bin")).expect("mkdir");
    let py = target.join(".venv/bin/python");
    std::fs::write(&py, b"#!/bin/sh\necho started-ok\nexec sleep 30\n").expect("write stub");
    std::fs::set_permissions(&py, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    std::fs::write(target.join("server.py"), b"\n").expect("write entry");
    std::fs::write(
        target.join("runner.json"),
        br#"{"type": "python", "entry": "server.py"}"#,
    )
    .expect("write runner");

    let supervisor = Supervisor::new(RuntimeHome::at(root.join("home"))).expect("supervisor");
    supervisor
        .start(&target, Some("logger"), None)
        .expect("start");

    // give the stub a moment to write its line
    let mut lines = Vec::new();
    for _ in 0..50 {
        lines = supervisor.tail_logs("logger", 10).expect("tail");
        if !lines.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(lines, vec!["started-ok"]);

    supervisor
        .stop("logger", Duration::from_millis(200))
        .expect("stop");
    rm_rf(&root);
}
