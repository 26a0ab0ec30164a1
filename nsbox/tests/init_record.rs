//! Init record validation against a fake procfs.

#![cfg(target_os = "linux")]

use std::fs;
use std::process::Command;

use nsbox::{Config, INIT_NAME, Identity, InitManager, LaunchContext, Prefix, Shutdown};
use tempfile::TempDir;

/// A prefix plus a procfs directory we control.
struct Fixture {
    prefix: TempDir,
    proc: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            prefix: tempfile::tempdir().unwrap(),
            proc: tempfile::tempdir().unwrap(),
        }
    }

    fn ctx(&self, original: Identity) -> LaunchContext {
        LaunchContext::new(
            Config::default().with_procfs(self.proc.path()),
            original,
            Prefix::new(self.prefix.path()).unwrap(),
            "/".into(),
        )
    }

    fn pid_file(&self) -> std::path::PathBuf {
        self.prefix.path().join(".init.pid")
    }

    fn record(&self, content: &str) {
        fs::write(self.pid_file(), content).unwrap();
    }

    /// Fakes `/proc/<pid>/{comm,status}`.
    fn fake_process(&self, pid: u32, comm: &str, uid: u32, gid: u32) {
        let dir = self.proc.path().join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        fs::write(
            dir.join("status"),
            format!(
                "Name:\t{comm}\nPid:\t{pid}\nUid:\t{uid}\t{uid}\t{uid}\t{uid}\n\
                 Gid:\t{gid}\t{gid}\t{gid}\t{gid}\nGroups:\t\n"
            ),
        )
        .unwrap();
    }
}

/// PID of a process that has already exited and been reaped.
fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

const USER: Identity = Identity::new(4321, 4322);

#[test]
fn missing_record_means_absent() {
    let fx = Fixture::new();
    assert_eq!(InitManager::new(&fx.ctx(USER)).resolve().unwrap(), None);
}

#[test]
fn unparsable_record_is_removed() {
    let fx = Fixture::new();
    for junk in ["", "abc", "-5", "0"] {
        fx.record(junk);
        assert_eq!(InitManager::new(&fx.ctx(USER)).resolve().unwrap(), None, "{junk:?}");
        assert!(!fx.pid_file().exists());
    }
}

#[test]
fn dead_process_record_is_removed() {
    let fx = Fixture::new();
    let pid = dead_pid();
    fx.fake_process(pid, INIT_NAME, USER.uid, USER.gid);
    fx.record(&pid.to_string());

    let ctx = fx.ctx(USER);
    let mgr = InitManager::new(&ctx);
    assert_eq!(mgr.resolve().unwrap(), None);
    assert!(!fx.pid_file().exists());
    // Cleanup is idempotent.
    assert_eq!(mgr.resolve().unwrap(), None);
}

#[test]
fn live_matching_process_is_trusted() {
    let fx = Fixture::new();
    let pid = std::process::id();
    fx.fake_process(pid, INIT_NAME, USER.uid, USER.gid);
    fx.record(&format!("{pid}\n"));

    let record = InitManager::new(&fx.ctx(USER)).resolve().unwrap().unwrap();
    assert_eq!(record.pid(), i32::try_from(pid).unwrap());
    assert!(fx.pid_file().exists());
}

#[test]
fn wrong_process_name_is_stale() {
    let fx = Fixture::new();
    let pid = std::process::id();
    fx.fake_process(pid, "bash", USER.uid, USER.gid);
    fx.record(&pid.to_string());

    assert_eq!(InitManager::new(&fx.ctx(USER)).resolve().unwrap(), None);
    assert!(!fx.pid_file().exists());
}

#[test]
fn foreign_owner_is_stale_for_regular_users() {
    let fx = Fixture::new();
    let pid = std::process::id();
    fx.fake_process(pid, INIT_NAME, USER.uid + 1, USER.gid);
    fx.record(&pid.to_string());

    assert_eq!(InitManager::new(&fx.ctx(USER)).resolve().unwrap(), None);
    assert!(!fx.pid_file().exists());
}

#[test]
fn superuser_skips_the_owner_check() {
    let fx = Fixture::new();
    let pid = std::process::id();
    fx.fake_process(pid, INIT_NAME, USER.uid, USER.gid);
    fx.record(&pid.to_string());

    let root = Identity::new(0, 0);
    assert!(InitManager::new(&fx.ctx(root)).resolve().unwrap().is_some());
}

#[test]
fn shutdown_without_record_reports_not_running() {
    let fx = Fixture::new();
    let stopped = match InitManager::new(&fx.ctx(USER)).shutdown().unwrap() {
        Shutdown::NotRunning => false,
        Shutdown::Stopped { .. } => true,
    };
    assert!(!stopped);
}

#[test]
fn shutdown_without_supervisor_fails() {
    let fx = Fixture::new();
    let pid = std::process::id();
    fx.fake_process(pid, INIT_NAME, USER.uid, USER.gid);
    fx.record(&pid.to_string());

    // No task/<pid>/children entry in the fake procfs.
    let err = InitManager::new(&fx.ctx(USER)).shutdown().unwrap_err();
    assert_eq!(err.to_string(), "Failed to shut down the container");
    assert!(fx.pid_file().exists());
}
