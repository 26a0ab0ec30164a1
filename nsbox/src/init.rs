//! Init lifecycle: find, validate, start, and stop the sandbox init process.
//!
//! The init process is recorded as a decimal PID in `<prefix>/.init.pid`.
//! A record is only trusted after re-checking the live process: it must
//! exist, run under the expected name, and (for non-root invokers) carry
//! the invoker's uid and gid in every slot. Anything else is stale and the
//! file is removed.

use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use nix::sched::{CloneFlags, unshare};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::barrier;
use crate::config::PREFIX_ENV;
use crate::context::{AssumedIdentity, LaunchContext};
use crate::error::{Error, Result};
use crate::procfs::ProcFs;

/// A validated, running init process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitRecord {
    /// Init process id.
    pid: i32,
}

impl InitRecord {
    /// Process id of the init process.
    pub const fn pid(self) -> i32 {
        self.pid
    }
}

/// Outcome of [`InitManager::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum Shutdown {
    /// Both processes were sent `SIGKILL`.
    Stopped {
        /// The init process.
        init: i32,
        /// Its first child, the in-sandbox supervisor.
        supervisor: i32,
    },
    /// No valid record: nothing to stop.
    NotRunning,
}

/// Why a recorded PID was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stale {
    /// PID file content is not a positive integer.
    Unparsable,
    /// No such process.
    Dead,
    /// Process runs under another name.
    WrongName,
    /// Process credentials differ from the invoker's.
    ForeignOwner,
}

/// Start-or-reuse logic for one prefix.
#[derive(Debug, Clone, Copy)]
pub struct InitManager<'a> {
    /// Invocation inputs.
    ctx: &'a LaunchContext,
}

impl<'a> InitManager<'a> {
    /// Binds the manager to a launch context.
    pub const fn new(ctx: &'a LaunchContext) -> Self {
        Self { ctx }
    }

    /// procfs view from the configured mount point.
    fn procfs(&self) -> ProcFs<'a> {
        ProcFs::new(&self.ctx.config.procfs)
    }

    /// Looks up the recorded init process.
    ///
    /// Returns `None` when no PID file exists or the record is stale; a stale
    /// PID file is deleted.
    pub fn resolve(&self) -> Result<Option<InitRecord>> {
        let path = self.ctx.prefix.pid_file();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match self.validate(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(reason) => {
                debug!(?reason, pid_file = %path.display(), "discarding stale init record");
                remove_if_present(&path)?;
                Ok(None)
            }
        }
    }

    /// Applies the liveness and identity checks to PID file content.
    fn validate(&self, raw: &str) -> std::result::Result<InitRecord, Stale> {
        let pid: i32 = raw
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .filter(|&p| p > 0)
            .ok_or(Stale::Unparsable)?;

        kill(Pid::from_raw(pid), None).map_err(|_| Stale::Dead)?;

        let proc = self.procfs();
        match proc.comm(pid) {
            Ok(name) if name == self.ctx.config.init_name => {}
            _ => return Err(Stale::WrongName),
        }

        let who = self.ctx.original;
        if !who.is_superuser() {
            let ids = proc.ids(pid).map_err(|_| Stale::ForeignOwner)?;
            if !ids.all_match(who.uid, who.gid) {
                return Err(Stale::ForeignOwner);
            }
        }
        Ok(InitRecord { pid })
    }

    /// Returns the running init, starting a new one if needed.
    ///
    /// `fix_permissions` is forwarded to a newly started init (set when the
    /// prefix was created by this invocation).
    pub fn ensure_running(&self, fix_permissions: bool) -> Result<InitRecord> {
        if let Some(record) = self.resolve()? {
            debug!(pid = record.pid, "reusing running init");
            return Ok(record);
        }
        self.start(fix_permissions)
    }

    /// Starts a new init process and waits for its spawn daemon socket.
    fn start(&self, fix_permissions: bool) -> Result<InitRecord> {
        let socket = self.ctx.socket_path();
        if let Err(e) = remove_if_present(&socket) {
            warn!("cannot remove stale socket {}: {e}", socket.display());
        }
        self.ctx.prefix.ensure_workdir()?;

        let pid = self.spawn(fix_permissions)?;
        info!(pid, "init process started");
        self.write_pid(pid);
        self.wait_for_socket(&socket);
        Ok(InitRecord { pid })
    }

    /// Unshares UTS/IPC, spawns the init program, and blocks on the barrier.
    fn spawn(&self, fix_permissions: bool) -> Result<i32> {
        let config = &self.ctx.config;
        let (child_end, barrier) = barrier::create()
            .map_err(|e| Error::kernel("Cannot create a pipe for synchronization", e))?;

        if config.unshare {
            unshare(CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWIPC).map_err(|e| {
                Error::kernel(
                    format!("Cannot unshare UTS and IPC namespaces to create {}", config.init_name),
                    e,
                )
            })?;
        }

        // The init outlives the launcher and is reparented when we exit.
        #[allow(clippy::zombie_processes)]
        let child = Command::new(&config.init_program)
            .arg0(&config.init_name)
            .arg(self.ctx.prefix.path())
            .arg(self.ctx.original.uid.to_string())
            .arg(self.ctx.original.gid.to_string())
            .arg(child_end.as_raw_fd().to_string())
            .arg(if fix_permissions { "1" } else { "0" })
            .env_remove(PREFIX_ENV)
            .spawn()
            .map_err(|e| {
                Error::kernel(
                    format!("Cannot start {} ({})", config.init_name, config.init_program.display()),
                    e,
                )
            })?;
        drop(child_end);

        barrier
            .wait()
            .map_err(|e| Error::kernel("Cannot wait for the init process", e))?;
        i32::try_from(child.id())
            .map_err(|_| Error::kernel("init pid out of range", io::ErrorKind::InvalidData))
    }

    /// Persists the init PID, written as the invoking user.
    ///
    /// Failure is logged, not fatal: the next invocation will simply start
    /// another init.
    fn write_pid(&self, pid: i32) {
        let path = self.ctx.prefix.pid_file();
        let written = AssumedIdentity::assume(self.ctx.original)
            .and_then(|_as_user| fs::write(&path, pid.to_string()).map_err(Error::from));
        if let Err(e) = written {
            warn!("Cannot write out PID of the init process: {e}");
        }
    }

    /// Polls for the daemon socket. Timing out is not an error; the connect
    /// that follows reports the real failure.
    fn wait_for_socket(&self, socket: &Path) {
        let config = &self.ctx.config;
        for attempt in 0..config.ready_attempts {
            if socket.exists() {
                debug!(attempt, "spawn daemon socket present");
                return;
            }
            std::thread::sleep(config.ready_interval);
        }
        warn!(socket = %socket.display(), "spawn daemon socket did not appear");
    }

    /// Kills the supervisor and the init process and removes the record.
    ///
    /// Does not wait for either process to exit.
    pub fn shutdown(&self) -> Result<Shutdown> {
        let Some(record) = self.resolve()? else {
            return Ok(Shutdown::NotRunning);
        };
        let supervisor = self
            .procfs()
            .first_child(record.pid)
            .map_err(|e| Error::kernel("Failed to shut down the container", e))?;

        for pid in [supervisor, record.pid] {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!(pid, "kill failed: {e}");
            }
        }
        remove_if_present(&self.ctx.prefix.pid_file())?;
        info!(init = record.pid, supervisor, "container stopped");
        Ok(Shutdown::Stopped {
            init: record.pid,
            supervisor,
        })
    }
}

/// Removes a file, treating "already gone" as success.
fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
