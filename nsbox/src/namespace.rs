//! Joining the namespaces of a running process.
//!
//! `setns` on a PID namespace does not move the caller, only its future
//! children. The mount namespace is joined by the launcher itself so the
//! daemon socket resolves inside the sandbox's filesystem view.

use std::fs::File;
use std::path::Path;

use nix::sched::{CloneFlags, setns};
use tracing::debug;

use crate::error::{Error, Result};
use crate::procfs::ProcFs;

/// A joinable namespace kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Namespace {
    /// Mount namespace (`mnt`).
    Mount,
    /// PID namespace (`pid`); affects children only.
    Pid,
    /// Hostname namespace (`uts`).
    Uts,
    /// System V IPC namespace (`ipc`).
    Ipc,
}

impl Namespace {
    /// Entry name under `/proc/<pid>/ns/`.
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Pid => "pid",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
        }
    }

    /// Matching `CLONE_NEW*` flag.
    pub const fn flag(self) -> CloneFlags {
        match self {
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
        }
    }
}

/// Joins namespace `ns` of process `pid`, using procfs at `procfs`.
pub fn join(procfs: &Path, pid: i32, ns: Namespace) -> Result<()> {
    let name = ns.proc_name();
    let path = ProcFs::new(procfs).entry(pid, &format!("ns/{name}"));
    let file = File::open(&path)
        .map_err(|e| Error::kernel(format!("Cannot open {name} namespace file"), e))?;
    setns(&file, ns.flag())
        .map_err(|e| Error::kernel(format!("Cannot join {name} namespace"), e))?;
    debug!(pid, namespace = name, "joined namespace");
    Ok(())
}
