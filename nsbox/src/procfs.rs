//! Minimal readers for `/proc/<pid>` entries.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Real, effective, saved and filesystem ids, as listed in `/proc/<pid>/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcIds {
    /// `Uid:` line.
    pub(crate) uids: [u32; 4],
    /// `Gid:` line.
    pub(crate) gids: [u32; 4],
}

impl ProcIds {
    /// Returns `true` when every uid equals `uid` and every gid equals `gid`.
    pub(crate) fn all_match(&self, uid: u32, gid: u32) -> bool {
        self.uids.iter().all(|&u| u == uid) && self.gids.iter().all(|&g| g == gid)
    }
}

/// A procfs mount.
#[derive(Debug, Clone)]
pub(crate) struct ProcFs<'a> {
    /// Mount point, normally `/proc`.
    root: &'a Path,
}

impl<'a> ProcFs<'a> {
    /// Uses the procfs mounted at `root`.
    pub(crate) const fn new(root: &'a Path) -> Self {
        Self { root }
    }

    /// `/proc/<pid>/<entry>`.
    pub(crate) fn entry(&self, pid: i32, entry: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(entry)
    }

    /// Process name (`comm`), first word only.
    pub(crate) fn comm(&self, pid: i32) -> io::Result<String> {
        let raw = fs::read_to_string(self.entry(pid, "comm"))?;
        raw.split_whitespace()
            .next()
            .map(str::to_owned)
            .ok_or_else(|| invalid("empty comm"))
    }

    /// Credentials from `status`.
    pub(crate) fn ids(&self, pid: i32) -> io::Result<ProcIds> {
        parse_status(&fs::read_to_string(self.entry(pid, "status"))?)
    }

    /// First child of the process's main thread.
    pub(crate) fn first_child(&self, pid: i32) -> io::Result<i32> {
        let path = self.entry(pid, &format!("task/{pid}/children"));
        fs::read_to_string(path)?
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| invalid("no child process"))
    }
}

/// Extracts the `Uid:` and `Gid:` lines of a status file.
fn parse_status(status: &str) -> io::Result<ProcIds> {
    let mut uids = None;
    let mut gids = None;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            uids = Some(four_ids(rest)?);
        } else if let Some(rest) = line.strip_prefix("Gid:") {
            gids = Some(four_ids(rest)?);
        }
    }
    match (uids, gids) {
        (Some(uids), Some(gids)) => Ok(ProcIds { uids, gids }),
        _ => Err(invalid("missing Uid/Gid lines")),
    }
}

/// Parses exactly four whitespace-separated ids.
fn four_ids(field: &str) -> io::Result<[u32; 4]> {
    let mut out = [0u32; 4];
    let mut it = field.split_whitespace();
    for slot in &mut out {
        *slot = it
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| invalid("malformed id list"))?;
    }
    Ok(out)
}

/// `InvalidData` error with a message.
fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_owned())
}
