//! Invoking identity, privilege switching, and the per-invocation context.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid, getegid, geteuid, getgid, getuid, setegid, seteuid, setgid, setuid};
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::prefix::Prefix;

/// A uid/gid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Identity {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

impl Identity {
    /// Builds an identity from raw ids.
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Real uid/gid of the calling process.
    pub fn real() -> Self {
        Self::new(getuid().as_raw(), getgid().as_raw())
    }

    /// Returns `true` for uid 0.
    pub const fn is_superuser(self) -> bool {
        self.uid == 0
    }

    /// Captures the invoking identity and makes root the real identity.
    ///
    /// The binary must be installed setuid-root: namespaces and mounts need
    /// it. Returns the original (pre-elevation) real identity.
    pub fn elevate() -> Result<Self> {
        if !geteuid().is_root() {
            let exe = std::env::current_exe()
                .map_or_else(|_| "nsbox".into(), |p| p.display().to_string());
            return Err(Error::Config(format!(
                "the `{exe}' binary is not setuid root, which is mandatory \
                 (it creates mount and PID namespaces and performs mounts)"
            )));
        }
        let original = Self::real();
        setuid(Uid::from_raw(0)).map_err(|e| Error::kernel("Cannot set uid to root", e))?;
        setgid(Gid::from_raw(0)).map_err(|e| Error::kernel("Cannot set gid to root", e))?;
        Ok(original)
    }

    /// Drops the effective uid to this identity for the rest of the process.
    pub fn drop_effective_uid(self) -> Result<()> {
        seteuid(Uid::from_raw(self.uid))
            .map_err(|e| Error::kernel("Cannot drop effective uid", e))
    }
}

/// Guard that runs with another effective identity and switches back on drop.
///
/// A no-op unless the process is currently running as effective root.
#[derive(Debug)]
#[must_use = "the previous identity is restored when the guard drops"]
pub(crate) struct AssumedIdentity {
    /// Effective ids to restore.
    saved: Option<(Uid, Gid)>,
}

impl AssumedIdentity {
    /// Switches effective gid then uid to `who`.
    pub(crate) fn assume(who: Identity) -> Result<Self> {
        let (euid, egid) = (geteuid(), getegid());
        if !euid.is_root() {
            return Ok(Self { saved: None });
        }
        setegid(Gid::from_raw(who.gid))
            .map_err(|e| Error::kernel("Cannot switch effective gid", e))?;
        if let Err(e) = seteuid(Uid::from_raw(who.uid)) {
            let _ = setegid(egid);
            return Err(Error::kernel("Cannot switch effective uid", e));
        }
        Ok(Self {
            saved: Some((euid, egid)),
        })
    }
}

impl Drop for AssumedIdentity {
    fn drop(&mut self) {
        if let Some((uid, gid)) = self.saved {
            // uid first: regaining root is what permits the gid change.
            if let Err(e) = seteuid(uid).and_then(|()| setegid(gid)) {
                warn!("failed to restore effective identity: {e}");
            }
        }
    }
}

/// Everything one invocation needs, resolved once up front.
#[derive(Debug)]
#[non_exhaustive]
pub struct LaunchContext {
    /// Launcher settings.
    pub config: Config,
    /// Identity of the invoking user.
    pub original: Identity,
    /// Sandbox prefix.
    pub prefix: Prefix,
    /// Host working directory at startup.
    pub cwd: PathBuf,
}

impl LaunchContext {
    /// Bundles resolved launch inputs.
    pub const fn new(config: Config, original: Identity, prefix: Prefix, cwd: PathBuf) -> Self {
        Self {
            config,
            original,
            prefix,
            cwd,
        }
    }

    /// Absolute path of the spawn daemon socket.
    pub fn socket_path(&self) -> PathBuf {
        self.prefix.path().join(&self.config.socket)
    }

    /// Maps a host path to the same file as seen from inside the sandbox.
    pub fn sandbox_path(&self, host: &Path) -> PathBuf {
        under_root(&self.config.system_root, host)
    }
}

/// Concatenates `root` and an absolute `path` byte-for-byte.
pub(crate) fn under_root(root: &Path, path: &Path) -> PathBuf {
    let mut out = root.as_os_str().to_os_string().into_vec();
    out.extend_from_slice(path.as_os_str().as_encoded_bytes());
    PathBuf::from(OsString::from_vec(out))
}
