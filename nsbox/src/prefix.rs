//! Prefix store: location, bootstrap layout, and ownership of a sandbox root.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};

use nix::unistd::{Uid, User};
use tracing::{debug, info};

use crate::config::{MAX_PREFIX_LEN, PREFIX_ENV};
use crate::context::{AssumedIdentity, Identity};
use crate::error::{Error, Result};

/// Directories created inside a fresh prefix, parents first.
const LAYOUT: &[&str] = &[
    "Volumes",
    "Applications",
    "usr",
    "usr/local",
    "usr/local/share",
    "private",
    "private/var",
    "private/var/log",
    "private/var/db",
    "private/etc",
    "var",
    "var/run",
    "var/tmp",
    "var/log",
];

/// Default prefix directory name under `$HOME`.
const DEFAULT_DIR: &str = ".nsbox";

/// PID file of the running init process, relative to the prefix.
const PID_FILE: &str = ".init.pid";

/// What currently sits at the prefix path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum PrefixState {
    /// Nothing exists yet.
    Absent,
    /// A directory exists.
    Directory,
    /// Something other than a directory is in the way.
    NotADirectory,
}

/// Root directory of one sandbox instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    /// Absolute or caller-relative root path.
    path: PathBuf,
}

impl Prefix {
    /// Wraps `path`, enforcing the length bound.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().len() > MAX_PREFIX_LEN {
            return Err(Error::Config("Prefix path too long".into()));
        }
        Ok(Self { path })
    }

    /// Resolves the prefix from `DPREFIX` or `$HOME/.nsbox`.
    ///
    /// The default comes from `HOME` alone, since the real uid is root by
    /// now. The override is removed from the environment so no child
    /// inherits it.
    pub fn resolve() -> Result<Self> {
        let explicit = std::env::var_os(PREFIX_ENV);
        // SAFETY: called during single-threaded startup, before any thread
        // that could read the environment exists.
        #[allow(unsafe_code)]
        unsafe {
            std::env::remove_var(PREFIX_ENV);
        }
        Self::resolve_from(explicit, std::env::var_os("HOME").map(PathBuf::from))
    }

    /// Resolution with explicit inputs.
    pub fn resolve_from(explicit: Option<OsString>, home: Option<PathBuf>) -> Result<Self> {
        match (explicit, home) {
            (Some(p), _) if !p.is_empty() => Self::new(p),
            (_, Some(home)) => Self::new(home.join(DEFAULT_DIR)),
            _ => Err(Error::Config("Cannot detect your home directory!".into())),
        }
    }

    /// Prefix path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID file recording the running init process.
    pub fn pid_file(&self) -> PathBuf {
        self.path.join(PID_FILE)
    }

    /// Sibling work directory: the prefix with trailing slashes trimmed and
    /// `.workdir` appended.
    pub fn workdir(&self) -> PathBuf {
        let bytes = self.path.as_os_str().as_bytes();
        let end = bytes.iter().rposition(|&b| b != b'/').map_or(0, |i| i + 1);
        let mut out = bytes[..end].to_vec();
        out.extend_from_slice(b".workdir");
        PathBuf::from(OsString::from_vec(out))
    }

    /// Inspects what exists at the prefix path.
    pub fn state(&self) -> Result<PrefixState> {
        match fs::metadata(&self.path) {
            Ok(m) if m.is_dir() => Ok(PrefixState::Directory),
            Ok(_) => Ok(PrefixState::NotADirectory),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PrefixState::Absent),
            Err(e) => Err(Error::Config(format!(
                "Cannot access {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Creates the prefix if missing. Returns `true` when it was created.
    ///
    /// An existing non-directory at the prefix path is a configuration error.
    pub fn ensure_bootstrapped(&self, who: Identity) -> Result<bool> {
        match self.state()? {
            PrefixState::Directory => Ok(false),
            PrefixState::NotADirectory => Err(Error::Config(format!(
                "{} is a file. Remove the file.",
                self.path.display()
            ))),
            PrefixState::Absent => {
                self.bootstrap(who)?;
                Ok(true)
            }
        }
    }

    /// Creates the directory layout and identity files as `who`.
    pub fn bootstrap(&self, who: Identity) -> Result<()> {
        info!(prefix = %self.path.display(), "bootstrapping prefix");
        let account = User::from_uid(Uid::from_raw(who.uid))
            .map_err(|e| Error::kernel("Cannot look up the current user", e))?
            .ok_or_else(|| {
                Error::Config("Failed to find the system passwd entry for the current user".into())
            })?;
        let entry = Account {
            name: &account.name,
            uid: account.uid.as_raw(),
            gid: account.gid.as_raw(),
        };

        let _as_user = AssumedIdentity::assume(who)?;
        create_dir(&self.path)?;
        for dir in LAYOUT {
            create_dir(&self.path.join(dir))?;
        }
        let etc = self.path.join("private/etc");
        for (name, body) in [
            ("passwd", passwd_db(&entry)),
            ("master.passwd", master_passwd_db(&entry)),
            ("group", group_db(&entry)),
        ] {
            fs::write(etc.join(name), body).map_err(|e| {
                Error::Config(format!(
                    "Failed to write /private/etc/{name} within the prefix: {e}"
                ))
            })?;
        }
        debug!(user = entry.name, "identity files written");
        Ok(())
    }

    /// Fails unless `who` owns the prefix. The superuser is exempt.
    pub fn check_ownership(&self, who: Identity) -> Result<()> {
        let not_owner = || Error::Config("You do not own the prefix directory.".into());
        match fs::metadata(&self.path) {
            Ok(m) if !who.is_superuser() && m.uid() != who.uid => Err(not_owner()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(not_owner()),
            _ => Ok(()),
        }
    }

    /// Creates the sibling work directory if missing.
    pub fn ensure_workdir(&self) -> Result<()> {
        create_dir(&self.workdir())
    }
}

/// Creates one directory with mode 0755, accepting an existing directory.
fn create_dir(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(m) if m.is_dir() => Ok(()),
        Ok(_) => Err(Error::Config(format!(
            "{} already exists and is a file. Remove the file.",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => DirBuilder::new()
            .mode(0o755)
            .create(path)
            .map_err(|e| Error::Config(format!("Cannot create {}: {e}", path.display()))),
        Err(e) => Err(Error::Config(format!(
            "Cannot access {}: {e}",
            path.display()
        ))),
    }
}

/// The invoking user's account as recorded in the prefix.
#[derive(Debug)]
struct Account<'a> {
    /// Login name.
    name: &'a str,
    /// User id.
    uid: u32,
    /// Primary group id.
    gid: u32,
}

/// `private/etc/passwd` contents.
fn passwd_db(a: &Account<'_>) -> String {
    let mut s = String::from("root:*:0:0:System Administrator:/var/root:/bin/sh\n");
    let _ = writeln!(
        s,
        "{0}:*:{1}:{2}:nsbox User:/Users/{0}:/bin/bash",
        a.name, a.uid, a.gid
    );
    s
}

/// `private/etc/master.passwd` contents: passwd plus class, change and expire.
fn master_passwd_db(a: &Account<'_>) -> String {
    let mut s = String::from("root:*:0:0::0:0:System Administrator:/var/root:/bin/sh\n");
    let _ = writeln!(
        s,
        "{0}:*:{1}:{2}::0:0:nsbox User:/Users/{0}:/bin/bash",
        a.name, a.uid, a.gid
    );
    s
}

/// `private/etc/group` contents.
fn group_db(a: &Account<'_>) -> String {
    format!("wheel:*:0:root,{0}\n{0}:*:{1}:{0}\n", a.name, a.gid)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: Account<'static> = Account {
        name: "alice",
        uid: 1000,
        gid: 100,
    };

    #[test]
    fn identity_file_formats() {
        assert_eq!(
            passwd_db(&ALICE),
            "root:*:0:0:System Administrator:/var/root:/bin/sh\n\
             alice:*:1000:100:nsbox User:/Users/alice:/bin/bash\n"
        );
        assert_eq!(
            master_passwd_db(&ALICE),
            "root:*:0:0::0:0:System Administrator:/var/root:/bin/sh\n\
             alice:*:1000:100::0:0:nsbox User:/Users/alice:/bin/bash\n"
        );
        assert_eq!(group_db(&ALICE), "wheel:*:0:root,alice\nalice:*:100:alice\n");
    }

    #[test]
    fn override_wins_over_home() {
        let p = Prefix::resolve_from(Some("/srv/box".into()), Some("/home/a".into())).unwrap();
        assert_eq!(p.path(), Path::new("/srv/box"));
    }

    #[test]
    fn default_lives_under_home() {
        let p = Prefix::resolve_from(None, Some("/home/a".into())).unwrap();
        assert_eq!(p.path(), Path::new("/home/a/.nsbox"));
        assert_eq!(p.pid_file(), Path::new("/home/a/.nsbox/.init.pid"));
    }

    #[test]
    fn no_home_and_no_override_fails() {
        assert!(matches!(
            Prefix::resolve_from(None, None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn length_bound() {
        let ok = format!("/{}", "a".repeat(MAX_PREFIX_LEN - 1));
        assert!(Prefix::new(ok).is_ok());
        let long = format!("/{}", "a".repeat(MAX_PREFIX_LEN));
        assert!(matches!(Prefix::new(long), Err(Error::Config(_))));
    }

    #[test]
    fn workdir_trims_trailing_slashes() {
        let p = Prefix::new("/home/a/.nsbox///").unwrap();
        assert_eq!(p.workdir(), Path::new("/home/a/.nsbox.workdir"));
        let p = Prefix::new("/home/a/.nsbox").unwrap();
        assert_eq!(p.workdir(), Path::new("/home/a/.nsbox.workdir"));
    }
}
