//! Launcher configuration.
//!
//! The launcher is installed setuid-root, so nothing here is read from a
//! user-controlled file: defaults are fixed at build time and the builder
//! methods exist for embedding and tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the prefix location.
pub const PREFIX_ENV: &str = "DPREFIX";

/// Longest accepted prefix path, in bytes.
pub const MAX_PREFIX_LEN: usize = 255;

/// Installation root of the init daemon, fixed at build time.
const INSTALL_PREFIX: &str = match option_env!("NSBOX_INSTALL_PREFIX") {
    Some(p) => p,
    None => "/usr/local",
};

/// Process name the init daemon runs under (`/proc/<pid>/comm`).
pub const INIT_NAME: &str = "nsbox-init";

/// Immutable launcher settings.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Init daemon executable.
    pub init_program: PathBuf,
    /// Expected `comm` of a live init process; also its argv\[0\].
    pub init_name: String,
    /// Spawn daemon socket, relative to the prefix.
    pub socket: PathBuf,
    /// Where the host filesystem appears inside the sandbox.
    pub system_root: PathBuf,
    /// Mount point of procfs.
    pub procfs: PathBuf,
    /// Unshare UTS and IPC namespaces before starting init.
    pub unshare: bool,
    /// How many times to look for the daemon socket after starting init.
    pub ready_attempts: u32,
    /// Delay between socket checks.
    pub ready_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            init_program: Path::new(INSTALL_PREFIX).join("bin").join(INIT_NAME),
            init_name: INIT_NAME.to_owned(),
            socket: PathBuf::from("var/run/spawnd.sock"),
            system_root: PathBuf::from("/Volumes/SystemRoot"),
            procfs: PathBuf::from("/proc"),
            unshare: true,
            ready_attempts: 15,
            ready_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Sets the init daemon executable and the process name it runs under.
    #[must_use]
    pub fn with_init(mut self, program: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        self.init_program = program.into();
        self.init_name = name.into();
        self
    }

    /// Sets the procfs mount point.
    #[must_use]
    pub fn with_procfs(mut self, procfs: impl Into<PathBuf>) -> Self {
        self.procfs = procfs.into();
        self
    }

    /// Enables or disables UTS/IPC unsharing before init starts.
    #[must_use]
    pub const fn with_unshare(mut self, unshare: bool) -> Self {
        self.unshare = unshare;
        self
    }

    /// Sets the daemon socket readiness wait.
    #[must_use]
    pub const fn with_ready_wait(mut self, attempts: u32, interval: Duration) -> Self {
        self.ready_attempts = attempts;
        self.ready_interval = interval;
        self
    }
}
