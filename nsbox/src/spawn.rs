//! Spawn protocol client: request a process from the daemon in the sandbox.
//!
//! Every spawn sends, in order: environment, the target (shell arguments or
//! an explicit binary with its argv), working directory, identity, and
//! finally `Go` with the three standard descriptors attached.

use std::ffi::{CStr, OsStr, OsString};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use nix::unistd::{User, geteuid};
use nsbox_proto::Command;
use tracing::debug;

use crate::context::LaunchContext;
use crate::error::{Error, Result};
use crate::proxy::ProxySession;
use crate::quote;
use crate::terminal::{self, Stdio};

/// `PATH` inside the sandbox.
const SANDBOX_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin:/usr/local/bin";

/// `TMPDIR` inside the sandbox.
const SANDBOX_TMPDIR: &str = "/private/tmp";

/// What to run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Target {
    /// The daemon's login shell, optionally running `args` via `-c`.
    Shell(Vec<OsString>),
    /// An explicit binary.
    Binary {
        /// Absolute path inside the sandbox.
        path: PathBuf,
        /// Full argv, including argv\[0\].
        argv: Vec<OsString>,
    },
}

impl Target {
    /// Interactive shell, or `sh -c` of the quoted `args` when non-empty.
    pub const fn shell(args: Vec<OsString>) -> Self {
        Self::Shell(args)
    }

    /// Runs `program` directly. Its sandbox path is also argv\[0\].
    pub fn exec(ctx: &LaunchContext, program: &OsStr, args: Vec<OsString>) -> Result<Self> {
        let path = resolve_program(ctx, program)?;
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(path.clone().into_os_string());
        argv.extend(args);
        Ok(Self::Binary { path, argv })
    }

    /// Runs `program` through the shell, so scripts work without `exec`.
    pub fn script(ctx: &LaunchContext, program: &OsStr, args: Vec<OsString>) -> Result<Self> {
        let path = resolve_program(ctx, program)?;
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(path.into_os_string());
        all.extend(args);
        Ok(Self::Shell(all))
    }
}

/// Canonicalizes a host path and maps it under the sandbox system root.
fn resolve_program(ctx: &LaunchContext, program: &OsStr) -> Result<PathBuf> {
    let host = std::fs::canonicalize(program).map_err(|_| {
        Error::Config(format!(
            "'{}' is not a supported command or a file.",
            program.to_string_lossy()
        ))
    })?;
    Ok(ctx.sandbox_path(&host))
}

/// The full command sequence for one spawn, excluding `Go`.
pub fn plan(ctx: &LaunchContext, target: &Target, login: &str) -> Result<Vec<Command>> {
    let mut cmds = vec![
        Command::set_env("PATH", SANDBOX_PATH)?,
        Command::set_env("TMPDIR", SANDBOX_TMPDIR)?,
        Command::set_env("HOME", &format!("/Users/{login}"))?,
    ];
    match target {
        Target::Shell(args) if args.is_empty() => {}
        Target::Shell(args) => {
            let bytes: Vec<&[u8]> = args.iter().map(|a| a.as_bytes()).collect();
            cmds.push(Command::arg("-c")?);
            cmds.push(Command::arg(quote::shell_command(&bytes))?);
        }
        Target::Binary { path, argv } => {
            cmds.push(Command::exec(path.as_os_str().as_bytes())?);
            for arg in argv {
                cmds.push(Command::arg(arg.as_bytes())?);
            }
        }
    }
    let cwd = ctx.sandbox_path(&ctx.cwd);
    cmds.push(Command::chdir(cwd.into_os_string().into_vec())?);
    cmds.push(Command::SetIds {
        uid: ctx.original.uid,
        gid: ctx.original.gid,
    });
    Ok(cmds)
}

/// Name of the effective user, from the passwd database or `getlogin`.
pub fn login_name() -> Result<String> {
    if let Ok(Some(user)) = User::from_uid(geteuid()) {
        return Ok(user.name);
    }
    getlogin().ok_or_else(|| Error::Config("Cannot determine your user name".into()))
}

/// `getlogin(3)`.
#[allow(unsafe_code)]
fn getlogin() -> Option<String> {
    // SAFETY: getlogin returns NULL or a pointer to a static NUL-terminated
    // buffer that stays valid until the next call on this thread.
    let ptr = unsafe { libc::getlogin() };
    if ptr.is_null() {
        return None;
    }
    // SAFETY: checked non-null above.
    let name = unsafe { CStr::from_ptr(ptr) };
    Some(name.to_string_lossy().into_owned())
}

/// A connection to the spawn daemon.
#[derive(Debug)]
pub struct SpawnClient {
    /// Stream socket to the daemon.
    stream: UnixStream,
}

impl SpawnClient {
    /// Connects to the daemon socket at `path`.
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| {
            Error::transport(
                format!(
                    "Error connecting to the spawn daemon in the container ({})",
                    path.display()
                ),
                e,
            )
        })?;
        debug!(socket = %path.display(), "connected to spawn daemon");
        Ok(Self { stream })
    }

    /// Sends one framed command.
    pub fn send(&mut self, cmd: &Command) -> Result<()> {
        nsbox_proto::send(&mut self.stream, cmd)
            .map_err(|e| Error::transport("Error sending command to the spawn daemon", e))
    }

    /// Sends `Go` with the child's stdin, stdout and stderr.
    ///
    /// The descriptors move to the daemon; the launcher's copies are closed.
    /// Returns the stream for the proxy loop.
    pub fn go(self, stdio: [OwnedFd; 3]) -> Result<UnixStream> {
        nsbox_proto::send_go(&self.stream, stdio)
            .map_err(|e| Error::transport("Error sending command to the spawn daemon", e))?;
        Ok(self.stream)
    }
}

/// Spawns `target` in the sandbox and proxies it until it exits.
///
/// Returns the remote exit status.
pub fn launch(ctx: &LaunchContext, target: &Target) -> Result<i32> {
    let commands = plan(ctx, target, &login_name()?)?;
    let mut client = SpawnClient::connect(&ctx.socket_path())?;
    for cmd in &commands {
        client.send(cmd)?;
    }
    debug!(count = commands.len(), "spawn request sent");

    let Stdio { fds, terminal } = terminal::prepare_stdio()?;
    let sock = client.go(fds)?;
    ProxySession::new(sock, terminal)?.run()
}
