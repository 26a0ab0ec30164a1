//! CLI for the nsbox namespace sandbox launcher.
//!
//! Installed setuid-root. Every invocation makes sure the prefix's init is
//! running, joins its mount namespace, and relays a shell or a command into
//! the sandbox, exiting with the remote status.

// The launcher talks to the user on stderr and exits with remote statuses.
#![allow(clippy::print_stderr, clippy::print_stdout)]

use std::ffi::OsString;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "nsbox",
    version,
    about = "Run shells and commands inside a per-user namespace sandbox",
    arg_required_else_help = true
)]
struct Cli {
    /// Log lifecycle details to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stop the sandbox for this prefix.
    Shutdown,

    /// Open a shell in the sandbox, or run `sh -c` with the given words.
    Shell {
        /// Words joined into one shell command line.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },

    /// Execute a binary in the sandbox directly.
    Exec {
        /// Binary followed by its arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<OsString>,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },

    /// Any other word is a program or script to run through the shell.
    #[command(external_subcommand)]
    External(Vec<OsString>),
}

/// Initialises `tracing` on stderr. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.kind() == ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
        Err(e) => e.exit(),
    };

    init_logging(cli.verbose);
    match run(cli.command) {
        Ok(status) => ExitCode::from(status_byte(status)),
        Err(e) => {
            eprintln!("nsbox: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Low eight bits of a remote status, as the shell would report them.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn status_byte(status: i32) -> u8 {
    (status & 0xff) as u8
}

#[cfg(target_os = "linux")]
fn run(command: Command) -> anyhow::Result<i32> {
    use anyhow::bail;
    use nsbox::{InitManager, Shutdown, Target};

    match command {
        Command::Completion { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "nsbox", &mut std::io::stdout());
            Ok(0)
        }
        Command::Shutdown => {
            let (ctx, _) = sandbox::prepare()?;
            match InitManager::new(&ctx).shutdown()? {
                Shutdown::NotRunning => {
                    eprintln!("container is not running");
                    Ok(1)
                }
                Shutdown::Stopped { .. } => Ok(0),
            }
        }
        Command::Shell { args } => {
            let ctx = sandbox::enter()?;
            Ok(nsbox::launch(&ctx, &Target::shell(args))?)
        }
        Command::Exec { argv } => {
            let ctx = sandbox::enter()?;
            let mut argv = argv.into_iter();
            let Some(binary) = argv.next() else {
                bail!("'exec' subcommand requires a binary to execute.");
            };
            let target = Target::exec(&ctx, &binary, argv.collect())?;
            Ok(nsbox::launch(&ctx, &target)?)
        }
        Command::External(argv) => {
            let ctx = sandbox::enter()?;
            let mut argv = argv.into_iter();
            let Some(program) = argv.next() else {
                bail!("no program given");
            };
            let target = Target::script(&ctx, &program, argv.collect())?;
            Ok(nsbox::launch(&ctx, &target)?)
        }
    }
}

/// Startup steps shared by every subcommand that touches the sandbox.
#[cfg(target_os = "linux")]
mod sandbox {
    use anyhow::{Result, bail};
    use nsbox::{Config, Identity, InitManager, LaunchContext, Namespace, Prefix, PrefixState};

    /// Elevates, resolves and (if missing) bootstraps the prefix, and checks
    /// ownership. Returns the context and whether the prefix is new.
    pub(crate) fn prepare() -> Result<(LaunchContext, bool)> {
        let original = Identity::elevate()?;

        let prefix = Prefix::resolve()?;
        let fresh = match prefix.state()? {
            PrefixState::Absent => {
                eprintln!("Setting up a new prefix at {}", prefix.path().display());
                prefix.bootstrap(original)?;
                true
            }
            PrefixState::Directory => false,
            PrefixState::NotADirectory => {
                bail!("{} is a file. Remove the file.", prefix.path().display())
            }
        };
        prefix.check_ownership(original)?;

        let cwd = std::env::current_dir().unwrap_or_else(|_| "/".into());
        Ok((LaunchContext::new(Config::default(), original, prefix, cwd), fresh))
    }

    /// [`prepare`], then starts or reuses init, joins its mount namespace,
    /// and drops the effective uid back to the invoking user.
    pub(crate) fn enter() -> Result<LaunchContext> {
        let (ctx, fresh) = prepare()?;
        let record = InitManager::new(&ctx).ensure_running(fresh)?;
        nsbox::join(&ctx.config.procfs, record.pid(), Namespace::Mount)?;
        ctx.original.drop_effective_uid()?;
        Ok(ctx)
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_command: Command) -> anyhow::Result<i32> {
    anyhow::bail!("nsbox only runs on Linux")
}
