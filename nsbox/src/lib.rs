//! Launcher for a per-user Linux namespace sandbox.
//!
//! `nsbox` keeps exactly one sandbox init process alive per prefix
//! directory, joins its mount namespace, and asks the spawn daemon inside
//! the sandbox to run a shell or a binary, proxying terminal I/O and
//! signals until the remote process exits.
//!
//! # Flow
//!
//! ```no_run
//! use nsbox::{Config, Identity, InitManager, LaunchContext, Namespace, Prefix, Target};
//!
//! # fn main() -> nsbox::Result<()> {
//! let original = Identity::elevate()?;
//! let prefix = Prefix::resolve()?;
//! let fresh = prefix.ensure_bootstrapped(original)?;
//! prefix.check_ownership(original)?;
//!
//! let config = Config::default();
//! let ctx = LaunchContext::new(config, original, prefix, std::env::current_dir()?);
//! let init = InitManager::new(&ctx).ensure_running(fresh)?;
//! nsbox::join(&ctx.config.procfs, init.pid(), Namespace::Mount)?;
//! original.drop_effective_uid()?;
//!
//! let status = nsbox::launch(&ctx, &Target::shell(vec![]))?;
//! std::process::exit(status);
//! # }
//! ```

#![cfg(target_os = "linux")]

mod barrier;
mod config;
mod context;
mod error;
mod init;
mod namespace;
mod prefix;
mod procfs;
mod proxy;
mod quote;
mod signals;
mod spawn;
mod terminal;

pub use config::{Config, INIT_NAME, MAX_PREFIX_LEN, PREFIX_ENV};
pub use context::{Identity, LaunchContext};
pub use error::{Error, Result};
pub use init::{InitManager, InitRecord, Shutdown};
pub use namespace::{Namespace, join};
pub use prefix::{Prefix, PrefixState};
pub use proxy::ProxySession;
pub use quote::shell_command;
pub use spawn::{SpawnClient, Target, launch, login_name, plan};
pub use terminal::{Stdio, Terminal, prepare_stdio, prepare_stdio_from};
