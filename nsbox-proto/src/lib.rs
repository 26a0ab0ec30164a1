//! Wire protocol for the nsbox spawn daemon.
//!
//! The launcher drives the daemon with a sequence of framed commands over a
//! Unix stream socket. Each frame is an 8-byte header (`kind`, `len`, both
//! native-endian `u32`) followed by `len` payload bytes. The final
//! [`Command::Go`] frame carries the child's stdio descriptors as
//! `SCM_RIGHTS` ancillary data; after it the daemon answers with a single
//! native-endian `i32` exit status.

mod codec;
#[cfg(unix)]
mod fdpass;
mod message;

pub use codec::{HEADER_LEN, Header, MAX_PAYLOAD, decode, encode, read_exit_status, send};
#[cfg(unix)]
pub use fdpass::{recv_with_fds, send_go, send_with_fds};
pub use message::{Command, Kind};
