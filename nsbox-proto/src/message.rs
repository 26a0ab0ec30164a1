//! Spawn daemon command types.

use std::ffi::{CStr, CString};
use std::io;

/// Discriminant carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u32)]
pub enum Kind {
    /// Add one `KEY=VALUE` pair to the child environment.
    SetEnv = 1,
    /// Set the child working directory.
    ChDir = 2,
    /// Set the child uid and gid.
    SetIds = 3,
    /// Append one argument to the child argv.
    AddArg = 4,
    /// Replace the default shell with an explicit binary.
    SetExec = 5,
    /// Spawn the child; carries three descriptors out of band.
    Go = 6,
    /// Deliver a signal to the spawned child.
    Signal = 7,
}

impl TryFrom<u32> for Kind {
    type Error = io::Error;

    fn try_from(raw: u32) -> io::Result<Self> {
        Ok(match raw {
            1 => Self::SetEnv,
            2 => Self::ChDir,
            3 => Self::SetIds,
            4 => Self::AddArg,
            5 => Self::SetExec,
            6 => Self::Go,
            7 => Self::Signal,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown command kind {other}"),
                ));
            }
        })
    }
}

/// A single command sent to the spawn daemon.
///
/// Environment and argument commands accumulate state on the daemon side;
/// [`Command::Go`] is terminal and triggers the spawn. String payloads are
/// sent NUL-terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Command {
    /// `KEY=VALUE` environment entry.
    SetEnv(CString),
    /// Absolute working directory inside the sandbox.
    ChDir(CString),
    /// Identity the child runs as.
    SetIds {
        /// Target user id.
        uid: u32,
        /// Target group id.
        gid: u32,
    },
    /// One argv element.
    AddArg(CString),
    /// Binary to execute instead of the login shell.
    SetExec(CString),
    /// Launch. The descriptors travel as ancillary data, not payload.
    Go,
    /// Signal number to deliver.
    Signal(i32),
}

impl Command {
    /// Builds a [`Command::SetEnv`] from a key and value.
    pub fn set_env(key: &str, value: &str) -> io::Result<Self> {
        cstring(format!("{key}={value}")).map(Self::SetEnv)
    }

    /// Builds a [`Command::ChDir`].
    pub fn chdir(path: impl Into<Vec<u8>>) -> io::Result<Self> {
        cstring(path).map(Self::ChDir)
    }

    /// Builds a [`Command::AddArg`].
    pub fn arg(arg: impl Into<Vec<u8>>) -> io::Result<Self> {
        cstring(arg).map(Self::AddArg)
    }

    /// Builds a [`Command::SetExec`].
    pub fn exec(path: impl Into<Vec<u8>>) -> io::Result<Self> {
        cstring(path).map(Self::SetExec)
    }

    /// Header discriminant for this command.
    pub const fn kind(&self) -> Kind {
        match self {
            Self::SetEnv(_) => Kind::SetEnv,
            Self::ChDir(_) => Kind::ChDir,
            Self::SetIds { .. } => Kind::SetIds,
            Self::AddArg(_) => Kind::AddArg,
            Self::SetExec(_) => Kind::SetExec,
            Self::Go => Kind::Go,
            Self::Signal(_) => Kind::Signal,
        }
    }

    /// Exact payload size in bytes, computed without serializing.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::SetEnv(s) | Self::ChDir(s) | Self::AddArg(s) | Self::SetExec(s) => {
                s.as_bytes_with_nul().len()
            }
            Self::SetIds { .. } => 2 * size_of::<u32>(),
            Self::Go => 0,
            Self::Signal(_) => size_of::<i32>(),
        }
    }

    /// Appends the payload bytes to `buf`.
    pub(crate) fn write_payload(&self, buf: &mut Vec<u8>) {
        match self {
            Self::SetEnv(s) | Self::ChDir(s) | Self::AddArg(s) | Self::SetExec(s) => {
                buf.extend_from_slice(s.as_bytes_with_nul());
            }
            Self::SetIds { uid, gid } => {
                buf.extend_from_slice(&uid.to_ne_bytes());
                buf.extend_from_slice(&gid.to_ne_bytes());
            }
            Self::Go => {}
            Self::Signal(sig) => buf.extend_from_slice(&sig.to_ne_bytes()),
        }
    }

    /// Parses a payload of the given kind.
    pub(crate) fn from_payload(kind: Kind, payload: &[u8]) -> io::Result<Self> {
        match kind {
            Kind::SetEnv => c_payload(payload).map(Self::SetEnv),
            Kind::ChDir => c_payload(payload).map(Self::ChDir),
            Kind::AddArg => c_payload(payload).map(Self::AddArg),
            Kind::SetExec => c_payload(payload).map(Self::SetExec),
            Kind::SetIds => {
                let [uid, gid] = fixed::<8>(payload).map(|b| {
                    let (u, g) = b.split_at(4);
                    [ne_u32(u), ne_u32(g)]
                })?;
                Ok(Self::SetIds { uid, gid })
            }
            Kind::Go => {
                fixed::<0>(payload)?;
                Ok(Self::Go)
            }
            Kind::Signal => fixed::<4>(payload).map(|b| Self::Signal(i32::from_ne_bytes(b))),
        }
    }
}

/// Converts bytes into a `CString`, reporting interior NULs as `InvalidInput`.
fn cstring(bytes: impl Into<Vec<u8>>) -> io::Result<CString> {
    CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Parses a NUL-terminated string payload.
fn c_payload(payload: &[u8]) -> io::Result<CString> {
    CStr::from_bytes_with_nul(payload)
        .map(CStr::to_owned)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Requires a payload of exactly `N` bytes.
fn fixed<const N: usize>(payload: &[u8]) -> io::Result<[u8; N]> {
    payload.try_into().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {N}-byte payload, got {}", payload.len()),
        )
    })
}

/// Reads a native-endian `u32` from a 4-byte slice.
fn ne_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_ne_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_values_are_stable() {
        assert_eq!(Kind::SetEnv as u32, 1);
        assert_eq!(Kind::Go as u32, 6);
        assert_eq!(Kind::Signal as u32, 7);
        assert_eq!(Kind::try_from(3).unwrap(), Kind::SetIds);
        assert!(Kind::try_from(0).is_err());
        assert!(Kind::try_from(8).is_err());
    }

    #[test]
    fn string_payloads_include_nul() {
        let cmd = Command::set_env("TMPDIR", "/private/tmp").unwrap();
        assert_eq!(cmd.payload_len(), "TMPDIR=/private/tmp".len() + 1);
        assert_eq!(Command::Go.payload_len(), 0);
        assert_eq!(Command::Signal(2).payload_len(), 4);
        assert_eq!(Command::SetIds { uid: 1, gid: 2 }.payload_len(), 8);
    }

    #[test]
    fn interior_nul_is_rejected() {
        let err = Command::arg("a\0b").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn unterminated_string_payload_is_rejected() {
        let err = Command::from_payload(Kind::AddArg, b"abc").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn fixed_payload_size_is_enforced() {
        assert!(Command::from_payload(Kind::Signal, &[0; 3]).is_err());
        assert!(Command::from_payload(Kind::Go, &[0; 1]).is_err());
    }
}
