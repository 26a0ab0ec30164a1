//! Header-then-payload frame codec over any `Read`/`Write` stream.
//!
//! Each frame is: `[u32 kind][u32 len][len payload bytes]`, native-endian.

use std::io::{self, Read, Write};

use crate::message::{Command, Kind};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Maximum accepted payload (64 KiB).
pub const MAX_PAYLOAD: u32 = 64 * 1024;

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Header {
    /// Command discriminant.
    pub kind: Kind,
    /// Payload length in bytes.
    pub len: u32,
}

impl Header {
    /// Serializes the header.
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&(self.kind as u32).to_ne_bytes());
        out[4..].copy_from_slice(&self.len.to_ne_bytes());
        out
    }

    /// Parses and validates a header.
    pub fn from_bytes(raw: [u8; HEADER_LEN]) -> io::Result<Self> {
        let [k0, k1, k2, k3, l0, l1, l2, l3] = raw;
        let kind = Kind::try_from(u32::from_ne_bytes([k0, k1, k2, k3]))?;
        let len = u32::from_ne_bytes([l0, l1, l2, l3]);
        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload of {len} bytes exceeds 64 KiB limit"),
            ));
        }
        Ok(Self { kind, len })
    }
}

/// Encodes `cmd` into a single contiguous frame.
///
/// The payload size is measured first so the header can be written before
/// the payload and the buffer is allocated exactly once.
pub fn encode(cmd: &Command) -> io::Result<Vec<u8>> {
    let payload_len = cmd.payload_len();
    let len = u32::try_from(payload_len)
        .ok()
        .filter(|&n| n <= MAX_PAYLOAD)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {payload_len} bytes exceeds 64 KiB limit"),
            )
        })?;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload_len);
    buf.extend_from_slice(
        &Header {
            kind: cmd.kind(),
            len,
        }
        .to_bytes(),
    );
    cmd.write_payload(&mut buf);
    debug_assert_eq!(buf.len(), HEADER_LEN + payload_len);
    Ok(buf)
}

/// Writes `cmd` to `w` with a single `write` call.
///
/// A short write leaves the daemon mid-frame, so it is reported as
/// [`io::ErrorKind::WriteZero`] rather than retried.
pub fn send<W: Write + ?Sized>(w: &mut W, cmd: &Command) -> io::Result<()> {
    let frame = encode(cmd)?;
    let written = w.write(&frame)?;
    if written != frame.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {written} of {} bytes", frame.len()),
        ));
    }
    Ok(())
}

/// Reads one frame from `r` and decodes it.
pub fn decode<R: Read + ?Sized>(r: &mut R) -> io::Result<Command> {
    let mut raw = [0u8; HEADER_LEN];
    r.read_exact(&mut raw)?;
    let header = Header::from_bytes(raw)?;
    let mut payload = vec![0u8; header.len as usize];
    r.read_exact(&mut payload)?;
    Command::from_payload(header.kind, &payload)
}

/// Reads the daemon's 4-byte exit status.
///
/// Returns `None` when fewer than four bytes are available in one read.
pub fn read_exit_status<R: Read + ?Sized>(r: &mut R) -> io::Result<Option<i32>> {
    let mut raw = [0u8; 4];
    let n = r.read(&mut raw)?;
    Ok((n == raw.len()).then(|| i32::from_ne_bytes(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: &Command) -> Command {
        let frame = encode(cmd).unwrap();
        let header = Header::from_bytes(frame[..HEADER_LEN].try_into().unwrap()).unwrap();
        assert_eq!(header.kind, cmd.kind());
        assert_eq!(header.len as usize, cmd.payload_len());
        assert_eq!(frame.len(), HEADER_LEN + cmd.payload_len());

        let mut cursor = io::Cursor::new(&frame);
        let decoded = decode(&mut cursor).unwrap();
        assert_eq!(cursor.position() as usize, frame.len());
        decoded
    }

    #[test]
    fn roundtrip_every_kind() {
        let cases = [
            Command::set_env("PATH", "/usr/bin:/bin").unwrap(),
            Command::chdir("/Volumes/SystemRoot/home/me").unwrap(),
            Command::SetIds {
                uid: 1000,
                gid: 100,
            },
            Command::arg("-c").unwrap(),
            Command::exec("/Volumes/SystemRoot/usr/bin/true").unwrap(),
            Command::Go,
            Command::Signal(15),
        ];
        for cmd in &cases {
            assert_eq!(&roundtrip(cmd), cmd);
        }
    }

    #[test]
    fn empty_payload_still_sends_header() {
        let frame = encode(&Command::Go).unwrap();
        assert_eq!(frame.len(), HEADER_LEN);
        assert_eq!(&frame[4..], &0u32.to_ne_bytes());
    }

    #[test]
    fn sequence_decodes_in_order() {
        let mut wire = Vec::new();
        send(&mut wire, &Command::set_env("TMPDIR", "/private/tmp").unwrap()).unwrap();
        send(&mut wire, &Command::arg("x").unwrap()).unwrap();
        send(&mut wire, &Command::Signal(2)).unwrap();

        let mut cursor = io::Cursor::new(&wire);
        assert_eq!(decode(&mut cursor).unwrap().kind(), Kind::SetEnv);
        assert_eq!(decode(&mut cursor).unwrap().kind(), Kind::AddArg);
        assert_eq!(decode(&mut cursor).unwrap(), Command::Signal(2));
        let eof = decode(&mut cursor).unwrap_err();
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn rejects_oversized_payload_header() {
        let header = Header {
            kind: Kind::AddArg,
            len: MAX_PAYLOAD,
        }
        .to_bytes();
        let mut raw = header;
        raw[4..].copy_from_slice(&(MAX_PAYLOAD + 1).to_ne_bytes());
        assert!(Header::from_bytes(raw).is_err());
    }

    #[test]
    fn rejects_oversized_payload_on_encode() {
        let big = Command::arg(vec![b'a'; MAX_PAYLOAD as usize]).unwrap();
        assert_eq!(
            encode(&big).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    /// Writer that accepts at most a few bytes per call.
    struct Trickle(Vec<u8>);

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(3);
            self.0.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn short_write_is_an_error() {
        let mut w = Trickle(Vec::new());
        let err = send(&mut w, &Command::Go).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn exit_status_needs_four_bytes() {
        let full = 42i32.to_ne_bytes();
        assert_eq!(read_exit_status(&mut &full[..]).unwrap(), Some(42));
        assert_eq!(read_exit_status(&mut &full[..2]).unwrap(), None);
        assert_eq!(read_exit_status(&mut &b""[..]).unwrap(), None);
    }
}
