//! Single-quote escaping for the composite `sh -c` argument.
//!
//! Each argument is wrapped in single quotes; an embedded `'` becomes
//! `'\''` (close, escaped quote, reopen). Sizes are computed first so the
//! output buffer is allocated exactly once.

/// Replacement for one embedded single quote.
const QUOTE_ESCAPE: &[u8] = b"'\\''";

/// Length of `arg` once escaped, without the surrounding quotes.
pub(crate) fn escaped_len(arg: &[u8]) -> usize {
    let quotes = arg.iter().filter(|&&b| b == b'\'').count();
    arg.len() + quotes * (QUOTE_ESCAPE.len() - 1)
}

/// Appends `arg` escaped, without the surrounding quotes.
pub(crate) fn escape_into(out: &mut Vec<u8>, arg: &[u8]) {
    for &b in arg {
        if b == b'\'' {
            out.extend_from_slice(QUOTE_ESCAPE);
        } else {
            out.push(b);
        }
    }
}

/// Joins `args` into one shell command line: each quoted, space-separated.
pub fn shell_command<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let capacity = args
        .iter()
        .map(|a| escaped_len(a.as_ref()) + 2)
        .sum::<usize>()
        + args.len().saturating_sub(1);

    let mut out = Vec::with_capacity(capacity);
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        out.push(b'\'');
        escape_into(&mut out, arg.as_ref());
        out.push(b'\'');
    }
    debug_assert_eq!(out.len(), capacity);
    out
}
