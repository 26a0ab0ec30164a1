//! Prefix resolution from the process environment.
//!
//! Mutates `HOME` and `DPREFIX`, so it lives in its own test binary.

#![cfg(target_os = "linux")]

use std::path::Path;

use nsbox::{Error, PREFIX_ENV, Prefix};

#[test]
fn environment_decides_the_prefix() {
    // SAFETY: the only test in this binary; no other thread reads the
    // environment.
    unsafe {
        std::env::remove_var("HOME");
        std::env::remove_var(PREFIX_ENV);
    }
    let err = Prefix::resolve().unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(err.to_string(), "Cannot detect your home directory!");

    // SAFETY: as above.
    unsafe { std::env::set_var("HOME", "/home/someone") };
    assert_eq!(Prefix::resolve().unwrap().path(), Path::new("/home/someone/.nsbox"));

    // SAFETY: as above.
    unsafe { std::env::set_var(PREFIX_ENV, "/srv/box") };
    assert_eq!(Prefix::resolve().unwrap().path(), Path::new("/srv/box"));
    assert!(std::env::var_os(PREFIX_ENV).is_none());
}
