#![no_main]

use std::fs;

use cloudsync_lock::read_lock_info;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join("lockfile.json");
    if fs::write(&path, data).is_ok() {
        let _ = read_lock_info(&path);
    }
});
