#![no_main]

use std::fs;

use cloudsync::manifest::ManifestStore;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let store = ManifestStore::new(td.path());
    let source_dir = store.source_dir("fuzz-source");
    if fs::create_dir_all(&source_dir).is_err() {
        return;
    }
    if fs::write(source_dir.join("manifest.json"), data).is_ok() {
        let _ = store.load("fuzz-source");
    }
});
