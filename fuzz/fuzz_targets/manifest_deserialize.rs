#![no_main]

use cloudsync::types::Manifest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(manifest) = serde_json::from_str::<Manifest>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&manifest) {
            if let Ok(parsed) = serde_json::from_str::<Manifest>(&roundtripped) {
                assert_eq!(manifest.source_path, parsed.source_path);
                assert_eq!(manifest.bundles.len(), parsed.bundles.len());
                assert_eq!(manifest.incremental_count, parsed.incremental_count);
            }
        }
    }
});
