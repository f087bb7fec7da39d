#![no_main]

use dnx_vm::BinaryImage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Skip very large inputs to avoid timeouts
    if data.len() > 1_000_000 {
        return;
    }

    // Attempt to load - may fail with a load error, but must never panic
    match BinaryImage::from_bytes(data) {
        Ok(image) => {
            // Property: a loaded image round-trips through the writer
            let bytes = image.to_bytes(false).expect("loaded image must serialize");
            let reparsed = BinaryImage::from_bytes(&bytes).expect("writer output must load");
            assert_eq!(image.string_table, reparsed.string_table);
            assert_eq!(image.instructions, reparsed.instructions);
            assert_eq!(image.scenes, reparsed.scenes);
            assert_eq!(image.functions, reparsed.functions);
        }
        Err(_load_error) => {
            // Load errors are expected for malformed input
        }
    }
});
