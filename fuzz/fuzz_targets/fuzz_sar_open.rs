#![no_main]
use libfuzzer_sys::fuzz_target;
use nestar_rs::core::driver::InputService;
use nestar_rs::core::socket::InputTarget;
use nestar_rs::{ArchiveDriver, KeyProvider, NoKeys, SarDriver, StaticKeys};
use std::io::{Cursor, Read};

// Arbitrary container bytes must decode or fail cleanly, never panic
fuzz_target!(|data: &[u8]| {
    let keys = StaticKeys::with_default(b"fuzz".to_vec());
    for (driver, keys) in [
        (SarDriver::new(), &NoKeys as &dyn KeyProvider),
        (SarDriver::new().encrypted(), &keys as &dyn KeyProvider),
    ] {
        let input = match driver.new_input("fuzz.sar", Box::new(Cursor::new(data.to_vec())), keys) {
            Ok(input) => input,
            Err(_) => continue,
        };
        for entry in input.entries() {
            if !entry.is_file() {
                continue;
            }
            if let Ok(target) = input.input(entry.name()) {
                if let Ok(mut stream) = target.open(None) {
                    let mut out = Vec::new();
                    let _ = stream.read_to_end(&mut out);
                }
            }
        }
    }
});
