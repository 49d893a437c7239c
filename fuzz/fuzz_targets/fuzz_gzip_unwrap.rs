#![no_main]
use libfuzzer_sys::fuzz_target;
use microfreeze::GzipUnwrap;

fuzz_target!(|data: &[u8]| {
    let mut gz = match GzipUnwrap::new(data) {
        Ok(gz) => gz,
        Err(_) => return,
    };
    let mut buf = [0u8; 512];
    // Cap output so highly compressible inputs stay quick
    let mut total = 0usize;
    while total < 16 * 1024 * 1024 {
        match gz.pull(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => total += n,
        }
    }
});
