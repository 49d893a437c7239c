#![no_main]
use libfuzzer_sys::fuzz_target;
use microfreeze::{CompressionMethod, UnitFile};

fuzz_target!(|data: &[u8]| {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => return,
    };
    let file: UnitFile = match toml::from_str(text) {
        Ok(file) => file,
        Err(_) => return,
    };
    if let Ok(unit) = file.decode("unit_0.toml") {
        let mut sink = std::io::sink();
        let _ = unit.write_content(CompressionMethod::Zlib, &mut sink);
        let _ = unit.write_content(CompressionMethod::None, &mut sink);
    }
});
