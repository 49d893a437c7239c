#![no_main]
use libfuzzer_sys::fuzz_target;
use microfreeze::ArchiveReader;

// Arbitrary bytes must end in Ok(None) or an error, never a panic or a hang
fuzz_target!(|data: &[u8]| {
    let mut reader = ArchiveReader::from_bytes(data);
    let mut buf = [0u8; 64];
    let mut sink = std::io::sink();
    loop {
        match reader.next_entry() {
            Ok(Some(entry)) => {
                let _ = entry.destination();
                // Read every other entry so skipping is exercised too
                if reader.entries_read() % 2 == 0
                    && reader.entry_reader().copy_to(&mut sink, &mut buf).is_err()
                {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
});
