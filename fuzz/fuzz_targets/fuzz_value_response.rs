#![no_main]

use libfuzzer_sys::fuzz_target;
use protocol_memcache::{Parsed, ValueParser};

fuzz_target!(|data: &[u8]| {
    // Split the input in two to exercise carry-over between reads
    let split = data.first().map(|b| *b as usize % (data.len() + 1)).unwrap_or(0);
    let mut parser = ValueParser::new();
    let mut buffer = data[..split].to_vec();
    let mut tail = Some(&data[split..]);

    loop {
        let mut offset = 0;
        loop {
            match parser.parse(&buffer[offset..]) {
                Ok((parsed, consumed)) => {
                    assert!(consumed <= buffer.len() - offset);
                    offset += consumed;
                    match parsed {
                        Parsed::Value(value) => assert!(!value.key.is_empty()),
                        Parsed::End | Parsed::Error(_) => return,
                        Parsed::Incomplete => break,
                    }
                }
                // Parse errors are expected for malformed input
                Err(_) => return,
            }
        }
        buffer.drain(..offset);
        match tail.take() {
            Some(rest) => buffer.extend_from_slice(rest),
            None => return,
        }
    }
});
