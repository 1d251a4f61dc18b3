#![no_main]

use libfuzzer_sys::fuzz_target;
use protocol_memcache::{MetadumpLine, parse_metadump_line};

fuzz_target!(|data: &[u8]| {
    let mut pos = 0;
    loop {
        let (line, consumed) = parse_metadump_line(&data[pos..]);
        assert!(consumed <= data.len() - pos);
        pos += consumed;
        match line {
            MetadumpLine::Record(record) => {
                // empty keys are reported as unrecognized lines
                assert!(!record.key.is_empty());
            }
            MetadumpLine::End | MetadumpLine::Unrecognized => {}
            MetadumpLine::Incomplete => {
                assert_eq!(consumed, 0);
                break;
            }
        }
    }
});
