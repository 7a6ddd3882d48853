// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target for THL record decoding

#![no_main]

use libfuzzer_sys::fuzz_target;
use thl_log::codec::{decode_rotate, EventRecord};
use thl_log::record::CrcType;
use thl_log::{LogRecord, SerializerKind};

fuzz_target!(|data: &[u8]| {
    // [crc_type][crc u32 BE][record data...]
    if data.len() < 5 {
        return;
    }
    let Some(crc_type) = CrcType::from_byte(data[0] % 2) else {
        return;
    };
    let crc = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let record = LogRecord::new(0, data[5..].to_vec(), crc_type, crc);

    let _ = record.check_crc();
    let _ = decode_rotate(&record, "fuzz", false);
    for kind in [SerializerKind::Cbor, SerializerKind::Json] {
        let serializer = kind.build();
        if let Ok(decoded) = EventRecord::decode(&record, "fuzz", false) {
            let _ = decoded.into_event(serializer.as_ref());
        }
    }
});
