// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Event and rotation record codecs
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// EventRepl data (all integers big-endian):
//   [1 byte:  type = 0x01]
//   [8 bytes: seqno (i64)]
//   [2 bytes: fragno (i16)]
//   [1 byte:  last_frag]
//   [8 bytes: epoch (i64)]
//   [u16 len + UTF-8: source_id]
//   [u16 len + UTF-8: event_id]
//   [u16 len + UTF-8: shard_id]
//   [8 bytes: source_tstamp (i64, epoch millis)]
//   [rest:    serialized event body]
//
// EventRotate data:
//   [1 byte:  type = 0x02]
//   [4 bytes: next_segment_index (u32)]

use crate::error::{ThlError, ThlResult};
use crate::event::{tstamp_from_millis, EventHeader, ThlEvent};
use crate::record::{LogRecord, RecordBuilder, RecordReader, RecordType};
use crate::serializer::EventSerializer;

/// Encode an event fragment into a sealed record.
pub fn encode_event(
    event: &ThlEvent,
    serializer: &dyn EventSerializer,
    checksum: bool,
) -> ThlResult<LogRecord> {
    let mut builder = RecordBuilder::new(RecordType::EventRepl);
    builder
        .put_i64(event.seqno)
        .put_i16(event.fragno)
        .put_u8(u8::from(event.last_frag))
        .put_i64(event.epoch);
    builder.put_str(&event.source_id)?;
    builder.put_str(&event.event_id)?;
    builder.put_str(&event.shard_id)?;
    builder.put_i64(event.source_tstamp.timestamp_millis());
    if let Some(body) = &event.event {
        builder.put_bytes(&serializer.serialize(body)?);
    }
    Ok(builder.seal(checksum))
}

/// A decoded EventRepl record: header fields plus the still-serialized body.
#[derive(Debug)]
pub struct EventRecord<'a> {
    pub header: EventHeader,
    pub body: &'a [u8],
}

impl<'a> EventRecord<'a> {
    /// Decode the header of an EventRepl record, verifying the CRC first when
    /// `check_crc` is set.
    pub fn decode(record: &'a LogRecord, file: &'a str, check_crc: bool) -> ThlResult<Self> {
        if record.record_type() != Some(RecordType::EventRepl) {
            return Err(ThlError::corruption(
                file,
                record.offset(),
                format!("expected event record, found type {:?}", record.type_byte()),
            ));
        }
        if check_crc {
            record.verify_crc(file)?;
        }

        let mut reader = RecordReader::new(record, file);
        let seqno = reader.get_i64()?;
        let fragno = reader.get_i16()?;
        let last_frag = reader.get_u8()? != 0;
        let epoch = reader.get_i64()?;
        let source_id = reader.get_str()?;
        let event_id = reader.get_str()?;
        let shard_id = reader.get_str()?;
        let source_tstamp = tstamp_from_millis(reader.get_i64()?);

        Ok(Self {
            header: EventHeader {
                seqno,
                fragno,
                last_frag,
                epoch,
                source_id,
                event_id,
                shard_id,
                source_tstamp,
            },
            body: reader.remaining(),
        })
    }

    /// Deserialize the body and produce the full event.
    pub fn into_event(self, serializer: &dyn EventSerializer) -> ThlResult<ThlEvent> {
        let event = if self.body.is_empty() {
            None
        } else {
            Some(serializer.deserialize(self.body)?)
        };
        Ok(ThlEvent::from_header(self.header, event))
    }

    /// Produce an event with header fields only.
    pub fn into_header_event(self) -> ThlEvent {
        ThlEvent::from_header(self.header, None)
    }
}

/// Encode a rotation marker naming the next segment.
pub fn encode_rotate(next_index: u32, checksum: bool) -> LogRecord {
    let mut builder = RecordBuilder::new(RecordType::EventRotate);
    builder.put_u32(next_index);
    builder.seal(checksum)
}

/// Decode a rotation marker, returning the next segment index.
pub fn decode_rotate(record: &LogRecord, file: &str, check_crc: bool) -> ThlResult<u32> {
    if record.record_type() != Some(RecordType::EventRotate) {
        return Err(ThlError::corruption(
            file,
            record.offset(),
            format!("expected rotate record, found type {:?}", record.type_byte()),
        ));
    }
    if check_crc {
        record.verify_crc(file)?;
    }
    RecordReader::new(record, file).get_u32()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ReplEvent;
    use crate::record::CrcType;
    use crate::serializer::SerializerKind;

    const FILE: &str = "thl.data.0000000001";

    fn sample_event() -> ThlEvent {
        ThlEvent::new(41, "mysql-bin.000003:0000000000001234", b"row".to_vec())
            .with_fragment(2, true)
            .with_epoch(7)
            .with_source_id("db1")
            .with_shard_id("inventory")
    }

    #[test]
    fn test_event_record_round_trip() {
        let serializer = SerializerKind::Cbor.build();
        let event = sample_event();
        let record = encode_event(&event, serializer.as_ref(), true).unwrap();
        assert_eq!(record.record_type(), Some(RecordType::EventRepl));

        let decoded = EventRecord::decode(&record, FILE, true).unwrap();
        assert_eq!(decoded.header, event.header());
        assert_eq!(decoded.into_event(serializer.as_ref()).unwrap(), event);
    }

    #[test]
    fn test_header_only_decode_leaves_body() {
        let serializer = SerializerKind::Json.build();
        let record = encode_event(&sample_event(), serializer.as_ref(), false).unwrap();
        let decoded = EventRecord::decode(&record, FILE, false).unwrap();
        assert!(!decoded.body.is_empty());
        let header_only = decoded.into_header_event();
        assert_eq!(header_only.seqno, 41);
        assert_eq!(header_only.event, None);
    }

    #[test]
    fn test_filtered_body_survives() {
        let serializer = SerializerKind::Cbor.build();
        let mut event = sample_event();
        event.event = Some(ReplEvent::Filtered {
            seqno_end: 50,
            fragno_end: 0,
        });
        let record = encode_event(&event, serializer.as_ref(), true).unwrap();
        let decoded = EventRecord::decode(&record, FILE, true)
            .and_then(|r| r.into_event(serializer.as_ref()))
            .unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_corrupted_event_fails_crc() {
        let serializer = SerializerKind::Cbor.build();
        let record = encode_event(&sample_event(), serializer.as_ref(), true).unwrap();
        let mut data = record.data().to_vec();
        data[3] ^= 0xff;
        let damaged = LogRecord::new(99, data, CrcType::Crc32, record.crc());
        let error = EventRecord::decode(&damaged, FILE, true).unwrap_err();
        assert!(matches!(error, ThlError::CrcMismatch { offset: 99, .. }));
    }

    #[test]
    fn test_rotate_round_trip_and_type_check() {
        let record = encode_rotate(42, true);
        assert_eq!(decode_rotate(&record, FILE, true).unwrap(), 42);
        assert!(EventRecord::decode(&record, FILE, true)
            .unwrap_err()
            .is_corruption());
    }
}
