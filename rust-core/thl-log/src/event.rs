// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Replication events
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A `ThlEvent` is one fragment of a logical transaction as stored in the log:
// a fixed binary header plus an event body produced by the configured
// serializer.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Header fields of a stored event. This is what read filters see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub seqno: i64,
    pub fragno: i16,
    pub last_frag: bool,
    pub epoch: i64,
    pub source_id: String,
    pub event_id: String,
    pub shard_id: String,
    /// Source timestamp, millisecond precision.
    pub source_tstamp: DateTime<Utc>,
}

/// The serialized body of a replication event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplEvent {
    /// A change extracted from the source, carried as opaque bytes.
    Data {
        metadata: BTreeMap<String, String>,
        payload: Vec<u8>,
    },
    /// Placeholder for a run of events removed by filtering upstream.
    Filtered { seqno_end: i64, fragno_end: i16 },
}

/// One event fragment as stored in and returned by the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThlEvent {
    /// Sequence number of the transaction this fragment belongs to.
    pub seqno: i64,
    /// Position within the transaction's fragment chain, from 0.
    pub fragno: i16,
    /// Set on the final fragment of the chain.
    pub last_frag: bool,
    /// Epoch number of the source at the time of extraction.
    pub epoch: i64,
    /// Identifies the source server.
    pub source_id: String,
    /// Native position in the source's own log.
    pub event_id: String,
    /// Shard the event belongs to; empty when unsharded.
    pub shard_id: String,
    /// Source timestamp, millisecond precision.
    pub source_tstamp: DateTime<Utc>,
    /// The event body. `None` when a read filter rejected the event.
    pub event: Option<ReplEvent>,
}

impl ThlEvent {
    /// Build a single-fragment data event. The timestamp is truncated to
    /// milliseconds, matching what the log stores.
    pub fn new(seqno: i64, event_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            seqno,
            fragno: 0,
            last_frag: true,
            epoch: 0,
            source_id: String::new(),
            event_id: event_id.into(),
            shard_id: String::new(),
            source_tstamp: millis_precision(Utc::now()),
            event: Some(ReplEvent::Data {
                metadata: BTreeMap::new(),
                payload,
            }),
        }
    }

    /// Turn this event into fragment `fragno` of its chain.
    pub fn with_fragment(mut self, fragno: i16, last_frag: bool) -> Self {
        self.fragno = fragno;
        self.last_frag = last_frag;
        self
    }

    pub fn with_epoch(mut self, epoch: i64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    pub fn with_shard_id(mut self, shard_id: impl Into<String>) -> Self {
        self.shard_id = shard_id.into();
        self
    }

    pub fn with_source_tstamp(mut self, source_tstamp: DateTime<Utc>) -> Self {
        self.source_tstamp = millis_precision(source_tstamp);
        self
    }

    /// Header view of this event.
    pub fn header(&self) -> EventHeader {
        EventHeader {
            seqno: self.seqno,
            fragno: self.fragno,
            last_frag: self.last_frag,
            epoch: self.epoch,
            source_id: self.source_id.clone(),
            event_id: self.event_id.clone(),
            shard_id: self.shard_id.clone(),
            source_tstamp: self.source_tstamp,
        }
    }

    /// Rebuild an event from a decoded header and optional body.
    pub fn from_header(header: EventHeader, event: Option<ReplEvent>) -> Self {
        Self {
            seqno: header.seqno,
            fragno: header.fragno,
            last_frag: header.last_frag,
            epoch: header.epoch,
            source_id: header.source_id,
            event_id: header.event_id,
            shard_id: header.shard_id,
            source_tstamp: header.source_tstamp,
            event,
        }
    }
}

/// Epoch milliseconds to a UTC timestamp. Out-of-range values clamp to the
/// epoch.
pub(crate) fn tstamp_from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn millis_precision(tstamp: DateTime<Utc>) -> DateTime<Utc> {
    tstamp_from_millis(tstamp.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_is_complete_single_fragment() {
        let event = ThlEvent::new(12, "12", b"insert".to_vec());
        assert_eq!(event.fragno, 0);
        assert!(event.last_frag);
        assert_eq!(event.source_tstamp.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_header_round_trips_through_from_header() {
        let event = ThlEvent::new(3, "3", vec![1, 2])
            .with_fragment(1, false)
            .with_epoch(9)
            .with_shard_id("orders");
        let rebuilt = ThlEvent::from_header(event.header(), event.event.clone());
        assert_eq!(rebuilt, event);
    }
}
