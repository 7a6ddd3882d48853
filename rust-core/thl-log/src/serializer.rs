// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Event body serializers
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The binary record header is fixed; only the event body behind it is
// pluggable. Serializers are selected by `SerializerKind` in the config.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ThlError, ThlResult};
use crate::event::ReplEvent;

/// Converts event bodies to and from bytes.
pub trait EventSerializer: Send + Sync {
    /// Short identifier, e.g. `"json"`.
    fn name(&self) -> &'static str;

    fn serialize(&self, event: &ReplEvent) -> ThlResult<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> ThlResult<ReplEvent>;
}

/// JSON bodies via `serde_json`. Readable with standard tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEventSerializer;

impl EventSerializer for JsonEventSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, event: &ReplEvent) -> ThlResult<Vec<u8>> {
        serde_json::to_vec(event).map_err(|e| ThlError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> ThlResult<ReplEvent> {
        serde_json::from_slice(bytes).map_err(|e| ThlError::Serialization(e.to_string()))
    }
}

/// CBOR bodies via `ciborium`. Compact, handles binary payloads natively.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborEventSerializer;

impl EventSerializer for CborEventSerializer {
    fn name(&self) -> &'static str {
        "cbor"
    }

    fn serialize(&self, event: &ReplEvent) -> ThlResult<Vec<u8>> {
        let mut buffer = Vec::new();
        ciborium::into_writer(event, &mut buffer)
            .map_err(|e| ThlError::Serialization(e.to_string()))?;
        Ok(buffer)
    }

    fn deserialize(&self, bytes: &[u8]) -> ThlResult<ReplEvent> {
        ciborium::from_reader(bytes).map_err(|e| ThlError::Serialization(e.to_string()))
    }
}

/// Serializer selection as it appears in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    Json,
    #[default]
    Cbor,
}

impl SerializerKind {
    /// Instantiate the serializer.
    pub fn build(self) -> Arc<dyn EventSerializer> {
        match self {
            Self::Json => Arc::new(JsonEventSerializer),
            Self::Cbor => Arc::new(CborEventSerializer),
        }
    }
}

impl FromStr for SerializerKind {
    type Err = ThlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            other => Err(ThlError::Config(format!("unknown serializer: {other}"))),
        }
    }
}

impl fmt::Display for SerializerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample() -> ReplEvent {
        let mut metadata = BTreeMap::new();
        metadata.insert("service".to_string(), "orders".to_string());
        ReplEvent::Data {
            metadata,
            payload: vec![0, 159, 255, 10],
        }
    }

    #[test]
    fn test_both_serializers_preserve_binary_payloads() {
        for kind in [SerializerKind::Json, SerializerKind::Cbor] {
            let serializer = kind.build();
            let bytes = serializer.serialize(&sample()).unwrap();
            assert_eq!(serializer.deserialize(&bytes).unwrap(), sample(), "{kind}");
        }
    }

    #[test]
    fn test_garbage_body_is_serialization_error() {
        let serializer = SerializerKind::Json.build();
        assert!(matches!(
            serializer.deserialize(b"{not json"),
            Err(ThlError::Serialization(_))
        ));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("CBOR".parse::<SerializerKind>().unwrap(), SerializerKind::Cbor);
        assert_eq!("json".parse::<SerializerKind>().unwrap(), SerializerKind::Json);
        assert!("protobuf".parse::<SerializerKind>().is_err());
    }
}
