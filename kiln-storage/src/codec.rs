//! Record serialization.
//!
//! A record is laid out as a single contiguous byte stream:
//!
//! ```text
//! {"key":"a.js","sourcePaths":[..],"minimumMtime":..,"payloads":{"out":{"name":"out","start":0,"end":12}}}\n
//! <payload bytes, concatenated in insertion order, no padding>
//! ```
//!
//! The metadata is compact JSON, which never contains a raw newline (string
//! newlines are escaped), so the first `0x0A` byte unambiguously ends it.
//! Offsets in the payload table are relative to the start of the blob region.

use std::fmt;

use kiln_core::{CacheRecord, CodecError, Payloads, RecordMetadata};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Byte separating the metadata text from the blob region.
pub const METADATA_DELIMITER: u8 = b'\n';

/// Top-level metadata names the codec owns. Caller metadata may not use them.
pub const RESERVED_FIELDS: [&str; 4] = ["key", "sourcePaths", "minimumMtime", "payloads"];

/// Location of one payload inside the blob region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSpan {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

/// Payload table serialized as a JSON object in payload order.
struct SpanTable<'a>(&'a [PayloadSpan]);

impl Serialize for SpanTable<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for span in self.0 {
            map.serialize_entry(&span.name, span)?;
        }
        map.end()
    }
}

/// Read the payload table keeping document order.
fn ordered_spans<'de, D>(deserializer: D) -> Result<Vec<(String, PayloadSpan)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct SpansVisitor;

    impl<'de> Visitor<'de> for SpansVisitor {
        type Value = Vec<(String, PayloadSpan)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of payload name to {name, start, end}")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut spans = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some(entry) = access.next_entry::<String, PayloadSpan>()? {
                spans.push(entry);
            }
            Ok(spans)
        }
    }

    deserializer.deserialize_map(SpansVisitor)
}

#[derive(Serialize)]
struct EncodedMetadata<'a> {
    #[serde(flatten)]
    metadata: &'a RecordMetadata,
    payloads: SpanTable<'a>,
}

#[derive(Deserialize)]
struct DecodedMetadata {
    #[serde(flatten)]
    metadata: RecordMetadata,
    #[serde(default, deserialize_with = "ordered_spans")]
    payloads: Vec<(String, PayloadSpan)>,
}

/// Serialize a record.
pub fn encode(record: &CacheRecord) -> Result<Vec<u8>, CodecError> {
    if let Some(field) = RESERVED_FIELDS
        .iter()
        .find(|f| record.metadata.extra.contains_key(**f))
    {
        return Err(CodecError::ReservedField {
            field: (*field).to_string(),
        });
    }

    let mut offset = 0;
    let mut spans = Vec::with_capacity(record.payloads.len());
    for (name, bytes) in record.payloads.iter() {
        let end = offset + bytes.len();
        spans.push(PayloadSpan {
            name: name.to_string(),
            start: offset,
            end,
        });
        offset = end;
    }

    let header = EncodedMetadata {
        metadata: &record.metadata,
        payloads: SpanTable(&spans),
    };
    let mut out = serde_json::to_vec(&header).map_err(|e| CodecError::MalformedMetadata {
        reason: e.to_string(),
    })?;
    debug_assert!(!out.contains(&METADATA_DELIMITER));

    out.reserve(1 + offset);
    out.push(METADATA_DELIMITER);
    for (_, bytes) in record.payloads.iter() {
        out.extend_from_slice(bytes);
    }
    Ok(out)
}

/// Deserialize a record.
///
/// Fails on a buffer without a delimiter, unparseable metadata, or a payload
/// span that does not fit the blob region.
pub fn decode(bytes: &[u8]) -> Result<CacheRecord, CodecError> {
    let split = bytes
        .iter()
        .position(|b| *b == METADATA_DELIMITER)
        .ok_or(CodecError::MissingDelimiter)?;

    let decoded: DecodedMetadata =
        serde_json::from_slice(&bytes[..split]).map_err(|e| CodecError::MalformedMetadata {
            reason: e.to_string(),
        })?;
    let blob = &bytes[split + 1..];

    // Stable: payloads sharing an offset (empty ones) keep document order.
    let mut spans = decoded.payloads;
    spans.sort_by_key(|(_, span)| span.start);

    let mut payloads = Payloads::new();
    for (name, span) in spans {
        if span.start > span.end || span.end > blob.len() {
            return Err(CodecError::PayloadOutOfBounds {
                name,
                start: span.start,
                end: span.end,
                len: blob.len(),
            });
        }
        payloads.insert(name, blob[span.start..span.end].to_vec());
    }

    Ok(CacheRecord::new(decoded.metadata, payloads))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::path::PathBuf;

    fn transpiled(key: &str) -> CacheRecord {
        let mut record = CacheRecord::with_sources(["/project/src/foo.txt"])
            .with_payload("transpiledOutput", format!("the transpiled output of {key}"))
            .with_payload("sourceMap", format!("the source map of {key}"))
            .with_meta("compileTime", 12);
        record.metadata.key = key.to_string();
        record.metadata.minimum_mtime = 1_700_000_000_000;
        record
    }

    fn metadata_json(bytes: &[u8]) -> Value {
        let split = bytes.iter().position(|b| *b == b'\n').unwrap();
        serde_json::from_slice(&bytes[..split]).unwrap()
    }

    #[test]
    fn test_offsets_follow_insertion_order() {
        let key = "read-write-if-nonexist.txt";
        let bytes = encode(&transpiled(key)).unwrap();
        let out_len = format!("the transpiled output of {key}").len();
        let map_len = format!("the source map of {key}").len();

        let meta = metadata_json(&bytes);
        assert_eq!(
            meta["payloads"],
            json!({
                "transpiledOutput": {"name": "transpiledOutput", "start": 0, "end": out_len},
                "sourceMap": {"name": "sourceMap", "start": out_len, "end": out_len + map_len},
            })
        );
        assert_eq!(meta["key"], json!(key));
        assert_eq!(meta["compileTime"], json!(12));
    }

    #[test]
    fn test_blob_region_directly_follows_delimiter() {
        let record = CacheRecord::default().with_payload("a", "xy").with_payload("b", "z");
        let bytes = encode(&record).unwrap();
        assert!(bytes.ends_with(b"\nxyz"));
    }

    #[test]
    fn test_roundtrip_preserves_order_and_fields() {
        let record = transpiled("a/b.js");
        let back = decode(&encode(&record).unwrap()).unwrap();
        assert_eq!(back, record);
        assert_eq!(
            back.payloads.names().collect::<Vec<_>>(),
            vec!["transpiledOutput", "sourceMap"]
        );
    }

    #[test]
    fn test_payload_bytes_may_contain_delimiter() {
        let record = CacheRecord::default().with_payload("bin", vec![b'\n', 0, b'\n', 255]);
        let back = decode(&encode(&record).unwrap()).unwrap();
        assert_eq!(back.payloads.get("bin"), Some(&[b'\n', 0, b'\n', 255][..]));
    }

    #[test]
    fn test_metadata_newlines_are_escaped() {
        let record = CacheRecord::default().with_meta("note", "line one\nline two");
        let bytes = encode(&record).unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        let back = decode(&bytes).unwrap();
        assert_eq!(back.metadata.get("note"), Some(&json!("line one\nline two")));
    }

    #[test]
    fn test_empty_payloads() {
        let record = CacheRecord::with_sources(["/x"]);
        let bytes = encode(&record).unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');
        assert_eq!(decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_reserved_field_rejected() {
        let record = CacheRecord::default().with_meta("payloads", 1);
        assert_eq!(
            encode(&record),
            Err(CodecError::ReservedField {
                field: "payloads".to_string()
            })
        );
    }

    #[test]
    fn test_decode_without_delimiter() {
        assert_eq!(decode(b"{\"key\":\"x\"}"), Err(CodecError::MissingDelimiter));
        assert_eq!(decode(b""), Err(CodecError::MissingDelimiter));
    }

    #[test]
    fn test_decode_malformed_metadata() {
        assert!(matches!(
            decode(b"not json\npayload"),
            Err(CodecError::MalformedMetadata { .. })
        ));
    }

    #[test]
    fn test_decode_truncated_blob() {
        let bytes = encode(&transpiled("k")).unwrap();
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(
            decode(truncated),
            Err(CodecError::PayloadOutOfBounds { ref name, .. }) if name == "sourceMap"
        ));
    }

    #[test]
    fn test_decode_inverted_span() {
        let bytes = br#"{"payloads":{"x":{"name":"x","start":3,"end":1}}}
abcd"#;
        assert!(matches!(
            decode(bytes),
            Err(CodecError::PayloadOutOfBounds { start: 3, end: 1, len: 4, .. })
        ));
    }

    #[test]
    fn test_empty_payloads_keep_their_order() {
        let record = CacheRecord::default()
            .with_payload("zeta", Vec::new())
            .with_payload("alpha", Vec::new())
            .with_payload("mid", "x");
        let back = decode(&encode(&record).unwrap()).unwrap();
        assert_eq!(back.payloads.names().collect::<Vec<_>>(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_decode_restores_order_from_offsets() {
        let bytes = br#"{"payloads":{"a":{"name":"a","start":3,"end":5},"z":{"name":"z","start":0,"end":3}}}
zzzaa"#;
        let record = decode(bytes).unwrap();
        assert_eq!(record.payloads.names().collect::<Vec<_>>(), vec!["z", "a"]);
        assert_eq!(record.payloads.get_str("a"), Some("aa"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_roundtrip_law(
            key in ".*",
            minimum_mtime in any::<i64>(),
            sources in prop::collection::vec("/[a-z0-9/._\n-]{1,24}", 0..4),
            note in ".*",
            payloads in prop::collection::btree_map("[a-zA-Z]{1,12}", prop::collection::vec(any::<u8>(), 0..256), 0..5),
        ) {
            let mut record = CacheRecord::with_sources(sources.iter().map(PathBuf::from))
                .with_meta("note", note.clone());
            record.metadata.key = key.clone();
            record.metadata.minimum_mtime = minimum_mtime;
            for (name, bytes) in &payloads {
                record.payloads.insert(name.clone(), bytes.clone());
            }

            let back = decode(&encode(&record).unwrap()).unwrap();
            prop_assert_eq!(&back.metadata.key, &key);
            prop_assert_eq!(back.metadata.minimum_mtime, minimum_mtime);
            prop_assert_eq!(&back.metadata.source_paths, &record.metadata.source_paths);
            prop_assert_eq!(back.metadata.get("note"), Some(&Value::String(note)));
            for (name, bytes) in &payloads {
                prop_assert_eq!(back.payloads.get(name), Some(bytes.as_slice()));
            }
        }
    }
}
