//! Versioned, checksummed binary record wrapping every stored object.
//!
//! Layout (all integers big-endian, every variable field length-prefixed):
//!
//! ```text
//! v0: u8 version | u16 len, metadata checksum | u16 len, metadata JSON
//!     | u16 len, payload encoding | u32 len, payload
//! v1: v0 fields | u16 len, payload checksum
//! ```
//!
//! The metadata checksum is always verified. The payload checksum is only
//! checked on request, since block-level checksums already cover routine reads.

use crate::checksum::{Checksum, ChecksumAlgorithm, ChecksumEngine};
use crate::error::{StoreError, StoreResult};
use serde_json::Value;

/// Version written by [`encode`]
pub const ENVELOPE_VERSION: u8 = 1;

/// Algorithm used for metadata and payload checksums
pub const METADATA_CHECKSUM_ALGORITHM: ChecksumAlgorithm = ChecksumAlgorithm::Sha256;

/// Encoding tag recorded for opaque payloads
pub const BINARY_PAYLOAD_ENCODING: &str = "binary";

/// JSON object stored in an envelope's metadata field
pub type Metadata = serde_json::Map<String, Value>;

/// A decoded envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Record version the bytes were written with
    pub version: u8,
    /// Parsed metadata object
    pub metadata: Metadata,
    /// Payload encoding tag
    pub payload_encoding: String,
    /// Opaque payload
    pub payload: Vec<u8>,
}

/// Encode `metadata` and `payload` into the latest record version.
pub fn encode(metadata: &Metadata, payload: &[u8]) -> StoreResult<Vec<u8>> {
    let raw_metadata = serde_json::to_vec(metadata)?;
    let engine = ChecksumEngine::new(METADATA_CHECKSUM_ALGORITHM);
    let metadata_checksum = engine.block(&raw_metadata).to_string();
    let payload_checksum = engine.block(payload).to_string();

    let mut out = Vec::with_capacity(
        raw_metadata.len() + payload.len() + metadata_checksum.len() * 2 + 32,
    );
    out.push(ENVELOPE_VERSION);
    put_u16_field(&mut out, "metadata_checksum", metadata_checksum.as_bytes())?;
    put_u16_field(&mut out, "metadata", &raw_metadata)?;
    put_u16_field(&mut out, "payload_encoding", BINARY_PAYLOAD_ENCODING.as_bytes())?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        StoreError::Encode(format!("payload too large: {} bytes", payload.len()))
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    put_u16_field(&mut out, "payload_checksum", payload_checksum.as_bytes())?;
    Ok(out)
}

/// Decode a record, always verifying the metadata checksum and optionally the payload checksum.
pub fn decode(bytes: &[u8], verify_payload_checksum: bool) -> StoreResult<Envelope> {
    let mut reader = Reader::new(bytes);
    let version = reader.u8()?;
    let record = match version {
        0 => RawRecord::read(version, &mut reader, false)?,
        1 => RawRecord::read(version, &mut reader, true)?,
        other => {
            return Err(StoreError::Decode(format!(
                "Record version mismatch: unknown version {other}"
            )))
        }
    };
    if !reader.is_empty() {
        return Err(StoreError::Decode(format!(
            "{} trailing bytes after v{} record",
            reader.remaining(),
            version
        )));
    }

    verify_field(record.metadata_checksum, record.metadata)
        .map_err(|e| StoreError::Verify(format!("Record metadata checksum: {e}")))?;

    if verify_payload_checksum {
        let payload_checksum = record.payload_checksum.ok_or_else(|| {
            StoreError::Verify(format!(
                "Cannot verify payload: no payload checksum in v{version} records"
            ))
        })?;
        verify_field(payload_checksum, record.payload)
            .map_err(|e| StoreError::Verify(format!("Record payload checksum: {e}")))?;
    }

    let metadata = match serde_json::from_slice::<Value>(record.metadata)? {
        Value::Object(map) => map,
        other => {
            return Err(StoreError::Decode(format!(
                "Record metadata is not an object: {other}"
            )))
        }
    };
    let payload_encoding = String::from_utf8(record.payload_encoding.to_vec())
        .map_err(|_| StoreError::Decode("payload encoding is not UTF-8".into()))?;

    Ok(Envelope {
        version,
        metadata,
        payload_encoding,
        payload: record.payload.to_vec(),
    })
}

struct RawRecord<'a> {
    metadata_checksum: &'a [u8],
    metadata: &'a [u8],
    payload_encoding: &'a [u8],
    payload: &'a [u8],
    payload_checksum: Option<&'a [u8]>,
}

impl<'a> RawRecord<'a> {
    fn read(version: u8, reader: &mut Reader<'a>, has_payload_checksum: bool) -> StoreResult<Self> {
        let metadata_checksum = reader.u16_field()?;
        let metadata = reader.u16_field()?;
        let payload_encoding = reader.u16_field()?;
        let payload_len = reader.u32()? as usize;
        let payload = reader.bytes(payload_len)?;
        let payload_checksum = if has_payload_checksum {
            Some(reader.u16_field()?)
        } else {
            None
        };
        tracing::trace!(version, payload_len, "decoded envelope fields");
        Ok(Self {
            metadata_checksum,
            metadata,
            payload_encoding,
            payload,
            payload_checksum,
        })
    }
}

// Any failure to parse or match the stored checksum is a verification failure.
fn verify_field(stored: &[u8], data: &[u8]) -> StoreResult<()> {
    let stored = std::str::from_utf8(stored)
        .map_err(|_| StoreError::Verify("checksum is not UTF-8".into()))?;
    let checksum: Checksum = stored.parse()?;
    checksum.verify_block(data)
}

fn put_u16_field(out: &mut Vec<u8>, name: &str, data: &[u8]) -> StoreResult<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| StoreError::Encode(format!("{name} too long: {} bytes", data.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn bytes(&mut self, n: usize) -> StoreResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(StoreError::Decode(format!(
                "truncated record: wanted {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> StoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> StoreResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> StoreResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u16_field(&mut self) -> StoreResult<&'a [u8]> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn sample_metadata() -> Metadata {
        match json!({"version": 0, "length": 10, "compression": {"algorithm": "zlib"}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    // Offsets of the metadata checksum + metadata region and of the payload.
    fn regions(encoded: &[u8]) -> (std::ops::Range<usize>, std::ops::Range<usize>, std::ops::Range<usize>) {
        let ck_len = u16::from_be_bytes([encoded[1], encoded[2]]) as usize;
        let md_len_at = 3 + ck_len;
        let md_len = u16::from_be_bytes([encoded[md_len_at], encoded[md_len_at + 1]]) as usize;
        let md_start = md_len_at + 2;
        let enc_len_at = md_start + md_len;
        let enc_len = u16::from_be_bytes([encoded[enc_len_at], encoded[enc_len_at + 1]]) as usize;
        let pl_len_at = enc_len_at + 2 + enc_len;
        let pl_len = u32::from_be_bytes(encoded[pl_len_at..pl_len_at + 4].try_into().unwrap()) as usize;
        let pl_start = pl_len_at + 4;
        let pck_start = pl_start + pl_len + 2;
        (3..md_start + md_len, pl_start..pl_start + pl_len, pck_start..encoded.len())
    }

    /// Hand-built v0 record (no payload checksum)
    fn encode_v0(metadata: &Metadata, payload: &[u8]) -> Vec<u8> {
        let raw = serde_json::to_vec(metadata).unwrap();
        let ck = ChecksumEngine::default().block(&raw).to_string();
        let mut out = vec![0u8];
        put_u16_field(&mut out, "c", ck.as_bytes()).unwrap();
        put_u16_field(&mut out, "m", &raw).unwrap();
        put_u16_field(&mut out, "e", b"binary").unwrap();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn roundtrip_with_payload_verification() {
        let md = sample_metadata();
        let encoded = encode(&md, b"payload bytes").unwrap();
        assert_eq!(encoded[0], ENVELOPE_VERSION);
        let env = decode(&encoded, true).unwrap();
        assert_eq!(env.metadata, md);
        assert_eq!(env.payload, b"payload bytes");
        assert_eq!(env.payload_encoding, BINARY_PAYLOAD_ENCODING);
    }

    #[test]
    fn encode_is_deterministic() {
        let md = sample_metadata();
        assert_eq!(encode(&md, b"x").unwrap(), encode(&md, b"x").unwrap());
    }

    #[test]
    fn unknown_version_is_decode_error() {
        let mut encoded = encode(&sample_metadata(), b"x").unwrap();
        encoded[0] = 7;
        assert!(matches!(decode(&encoded, false), Err(StoreError::Decode(_))));
    }

    #[test]
    fn truncated_and_trailing_are_decode_errors() {
        let encoded = encode(&sample_metadata(), b"payload").unwrap();
        assert!(matches!(
            decode(&encoded[..encoded.len() - 3], false),
            Err(StoreError::Decode(_))
        ));
        let mut longer = encoded.clone();
        longer.push(0);
        assert!(matches!(decode(&longer, false), Err(StoreError::Decode(_))));
        assert!(matches!(decode(&[], false), Err(StoreError::Decode(_))));
    }

    #[test]
    fn payload_tamper_only_detected_when_verifying() {
        let encoded = encode(&sample_metadata(), b"payload bytes").unwrap();
        let (_, payload, _) = regions(&encoded);
        let mut tampered = encoded.clone();
        tampered[payload.start] ^= 0x01;
        let env = decode(&tampered, false).unwrap();
        assert_ne!(env.payload, b"payload bytes");
        assert!(matches!(decode(&tampered, true), Err(StoreError::Verify(_))));
    }

    #[test]
    fn payload_checksum_tamper_detected_when_verifying() {
        let encoded = encode(&sample_metadata(), b"payload bytes").unwrap();
        let (_, _, checksum) = regions(&encoded);
        let mut tampered = encoded.clone();
        tampered[checksum.end - 1] ^= 0x01;
        assert!(matches!(decode(&tampered, true), Err(StoreError::Verify(_))));
    }

    #[test]
    fn v0_records_decode_but_cannot_verify_payload() {
        let md = sample_metadata();
        let v0 = encode_v0(&md, b"old");
        let env = decode(&v0, false).unwrap();
        assert_eq!(env.version, 0);
        assert_eq!(env.payload, b"old");
        assert!(matches!(decode(&v0, true), Err(StoreError::Verify(_))));
    }

    #[test]
    fn oversized_metadata_is_encode_error() {
        let mut md = Metadata::new();
        md.insert("big".into(), Value::String("x".repeat(70_000)));
        assert!(matches!(encode(&md, b""), Err(StoreError::Encode(_))));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(key in "[a-z]{1,12}", value in any::<i64>(),
                          payload in prop::collection::vec(any::<u8>(), 0..4096)) {
            let mut md = Metadata::new();
            md.insert(key, Value::from(value));
            let env = decode(&encode(&md, &payload).unwrap(), true).unwrap();
            prop_assert_eq!(env.metadata, md);
            prop_assert_eq!(env.payload, payload);
        }

        #[test]
        fn prop_metadata_tamper_is_verify_error(idx in any::<prop::sample::Index>(), bit in 0u8..8) {
            let encoded = encode(&sample_metadata(), b"payload").unwrap();
            let (metadata, _, _) = regions(&encoded);
            // Skip the metadata length prefix itself, which changes the layout.
            let ck_len = u16::from_be_bytes([encoded[1], encoded[2]]) as usize;
            let len_prefix = 3 + ck_len..3 + ck_len + 2;
            let candidates: Vec<usize> = metadata.filter(|i| !len_prefix.contains(i)).collect();
            let at = candidates[idx.index(candidates.len())];
            let mut tampered = encoded.clone();
            tampered[at] ^= 1 << bit;
            prop_assert!(matches!(decode(&tampered, false), Err(StoreError::Verify(_))));
        }
    }
}
