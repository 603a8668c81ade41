use std::io::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use serde_json::Value;

use super::message::Envelope;
use crate::error::GatewayError;

/// Compress data using flate2 zlib. `level` runs 1 (fastest) through 9 (smallest).
pub fn compress(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompress zlib-compressed data.
pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder.write_all(data)?;
    decoder.finish()
}

/// Return true if the data length exceeds the given threshold.
pub fn should_compress(data: &[u8], threshold: usize) -> bool {
    data.len() > threshold
}

/// Payload codec for envelopes that carry `compression: true`.
/// The payload is then a base64 string of zlib-compressed JSON.
#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    pub threshold: usize,
    pub level: u32,
}

impl PayloadCodec {
    pub fn new(threshold: usize, level: u32) -> Self {
        Self { threshold, level }
    }

    /// Replace a compressed payload by its JSON value. Plain envelopes pass through.
    pub fn inflate(&self, env: &mut Envelope) -> Result<(), GatewayError> {
        if !env.is_compressed() {
            return Ok(());
        }
        let encoded = env
            .payload
            .as_str()
            .ok_or_else(|| GatewayError::InvalidMessage("compressed payload must be a string".into()))?;
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| GatewayError::InvalidMessage(format!("payload base64: {e}")))?;
        let json = decompress(&raw)
            .map_err(|e| GatewayError::InvalidMessage(format!("payload inflate: {e}")))?;
        env.payload = serde_json::from_slice(&json)
            .map_err(|e| GatewayError::InvalidMessage(format!("payload json: {e}")))?;
        env.compression = None;
        Ok(())
    }

    /// Compress the payload when it is larger than the threshold.
    /// Returns whether the envelope was changed.
    pub fn deflate(&self, env: &mut Envelope) -> bool {
        if env.is_compressed() {
            return false;
        }
        let Ok(json) = serde_json::to_vec(&env.payload) else {
            return false;
        };
        if !should_compress(&json, self.threshold) {
            return false;
        }
        match compress(&json, self.level) {
            Ok(packed) if packed.len() < json.len() => {
                env.payload = Value::String(STANDARD.encode(packed));
                env.compression = Some(true);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compress_and_decompress_bytes() {
        let data = b"hello hello hello hello hello hello".repeat(20);
        let packed = compress(&data, 6).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn decompress_rejects_garbage() {
        assert!(decompress(b"definitely not zlib").is_err());
    }

    #[test]
    fn small_payloads_stay_plain() {
        let codec = PayloadCodec::new(1024, 6);
        let mut env = Envelope::new("device_event", json!({"a": 1}));
        assert!(!codec.deflate(&mut env));
        assert_eq!(env.payload, json!({"a": 1}));
        assert_eq!(env.compression, None);
    }

    #[test]
    fn large_payload_deflates_then_inflates() {
        let codec = PayloadCodec::new(64, 6);
        let samples = vec!["temperature=21.5"; 50];
        let original = json!({ "samples": samples });
        let mut env = Envelope::new("device_event", original.clone());
        assert!(codec.deflate(&mut env));
        assert!(env.is_compressed());
        assert!(env.payload.is_string());

        codec.inflate(&mut env).unwrap();
        assert_eq!(env.payload, original);
        assert!(!env.is_compressed());
    }

    #[test]
    fn inflate_rejects_non_string_payload() {
        let codec = PayloadCodec::new(64, 6);
        let mut env = Envelope::new("x", json!({"a": 1}));
        env.compression = Some(true);
        assert!(matches!(
            codec.inflate(&mut env),
            Err(GatewayError::InvalidMessage(_))
        ));
    }
}
