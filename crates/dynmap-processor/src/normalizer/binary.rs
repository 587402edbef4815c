use serde_json::{json, Value};

use dynmap_core::mapping::Mapping;

use super::{Decoded, PayloadNormalizer};

/// Plain text, addressed as `message`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatFileNormalizer;

impl PayloadNormalizer for FlatFileNormalizer {
    fn decode(&self, payload: &[u8], _mapping: &Mapping) -> Result<Decoded, String> {
        let text = std::str::from_utf8(payload).map_err(|e| format!("payload is not UTF-8: {}", e))?;
        Ok(Decoded::new(json!({ "message": text })))
    }
}

/// Raw bytes rendered as `0x`-prefixed hex.
#[derive(Debug, Default, Clone, Copy)]
pub struct HexNormalizer;

impl PayloadNormalizer for HexNormalizer {
    fn decode(&self, payload: &[u8], _mapping: &Mapping) -> Result<Decoded, String> {
        let rendered = format!("0x{}", hex::encode(payload));
        Ok(Decoded::new(json!({ "message": Value::String(rendered) })))
    }
}
