use serde_json::Value;

use dynmap_core::mapping::Mapping;

use super::{wrap_message, Decoded, PayloadNormalizer};

/// JSON text.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonNormalizer;

impl PayloadNormalizer for JsonNormalizer {
    fn decode(&self, payload: &[u8], _mapping: &Mapping) -> Result<Decoded, String> {
        let root: Value =
            serde_json::from_slice(payload).map_err(|e| format!("invalid JSON payload: {}", e))?;
        Ok(Decoded::new(wrap_message(root)))
    }
}
