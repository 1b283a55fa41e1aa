use crate::errors::RelayError;
use crate::record::ActivityRecord;

/// Decodes a payload holding either one record object or an array of them.
///
/// Array order is preserved. A single malformed element fails the whole
/// payload.
pub fn decode_records(payload: &[u8]) -> Result<Vec<ActivityRecord>, RelayError> {
    let first = payload
        .iter()
        .copied()
        .find(|b| !b.is_ascii_whitespace());

    match first {
        Some(b'{') => serde_json::from_slice::<ActivityRecord>(payload)
            .map(|record| vec![record])
            .map_err(|e| RelayError::InvalidFormat(format!("record object: {e}"))),
        Some(b'[') => serde_json::from_slice::<Vec<ActivityRecord>>(payload)
            .map_err(|e| RelayError::InvalidFormat(format!("record array: {e}"))),
        Some(_) => Err(RelayError::InvalidFormat(
            "expected a JSON object or an array of objects".to_string(),
        )),
        None => Err(RelayError::InvalidFormat("empty payload".to_string())),
    }
}
