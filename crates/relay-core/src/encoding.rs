use crate::batcher::DeltaBatch;
use crate::errors::EncodingError;
use crate::event::StreamEvent;

/// Encoding tag stored next to every delta so readers can dispatch on it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DeltaEncoding {
    /// Events as an inline JSON array.
    #[default]
    #[serde(rename = "inline+json")]
    InlineJson,
}

/// A delta batch as persisted in a delta store.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StoredDelta {
    pub start: usize,
    pub end: usize,
    pub encoding: DeltaEncoding,
    pub payload: String,
}

impl StoredDelta {
    /// Encodes a batch with the given encoding.
    pub fn encode(batch: &DeltaBatch, encoding: DeltaEncoding) -> Result<Self, EncodingError> {
        let payload = match encoding {
            DeltaEncoding::InlineJson => serde_json::to_string(&batch.events)?,
        };
        Ok(Self {
            start: batch.start,
            end: batch.end,
            encoding,
            payload,
        })
    }

    /// Decodes the stored events.
    pub fn decode(&self) -> Result<Vec<StreamEvent>, EncodingError> {
        decode_events(self.encoding, &self.payload)
    }
}

/// Decodes a payload according to its encoding tag.
pub fn decode_events(
    encoding: DeltaEncoding,
    payload: &str,
) -> Result<Vec<StreamEvent>, EncodingError> {
    match encoding {
        DeltaEncoding::InlineJson => Ok(serde_json::from_str(payload)?),
    }
}

/// Decodes stored deltas and concatenates their events in `start` order.
pub fn collect_events(mut deltas: Vec<StoredDelta>) -> Result<Vec<StreamEvent>, EncodingError> {
    deltas.sort_by_key(|delta| delta.start);
    let mut events = Vec::new();
    for delta in &deltas {
        events.extend(delta.decode()?);
    }
    Ok(events)
}
