//! Merging of adjacent incremental events.

use crate::event::StreamEvent;

/// Merges runs of consecutive `text-delta` (or `reasoning-delta`) events with
/// the same part id into one event carrying the concatenated delta.
///
/// The merged event takes the position of the first event in the run; every
/// other event passes through unchanged. Running it on its own output is a
/// no-op.
pub fn compress(events: &[StreamEvent]) -> Vec<StreamEvent> {
    let mut out: Vec<StreamEvent> = Vec::with_capacity(events.len());
    for event in events {
        if let Some(last) = out.last_mut()
            && try_append(last, event)
        {
            continue;
        }
        out.push(event.clone());
    }
    out
}

fn try_append(last: &mut StreamEvent, next: &StreamEvent) -> bool {
    match (last, next) {
        (
            StreamEvent::TextDelta { id, delta },
            StreamEvent::TextDelta {
                id: next_id,
                delta: next_delta,
            },
        )
        | (
            StreamEvent::ReasoningDelta { id, delta },
            StreamEvent::ReasoningDelta {
                id: next_id,
                delta: next_delta,
            },
        ) if *id == *next_id => {
            delta.push_str(next_delta);
            true
        }
        _ => false,
    }
}
