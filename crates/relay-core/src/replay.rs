//! Reconstruction of one message from an ordered event sequence.

use std::collections::HashMap;

use crate::errors::ReplayError;
use crate::event::StreamEvent;
use crate::ids::MessageId;
use crate::message::{ErrorPayload, LiveStatus, Message, MessagePart, PartState, ToolState};

/// Replays `events` on top of `seed` (or an empty assistant message) and
/// returns the resulting message.
///
/// The message id is the seed's, else the first one carried by a `start`
/// event; an event naming any other id is a
/// [`ReplayError::CrossMessageContamination`]. An `error` event is raised as
/// [`ReplayError::Stream`] together with the message built so far.
///
/// Replay is pure: equal inputs always produce equal messages.
pub fn replay(events: &[StreamEvent], seed: Option<Message>) -> Result<Message, ReplayError> {
    let mut acc = Accumulator::new(seed);
    for event in events {
        acc.apply(event)?;
    }
    Ok(acc.message)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum PartKind {
    Text,
    Reasoning,
}

struct Accumulator {
    message: Message,
    id_known: bool,
    /// Open text/reasoning parts by (kind, part id) → index into `parts`.
    active: HashMap<(PartKind, String), usize>,
}

impl Accumulator {
    fn new(seed: Option<Message>) -> Self {
        let id_known = seed.is_some();
        Self {
            message: seed.unwrap_or_else(|| Message::assistant(MessageId::default())),
            id_known,
            active: HashMap::new(),
        }
    }

    fn apply(&mut self, event: &StreamEvent) -> Result<(), ReplayError> {
        if let Some(found) = event.message_id() {
            self.check_id(found)?;
        }
        match event {
            StreamEvent::Start {
                message_metadata, ..
            } => {
                self.message.metadata.live_status = Some(LiveStatus::Streaming);
                if let Some(patch) = message_metadata {
                    self.message.metadata.merge(patch);
                }
            }
            StreamEvent::StartStep => self.message.parts.push(MessagePart::StepStart),
            StreamEvent::FinishStep => self.close_all(),
            StreamEvent::TextStart { id } => {
                self.open(PartKind::Text, id);
            }
            StreamEvent::TextDelta { id, delta } => self.append(PartKind::Text, id, delta),
            StreamEvent::TextEnd { id } => self.close(PartKind::Text, id),
            StreamEvent::ReasoningStart { id } => {
                self.open(PartKind::Reasoning, id);
            }
            StreamEvent::ReasoningDelta { id, delta } => {
                self.append(PartKind::Reasoning, id, delta)
            }
            StreamEvent::ReasoningEnd { id } => self.close(PartKind::Reasoning, id),
            StreamEvent::ToolCall {
                tool_call_id,
                tool_name,
                input,
            } => self.message.parts.push(MessagePart::Tool {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                input: input.clone(),
                output: None,
                state: ToolState::InputAvailable,
            }),
            StreamEvent::ToolResult {
                tool_call_id,
                output,
            } => self.set_tool_output(tool_call_id, output)?,
            StreamEvent::Metadata { message_metadata } => {
                self.message.metadata.merge(message_metadata)
            }
            StreamEvent::Finish { message_metadata } => {
                self.close_all();
                self.message.metadata.live_status = Some(LiveStatus::Completed);
                if let Some(patch) = message_metadata {
                    self.message.metadata.merge(patch);
                }
            }
            StreamEvent::Error { error_text } => {
                self.close_all();
                self.message.metadata.live_status = Some(LiveStatus::Error);
                self.message.metadata.error = Some(ErrorPayload::new(error_text.clone()));
                return Err(ReplayError::Stream {
                    message: error_text.clone(),
                    partial: Box::new(self.message.clone()),
                });
            }
            StreamEvent::Abort => {
                self.close_all();
                self.message.metadata.live_status = Some(LiveStatus::Cancelled);
            }
        }
        Ok(())
    }

    fn check_id(&mut self, found: &MessageId) -> Result<(), ReplayError> {
        if !self.id_known {
            self.message.id = found.clone();
            self.id_known = true;
            return Ok(());
        }
        if self.message.id != *found {
            return Err(ReplayError::CrossMessageContamination {
                expected: self.message.id.clone(),
                found: found.clone(),
            });
        }
        Ok(())
    }

    fn open(&mut self, kind: PartKind, id: &str) -> usize {
        let part = match kind {
            PartKind::Text => MessagePart::Text {
                text: String::new(),
                state: PartState::Streaming,
            },
            PartKind::Reasoning => MessagePart::Reasoning {
                text: String::new(),
                state: PartState::Streaming,
            },
        };
        let index = self.message.parts.len();
        self.message.parts.push(part);
        self.active.insert((kind, id.to_string()), index);
        index
    }

    /// Deltas for a part that was never started open it implicitly: a
    /// session may be read from the middle of a part.
    fn append(&mut self, kind: PartKind, id: &str, delta: &str) {
        let index = match self.active.get(&(kind, id.to_string())) {
            Some(index) => *index,
            None => self.open(kind, id),
        };
        if let Some(MessagePart::Text { text, .. } | MessagePart::Reasoning { text, .. }) =
            self.message.parts.get_mut(index)
        {
            text.push_str(delta);
        }
    }

    fn close(&mut self, kind: PartKind, id: &str) {
        if let Some(index) = self.active.remove(&(kind, id.to_string())) {
            mark_done(&mut self.message.parts[index]);
        }
    }

    fn close_all(&mut self) {
        for (_, index) in self.active.drain() {
            mark_done(&mut self.message.parts[index]);
        }
    }

    fn set_tool_output(
        &mut self,
        tool_call_id: &str,
        value: &serde_json::Value,
    ) -> Result<(), ReplayError> {
        let part = self.message.parts.iter_mut().rev().find(|part| {
            matches!(part, MessagePart::Tool { tool_call_id: id, .. } if id == tool_call_id)
        });
        match part {
            Some(MessagePart::Tool { output, state, .. }) => {
                *output = Some(value.clone());
                *state = ToolState::OutputAvailable;
                Ok(())
            }
            _ => Err(ReplayError::UnknownToolCall {
                tool_call_id: tool_call_id.to_string(),
            }),
        }
    }
}

fn mark_done(part: &mut MessagePart) {
    if let MessagePart::Text { state, .. } | MessagePart::Reasoning { state, .. } = part {
        *state = PartState::Done;
    }
}
