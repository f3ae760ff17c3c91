use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use toolstream_core::errors::GatewayError;
use toolstream_core::events::ProtocolEvent;
use toolstream_core::ids::{MessageId, ToolCallId};
use toolstream_core::messages::{Message, Role, ToolCallRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentStatus {
    Pending,
    Complete,
}

/// A tool call being reassembled from streamed fragments.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: ToolCallId,
    pub name: String,
    pub arguments: String,
    pub status: FragmentStatus,
}

impl ToolCallFragment {
    pub fn to_ref(&self) -> ToolCallRef {
        ToolCallRef {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

/// The assistant side of one finished round.
#[derive(Clone, Debug, PartialEq)]
pub struct AssistantTurn {
    pub message_id: MessageId,
    pub content: String,
    /// In the order their contexts were opened.
    pub tool_calls: Vec<ToolCallFragment>,
    pub finish_reason: Option<String>,
}

impl AssistantTurn {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn to_message(&self) -> Message {
        Message::assistant_with_tool_calls(
            self.message_id.clone(),
            self.content.clone(),
            self.tool_calls.iter().map(ToolCallFragment::to_ref).collect(),
        )
    }
}

/// Per-round state machine that merges upstream chat-completion chunks.
///
/// Each payload is merged in arrival order and produces the protocol
/// events describing the transition. Tool-call fragments are correlated by
/// the upstream's transient `index`; the index table lives only as long as
/// the accumulator, which is consumed by [`DeltaAccumulator::finish`].
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    message_id: Option<MessageId>,
    content: String,
    by_index: HashMap<u32, usize>,
    calls: Vec<ToolCallFragment>,
    /// Slots whose TOOL_CALL_START is held back until a name arrives.
    unnamed: BTreeSet<usize>,
    finish_reason: Option<String>,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one `data:` payload. Unparseable payloads are skipped; an
    /// in-band upstream error object is returned as `Err`.
    pub fn push_payload(&mut self, payload: &str) -> Result<Vec<ProtocolEvent>, GatewayError> {
        let chunk: ChatChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, payload_len = payload.len(), "skipping malformed chunk");
                return Ok(Vec::new());
            }
        };

        if let Some(err) = chunk.error {
            return Err(GatewayError::StreamInterrupted(upstream_error_message(&err)));
        }

        let mut events = Vec::new();

        if let Some(id) = chunk.id.filter(|id| !id.is_empty()) {
            self.open_message(Some(MessageId::from_raw(id)), &mut events);
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                    let message_id = self.open_message(None, &mut events);
                    self.content.push_str(&text);
                    events.push(ProtocolEvent::TextMessageContent {
                        message_id,
                        delta: text,
                    });
                }
                for (position, call) in delta.tool_calls.unwrap_or_default().into_iter().enumerate() {
                    self.merge_tool_call(position, call, &mut events);
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.close_tool_calls(&mut events);
                self.finish_reason = Some(reason);
            }
        }

        Ok(events)
    }

    /// End the round: close every still-pending tool call, then the message.
    /// Returns `None` for the turn when the upstream produced no message.
    pub fn finish(mut self) -> (Vec<ProtocolEvent>, Option<AssistantTurn>) {
        let mut events = Vec::new();
        self.close_tool_calls(&mut events);

        let Some(message_id) = self.message_id else {
            return (events, None);
        };
        events.push(ProtocolEvent::TextMessageEnd {
            message_id: message_id.clone(),
        });

        let turn = AssistantTurn {
            message_id,
            content: self.content,
            tool_calls: self.calls,
            finish_reason: self.finish_reason,
        };
        (events, Some(turn))
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        self.message_id.as_ref()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn tool_calls(&self) -> &[ToolCallFragment] {
        &self.calls
    }

    /// Open the round's message if none is open yet and return its id.
    /// Ids on later chunks that differ from the open one are merged into it.
    fn open_message(&mut self, id: Option<MessageId>, events: &mut Vec<ProtocolEvent>) -> MessageId {
        if let Some(open) = &self.message_id {
            if let Some(other) = id.filter(|other| other != open) {
                debug!(open = %open, other = %other, "merging chunk with different message id");
            }
            return open.clone();
        }
        let id = id.unwrap_or_default();
        events.push(ProtocolEvent::TextMessageStart {
            message_id: id.clone(),
            role: Role::Assistant,
        });
        self.message_id = Some(id.clone());
        id
    }

    fn merge_tool_call(&mut self, position: usize, call: ToolCallDelta, events: &mut Vec<ProtocolEvent>) {
        let index = match call.index {
            Some(index) => index,
            // Without an index, an id-bearing fragment opens a new call and
            // anything else continues the most recent one.
            None if call.id.is_some() => self.by_index.keys().max().map_or(0, |max| max + 1),
            None => self
                .calls
                .last()
                .map(|c| c.index)
                .unwrap_or(position as u32),
        };
        let (name, arguments) = match call.function {
            Some(f) => (f.name.filter(|n| !n.is_empty()), f.arguments.filter(|a| !a.is_empty())),
            None => (None, None),
        };

        let slot = match self.by_index.get(&index) {
            Some(&slot) => slot,
            None => {
                self.open_message(None, events);
                let id = call
                    .id
                    .filter(|id| !id.is_empty())
                    .map(ToolCallId::from_raw)
                    .unwrap_or_default();
                self.calls.push(ToolCallFragment {
                    index,
                    id,
                    name: String::new(),
                    arguments: String::new(),
                    status: FragmentStatus::Pending,
                });
                let slot = self.calls.len() - 1;
                self.by_index.insert(index, slot);
                let _ = self.unnamed.insert(slot);
                slot
            }
        };

        if self.calls[slot].status == FragmentStatus::Complete {
            if arguments.is_some() {
                warn!(tool_call_id = %self.calls[slot].id, "argument fragment after end signal ignored");
            }
            return;
        }

        if let Some(name) = name {
            if self.unnamed.remove(&slot) {
                self.calls[slot].name = name;
                self.announce(slot, events);
            }
        }

        let Some(arguments) = arguments else {
            return;
        };
        let fragment = &mut self.calls[slot];
        fragment.arguments.push_str(&arguments);
        if !self.unnamed.contains(&slot) {
            events.push(ProtocolEvent::ToolCallArgs {
                tool_call_id: fragment.id.clone(),
                delta: arguments,
            });
        }
    }

    /// Emit TOOL_CALL_START for a slot, followed by any arguments that were
    /// buffered while its name was unknown.
    fn announce(&self, slot: usize, events: &mut Vec<ProtocolEvent>) {
        let fragment = &self.calls[slot];
        events.push(ProtocolEvent::ToolCallStart {
            tool_call_id: fragment.id.clone(),
            tool_call_name: fragment.name.clone(),
            parent_message_id: self.message_id.clone(),
        });
        if !fragment.arguments.is_empty() {
            events.push(ProtocolEvent::ToolCallArgs {
                tool_call_id: fragment.id.clone(),
                delta: fragment.arguments.clone(),
            });
        }
    }

    fn close_tool_calls(&mut self, events: &mut Vec<ProtocolEvent>) {
        // A call that never got a name is still announced so its END has a START.
        for slot in std::mem::take(&mut self.unnamed) {
            warn!(tool_call_id = %self.calls[slot].id, "tool call closed without a name");
            self.announce(slot, events);
        }
        for fragment in self.calls.iter_mut() {
            if fragment.status == FragmentStatus::Pending {
                fragment.status = FragmentStatus::Complete;
                events.push(ProtocolEvent::ToolCallEnd {
                    tool_call_id: fragment.id.clone(),
                });
            }
        }
    }
}

fn upstream_error_message(err: &Value) -> String {
    err.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string())
}

// --- Deserialization types for chat-completion chunks ---

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::chunks;

    fn feed(acc: &mut DeltaAccumulator, payloads: &[String]) -> Vec<ProtocolEvent> {
        payloads
            .iter()
            .flat_map(|p| acc.push_payload(p).unwrap())
            .collect()
    }

    fn types(events: &[ProtocolEvent]) -> Vec<&'static str> {
        events.iter().map(ProtocolEvent::event_type).collect()
    }

    #[test]
    fn text_fragments_concatenate_in_order() {
        let mut acc = DeltaAccumulator::new();
        let events = feed(
            &mut acc,
            &[
                chunks::role("chatcmpl-1"),
                chunks::content("chatcmpl-1", "Hello"),
                chunks::content("chatcmpl-1", " world"),
                chunks::finish("chatcmpl-1", "stop"),
            ],
        );
        assert_eq!(
            types(&events),
            vec!["TEXT_MESSAGE_START", "TEXT_MESSAGE_CONTENT", "TEXT_MESSAGE_CONTENT"]
        );

        let (tail, turn) = acc.finish();
        assert_eq!(types(&tail), vec!["TEXT_MESSAGE_END"]);
        let turn = turn.unwrap();
        assert_eq!(turn.message_id.as_str(), "chatcmpl-1");
        assert_eq!(turn.content, "Hello world");
        assert!(!turn.has_tool_calls());
        assert_eq!(turn.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn tool_call_fragments_reassemble() {
        let mut acc = DeltaAccumulator::new();
        let events = feed(
            &mut acc,
            &[
                chunks::tool_call_start("chatcmpl-2", 0, "call_1", "summarize_revisions", "{\"post"),
                chunks::tool_call_args("chatcmpl-2", 0, "_id\":\"42"),
                chunks::tool_call_args("chatcmpl-2", 0, "\"}"),
                chunks::finish("chatcmpl-2", "tool_calls"),
            ],
        );
        assert_eq!(
            types(&events),
            vec![
                "TEXT_MESSAGE_START",
                "TOOL_CALL_START",
                "TOOL_CALL_ARGS",
                "TOOL_CALL_ARGS",
                "TOOL_CALL_ARGS",
                "TOOL_CALL_END",
            ]
        );
        match &events[1] {
            ProtocolEvent::ToolCallStart {
                tool_call_id,
                tool_call_name,
                parent_message_id,
            } => {
                assert_eq!(tool_call_id.as_str(), "call_1");
                assert_eq!(tool_call_name, "summarize_revisions");
                assert_eq!(parent_message_id.as_ref().unwrap().as_str(), "chatcmpl-2");
            }
            other => panic!("expected ToolCallStart, got {other:?}"),
        }

        let (tail, turn) = acc.finish();
        assert_eq!(types(&tail), vec!["TEXT_MESSAGE_END"]);
        let turn = turn.unwrap();
        assert_eq!(turn.tool_calls.len(), 1);
        let call = &turn.tool_calls[0];
        assert_eq!(call.name, "summarize_revisions");
        assert_eq!(call.arguments, r#"{"post_id":"42"}"#);
        assert_eq!(call.status, FragmentStatus::Complete);
        let parsed: Value = serde_json::from_str(&call.arguments).unwrap();
        assert_eq!(parsed["post_id"], "42");
    }

    #[test]
    fn interleaved_indices_stay_separate() {
        let mut acc = DeltaAccumulator::new();
        feed(
            &mut acc,
            &[
                chunks::tool_call_start("m", 0, "call_a", "first", ""),
                chunks::tool_call_start("m", 1, "call_b", "second", "{\"b\":"),
                chunks::tool_call_args("m", 0, "{\"a\":1}"),
                chunks::tool_call_args("m", 1, "2}"),
            ],
        );
        let (tail, turn) = acc.finish();
        assert_eq!(
            types(&tail),
            vec!["TOOL_CALL_END", "TOOL_CALL_END", "TEXT_MESSAGE_END"]
        );
        let turn = turn.unwrap();
        assert_eq!(turn.tool_calls[0].id.as_str(), "call_a");
        assert_eq!(turn.tool_calls[0].arguments, r#"{"a":1}"#);
        assert_eq!(turn.tool_calls[1].id.as_str(), "call_b");
        assert_eq!(turn.tool_calls[1].arguments, r#"{"b":2}"#);
    }

    #[test]
    fn malformed_payload_is_skipped() {
        let mut acc = DeltaAccumulator::new();
        assert!(acc.push_payload("{not json").unwrap().is_empty());
        let events = acc.push_payload(&chunks::content("m", "ok")).unwrap();
        assert_eq!(types(&events), vec!["TEXT_MESSAGE_START", "TEXT_MESSAGE_CONTENT"]);
        assert_eq!(acc.content(), "ok");
    }

    #[test]
    fn in_band_error_is_returned() {
        let mut acc = DeltaAccumulator::new();
        let err = acc
            .push_payload(r#"{"error":{"message":"model overloaded","type":"server_error"}}"#)
            .unwrap_err();
        assert!(matches!(err, GatewayError::StreamInterrupted(msg) if msg == "model overloaded"));
    }

    #[test]
    fn missing_message_id_is_synthesized() {
        let mut acc = DeltaAccumulator::new();
        let events = acc
            .push_payload(r#"{"choices":[{"delta":{"content":"hi"}}]}"#)
            .unwrap();
        assert_eq!(types(&events), vec!["TEXT_MESSAGE_START", "TEXT_MESSAGE_CONTENT"]);
        assert!(acc.message_id().unwrap().as_str().starts_with("msg_"));
    }

    #[test]
    fn empty_round_has_no_turn() {
        let acc = DeltaAccumulator::new();
        let (events, turn) = acc.finish();
        assert!(events.is_empty());
        assert!(turn.is_none());
    }

    #[test]
    fn start_waits_for_late_name() {
        let mut acc = DeltaAccumulator::new();
        let first = acc
            .push_payload(r#"{"id":"m","choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_x"}]}}]}"#)
            .unwrap();
        assert_eq!(types(&first), vec!["TEXT_MESSAGE_START"]);

        let second = acc
            .push_payload(r#"{"id":"m","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"read_state","arguments":"{}"}}]}}]}"#)
            .unwrap();
        assert_eq!(types(&second), vec!["TOOL_CALL_START", "TOOL_CALL_ARGS"]);
        match &second[0] {
            ProtocolEvent::ToolCallStart {
                tool_call_id,
                tool_call_name,
                ..
            } => {
                assert_eq!(tool_call_id.as_str(), "call_x");
                assert_eq!(tool_call_name, "read_state");
            }
            other => panic!("expected ToolCallStart, got {other:?}"),
        }
        assert_eq!(acc.tool_calls()[0].name, "read_state");
        assert_eq!(acc.tool_calls()[0].arguments, "{}");
    }

    #[test]
    fn args_before_name_are_replayed_after_start() {
        let mut acc = DeltaAccumulator::new();
        let events = feed(
            &mut acc,
            &[
                r#"{"id":"m","choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_x","function":{"arguments":"{\"field\":"}}]}}]}"#.to_string(),
                r#"{"id":"m","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"read_state","arguments":"\"status\"}"}}]}}]}"#.to_string(),
            ],
        );
        assert_eq!(
            types(&events),
            vec!["TEXT_MESSAGE_START", "TOOL_CALL_START", "TOOL_CALL_ARGS", "TOOL_CALL_ARGS"]
        );
        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ProtocolEvent::ToolCallArgs { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec![r#"{"field":"#, r#""status"}"#]);
    }

    #[test]
    fn nameless_call_is_announced_before_end() {
        let mut acc = DeltaAccumulator::new();
        feed(
            &mut acc,
            &[r#"{"id":"m","choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_x","function":{"arguments":"{}"}}]}}]}"#.to_string()],
        );
        let (tail, turn) = acc.finish();
        assert_eq!(
            types(&tail),
            vec!["TOOL_CALL_START", "TOOL_CALL_ARGS", "TOOL_CALL_END", "TEXT_MESSAGE_END"]
        );
        assert_eq!(turn.unwrap().tool_calls[0].name, "");
    }

    #[test]
    fn indexless_fragment_after_explicit_index_opens_new_call() {
        let mut acc = DeltaAccumulator::new();
        feed(
            &mut acc,
            &[
                chunks::tool_call_start("m", 1, "call_a", "first", "{}"),
                r#"{"id":"m","choices":[{"delta":{"tool_calls":[{"id":"call_b","function":{"name":"second","arguments":"{}"}}]}}]}"#.to_string(),
            ],
        );
        let calls = acc.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id.as_str(), "call_a");
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[1].id.as_str(), "call_b");
        assert_eq!(calls[1].name, "second");
        assert_eq!(calls[1].index, 2);
    }

    #[test]
    fn indexless_fragment_skips_past_highest_index() {
        let mut acc = DeltaAccumulator::new();
        feed(
            &mut acc,
            &[
                chunks::tool_call_start("m", 2, "call_a", "first", "{}"),
                r#"{"id":"m","choices":[{"delta":{"tool_calls":[{"id":"call_b","function":{"name":"second"}}]}}]}"#.to_string(),
            ],
        );
        let calls = acc.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].id.as_str(), "call_b");
        assert_eq!(calls[1].index, 3);
    }

    #[test]
    fn fragment_without_id_gets_generated_id() {
        let mut acc = DeltaAccumulator::new();
        let events = acc
            .push_payload(r#"{"id":"m","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"f","arguments":"{}"}}]}}]}"#)
            .unwrap();
        assert_eq!(types(&events), vec!["TEXT_MESSAGE_START", "TOOL_CALL_START", "TOOL_CALL_ARGS"]);
        assert!(acc.tool_calls()[0].id.as_str().starts_with("call_"));
    }

    #[test]
    fn to_message_carries_manifest() {
        let mut acc = DeltaAccumulator::new();
        feed(
            &mut acc,
            &[
                chunks::content("m", "checking"),
                chunks::tool_call_start("m", 0, "call_1", "lookup", "{}"),
            ],
        );
        let (_, turn) = acc.finish();
        let msg = turn.unwrap().to_message();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "checking");
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].arguments, "{}");
    }
}
