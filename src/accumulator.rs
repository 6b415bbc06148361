//! Reconstruction of a complete chat completion from streamed chunks
//!
//! A [`StreamAccumulator`] lives for exactly one streamed request. Chunks are fed in the order
//! they are forwarded to the client, and the accumulator is consumed by [`finalize`] once the
//! stream ends, the engine fails, or the client goes away. Consuming it by value means a stream
//! can only ever produce one outcome.
//!
//! [`finalize`]: StreamAccumulator::finalize
use crate::pricing::Usage;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Where the accumulator is in its lifecycle. Finalizing and closing happen inside
/// [`StreamAccumulator::finalize`], after which the accumulator no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    Idle,
    Accumulating,
    /// A terminal error was observed; further chunks are ignored.
    Failed,
}

/// What a finished stream should be recorded as.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Success { response: Value, usage: Usage },
    /// Carries whatever usage had been reported before the failure.
    Failure { message: String, usage: Usage },
}

#[derive(Debug, Default)]
struct ToolCallBuffer {
    id: Option<String>,
    kind: Option<String>,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct ChoiceBuffer {
    role: Option<String>,
    content: String,
    finish_reason: Option<Value>,
    tool_calls: BTreeMap<u64, ToolCallBuffer>,
}

impl ChoiceBuffer {
    fn apply(&mut self, choice: &Value) {
        let delta = &choice["delta"];
        if let Some(role) = delta.get("role").and_then(Value::as_str) {
            self.role = Some(role.to_string());
        }
        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            self.content.push_str(content);
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for (position, call) in calls.iter().enumerate() {
                let index = call
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position as u64);
                let buffer = self.tool_calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    buffer.id = Some(id.to_string());
                }
                if let Some(kind) = call.get("type").and_then(Value::as_str) {
                    buffer.kind = Some(kind.to_string());
                }
                let function = &call["function"];
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    buffer.name.push_str(name);
                }
                if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                    buffer.arguments.push_str(args);
                }
            }
        }
        if let Some(reason) = choice.get("finish_reason").filter(|r| !r.is_null()) {
            self.finish_reason = Some(reason.clone());
        }
    }

    fn into_choice(self, index: u64) -> Value {
        let mut message = Map::new();
        message.insert(
            "role".into(),
            Value::String(self.role.unwrap_or_else(|| "assistant".to_string())),
        );
        message.insert("content".into(), Value::String(self.content));
        if !self.tool_calls.is_empty() {
            let calls = self
                .tool_calls
                .into_values()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": call.kind.unwrap_or_else(|| "function".to_string()),
                        "function": {"name": call.name, "arguments": call.arguments},
                    })
                })
                .collect();
            message.insert("tool_calls".into(), Value::Array(calls));
        }
        json!({
            "index": index,
            "message": message,
            "finish_reason": self.finish_reason.unwrap_or(Value::Null),
        })
    }
}

#[derive(Debug)]
pub struct StreamAccumulator {
    model: String,
    id: Option<String>,
    created: Option<i64>,
    choices: BTreeMap<u64, ChoiceBuffer>,
    usage: Option<Value>,
    error: Option<String>,
    chunks: usize,
}

impl StreamAccumulator {
    /// `model` is used for the synthetic response when no chunk names one.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: None,
            created: None,
            choices: BTreeMap::new(),
            usage: None,
            error: None,
            chunks: 0,
        }
    }

    pub fn state(&self) -> AccumulatorState {
        match (&self.error, self.chunks) {
            (Some(_), _) => AccumulatorState::Failed,
            (None, 0) => AccumulatorState::Idle,
            (None, _) => AccumulatorState::Accumulating,
        }
    }

    /// Number of chunks fed so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Fold one chunk into the running state.
    pub fn feed(&mut self, chunk: &Value) {
        if self.error.is_some() {
            return;
        }
        self.chunks += 1;

        if let Some(id) = chunk.get("id").and_then(Value::as_str) {
            self.id = Some(id.to_string());
        }
        if let Some(model) = chunk.get("model").and_then(Value::as_str) {
            self.model = model.to_string();
        }
        if let Some(created) = chunk.get("created").and_then(Value::as_i64) {
            self.created = Some(created);
        }
        if let Some(choices) = chunk.get("choices").and_then(Value::as_array) {
            for (position, choice) in choices.iter().enumerate() {
                let index = choice
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position as u64);
                self.choices.entry(index).or_default().apply(choice);
            }
        }
        // Last write wins; providers usually only attach usage to the final chunk
        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(usage.clone());
        }
    }

    /// Mark the stream as failed. Only the first reason is kept.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(reason.into());
        }
    }

    /// The content buffered so far for one choice.
    pub fn content(&self, index: u64) -> Option<&str> {
        self.choices.get(&index).map(|c| c.content.as_str())
    }

    fn usage(&self) -> Usage {
        self.usage
            .as_ref()
            .and_then(|u| serde_json::from_value(u.clone()).ok())
            .unwrap_or_default()
    }

    /// Close the stream and produce its single outcome.
    pub fn finalize(self) -> StreamOutcome {
        let usage = self.usage();
        if let Some(message) = self.error {
            return StreamOutcome::Failure { message, usage };
        }

        let mut choices = self.choices;
        if choices.is_empty() {
            choices.insert(0, ChoiceBuffer::default());
        }
        let choices: Vec<Value> = choices
            .into_iter()
            .map(|(index, buffer)| buffer.into_choice(index))
            .collect();

        let response = json!({
            "id": self.id,
            "object": "chat.completion",
            "created": self.created.unwrap_or_else(|| chrono::Utc::now().timestamp()),
            "model": self.model,
            "choices": choices,
            "usage": self.usage.unwrap_or_else(|| json!(Usage::default())),
        });
        StreamOutcome::Success { response, usage }
    }
}
