// worker/protocol.rs
//
// Line-delimited JSON codec for the worker wire protocol.
//
// Every message is a flat JSON object on its own line with a `type`
// discriminator, an optional correlation `id`, and type-specific fields.
// This module performs no I/O.

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Inbound/outbound message type tags
pub mod kinds {
    pub const READY: &str = "ready";
    pub const PROGRESS: &str = "progress";
    pub const ERROR: &str = "error";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const LOAD_MODEL: &str = "loadModel";
    pub const MODEL_LOADED: &str = "modelLoaded";
    pub const LOAD_DIARIZATION_MODEL: &str = "loadDiarizationModel";
    pub const DIARIZATION_MODEL_LOADED: &str = "diarizationModelLoaded";
    pub const TRANSCRIBE: &str = "transcribe";
    pub const TRANSCRIPTION_RESULT: &str = "transcriptionResult";
    pub const DIARIZE: &str = "diarize";
    pub const DIARIZATION_RESULT: &str = "diarizationResult";
}

/// Errors produced while encoding or decoding a single line
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message line: {0}")]
    Malformed(String),
    #[error("message has no `type` field: {0}")]
    MissingType(String),
    #[error("unrecognized message type `{0}`")]
    UnknownType(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// One protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub kind: String,
    pub id: Option<String>,
    pub payload: Map<String, Value>,
}

impl WireMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            payload: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Add a payload field. `type` and `id` are reserved and ignored here.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        if key != "type" && key != "id" {
            self.payload.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(|v| v.as_f64())
    }

    /// Build a message from a decoded JSON object
    pub fn from_object(mut object: Map<String, Value>) -> Result<Self, ProtocolError> {
        let kind = match object.remove("type") {
            Some(Value::String(kind)) => kind,
            Some(other) => {
                return Err(ProtocolError::MissingType(format!("non-string type {}", other)))
            }
            None => return Err(ProtocolError::MissingType(Value::Object(object).to_string())),
        };

        // Workers echo ids back verbatim; tolerate numeric ids as well
        let id = match object.remove("id") {
            Some(Value::String(id)) => Some(id),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Ok(Self {
            kind,
            id,
            payload: object,
        })
    }

    fn to_object(&self) -> Map<String, Value> {
        let mut object = Map::with_capacity(self.payload.len() + 2);
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        if let Some(ref id) = self.id {
            object.insert("id".to_string(), Value::String(id.clone()));
        }
        for (key, value) in &self.payload {
            object.insert(key.clone(), value.clone());
        }
        object
    }
}

/// Classification of messages the controller understands
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Startup handshake
    Ready,
    /// Non-terminal progress for a request
    Progress {
        id: Option<String>,
        percent: Option<f64>,
        stage: String,
        message: Option<String>,
    },
    /// Terminal failure (id may be missing for worker-level parse errors)
    Error { id: Option<String>, error: String },
    /// Terminal success of any recognized result type
    Response { id: Option<String> },
}

/// Classify a decoded message. Unknown types are a protocol error.
pub fn classify(message: &WireMessage) -> Result<Inbound, ProtocolError> {
    match message.kind.as_str() {
        kinds::READY => Ok(Inbound::Ready),
        kinds::PROGRESS => {
            // The worker reports -1 for indeterminate phases (e.g. downloads)
            let percent = message.f64_field("percent").filter(|p| *p >= 0.0);
            let stage = message.str_field("stage").unwrap_or("processing").to_string();
            Ok(Inbound::Progress {
                id: message.id.clone(),
                percent,
                stage,
                message: message.str_field("message").map(str::to_string),
            })
        }
        kinds::ERROR => Ok(Inbound::Error {
            id: message.id.clone(),
            error: message
                .str_field("error")
                .unwrap_or("unknown worker error")
                .to_string(),
        }),
        kinds::PONG
        | kinds::MODEL_LOADED
        | kinds::DIARIZATION_MODEL_LOADED
        | kinds::TRANSCRIPTION_RESULT
        | kinds::DIARIZATION_RESULT => Ok(Inbound::Response {
            id: message.id.clone(),
        }),
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

/// Serialize a message to one newline-terminated line
pub fn encode(message: &WireMessage) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(&Value::Object(message.to_object()))
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Parse one complete line (without terminator)
pub fn decode_line(line: &str) -> Result<WireMessage, ProtocolError> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(object)) => WireMessage::from_object(object),
        Ok(_) => Err(ProtocolError::Malformed(line.to_string())),
        Err(e) => Err(ProtocolError::Malformed(format!("{} ({})", line, e))),
    }
}

/// Incremental decoder that buffers partial lines across reads
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns one result per complete non-empty line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<WireMessage, ProtocolError>> {
        self.buffer.extend_from_slice(bytes);

        let mut results = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = self.buffer[consumed..].iter().position(|b| *b == b'\n') {
            let line_end = consumed + offset;
            let raw = &self.buffer[consumed..line_end];
            consumed = line_end + 1;

            let line = String::from_utf8_lossy(raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            results.push(decode_line(line));
        }

        self.buffer.drain(..consumed);
        results
    }

    /// Decode whatever is left once the stream has closed
    pub fn finish(&mut self) -> Option<Result<WireMessage, ProtocolError>> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        let line = line.trim();
        if line.is_empty() {
            None
        } else {
            Some(decode_line(line))
        }
    }

    /// Number of buffered bytes not yet forming a complete line
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// Generates correlation ids that are unique for the lifetime of the generator
#[derive(Debug)]
pub struct RequestIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        // A per-instance prefix keeps ids unique across controller restarts
        let prefix = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            prefix,
            counter: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.prefix, n)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
