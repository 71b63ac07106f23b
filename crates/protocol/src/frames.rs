use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

// ── Error shape ──────────────────────────────────────────────────────────────

/// Structured error carried in a failed response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Inbound request: `{type:"request", id, method, params}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Reply correlated by request id: `{type:"res", id, ok, payload?, error?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: &str, payload: Value) -> Self {
        Self {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: &str, error: ErrorShape) -> Self {
        Self {
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Version stamps attached to state events so consumers can detect
/// staleness after a dropped broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<u64>,
}

/// Server push: `{type:"event", event, payload, stateVersion?, seq?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(
        default,
        rename = "stateVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub state_version: Option<StateVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            state_version: None,
            seq: None,
        }
    }

    pub fn with_state_version(mut self, version: StateVersion) -> Self {
        self.state_version = Some(version);
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }
}

/// One self-contained wire message, discriminated by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    Event(EventFrame),
}

impl From<RequestFrame> for Frame {
    fn from(f: RequestFrame) -> Self {
        Self::Request(f)
    }
}

impl From<ResponseFrame> for Frame {
    fn from(f: ResponseFrame) -> Self {
        Self::Response(f)
    }
}

impl From<EventFrame> for Frame {
    fn from(f: EventFrame) -> Self {
        Self::Event(f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("request frame missing id")]
    MissingId,
    #[error("request frame missing method")]
    MissingMethod,
}

impl Frame {
    /// Parse and structurally validate one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let frame: Self = serde_json::from_str(text)?;
        if let Self::Request(req) = &frame {
            if req.id.is_empty() {
                return Err(FrameError::MissingId);
            }
            if req.method.is_empty() {
                return Err(FrameError::MissingMethod);
            }
        }
        Ok(frame)
    }

    /// Serialize for one physical send. Frames are plain data; failure
    /// here would mean a non-serializable `Value`, which serde_json
    /// cannot produce, so the fallback is never observed in practice.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Best-effort extraction of a request id from malformed input, so the
/// session can prefer an error reply over a silent drop.
pub fn recover_request_id(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
