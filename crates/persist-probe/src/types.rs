use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

pub const DEFAULT_MAX_ITERATIONS: u32 = 50;
pub const DEFAULT_WORKING_DIR: &str = "/work";

/// Login identity exchanged once for an [`AuthToken`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    identifier: String,
    secret: String,
}

impl Credentials {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Opaque bearer token. Expiry is the server's business.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Server-issued session identifier. The probe only ever holds a reference to
/// the session; the server owns it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body of the session-creation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    pub max_iterations: u32,
    pub tools_approved: bool,
    pub working_dir: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tools_approved: true,
            working_dir: DEFAULT_WORKING_DIR.to_string(),
        }
    }
}

/// Message author. Roles the server adds later are kept verbatim in `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
            Self::Other(role) => role,
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::Other("unknown".to_string())
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        match value {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            "system" => Self::System,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from(raw.as_str()))
    }
}

/// One entry of the message list posted to the agent stream endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub role: Role,
    pub content: String,
}

impl OutgoingMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A decoded server-sent event: the `type` discriminator plus the raw object.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamEvent {
    pub event_type: String,
    pub payload: Value,
}

impl StreamEvent {
    /// Parses one data payload. Anything but a JSON object is rejected; an
    /// object without a string `type` is kept as `unknown`.
    pub fn from_json(raw: &str) -> Result<Self, String> {
        let payload: Value = serde_json::from_str(raw).map_err(|error| error.to_string())?;
        let Some(object) = payload.as_object() else {
            return Err(format!("expected a JSON object, got {}", json_kind(&payload)));
        };
        let event_type = object
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Ok(Self {
            event_type,
            payload,
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMessage {
    #[serde(default)]
    pub message: MessageBody,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl SnapshotMessage {
    pub fn role(&self) -> &Role {
        &self.message.role
    }

    /// First `max_chars` characters of the content, rendering non-string
    /// content as compact JSON.
    pub fn content_preview(&self, max_chars: usize) -> String {
        let text = match &self.message.content {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        text.chars().take(max_chars).collect()
    }
}

/// Point-in-time read of a session's message log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub messages: Vec<SnapshotMessage>,
}

impl SessionSnapshot {
    pub fn roles(&self) -> Vec<Role> {
        self.messages
            .iter()
            .map(|message| message.role().clone())
            .collect()
    }

    pub fn count_role(&self, role: &Role) -> usize {
        self.messages
            .iter()
            .filter(|message| message.role() == role)
            .count()
    }
}
