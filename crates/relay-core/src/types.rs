use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RelayError, Result};

/// The nine canonical HTTP verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Connect,
    Trace,
}

impl Method {
    /// Lowercase name, the form handed to transports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Post => "post",
            Self::Put => "put",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::Head => "head",
            Self::Options => "options",
            Self::Connect => "connect",
            Self::Trace => "trace",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "post" => Ok(Self::Post),
            "put" => Ok(Self::Put),
            "patch" => Ok(Self::Patch),
            "delete" => Ok(Self::Delete),
            "head" => Ok(Self::Head),
            "options" => Ok(Self::Options),
            "connect" => Ok(Self::Connect),
            "trace" => Ok(Self::Trace),
            other => Err(RelayError::Config(format!("unknown HTTP verb: {}", other))),
        }
    }
}

impl Serialize for Method {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A concrete request handed to an adapter.
///
/// `extra` holds transport-specific fields the engine passes through
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    pub target: String,
    #[serde(default, alias = "method")]
    pub verb: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Extra flag asking an adapter for a streamed body instead of a read one.
pub const STREAM_BODY: &str = "stream";

impl RequestConfig {
    pub fn new(verb: Method, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            verb,
            payload: None,
            headers: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::Get, target)
    }

    pub fn post(target: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(Method::Post, target).with_payload(payload)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set a transport-specific field.
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Ask the adapter to hand back the body as a byte stream.
    pub fn streamed(self) -> Self {
        self.with_extra(STREAM_BODY, serde_json::Value::Bool(true))
    }

    /// Read a boolean transport-specific field, `false` when absent.
    pub fn extra_flag(&self, key: &str) -> bool {
        self.extra
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// The value a stage produces and later stages observe.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Json(serde_json::Value),
    Text(String),
    Bytes(Bytes),
    List(Vec<Output>),
}

impl Output {
    pub fn null() -> Self {
        Self::Json(serde_json::Value::Null)
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Output]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Render as JSON. Bytes that are not UTF-8 become an array of numbers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Json(v) => v.clone(),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => serde_json::Value::String(s.to_string()),
                Err(_) => serde_json::Value::Array(
                    b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
                ),
            },
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Output::to_json).collect())
            }
        }
    }
}

impl From<serde_json::Value> for Output {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<String> for Output {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Output {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Bytes> for Output {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<Output>> for Output {
    fn from(items: Vec<Output>) -> Self {
        Self::List(items)
    }
}

impl Serialize for Output {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// A raw response body as a stream of byte chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Body of a transport response.
pub enum ResponseBody {
    /// Fully read and decoded by the adapter.
    Complete(Output),
    /// Not yet read.
    Stream(ByteStream),
    /// Read by the stream processor; only the side effects remain.
    Consumed,
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete(out) => f.debug_tuple("Complete").field(out).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Consumed => f.write_str("Consumed"),
        }
    }
}

/// What an adapter returns for one call.
#[derive(Debug)]
pub struct Response {
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

impl Response {
    pub fn complete(output: impl Into<Output>) -> Self {
        Self {
            status: None,
            headers: BTreeMap::new(),
            body: ResponseBody::Complete(output.into()),
        }
    }

    pub fn streaming(stream: ByteStream) -> Self {
        Self {
            status: None,
            headers: BTreeMap::new(),
            body: ResponseBody::Stream(stream),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.body, ResponseBody::Stream(_))
    }

    /// Summary of status and headers, used when a consumed response is
    /// narrowed to an output.
    pub fn meta(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status,
            "headers": self.headers,
        })
    }
}

/// One piece of a streamed body, in the representation the stream policy
/// asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Bytes(Bytes),
    Text(String),
}

impl Chunk {
    pub fn len(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::Text(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(b) => b,
            Self::Text(s) => s.as_bytes(),
        }
    }
}

impl From<Chunk> for Output {
    fn from(c: Chunk) -> Self {
        match c {
            Chunk::Bytes(b) => Self::Bytes(b),
            Chunk::Text(s) => Self::Text(s),
        }
    }
}

/// Position of a chunk within its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    pub index: usize,
    pub is_last: bool,
    /// Raw bytes read from the stream so far, including this chunk.
    pub cumulative_bytes: usize,
}
