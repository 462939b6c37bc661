//! Message codecs selected by content type

use http::header::CONTENT_TYPE;
use http::HeaderMap;
use prost::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tonic::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Json,
    Proto,
}

/// Content type the request carried, or why it was refused
#[derive(Debug)]
pub struct UnsupportedMediaType(pub String);

impl Codec {
    /// Codec for a unary request (`application/json`, `application/proto`)
    pub fn for_unary(headers: &HeaderMap) -> Result<Self, UnsupportedMediaType> {
        match media_type(headers).as_str() {
            "application/json" => Ok(Self::Json),
            "application/proto" => Ok(Self::Proto),
            other => Err(UnsupportedMediaType(other.to_string())),
        }
    }

    /// Codec for a streaming request (`application/connect+json`, `application/connect+proto`)
    pub fn for_stream(headers: &HeaderMap) -> Result<Self, UnsupportedMediaType> {
        match media_type(headers).as_str() {
            "application/connect+json" => Ok(Self::Json),
            "application/connect+proto" => Ok(Self::Proto),
            other => Err(UnsupportedMediaType(other.to_string())),
        }
    }

    pub const fn unary_content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Proto => "application/proto",
        }
    }

    pub const fn stream_content_type(self) -> &'static str {
        match self {
            Self::Json => "application/connect+json",
            Self::Proto => "application/connect+proto",
        }
    }

    pub fn decode<M>(self, bytes: &[u8]) -> Result<M, Status>
    where
        M: Message + DeserializeOwned + Default,
    {
        match self {
            // an empty JSON body is an empty message
            Self::Json if bytes.iter().all(u8::is_ascii_whitespace) => Ok(M::default()),
            Self::Json => serde_json::from_slice(bytes)
                .map_err(|e| Status::invalid_argument(format!("invalid JSON message: {e}"))),
            Self::Proto => M::decode(bytes)
                .map_err(|e| Status::invalid_argument(format!("invalid protobuf message: {e}"))),
        }
    }

    pub fn encode<M>(self, msg: &M) -> Result<Vec<u8>, Status>
    where
        M: Message + Serialize,
    {
        match self {
            Self::Json => serde_json::to_vec(msg).map_err(|e| Status::internal(format!("failed to encode JSON: {e}"))),
            Self::Proto => Ok(msg.encode_to_vec()),
        }
    }
}

fn media_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default()
}
