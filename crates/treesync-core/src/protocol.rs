//! Wire protocol
//!
//! Every logical message is one [`Envelope`], encoded as a JSON document:
//!
//! ```text
//! {"type": "file_operation", "payload": {"path": "a.txt", "op": "write", "content": "QQ==", "is_dir": false}}
//! ```
//!
//! | type             | direction        | payload                    |
//! |------------------|------------------|----------------------------|
//! | `manifest`       | server → client  | [`ManifestMessage`]        |
//! | `file_request`   | client → server  | [`FileRequestMessage`]     |
//! | `file_content`   | server → client  | [`FileContentMessage`]     |
//! | `file_operation` | both             | [`FileOperation`]          |
//!
//! File content is carried as standard base64 so arbitrary bytes survive the
//! JSON encoding. Whole files travel in a single message; there is no
//! chunking, so very large files are bounded by memory.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::Manifest;

/// Envelope `type` values, in declaration order of [`Envelope`]
pub const MESSAGE_TYPES: &[&str] = &["manifest", "file_request", "file_content", "file_operation"];

/// Errors produced by the envelope codec
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The document is not a valid envelope
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The envelope is well-formed but its `type` is not one we know
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Serialization failed
    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// One logical protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    Manifest(ManifestMessage),
    FileRequest(FileRequestMessage),
    FileContent(FileContentMessage),
    FileOperation(FileOperation),
}

/// Full manifest of the server tree, sent once per accepted connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMessage {
    pub files: Manifest,
}

/// Paths a client wants the server to send, in the order they should arrive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequestMessage {
    pub paths: Vec<String>,
}

/// Content of one requested file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContentMessage {
    pub path: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

/// Kind of mutation carried by a [`FileOperation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Write,
    Remove,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Write => write!(f, "write"),
            OperationKind::Remove => write!(f, "remove"),
        }
    }
}

/// One atomic local mutation, exchanged once steady-state sync has begun
///
/// `is_dir` is only ever set together with [`OperationKind::Write`]; removing a
/// directory is expressed as a plain `Remove` of its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    pub path: String,
    pub op: OperationKind,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_opt_bytes"
    )]
    pub content: Option<Vec<u8>>,
    #[serde(default)]
    pub is_dir: bool,
}

impl FileOperation {
    /// Write `content` to the file at `path`.
    pub fn write(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            op: OperationKind::Write,
            content: Some(content),
            is_dir: false,
        }
    }

    /// Create the directory at `path`.
    pub fn create_dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: OperationKind::Write,
            content: None,
            is_dir: true,
        }
    }

    /// Remove the file or directory at `path`.
    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: OperationKind::Remove,
            content: None,
            is_dir: false,
        }
    }
}

impl Envelope {
    /// Short name of the message kind, as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Manifest(_) => MESSAGE_TYPES[0],
            Envelope::FileRequest(_) => MESSAGE_TYPES[1],
            Envelope::FileContent(_) => MESSAGE_TYPES[2],
            Envelope::FileOperation(_) => MESSAGE_TYPES[3],
        }
    }

    /// Serializes the envelope to its JSON wire form.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parses an envelope from its JSON wire form.
    ///
    /// # Errors
    /// - [`ProtocolError::UnknownType`] if the document is an object with a
    ///   string `type` that is not a known message kind
    /// - [`ProtocolError::Malformed`] for anything else that fails to decode
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|err| {
            #[derive(Deserialize)]
            struct Header {
                #[serde(rename = "type")]
                kind: String,
            }

            match serde_json::from_str::<Header>(text) {
                Ok(header) if !MESSAGE_TYPES.contains(&header.kind.as_str()) => {
                    ProtocolError::UnknownType(header.kind)
                }
                _ => ProtocolError::Malformed(err),
            }
        })
    }
}

impl From<FileOperation> for Envelope {
    fn from(op: FileOperation) -> Self {
        Envelope::FileOperation(op)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_opt_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
