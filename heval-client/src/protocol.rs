//! Network protocol types for client-server evaluation.
//!
//! Requests and responses are JSON. Context and ciphertext blobs (see
//! [`crate::codec`]) travel as hex strings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error categories shared by the server and its clients.
///
/// The first nine are produced by the server; `ConnectionError` and
/// `LocalDecryptionError` only ever arise on the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Request structure invalid (missing fields, bad JSON or hex).
    BadRequest,
    /// Context blob could not be decoded or is structurally invalid.
    MalformedContext,
    /// Ciphertext blob could not be decoded or is structurally invalid.
    MalformedCiphertext,
    /// Ciphertext and context disagree on scheme, parameters or key.
    SchemeMismatch,
    /// Secret-key material was submitted to the server.
    SecurityViolation,
    UnknownModel,
    UnknownVersion,
    /// The model failed on this input.
    EvaluationError,
    /// Server-side fault unrelated to the request contents.
    Internal,
    /// Transport failure reaching the server.
    ConnectionError,
    /// Result could not be decrypted locally.
    LocalDecryptionError,
}

impl ErrorKind {
    /// HTTP status the server answers with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::BadRequest | ErrorKind::MalformedContext | ErrorKind::MalformedCiphertext => 400,
            ErrorKind::SecurityViolation => 403,
            ErrorKind::UnknownModel | ErrorKind::UnknownVersion => 404,
            ErrorKind::SchemeMismatch => 409,
            ErrorKind::EvaluationError => 422,
            ErrorKind::Internal => 500,
            ErrorKind::ConnectionError => 503,
            ErrorKind::LocalDecryptionError => 500,
        }
    }

    /// Process exit code used by the command-line client.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::BadRequest => 10,
            ErrorKind::MalformedContext => 11,
            ErrorKind::MalformedCiphertext => 12,
            ErrorKind::SchemeMismatch => 13,
            ErrorKind::SecurityViolation => 14,
            ErrorKind::UnknownModel => 15,
            ErrorKind::UnknownVersion => 16,
            ErrorKind::EvaluationError => 17,
            ErrorKind::Internal => 18,
            ErrorKind::ConnectionError => 20,
            ErrorKind::LocalDecryptionError => 21,
        }
    }

    /// Whether resending the identical request yields the identical error.
    pub fn is_deterministic(self) -> bool {
        !matches!(self, ErrorKind::Internal | ErrorKind::ConnectionError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::MalformedContext => "MalformedContext",
            ErrorKind::MalformedCiphertext => "MalformedCiphertext",
            ErrorKind::SchemeMismatch => "SchemeMismatch",
            ErrorKind::SecurityViolation => "SecurityViolation",
            ErrorKind::UnknownModel => "UnknownModel",
            ErrorKind::UnknownVersion => "UnknownVersion",
            ErrorKind::EvaluationError => "EvaluationError",
            ErrorKind::Internal => "Internal",
            ErrorKind::ConnectionError => "ConnectionError",
            ErrorKind::LocalDecryptionError => "LocalDecryptionError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluation request from client to server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub model_name: String,
    /// Model version; the registered default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Public-only context blob.
    #[serde(with = "hex_bytes")]
    pub context: Vec<u8>,
    /// Ciphertext blob.
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Successful evaluation result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResponse {
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Error body returned with every non-2xx response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub detail: String,
}

/// Public description of a registered model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_name: String,
    pub description: String,
    pub versions: Vec<String>,
    pub default_version: String,
}

/// `GET /ping` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub message: String,
}

/// Serde helper storing `Vec<u8>` as a lowercase hex string.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        hex::decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
