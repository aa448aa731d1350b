//! # heval client: encrypted model evaluation SDK
//!
//! A client holds an [`EncryptionContext`] with the only copy of its secret
//! key. It sends the public projection of that context together with an
//! encrypted vector to a server, receives an encrypted result, and decrypts
//! locally. The server never sees plaintext or the secret key.
//!
//! ## Quick start
//!
//! ```ignore
//! let params = CkksParams::default_chain()?;
//! let ctx = EncryptionContext::generate(params, ContextOptions::default(), &mut rand::thread_rng())?;
//! let ct = ctx.encrypt(&[0.1; 16])?;
//!
//! let client = EvalClient::new("http://127.0.0.1:8000");
//! let result = client.evaluate("LinearLayer", None, &ctx, &ct)?;
//! let plain = ctx.decrypt(&result)?;
//! ```

pub mod ckks;
pub mod codec;
pub mod context;
pub mod protocol;

use std::time::Duration;

use thiserror::Error;

pub use crate::ckks::{Ciphertext, CkksParams};
pub use crate::context::{ContextOptions, DecryptionError, EncryptionContext, PublicContext};

use crate::codec::CodecError;
use crate::protocol::{
    ErrorBody, ErrorKind, EvaluationRequest, EvaluationResponse, ModelDescriptor, PingResponse,
};

/// Default request timeout. Evaluation of large contexts is slow.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Largest response body the client will read (64 MiB).
const MAX_RESPONSE_BYTES: u64 = 64 * 1024 * 1024;

/// Errors surfaced by [`EvalClient`] and local decryption.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server could not be reached or the transfer failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server answered with a classified error.
    #[error("{kind}: {detail}")]
    Server { kind: ErrorKind, detail: String },

    #[error("local decryption failed: {0}")]
    LocalDecryption(#[from] DecryptionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The server answered with something that is not part of the protocol.
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Error category, for exit codes and logging.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connection(_) => ErrorKind::ConnectionError,
            ClientError::Server { kind, .. } => *kind,
            ClientError::LocalDecryption(_) => ErrorKind::LocalDecryptionError,
            ClientError::Codec(CodecError::MalformedCiphertext(_)) => ErrorKind::MalformedCiphertext,
            ClientError::Codec(_) => ErrorKind::MalformedContext,
            ClientError::Protocol(_) => ErrorKind::Internal,
        }
    }

    /// Only transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Connection(_))
    }
}

/// HTTP client for an evaluation server.
pub struct EvalClient {
    base_url: String,
    agent: ureq::Agent,
}

impl EvalClient {
    /// Client for `base_url` (e.g. "http://127.0.0.1:8000") with the default timeout.
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// True when the server answers `GET /ping` with "pong".
    pub fn ping(&self) -> bool {
        match self.get::<PingResponse>("/ping") {
            Ok(resp) => resp.message == "pong",
            Err(e) => {
                log::debug!("ping {} failed: {}", self.base_url, e);
                false
            }
        }
    }

    pub fn list_models(&self) -> Result<Vec<ModelDescriptor>, ClientError> {
        self.get("/models")
    }

    pub fn model_info(&self, model_name: &str) -> Result<ModelDescriptor, ClientError> {
        self.get(&format!("/models/{}", urlencoding::encode(model_name)))
    }

    /// Evaluate `model_name` on `ct`. Only the public part of `ctx` is sent;
    /// the result comes back encrypted and is not decrypted here.
    pub fn evaluate(
        &self,
        model_name: &str,
        version: Option<&str>,
        ctx: &EncryptionContext,
        ct: &Ciphertext,
    ) -> Result<Ciphertext, ClientError> {
        let request = EvaluationRequest {
            model_name: model_name.to_string(),
            version: version.map(str::to_string),
            context: codec::encode_context(ctx, false)?,
            ciphertext: codec::encode_ciphertext(ct)?,
        };
        log::debug!(
            "POST /eval model={} version={:?} context={}B ciphertext={}B",
            model_name,
            version,
            request.context.len(),
            request.ciphertext.len()
        );
        let response: EvaluationResponse = self.post("/eval", &request)?;
        Ok(codec::decode_ciphertext(&response.ciphertext)?)
    }

    fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        read_response(resp)
    }

    fn post<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let json = serde_json::to_string(body).map_err(|e| ClientError::Protocol(e.to_string()))?;
        let resp = self
            .agent
            .post(&url)
            .content_type("application/json")
            .send(&json)
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        read_response(resp)
    }
}

fn read_response<T: serde::de::DeserializeOwned>(
    mut resp: ureq::http::Response<ureq::Body>,
) -> Result<T, ClientError> {
    let status = resp.status().as_u16();
    let text = resp
        .body_mut()
        .with_config()
        .limit(MAX_RESPONSE_BYTES)
        .read_to_string()
        .map_err(|e| ClientError::Connection(e.to_string()))?;

    if (200..300).contains(&status) {
        return serde_json::from_str(&text)
            .map_err(|e| ClientError::Protocol(format!("HTTP {}: {}", status, e)));
    }
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => Err(ClientError::Server {
            kind: body.kind,
            detail: body.detail,
        }),
        Err(_) => Err(ClientError::Protocol(format!("HTTP {}: {}", status, text))),
    }
}
