//! Evaluation pipeline.
//!
//! Each request moves through
//! `Received → Validated → Resolved → Evaluated → Responded`; any step may
//! short-circuit to a classified [`ServiceError`]. Everything that can be
//! checked on public metadata is checked before a model runs.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use heval_client::codec::{self, CodecError};
use heval_client::context::Incompatibility;
use heval_client::protocol::{ErrorBody, ErrorKind, EvaluationRequest, EvaluationResponse, ModelDescriptor};

use crate::registry::{ModelRegistry, RegistryError};

/// Pipeline position of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Resolved,
    Evaluated,
    Responded,
}

/// A request that failed, the kind it failed with, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub detail: String,
    /// Last stage the request reached.
    pub stage: Stage,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>, stage: Stage) -> Self {
        Self {
            kind,
            detail: detail.into(),
            stage,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind,
            detail: self.detail.clone(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for ServiceError {}

impl From<RegistryError> for ServiceError {
    fn from(e: RegistryError) -> Self {
        let kind = match &e {
            RegistryError::UnknownModel(_) => ErrorKind::UnknownModel,
            RegistryError::UnknownVersion { .. } => ErrorKind::UnknownVersion,
            _ => ErrorKind::Internal,
        };
        ServiceError::new(kind, e.to_string(), Stage::Validated)
    }
}

/// Stateless request handler around a shared registry.
pub struct EvaluationService {
    registry: Arc<ModelRegistry>,
}

impl EvaluationService {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn list_models(&self) -> Vec<ModelDescriptor> {
        self.registry.list()
    }

    pub fn describe_model(&self, name: &str) -> Result<ModelDescriptor, ServiceError> {
        self.registry
            .describe(name)
            .map_err(|e| ServiceError::new(ErrorKind::UnknownModel, e.to_string(), Stage::Received))
    }

    /// Handle a raw `POST /eval` body.
    pub fn handle_eval(&self, body: &[u8]) -> Result<EvaluationResponse, ServiceError> {
        let request: EvaluationRequest = serde_json::from_slice(body).map_err(|e| {
            ServiceError::new(ErrorKind::BadRequest, format!("invalid request: {}", e), Stage::Received)
        })?;
        self.evaluate(&request)
    }

    /// Run one evaluation request through the pipeline.
    pub fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResponse, ServiceError> {
        let mut progress = Progress::new(&request.model_name);
        let result = self.run(request, &mut progress);
        if let Err(e) = &result {
            log::warn!(
                "eval {} failed at {:?}: {}",
                request.model_name,
                e.stage,
                e
            );
        }
        result
    }

    fn run(&self, request: &EvaluationRequest, progress: &mut Progress<'_>) -> Result<EvaluationResponse, ServiceError> {
        let started = Instant::now();
        log::debug!(
            "received eval for {} version={:?} ({} context bytes, {} ciphertext bytes)",
            request.model_name,
            request.version,
            request.context.len(),
            request.ciphertext.len()
        );
        if request.model_name.trim().is_empty() {
            return Err(progress.fail(ErrorKind::BadRequest, "model_name must not be empty"));
        }

        let ctx = codec::decode_public_context(&request.context).map_err(|e| progress.context_error(e))?;
        let ct = codec::decode_ciphertext(&request.ciphertext)
            .map_err(|e| progress.fail(ErrorKind::MalformedCiphertext, e.to_string()))?;
        ctx.check_compatible(&ct).map_err(|e| match e {
            Incompatibility::SchemeMismatch(d) => progress.fail(ErrorKind::SchemeMismatch, d),
            Incompatibility::Malformed(d) => progress.fail(ErrorKind::MalformedCiphertext, d),
        })?;
        progress.reach(Stage::Validated);
        log::debug!(
            "validated: N={}, level={}, {} values",
            ct.degree(),
            ct.level,
            ct.len()
        );

        let resolved = self
            .registry
            .resolve(&request.model_name, request.version.as_deref())
            .map_err(|e| progress.registry_error(e))?;
        progress.reach(Stage::Resolved);
        if let Some(expected) = resolved.model.input_size() {
            if expected != ct.len() {
                return Err(progress.fail(
                    ErrorKind::EvaluationError,
                    format!(
                        "{} {} expects {} input values, got {}",
                        resolved.name,
                        resolved.version,
                        expected,
                        ct.len()
                    ),
                ));
            }
        }

        let output = resolved
            .model
            .evaluate(&ct, &ctx)
            .map_err(|e| progress.fail(ErrorKind::EvaluationError, e.to_string()))?;
        progress.reach(Stage::Evaluated);

        let ciphertext = codec::encode_ciphertext(&output)
            .map_err(|e| progress.fail(ErrorKind::Internal, e.to_string()))?;
        progress.reach(Stage::Responded);
        log::info!(
            "eval {} {} ok in {:.1}ms",
            resolved.name,
            resolved.version,
            started.elapsed().as_secs_f64() * 1e3
        );
        Ok(EvaluationResponse { ciphertext })
    }
}

/// Tracks how far one request got; errors are stamped with the last
/// stage reached.
struct Progress<'a> {
    model: &'a str,
    stage: Stage,
}

impl<'a> Progress<'a> {
    fn new(model: &'a str) -> Self {
        Self {
            model,
            stage: Stage::Received,
        }
    }

    fn reach(&mut self, stage: Stage) {
        log::debug!("eval {}: {:?} -> {:?}", self.model, self.stage, stage);
        self.stage = stage;
    }

    fn fail(&self, kind: ErrorKind, detail: impl Into<String>) -> ServiceError {
        ServiceError::new(kind, detail, self.stage)
    }

    fn context_error(&self, e: CodecError) -> ServiceError {
        let kind = match e {
            CodecError::SecretKeyPresent => ErrorKind::SecurityViolation,
            _ => ErrorKind::MalformedContext,
        };
        self.fail(kind, e.to_string())
    }

    fn registry_error(&self, e: RegistryError) -> ServiceError {
        let mut err = ServiceError::from(e);
        err.stage = self.stage;
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelError};
    use crate::registry::{ModelRegistration, ModelSource};
    use heval_client::codec::{encode_ciphertext, encode_context};
    use heval_client::{Ciphertext, CkksParams, ContextOptions, EncryptionContext, PublicContext};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Identity model that counts its invocations.
    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Model for Counting {
        fn input_size(&self) -> Option<usize> {
            Some(2)
        }
        fn output_size(&self) -> Option<usize> {
            Some(2)
        }
        fn evaluate(&self, input: &Ciphertext, _ctx: &PublicContext) -> Result<Ciphertext, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(input.clone())
        }
    }

    fn setup() -> (EvaluationService, Arc<Counting>, EncryptionContext) {
        let model = Arc::new(Counting::default());
        let registry = Arc::new(ModelRegistry::new());
        registry
            .register(ModelRegistration {
                name: "Identity".into(),
                description: "returns its input".into(),
                versions: vec!["1.0".into()],
                default_version: None,
                source: ModelSource::Instance(model.clone()),
            })
            .unwrap();
        let params = CkksParams::new(256, &[40, 20, 40], 20).unwrap();
        let ctx = EncryptionContext::generate(params, ContextOptions::default(), &mut StdRng::seed_from_u64(51))
            .unwrap();
        (EvaluationService::new(registry), model, ctx)
    }

    fn request(ctx: &EncryptionContext, ct: &Ciphertext) -> EvaluationRequest {
        EvaluationRequest {
            model_name: "Identity".into(),
            version: None,
            context: encode_context(ctx, false).unwrap(),
            ciphertext: encode_ciphertext(ct).unwrap(),
        }
    }

    #[test]
    fn happy_path() {
        let (service, model, ctx) = setup();
        let ct = ctx.encrypt(&[1.0, 2.0]).unwrap();
        let resp = service.evaluate(&request(&ctx, &ct)).unwrap();
        let out = codec::decode_ciphertext(&resp.ciphertext).unwrap();
        assert_eq!(out, ct);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn successful_request_reaches_responded() {
        let (service, _, ctx) = setup();
        let ct = ctx.encrypt(&[1.0, 2.0]).unwrap();
        let req = request(&ctx, &ct);
        let mut progress = Progress::new(&req.model_name);
        service.run(&req, &mut progress).unwrap();
        assert_eq!(progress.stage, Stage::Responded);
    }

    #[test]
    fn errors_carry_the_last_stage_reached() {
        let (service, _, ctx) = setup();
        let ct = ctx.encrypt(&[1.0, 2.0]).unwrap();

        let mut req = request(&ctx, &ct);
        req.context.truncate(8);
        assert_eq!(service.evaluate(&req).unwrap_err().stage, Stage::Received);

        let mut req = request(&ctx, &ct);
        req.model_name = "Missing".into();
        assert_eq!(service.evaluate(&req).unwrap_err().stage, Stage::Validated);
    }

    #[test]
    fn secret_key_is_a_security_violation() {
        let (service, model, ctx) = setup();
        let ct = ctx.encrypt(&[1.0, 2.0]).unwrap();
        let mut req = request(&ctx, &ct);
        req.context = encode_context(&ctx, true).unwrap();
        let err = service.evaluate(&req).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SecurityViolation);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_blobs() {
        let (service, _, ctx) = setup();
        let ct = ctx.encrypt(&[1.0, 2.0]).unwrap();

        let mut req = request(&ctx, &ct);
        req.context.truncate(8);
        assert_eq!(service.evaluate(&req).unwrap_err().kind, ErrorKind::MalformedContext);

        let mut req = request(&ctx, &ct);
        req.ciphertext.truncate(req.ciphertext.len() / 2);
        assert_eq!(service.evaluate(&req).unwrap_err().kind, ErrorKind::MalformedCiphertext);
    }

    #[test]
    fn foreign_key_is_a_scheme_mismatch() {
        let (service, model, ctx) = setup();
        let params = CkksParams::new(256, &[40, 20, 40], 20).unwrap();
        let other = EncryptionContext::generate(params, ContextOptions::default(), &mut StdRng::seed_from_u64(52))
            .unwrap();
        let ct = other.encrypt(&[1.0, 2.0]).unwrap();
        let err = service.evaluate(&request(&ctx, &ct)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemeMismatch);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_model_and_version() {
        let (service, _, ctx) = setup();
        let ct = ctx.encrypt(&[1.0, 2.0]).unwrap();

        let mut req = request(&ctx, &ct);
        req.model_name = "Missing".into();
        assert_eq!(service.evaluate(&req).unwrap_err().kind, ErrorKind::UnknownModel);

        let mut req = request(&ctx, &ct);
        req.version = Some("2.0".into());
        assert_eq!(service.evaluate(&req).unwrap_err().kind, ErrorKind::UnknownVersion);
    }

    #[test]
    fn shape_mismatch_skips_the_model() {
        let (service, model, ctx) = setup();
        let ct = ctx.encrypt(&[1.0, 2.0, 3.0]).unwrap();
        let err = service.evaluate(&request(&ctx, &ct)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EvaluationError);
        assert_eq!(err.stage, Stage::Resolved);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bad_json_and_empty_name() {
        let (service, _, ctx) = setup();
        assert_eq!(service.handle_eval(b"{not json").unwrap_err().kind, ErrorKind::BadRequest);
        assert_eq!(
            service
                .handle_eval(br#"{"model_name":"Identity","context":"xyz","ciphertext":""}"#)
                .unwrap_err()
                .kind,
            ErrorKind::BadRequest
        );
        let ct = ctx.encrypt(&[1.0, 2.0]).unwrap();
        let mut req = request(&ctx, &ct);
        req.model_name = " ".into();
        assert_eq!(service.evaluate(&req).unwrap_err().kind, ErrorKind::BadRequest);
    }

    #[test]
    fn describe_models() {
        let (service, _, _) = setup();
        assert_eq!(service.list_models().len(), 1);
        assert_eq!(service.describe_model("Identity").unwrap().default_version, "1.0");
        assert_eq!(
            service.describe_model("Other").unwrap_err().kind,
            ErrorKind::UnknownModel
        );
    }
}
