//! End-to-end tests over HTTP.
//!
//! Each test binds a server on an ephemeral port, serves a fixed number of
//! requests from a background thread and talks to it with `EvalClient` or
//! raw `ureq` requests. Models come from the bundled `demo-models/`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use heval_client::codec;
use heval_client::ckks::params::{DEFAULT_COEFF_MOD_BIT_SIZES, DEFAULT_SCALE_BITS};
use heval_client::protocol::{ErrorBody, ErrorKind, EvaluationRequest, ModelDescriptor};
use heval_client::{
    Ciphertext, CkksParams, ClientError, ContextOptions, EncryptionContext, EvalClient,
    PublicContext,
};
use heval_server::config::{build_registry, parameter_path, Manifest};
use heval_server::http::HttpServer;
use heval_server::model::{Model, ModelError};
use heval_server::models::{Fc, FcParams, LinearLayer, LinearLayerParams};
use heval_server::registry::{ModelRegistration, ModelRegistry, ModelSource};
use heval_server::service::EvaluationService;
use rand::rngs::StdRng;
use rand::SeedableRng;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn demo_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demo-models")
}

/// Identity model that counts how often it runs.
#[derive(Default)]
struct Recorder {
    calls: AtomicUsize,
}

impl Model for Recorder {
    fn input_size(&self) -> Option<usize> {
        None
    }
    fn output_size(&self) -> Option<usize> {
        None
    }
    fn evaluate(&self, input: &Ciphertext, _ctx: &PublicContext) -> Result<Ciphertext, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(input.clone())
    }
}

/// Demo registry plus a `Recorder` model.
fn demo_service() -> (Arc<EvaluationService>, Arc<Recorder>) {
    let manifest = Manifest::load(&demo_dir().join("manifest.json")).unwrap();
    let registry: ModelRegistry = build_registry(&manifest, &demo_dir()).unwrap();
    let recorder = Arc::new(Recorder::default());
    registry
        .register(ModelRegistration {
            name: "Recorder".into(),
            description: "identity".into(),
            versions: vec!["1".into()],
            default_version: None,
            source: ModelSource::Instance(recorder.clone()),
        })
        .unwrap();
    (Arc::new(EvaluationService::new(Arc::new(registry))), recorder)
}

/// Serve `requests` requests in the background; returns the base URL.
fn spawn_server(
    server: HttpServer,
    service: Arc<EvaluationService>,
    requests: usize,
) -> (String, JoinHandle<()>) {
    let addr = server.addr().unwrap();
    let handle = thread::spawn(move || {
        for _ in 0..requests {
            server.handle_one(&service).unwrap();
        }
    });
    (format!("http://{}", addr), handle)
}

fn start(requests: usize) -> (String, JoinHandle<()>, Arc<Recorder>) {
    let (service, recorder) = demo_service();
    let server = HttpServer::new("127.0.0.1:0").unwrap();
    let (url, handle) = spawn_server(server, service, requests);
    (url, handle, recorder)
}

fn context_with(degree: usize, seed: u64, options: ContextOptions) -> EncryptionContext {
    let params = CkksParams::new(degree, &DEFAULT_COEFF_MOD_BIT_SIZES, DEFAULT_SCALE_BITS).unwrap();
    EncryptionContext::generate(params, options, &mut StdRng::seed_from_u64(seed)).unwrap()
}

fn context(degree: usize, seed: u64) -> EncryptionContext {
    context_with(degree, seed, ContextOptions::default())
}

/// Registry built from the demo manifest, restricted to `names`.
fn registry_of(names: &[&str]) -> ModelRegistry {
    let mut manifest = Manifest::load(&demo_dir().join("manifest.json")).unwrap();
    manifest.models.retain(|m| names.contains(&m.name.as_str()));
    build_registry(&manifest, &demo_dir()).unwrap()
}

fn lenient_agent() -> ureq::Agent {
    ureq::Agent::config_builder()
        .http_status_as_error(false)
        .build()
        .into()
}

/// POST raw JSON to /eval and return (status, error body).
fn post_eval(url: &str, body: &str) -> (u16, ErrorBody) {
    let mut resp = lenient_agent()
        .post(&format!("{}/eval", url))
        .content_type("application/json")
        .send(body)
        .unwrap();
    let status = resp.status().as_u16();
    let text = resp.body_mut().read_to_string().unwrap();
    (status, serde_json::from_str(&text).unwrap())
}

fn eval_request(model: &str, context: Vec<u8>, ct: &Ciphertext) -> String {
    serde_json::to_string(&EvaluationRequest {
        model_name: model.into(),
        version: None,
        context,
        ciphertext: codec::encode_ciphertext(ct).unwrap(),
    })
    .unwrap()
}

// ===========================================================================
// Discovery
// ===========================================================================

#[test]
fn list_models_over_http() {
    let (url, handle, _) = start(1);
    let models = EvalClient::new(&url).list_models().unwrap();
    handle.join().unwrap();

    let names: Vec<&str> = models.iter().map(|m| m.model_name.as_str()).collect();
    assert_eq!(names, vec!["FC", "LinearLayer", "Polynomial", "Recorder"]);
    let layer = &models[1];
    assert_eq!(layer.versions, vec!["0.1".to_string()]);
    assert_eq!(layer.default_version, "0.1");
    assert!(!layer.description.is_empty());
}

#[test]
fn single_registered_model_is_the_whole_listing() {
    let service = Arc::new(EvaluationService::new(Arc::new(registry_of(&["LinearLayer"]))));
    let server = HttpServer::new("127.0.0.1:0").unwrap();
    let (url, handle) = spawn_server(server, service, 1);

    let mut resp = ureq::get(&format!("{}/models", url)).call().unwrap();
    let text = resp.body_mut().read_to_string().unwrap();
    handle.join().unwrap();

    let models: Vec<ModelDescriptor> = serde_json::from_str(&text).unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].model_name, "LinearLayer");
    assert_eq!(models[0].versions, vec!["0.1".to_string()]);
    assert_eq!(models[0].default_version, "0.1");
}

#[test]
fn escaped_model_names_resolve() {
    let registry = registry_of(&[]);
    registry
        .register(ModelRegistration {
            name: "Linear Layer/v".into(),
            description: "identity".into(),
            versions: vec!["1".into()],
            default_version: None,
            source: ModelSource::Instance(Arc::new(Recorder::default())),
        })
        .unwrap();
    let service = Arc::new(EvaluationService::new(Arc::new(registry)));
    let server = HttpServer::new("127.0.0.1:0").unwrap();
    let (url, handle) = spawn_server(server, service, 2);

    let mut resp = ureq::get(&format!("{}/models/Linear%20Layer%2Fv", url))
        .call()
        .unwrap();
    let raw: ModelDescriptor = serde_json::from_str(&resp.body_mut().read_to_string().unwrap()).unwrap();
    let via_client = EvalClient::new(&url).model_info("Linear Layer/v").unwrap();
    handle.join().unwrap();

    assert_eq!(raw.model_name, "Linear Layer/v");
    assert_eq!(via_client, raw);
}

#[test]
fn model_info_and_unknown_model() {
    let (url, handle, _) = start(2);
    let client = EvalClient::new(&url);

    let poly = client.model_info("Polynomial").unwrap();
    assert_eq!(poly.versions, vec!["1.0".to_string()]);

    match client.model_info("Missing") {
        Err(ClientError::Server { kind, .. }) => assert_eq!(kind, ErrorKind::UnknownModel),
        other => panic!("expected UnknownModel, got {:?}", other.map(|d| d.model_name)),
    }
    handle.join().unwrap();
}

#[test]
fn ping_answers_pong_with_headers() {
    let (url, handle, _) = start(1);
    let mut resp = ureq::get(&format!("{}/ping", url)).call().unwrap();
    handle.join().unwrap();

    assert_eq!(resp.status().as_u16(), 200);
    assert!(resp.headers().get("x-process-time").is_some());
    let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
    assert_eq!(content_type, "application/json");
    let body = resp.body_mut().read_to_string().unwrap();
    assert_eq!(body, r#"{"message":"pong"}"#);
}

// ===========================================================================
// Evaluation
// ===========================================================================

#[test]
fn linear_layer_round_trip() {
    let (url, handle, _) = start(1);
    let ctx = context(1024, 1);
    let x = vec![0.1; 16];
    let ct = ctx.encrypt(&x).unwrap();

    let result = EvalClient::new(&url)
        .evaluate("LinearLayer", None, &ctx, &ct)
        .unwrap();
    handle.join().unwrap();

    let json = std::fs::read_to_string(parameter_path(&demo_dir(), "LinearLayer", "0.1")).unwrap();
    let params: LinearLayerParams = serde_json::from_str(&json).unwrap();
    let expected = LinearLayer::new(params).unwrap().apply_plain(&x);

    let got = ctx.decrypt(&result).unwrap();
    assert_eq!(got.len(), 4);
    for (g, e) in got.iter().zip(&expected) {
        assert!((g - e).abs() < 2e-2, "got {:?}, expected {:?}", got, expected);
    }
}

#[test]
fn polynomial_round_trip() {
    let (url, handle, _) = start(1);
    let ctx = context(1024, 2);
    let x = [0.75, -0.5, 1.25];
    let ct = ctx.encrypt(&x).unwrap();

    let result = EvalClient::new(&url)
        .evaluate("Polynomial", Some("1.0"), &ctx, &ct)
        .unwrap();
    handle.join().unwrap();

    let got = ctx.decrypt(&result).unwrap();
    assert_eq!(got.len(), 3);
    for (xi, g) in x.iter().zip(&got) {
        let expected = 0.25 * xi * xi + xi + 0.5;
        assert!((g - expected).abs() < 2e-2, "x={}: got {}, expected {}", xi, g, expected);
    }
}

#[test]
fn fc_round_trip() {
    let (url, handle, _) = start(1);
    let ctx = context(1024, 12);
    let x: Vec<f64> = (0..16).map(|i| (i as f64 - 7.5) / 10.0).collect();
    let ct = ctx.encrypt(&x).unwrap();

    let result = EvalClient::new(&url).evaluate("FC", None, &ctx, &ct).unwrap();
    handle.join().unwrap();

    let json = std::fs::read_to_string(parameter_path(&demo_dir(), "FC", "0.1")).unwrap();
    let params: FcParams = serde_json::from_str(&json).unwrap();
    let expected = Fc::new(params).unwrap().apply_plain(&x);

    assert_eq!(result.level, 0);
    let got = ctx.decrypt(&result).unwrap();
    assert_eq!(got.len(), 4);
    for (g, e) in got.iter().zip(&expected) {
        assert!((g - e).abs() < 5e-2, "got {:?}, expected {:?}", got, expected);
    }
}

#[test]
fn fc_without_galois_keys_is_evaluation_error() {
    let (url, handle, _) = start(1);
    let ctx = context_with(
        1024,
        13,
        ContextOptions {
            galois_keys: false,
            ..ContextOptions::default()
        },
    );
    let ct = ctx.encrypt(&[0.1; 16]).unwrap();

    let err = EvalClient::new(&url).evaluate("FC", None, &ctx, &ct).unwrap_err();
    handle.join().unwrap();

    match err {
        ClientError::Server { kind, detail, .. } => {
            assert_eq!(kind, ErrorKind::EvaluationError);
            assert!(detail.contains("galois keys"), "{}", detail);
        }
        other => panic!("expected a server error, got {:?}", other),
    }
}

#[test]
fn unknown_version_is_reported() {
    let (url, handle, _) = start(1);
    let ctx = context(1024, 3);
    let ct = ctx.encrypt(&[0.1; 16]).unwrap();

    let err = EvalClient::new(&url)
        .evaluate("LinearLayer", Some("2.0"), &ctx, &ct)
        .unwrap_err();
    handle.join().unwrap();

    assert_eq!(err.kind(), ErrorKind::UnknownVersion);
    assert!(!err.is_retryable());
}

#[test]
fn wrong_input_length_is_evaluation_error() {
    let (url, handle, _) = start(1);
    let ctx = context(1024, 4);
    let ct = ctx.encrypt(&[0.1; 8]).unwrap();

    let err = EvalClient::new(&url)
        .evaluate("LinearLayer", None, &ctx, &ct)
        .unwrap_err();
    handle.join().unwrap();
    assert_eq!(err.kind(), ErrorKind::EvaluationError);
}

// ===========================================================================
// Rejections before evaluation
// ===========================================================================

#[test]
fn truncated_context_is_malformed() {
    let (url, handle, recorder) = start(1);
    let ctx = context(1024, 5);
    let ct = ctx.encrypt(&[0.5]).unwrap();
    let mut blob = codec::encode_context(&ctx, false).unwrap();
    blob.truncate(7);

    let (status, body) = post_eval(&url, &eval_request("Recorder", blob, &ct));
    handle.join().unwrap();

    assert_eq!(status, 400);
    assert_eq!(body.kind, ErrorKind::MalformedContext);
    assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn secret_key_is_refused() {
    let (url, handle, recorder) = start(1);
    let ctx = context(1024, 6);
    let ct = ctx.encrypt(&[0.5]).unwrap();
    let blob = codec::encode_context(&ctx, true).unwrap();

    let (status, body) = post_eval(&url, &eval_request("Recorder", blob, &ct));
    handle.join().unwrap();

    assert_eq!(status, 403);
    assert_eq!(body.kind, ErrorKind::SecurityViolation);
    assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn degree_mismatch_never_reaches_model() {
    let (url, handle, recorder) = start(1);
    let big = context(1024, 7);
    let small = context(512, 8);
    let ct = small.encrypt(&[0.5]).unwrap();
    let blob = codec::encode_context(&big, false).unwrap();

    let (status, body) = post_eval(&url, &eval_request("Recorder", blob, &ct));
    handle.join().unwrap();

    assert_eq!(status, 409);
    assert_eq!(body.kind, ErrorKind::SchemeMismatch);
    assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn foreign_key_is_scheme_mismatch() {
    let (url, handle, recorder) = start(1);
    let mine = context(1024, 9);
    let theirs = context(1024, 10);
    let ct = theirs.encrypt(&[0.5]).unwrap();
    let blob = codec::encode_context(&mine, false).unwrap();

    let (status, body) = post_eval(&url, &eval_request("Recorder", blob, &ct));
    handle.join().unwrap();

    assert_eq!(status, 409);
    assert_eq!(body.kind, ErrorKind::SchemeMismatch);
    assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn bad_json_is_bad_request() {
    let (url, handle, _) = start(1);
    let (status, body) = post_eval(&url, "{not json");
    handle.join().unwrap();
    assert_eq!(status, 400);
    assert_eq!(body.kind, ErrorKind::BadRequest);
}

#[test]
fn recorder_runs_on_valid_request() {
    let (url, handle, recorder) = start(1);
    let ctx = context(1024, 11);
    let ct = ctx.encrypt(&[0.5, -0.25]).unwrap();

    let result = EvalClient::new(&url)
        .evaluate("Recorder", None, &ctx, &ct)
        .unwrap();
    handle.join().unwrap();

    assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    let got = ctx.decrypt(&result).unwrap();
    assert!((got[0] - 0.5).abs() < 1e-2);
    assert!((got[1] + 0.25).abs() < 1e-2);
}

// ===========================================================================
// Transport
// ===========================================================================

#[test]
fn unknown_route_returns_404() {
    let (url, handle, _) = start(1);
    let err = ureq::post(&format!("{}/wrong", url))
        .content_type("application/json")
        .send("{}")
        .unwrap_err();
    handle.join().unwrap();

    match err {
        ureq::Error::StatusCode(code) => assert_eq!(code, 404),
        other => panic!("expected 404, got: {:?}", other),
    }
}

#[test]
fn wrong_method_returns_405() {
    let (url, handle, _) = start(1);
    let err = ureq::get(&format!("{}/eval", url)).call().unwrap_err();
    handle.join().unwrap();

    match err {
        ureq::Error::StatusCode(code) => assert_eq!(code, 405),
        other => panic!("expected 405, got: {:?}", other),
    }
}

#[test]
fn oversized_body_returns_413() {
    let (service, _) = demo_service();
    let server = HttpServer::new("127.0.0.1:0")
        .unwrap()
        .with_max_body_bytes(64);
    let (url, handle) = spawn_server(server, service, 1);

    let (status, body) = post_eval(&url, &format!("{{\"pad\":\"{}\"}}", "x".repeat(200)));
    handle.join().unwrap();

    assert_eq!(status, 413);
    assert_eq!(body.kind, ErrorKind::BadRequest);
}

#[test]
fn serve_returns_once_every_worker_is_unblocked() {
    let (service, _) = demo_service();
    let server = Arc::new(HttpServer::new("127.0.0.1:0").unwrap());
    let url = format!("http://{}", server.addr().unwrap());
    let serving = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.serve(&service, 2))
    };

    let client = EvalClient::new(&url);
    assert!(client.ping());
    assert_eq!(client.list_models().unwrap().len(), 4);

    server.unblock();
    server.unblock();
    serving.join().unwrap();
}

#[test]
fn ping_fails_without_server() {
    let server = HttpServer::new("127.0.0.1:0").unwrap();
    let addr = server.addr().unwrap();
    drop(server);
    // Let the listener thread notice the shutdown.
    thread::sleep(Duration::from_millis(100));

    let client = EvalClient::new(&format!("http://{}", addr));
    assert!(!client.ping());
    match client.list_models() {
        Err(e) => {
            assert_eq!(e.kind(), ErrorKind::ConnectionError);
            assert!(e.is_retryable());
        }
        Ok(_) => panic!("expected connection error"),
    }
}
