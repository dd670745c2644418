use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_admission::review::{serve_review, AdmissionReview, ReviewHook, ReviewTransport};
use keel_admission::*;
use keel_core::{Gvk, Object};
use serde_json::json;

const T: Duration = Duration::from_millis(200);

fn widget(replicas: i64) -> Object {
    Object::new(&Gvk::new("example.com", "v1", "Widget"), Some("default"), "w1").with_spec(json!({"replicas": replicas}))
}

struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MutatingHook for Recorder {
    fn name(&self) -> &str { self.name }
    async fn mutate(&self, req: &AdmissionRequest) -> Result<Mutation, HookError> {
        self.log.lock().unwrap().push(format!("m:{}", self.name));
        let mut obj = req.object.clone().unwrap();
        let seen = obj.spec["seen"].as_array().cloned().unwrap_or_default();
        let mut seen = seen;
        seen.push(json!(self.name));
        obj.spec["seen"] = json!(seen);
        Ok(Mutation::patched(obj))
    }
}

#[async_trait]
impl ValidatingHook for Recorder {
    fn name(&self) -> &str { self.name }
    async fn validate(&self, req: &AdmissionRequest) -> Result<Verdict, HookError> {
        let seen = req.object.as_ref().map(|o| o.spec["seen"].clone()).unwrap_or_default();
        self.log.lock().unwrap().push(format!("v:{}:{}", self.name, seen));
        Ok(Verdict::allow())
    }
}

struct Deny(&'static str);

#[async_trait]
impl ValidatingHook for Deny {
    fn name(&self) -> &str { "deny" }
    async fn validate(&self, _: &AdmissionRequest) -> Result<Verdict, HookError> { Ok(Verdict::deny(self.0)) }
}

struct Counting(Arc<AtomicUsize>);

#[async_trait]
impl ValidatingHook for Counting {
    fn name(&self) -> &str { "counting" }
    async fn validate(&self, _: &AdmissionRequest) -> Result<Verdict, HookError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Verdict::allow())
    }
}

struct Slow;

#[async_trait]
impl ValidatingHook for Slow {
    fn name(&self) -> &str { "slow" }
    async fn validate(&self, _: &AdmissionRequest) -> Result<Verdict, HookError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Verdict::allow())
    }
}

struct Panicky;

#[async_trait]
impl MutatingHook for Panicky {
    fn name(&self) -> &str { "panicky" }
    async fn mutate(&self, _: &AdmissionRequest) -> Result<Mutation, HookError> { panic!("hook bug") }
}

struct Renamer;

#[async_trait]
impl MutatingHook for Renamer {
    fn name(&self) -> &str { "renamer" }
    async fn mutate(&self, req: &AdmissionRequest) -> Result<Mutation, HookError> {
        let mut obj = req.object.clone().unwrap();
        obj.metadata.name = "other".into();
        Ok(Mutation::patched(obj))
    }
}

#[tokio::test]
async fn mutations_chain_before_validation() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let rec = |name| Recorder { name, log: log.clone() };
    let pipeline = Pipeline::new(
        vec![
            MutatingBinding::mutating(rec("m1"), T, FailurePolicy::FailClosed),
            MutatingBinding::mutating(rec("m2"), T, FailurePolicy::FailClosed),
        ],
        vec![ValidatingBinding::validating(rec("v1"), T, FailurePolicy::FailClosed)],
    );
    let out = pipeline.admit(AdmissionRequest::create(widget(1), UserInfo::default())).await.unwrap();
    assert_eq!(out.object.unwrap().spec["seen"], json!(["m1", "m2"]));
    assert_eq!(*log.lock().unwrap(), vec!["m:m1", "m:m2", r#"v:v1:["m1","m2"]"#]);
}

#[tokio::test]
async fn first_denial_short_circuits() {
    let count = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::new(
        vec![],
        vec![
            ValidatingBinding::validating(Deny("owner must be system"), T, FailurePolicy::FailClosed),
            ValidatingBinding::validating(Counting(count.clone()), T, FailurePolicy::FailClosed),
        ],
    );
    let err = pipeline.admit(AdmissionRequest::create(widget(1), UserInfo::default())).await.unwrap_err();
    assert_eq!(err, AdmissionError::Denied { hook: "deny".into(), reason: "owner must be system".into() });
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn timeout_follows_failure_policy() {
    let closed = Pipeline::new(vec![], vec![ValidatingBinding::validating(Slow, Duration::from_millis(20), FailurePolicy::FailClosed)]);
    let err = closed.admit(AdmissionRequest::create(widget(1), UserInfo::default())).await.unwrap_err();
    assert!(matches!(err, AdmissionError::HookFailed { ref hook, ref reason } if hook == "slow" && reason.contains("timed out")));

    let open = Pipeline::new(vec![], vec![ValidatingBinding::validating(Slow, Duration::from_millis(20), FailurePolicy::FailOpen)]);
    let out = open.admit(AdmissionRequest::create(widget(1), UserInfo::default())).await.unwrap();
    assert_eq!(out.warnings.len(), 1);
}

#[tokio::test]
async fn panicking_hook_is_contained() {
    let open = Pipeline::new(vec![MutatingBinding::mutating(Panicky, T, FailurePolicy::FailOpen)], vec![]);
    let out = open.admit(AdmissionRequest::create(widget(3), UserInfo::default())).await.unwrap();
    assert_eq!(out.object.unwrap().spec["replicas"], 3);

    let closed = Pipeline::new(vec![MutatingBinding::mutating(Panicky, T, FailurePolicy::FailClosed)], vec![]);
    let err = closed.admit(AdmissionRequest::create(widget(3), UserInfo::default())).await.unwrap_err();
    assert!(matches!(err, AdmissionError::HookFailed { ref reason, .. } if reason == "hook panicked"));
}

#[tokio::test]
async fn mutation_may_not_rename() {
    let p = Pipeline::new(vec![MutatingBinding::mutating(Renamer, T, FailurePolicy::FailClosed)], vec![]);
    let err = p.admit(AdmissionRequest::create(widget(1), UserInfo::default())).await.unwrap_err();
    assert_eq!(err.hook(), "renamer");
}

#[tokio::test]
async fn bindings_filter_operations_and_namespaces() {
    let count = Arc::new(AtomicUsize::new(0));
    let p = Pipeline::new(
        vec![],
        vec![
            ValidatingBinding::validating(Counting(count.clone()), T, FailurePolicy::FailClosed)
                .for_operations(&[Operation::Create]),
            ValidatingBinding::validating(Deny("nope"), T, FailurePolicy::FailClosed).exempt_namespace("default"),
        ],
    );
    p.admit(AdmissionRequest::create(widget(1), UserInfo::default())).await.unwrap();
    p.admit(AdmissionRequest::update(widget(1), widget(2), UserInfo::default())).await.unwrap();
    p.admit(AdmissionRequest::delete(widget(1), UserInfo::default())).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

/// Transport that serializes the envelope to JSON text and back, then lets
/// the validator side answer it.
struct Loopback<H>(H);

#[async_trait]
impl<H: ValidatingHook> ReviewTransport for Loopback<H> {
    async fn send(&self, review: AdmissionReview) -> Result<AdmissionReview, HookError> {
        let wire = serde_json::to_string(&review).map_err(HookError::new)?;
        let decoded: AdmissionReview = serde_json::from_str(&wire).map_err(HookError::new)?;
        Ok(serve_review(&self.0, decoded).await)
    }
}

#[tokio::test]
async fn review_envelope_carries_denials() {
    let pod = Object::new(&Gvk::new("", "v1", "Pod"), Some("apps"), "web")
        .with_spec(json!({"containers": [{"name": "app", "image": "nginx:1.25"}]}));
    let hook = ReviewHook::new("pod-validator", Arc::new(Loopback(RunAsNonRoot::new())));
    let p = Pipeline::new(vec![], vec![ValidatingBinding::validating(hook, T, FailurePolicy::FailClosed)]);
    let err = p.admit(AdmissionRequest::create(pod, UserInfo::new("dev"))).await.unwrap_err();
    assert_eq!(
        err,
        AdmissionError::Denied { hook: "pod-validator".into(), reason: "Container 'app' must set runAsNonRoot=true".into() }
    );
}

#[tokio::test]
async fn review_without_request_is_denied() {
    let bare = AdmissionReview {
        api_version: "admission.k8s.io/v1".into(),
        kind: "AdmissionReview".into(),
        request: None,
        response: None,
    };
    let reply = serve_review(&RunAsNonRoot::new(), bare).await;
    let resp = reply.response.unwrap();
    assert!(!resp.allowed);
    assert_eq!(resp.uid, "");
}

#[test]
fn image_references_are_nameable_from_outside() {
    let parsed: Option<ImageRef> = ImagePolicy::default().parse("registry.internal:5000/team/api:1.4");
    assert_eq!(
        parsed,
        Some(ImageRef {
            registry: "registry.internal:5000".into(),
            repository: "team/api".into(),
            tag: Some("1.4".into()),
            digest: None,
        })
    );
}
