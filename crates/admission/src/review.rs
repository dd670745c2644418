//! `admission.k8s.io/v1` AdmissionReview envelope, so out-of-process
//! validators can sit behind the same [`ValidatingHook`] seam.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{Gvk, Object};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hook::{HookError, ValidatingHook};
use crate::request::{AdmissionRequest, Operation, UserInfo, Verdict};

pub const REVIEW_API_VERSION: &str = "admission.k8s.io/v1";
pub const REVIEW_KIND: &str = "AdmissionReview";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ReviewRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ReviewResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub uid: String,
    pub kind: Gvk,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: String,
    pub operation: Operation,
    #[serde(default)]
    pub user_info: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Object>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<Object>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReviewStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewStatus {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl AdmissionReview {
    pub fn from_request(req: &AdmissionRequest) -> Self {
        Self {
            api_version: REVIEW_API_VERSION.to_string(),
            kind: REVIEW_KIND.to_string(),
            request: Some(ReviewRequest {
                uid: req.uid.clone(),
                kind: req.gvk.clone(),
                namespace: req.namespace.clone(),
                name: req.name.clone(),
                operation: req.operation,
                user_info: req.user_info.clone(),
                object: req.object.clone(),
                old_object: req.old_object.clone(),
                dry_run: req.dry_run,
            }),
            response: None,
        }
    }

    pub fn from_response(response: ReviewResponse) -> Self {
        Self {
            api_version: REVIEW_API_VERSION.to_string(),
            kind: REVIEW_KIND.to_string(),
            request: None,
            response: Some(response),
        }
    }

    /// Read the verdict for `uid` out of a reply envelope.
    pub fn verdict(&self, uid: &str) -> Result<Verdict, HookError> {
        let resp = self.response.as_ref().ok_or_else(|| HookError::new("review reply carries no response"))?;
        if resp.uid != uid {
            return Err(HookError(format!("review reply uid {} does not match request {uid}", resp.uid)));
        }
        let mut verdict = if resp.allowed {
            Verdict::allow()
        } else {
            let message = resp.status.as_ref().map(|s| s.message.clone()).filter(|m| !m.is_empty());
            Verdict::deny(message.unwrap_or_else(|| "denied by remote validator".to_string()))
        };
        verdict.warnings = resp.warnings.clone();
        Ok(verdict)
    }
}

impl ReviewResponse {
    pub fn allow(uid: &str) -> Self {
        Self { uid: uid.to_string(), allowed: true, status: None, warnings: Vec::new() }
    }

    pub fn deny(uid: &str, message: impl Into<String>) -> Self {
        Self {
            uid: uid.to_string(),
            allowed: false,
            status: Some(ReviewStatus { message: message.into(), code: Some(403) }),
            warnings: Vec::new(),
        }
    }
}

impl From<ReviewRequest> for AdmissionRequest {
    fn from(r: ReviewRequest) -> Self {
        AdmissionRequest {
            uid: r.uid,
            gvk: r.kind,
            namespace: r.namespace,
            name: r.name,
            operation: r.operation,
            old_object: r.old_object,
            object: r.object,
            user_info: r.user_info,
            dry_run: r.dry_run,
        }
    }
}

/// Moves an envelope to a validator and brings the reply back
/// (an HTTP client in production, a function call in tests).
#[async_trait]
pub trait ReviewTransport: Send + Sync {
    async fn send(&self, review: AdmissionReview) -> Result<AdmissionReview, HookError>;
}

/// A validating hook whose decision is made on the other side of a transport.
pub struct ReviewHook {
    name: String,
    transport: Arc<dyn ReviewTransport>,
}

impl ReviewHook {
    pub fn new(name: &str, transport: Arc<dyn ReviewTransport>) -> Self {
        Self { name: name.to_string(), transport }
    }
}

#[async_trait]
impl ValidatingHook for ReviewHook {
    fn name(&self) -> &str { &self.name }

    async fn validate(&self, req: &AdmissionRequest) -> Result<Verdict, HookError> {
        let reply = self.transport.send(AdmissionReview::from_request(req)).await?;
        debug!(hook = %self.name, uid = %req.uid, "review reply received");
        reply.verdict(&req.uid)
    }
}

/// Validator side of the envelope: decode, run `hook`, encode the reply.
/// An envelope without a request is answered with a denial.
pub async fn serve_review(hook: &dyn ValidatingHook, review: AdmissionReview) -> AdmissionReview {
    let Some(request) = review.request else {
        return AdmissionReview::from_response(ReviewResponse::deny("", "invalid request: missing request"));
    };
    let uid = request.uid.clone();
    let req = AdmissionRequest::from(request);
    let response = match hook.validate(&req).await {
        Ok(v) if v.allowed => ReviewResponse { warnings: v.warnings, ..ReviewResponse::allow(&uid) },
        Ok(v) => ReviewResponse {
            warnings: v.warnings,
            ..ReviewResponse::deny(&uid, v.reason.unwrap_or_default())
        },
        Err(e) => ReviewResponse::deny(&uid, format!("validator error: {e}")),
    };
    AdmissionReview::from_response(response)
}
