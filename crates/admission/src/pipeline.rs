use std::future::Future;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::hook::{FailurePolicy, HookError, MutatingBinding, ValidatingBinding};
use crate::request::AdmissionRequest;
use crate::AdmissionError;
use keel_core::Object;

/// Outcome of an admitted request.
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    /// The object after all mutations; `None` for DELETE.
    pub object: Option<Object>,
    pub warnings: Vec<String>,
}

/// Ordered mutating hooks followed by ordered validating hooks.
#[derive(Clone, Default)]
pub struct Pipeline {
    mutating: Vec<MutatingBinding>,
    validating: Vec<ValidatingBinding>,
}

enum CallFailure {
    Error(HookError),
    Timeout(Duration),
    Panicked,
}

impl CallFailure {
    fn describe(&self) -> String {
        match self {
            CallFailure::Error(e) => e.to_string(),
            CallFailure::Timeout(d) => format!("timed out after {}ms", d.as_millis()),
            CallFailure::Panicked => "hook panicked".to_string(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            CallFailure::Error(_) => "error",
            CallFailure::Timeout(_) => "timeout",
            CallFailure::Panicked => "panic",
        }
    }
}

/// Runs the hook on its own task so a panic or a stuck hook stays contained.
async fn guarded<T, F>(timeout: Duration, fut: F) -> Result<T, CallFailure>
where
    F: Future<Output = Result<T, HookError>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(fut);
    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Err(_) => {
            abort.abort();
            Err(CallFailure::Timeout(timeout))
        }
        Ok(Err(join)) if join.is_panic() => Err(CallFailure::Panicked),
        Ok(Err(join)) => Err(CallFailure::Error(HookError::new(join))),
        Ok(Ok(res)) => res.map_err(CallFailure::Error),
    }
}

impl Pipeline {
    pub fn new(mutating: Vec<MutatingBinding>, validating: Vec<ValidatingBinding>) -> Self {
        Self { mutating, validating }
    }

    pub fn is_empty(&self) -> bool { self.mutating.is_empty() && self.validating.is_empty() }

    pub fn mutating(&self) -> &[MutatingBinding] { &self.mutating }

    pub fn validating(&self) -> &[ValidatingBinding] { &self.validating }

    /// Run every applicable hook in registration order: all mutating hooks,
    /// each seeing the previous one's output, then all validating hooks against
    /// the final object. The first denial wins and nothing after it runs.
    pub async fn admit(&self, mut req: AdmissionRequest) -> Result<Admitted, AdmissionError> {
        let started = Instant::now();
        let gvk = req.gvk.to_string();
        let mut warnings = Vec::new();
        let result = self.run(&mut req, &mut warnings).await;
        histogram!("admission_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        match result {
            Ok(()) => {
                counter!("admission_allowed_total", 1u64, "gvk" => gvk);
                debug!(uid = %req.uid, op = %req.operation, name = %req.name, "admitted");
                Ok(Admitted { object: req.object, warnings })
            }
            Err(e) => {
                counter!("admission_denied_total", 1u64, "gvk" => gvk);
                info!(uid = %req.uid, op = %req.operation, name = %req.name, hook = %e.hook(), error = %e, "rejected");
                Err(e)
            }
        }
    }

    async fn run(&self, req: &mut AdmissionRequest, warnings: &mut Vec<String>) -> Result<(), AdmissionError> {
        // DELETE carries no incoming object, so there is nothing to mutate.
        if req.object.is_some() {
            for binding in &self.mutating {
                if !binding.applies_to(req) {
                    continue;
                }
                let hook = binding.hook.clone();
                let snapshot = req.clone();
                let outcome = guarded(binding.timeout, async move { hook.mutate(&snapshot).await }).await;
                let current = req.object.as_ref().map(|o| o.key());
                let outcome = outcome.and_then(|m| {
                    let renamed = m.object.as_ref().map(|o| Some(o.key()) != current).unwrap_or(false);
                    if renamed {
                        Err(CallFailure::Error(HookError::new("mutation changed object identity")))
                    } else {
                        Ok(m)
                    }
                });
                match outcome {
                    Ok(m) => {
                        if let Some(obj) = m.object {
                            debug!(hook = %binding.name(), name = %req.name, "object mutated");
                            req.object = Some(obj);
                        }
                        warnings.extend(m.warnings);
                    }
                    Err(failure) => on_failure(binding.name(), binding.failure_policy, failure, warnings)?,
                }
            }
        }

        for binding in &self.validating {
            if !binding.applies_to(req) {
                continue;
            }
            let hook = binding.hook.clone();
            let snapshot = req.clone();
            match guarded(binding.timeout, async move { hook.validate(&snapshot).await }).await {
                Ok(verdict) => {
                    warnings.extend(verdict.warnings);
                    if !verdict.allowed {
                        return Err(AdmissionError::Denied {
                            hook: binding.name().to_string(),
                            reason: verdict.reason.unwrap_or_else(|| "denied".to_string()),
                        });
                    }
                }
                Err(failure) => on_failure(binding.name(), binding.failure_policy, failure, warnings)?,
            }
        }
        Ok(())
    }
}

fn on_failure(hook: &str, policy: FailurePolicy, failure: CallFailure, warnings: &mut Vec<String>) -> Result<(), AdmissionError> {
    let reason = failure.describe();
    counter!("admission_hook_failures_total", 1u64, "hook" => hook.to_string(), "kind" => failure.kind());
    match policy {
        FailurePolicy::FailClosed => Err(AdmissionError::HookFailed { hook: hook.to_string(), reason }),
        FailurePolicy::FailOpen => {
            warn!(hook = %hook, error = %reason, "hook failed open");
            warnings.push(format!("{hook} failed open: {reason}"));
            Ok(())
        }
    }
}
