//! VM termination through the provider capability.
//!
//! The VPSie HTTP client lives behind [`VmProvider`]; only its request
//! contract matters here. The executor owns retry classification, the
//! cluster-wide concurrency bound, and the member phase transitions around
//! a delete.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cluster::ClusterOps;
use crate::config::ScaleDownConfig;
use crate::crd::{MemberPhase, NodeMember};
use crate::metrics;

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);

/* ============================= CONTRACT ============================= */

/// Classified failure of one provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// 429 from the provider; retry after the indicated delay.
    RateLimited { retry_after: Duration },
    /// 5xx or connection-level failure; retry with back-off.
    Transient(String),
    /// The VM no longer exists. For a delete this is success.
    NotFound,
    /// Credential rejection; retrying cannot help.
    Auth(String),
    /// Any other definitive rejection.
    Permanent(String),
}

impl ProviderError {
    /// Label used by `scale_down_errors_total{error_type}`.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Transient(_) => "transient",
            ProviderError::NotFound => "not_found",
            ProviderError::Auth(_) => "auth",
            ProviderError::Permanent(_) => "permanent_other",
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {}s", retry_after.as_secs())
            }
            ProviderError::Transient(e) => write!(f, "transient provider error: {e}"),
            ProviderError::NotFound => write!(f, "VM not found"),
            ProviderError::Auth(e) => write!(f, "provider authentication failed: {e}"),
            ProviderError::Permanent(e) => write!(f, "provider rejected request: {e}"),
        }
    }
}

/// Provider VM capability: delete a VM by its provider id.
pub trait VmProvider: Send + Sync {
    fn delete_vm(&self, vm_id: &str) -> impl Future<Output = Result<(), ProviderError>> + Send;
}

/* ============================= LIMITS ============================= */

#[derive(Debug, Clone)]
pub struct ExecutorLimits {
    /// Per-call timeout on provider requests.
    pub call_timeout: Duration,
    /// Cap on delete attempts across rate-limit and transient retries.
    pub max_attempts: u32,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl From<&ScaleDownConfig> for ExecutorLimits {
    fn from(cfg: &ScaleDownConfig) -> Self {
        Self {
            call_timeout: cfg.provider_call_timeout,
            ..Default::default()
        }
    }
}

/* ============================= EXECUTOR ============================= */

/// Why a termination did not complete.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationError {
    /// The member was not in Draining phase; nothing was attempted.
    InvariantViolation(String),
    /// Retryable failures outlasted the attempt budget.
    RetriesExhausted(String),
    /// Auth or permanent provider rejection; member moved to Failed.
    Fatal(String),
}

impl TerminationError {
    pub fn message(&self) -> &str {
        match self {
            TerminationError::InvariantViolation(m)
            | TerminationError::RetriesExhausted(m)
            | TerminationError::Fatal(m) => m,
        }
    }
}

pub struct ProviderExecutor<P: VmProvider> {
    provider: P,
    permits: Arc<Semaphore>,
}

impl<P: VmProvider> ProviderExecutor<P> {
    pub fn new(provider: P, global_concurrency: usize) -> Self {
        Self {
            provider,
            permits: Arc::new(Semaphore::new(global_concurrency.max(1))),
        }
    }

    /// Delete the member's VM after a safe drain.
    ///
    /// The member must be observed in Draining phase; it is moved to Deleting
    /// before the first provider call. On success the member stays in
    /// Deleting for the lifecycle watcher to collect. On fatal failure it is
    /// moved to Failed with the reason persisted; the caller owns the
    /// uncordon.
    pub async fn terminate<C: ClusterOps>(
        &self,
        cluster: &C,
        member: &NodeMember,
        limits: &ExecutorLimits,
    ) -> Result<(), TerminationError> {
        let name = member.metadata.name.clone().unwrap_or_default();
        let namespace = member.metadata.namespace.clone().unwrap_or_default();
        let vm_id = member.spec.vm_id.clone();

        if member.phase() != MemberPhase::Draining {
            let msg = format!(
                "member {name} is in phase {:?}, expected Draining",
                member.phase()
            );
            warn!(member = %name, "termination_invariant_violated");
            metrics::SCALE_DOWN_ERRORS
                .with_label_values(&["invariant"])
                .inc();
            return Err(TerminationError::InvariantViolation(msg));
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .expect("termination semaphore closed");

        cluster
            .set_member_phase(&namespace, &name, MemberPhase::Deleting, None)
            .await
            .map_err(|e| TerminationError::RetriesExhausted(format!("{e:#}")))?;

        let started = Instant::now();
        let result = self.delete_with_retry(&vm_id, &name, limits).await;
        match result {
            Ok(()) => {
                metrics::TERMINATION_DURATION.observe(started.elapsed().as_secs_f64());
                info!(member = %name, vm_id = %vm_id, "vm_deleted");
                Ok(())
            }
            Err(error) => {
                metrics::SCALE_DOWN_ERRORS
                    .with_label_values(&[error.error_type()])
                    .inc();
                let fatal = matches!(
                    error,
                    ProviderError::Auth(_) | ProviderError::Permanent(_)
                );
                let message = error.to_string();
                if let Err(e) = cluster
                    .set_member_phase(
                        &namespace,
                        &name,
                        MemberPhase::Failed,
                        Some(message.clone()),
                    )
                    .await
                {
                    warn!(member = %name, error = %format!("{e:#}"), "member_failed_phase_update_error");
                }
                warn!(member = %name, vm_id = %vm_id, error = %message, "vm_delete_failed");
                if fatal {
                    Err(TerminationError::Fatal(message))
                } else {
                    Err(TerminationError::RetriesExhausted(message))
                }
            }
        }
    }

    /// Issue the delete, absorbing rate limits and transient failures up to
    /// the attempt budget. `NotFound` means the VM is already gone and counts
    /// as success.
    async fn delete_with_retry(
        &self,
        vm_id: &str,
        member: &str,
        limits: &ExecutorLimits,
    ) -> Result<(), ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let call = tokio::time::timeout(limits.call_timeout, self.provider.delete_vm(vm_id));
            let outcome = match call.await {
                Ok(outcome) => outcome,
                Err(_elapsed) => Err(ProviderError::Transient(format!(
                    "provider call exceeded {}s",
                    limits.call_timeout.as_secs()
                ))),
            };

            let error = match outcome {
                Ok(()) => return Ok(()),
                Err(ProviderError::NotFound) => {
                    info!(member = %member, vm_id = %vm_id, "vm_already_absent");
                    return Ok(());
                }
                Err(e) => e,
            };

            match &error {
                ProviderError::RateLimited { retry_after } => {
                    if attempt >= limits.max_attempts {
                        return Err(error);
                    }
                    warn!(member = %member, attempt, "provider_rate_limited");
                    tokio::time::sleep(*retry_after).await;
                }
                ProviderError::Transient(_) => {
                    if attempt >= limits.max_attempts {
                        return Err(error);
                    }
                    warn!(member = %member, attempt, error = %error, "provider_retry");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
                _ => return Err(error),
            }
        }
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    RETRY_BASE
        .saturating_mul(1u32 << attempt.min(8))
        .min(RETRY_CAP)
}

/* ============================= VPSIE CLIENT ============================= */

/// Thin HTTP binding of the [`VmProvider`] contract against the VPSie API.
/// Only the delete call and its status classification live here.
pub struct VpsieVmClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl VpsieVmClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    /// Build from `VPSIE_API_URL` (optional) and `VPSIE_API_TOKEN` (required).
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = std::env::var("VPSIE_API_URL")
            .unwrap_or_else(|_| "https://api.vpsie.com/apps/v2".to_string());
        let token = std::env::var("VPSIE_API_TOKEN")
            .map_err(|_| anyhow::anyhow!("VPSIE_API_TOKEN is not set"))?;
        Ok(Self::new(base_url, token))
    }
}

impl VmProvider for VpsieVmClient {
    async fn delete_vm(&self, vm_id: &str) -> Result<(), ProviderError> {
        let url = format!("{}/vm/{vm_id}", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        match status.as_u16() {
            404 => Err(ProviderError::NotFound),
            401 | 403 => Err(ProviderError::Auth(format!("{status}"))),
            429 => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::from_secs(2));
                Err(ProviderError::RateLimited { retry_after })
            }
            500..=599 => Err(ProviderError::Transient(format!("{status}"))),
            _ => Err(ProviderError::Permanent(format!("{status}"))),
        }
    }
}

/* ============================= TESTS ============================= */
