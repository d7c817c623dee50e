use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::{Client, ResourceExt};
use prometheus::{Encoder, TextEncoder};
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use vpsie_autoscaler::cluster::{ClusterOps, FIELD_MANAGER, KubeClusterOps, MetricsApiSource};
use vpsie_autoscaler::config::ScaleDownConfig;
use vpsie_autoscaler::crd::{MemberPhase, MemberSummary, NodeGroup, NodeGroupStatus};
use vpsie_autoscaler::drain::InFlightSet;
use vpsie_autoscaler::metrics;
use vpsie_autoscaler::provider::{ProviderExecutor, VpsieVmClient};
use vpsie_autoscaler::scaledown::{self, ScaleDownContext};
use vpsie_autoscaler::utilization::UtilizationTracker;

/* ============================= CONFIG ============================= */

const REQUEUE_INTERVAL: Duration = Duration::from_secs(30);
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(60);

/* ============================= STATE ============================= */

pub(crate) struct ReconcileState {
    pub(crate) ready: bool,
}

/* ============================= CONTEXT ============================= */

struct ReconcileContext {
    client: Client,
    scaledown: ScaleDownContext<KubeClusterOps, MetricsApiSource, VpsieVmClient>,
}

#[derive(Debug, thiserror::Error)]
enum ReconcileError {
    #[error("kube API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

/* ============================= ENTRY ============================= */

pub async fn run() -> Result<()> {
    println!("Starting VPSie autoscaler operator...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    // Verify actual cluster connectivity before starting the controller
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  VPSie API credentials ....... ");
    let provider = match VpsieVmClient::from_env() {
        Ok(p) => {
            println!("OK");
            p
        }
        Err(e) => {
            println!("FAIL");
            return Err(e);
        }
    };

    let defaults = ScaleDownConfig::default();
    let ctx = Arc::new(ReconcileContext {
        client: client.clone(),
        scaledown: ScaleDownContext {
            cluster: KubeClusterOps::new(client.clone()),
            metrics_source: MetricsApiSource::new(client.clone()),
            executor: Arc::new(ProviderExecutor::new(
                provider,
                defaults.global_termination_concurrency,
            )),
            tracker: Arc::new(UtilizationTracker::new()),
            in_flight: InFlightSet::new(),
        },
    });

    metrics::force_init();

    let addr = SocketAddr::from(([0, 0, 0, 0], 9090));

    println!("  CRD watch ................... NodeGroup.autoscaler.vpsie.io/v1");
    println!(
        "  Requeue interval ............ {}s",
        REQUEUE_INTERVAL.as_secs()
    );
    println!("  Metrics server .............. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!(
        "    GET /readyz ............... Readiness probe (503 until first reconcile, then 200)"
    );
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("autoscaler_controller_started");

    let reconcile_state = Arc::new(Mutex::new(ReconcileState { ready: false }));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = reconcile_state.clone();
    let http_shutdown = shutdown_tx.subscribe();

    let http_handle =
        tokio::spawn(async move { start_metrics_server(http_state, http_shutdown, addr).await });

    let groups: Api<NodeGroup> = Api::all(client.clone());
    let controller_state = reconcile_state.clone();
    let controller = Controller::new(groups, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| {
            let state = controller_state.clone();
            async move {
                // Mark ready after first successful reconcile dispatch
                {
                    let mut s = state.lock().await;
                    if !s.ready {
                        s.ready = true;
                    }
                }
                match result {
                    Ok((_obj, _action)) => {}
                    Err(e) => {
                        warn!(error = %e, "reconcile_dispatch_error");
                        eprintln!("[ERROR] Reconcile dispatch: {e}");
                    }
                }
            }
        });

    // Use select! so Ctrl+C drops (cancels) the controller stream.
    // The kube Controller has no built-in shutdown hook, so dropping
    // the future is the only way to stop it cleanly.
    tokio::select! {
        _ = controller => {
            info!("autoscaler_controller_stream_ended");
            println!("\nController stream ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping operator...");
            println!("{}", "=".repeat(70));
        }
    }

    // Signal the HTTP server to shut down
    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("operator_stopped");
    println!("Operator stopped.");

    Ok(())
}

/* ============================= RECONCILE ============================= */

async fn reconcile(
    group: Arc<NodeGroup>,
    ctx: Arc<ReconcileContext>,
) -> std::result::Result<Action, ReconcileError> {
    let name = group.name_any();
    let namespace = group.namespace().unwrap_or_default();

    metrics::RECONCILE_TOTAL.inc();
    let _timer = metrics::RECONCILE_DURATION.start_timer();

    info!(group = %name, namespace = %namespace, "reconcile_start");

    // Member teardown on group deletion is the lifecycle watcher's job.
    if group.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    if let Err(err) = group.spec.validate() {
        warn!(group = %name, error = %err, "nodegroup_spec_invalid");
        let status = NodeGroupStatus {
            message: Some(format!("invalid spec: {err}")),
            ..Default::default()
        };
        patch_status(&ctx.client, &namespace, &name, &status).await?;
        return Ok(Action::requeue(REQUEUE_INTERVAL));
    }

    let now = chrono::Utc::now();
    let summary = scaledown::run_scale_down_pass(&ctx.scaledown, &group, now).await?;

    // Recompute counts from the surviving members.
    let members = ctx
        .scaledown
        .cluster
        .list_group_members(&namespace, &name)
        .await?;
    let current = members.len() as u32;
    let ready = members
        .iter()
        .filter(|m| m.phase() == MemberPhase::Ready)
        .count() as u32;
    let summaries: Vec<MemberSummary> = members
        .iter()
        .map(|m| MemberSummary {
            name: m.metadata.name.clone().unwrap_or_default(),
            phase: m.phase(),
            node_name: m.node_name().map(str::to_string),
        })
        .collect();

    let message = summary.message();
    let status = NodeGroupStatus {
        current_count: Some(current),
        ready_count: Some(ready),
        members: Some(summaries),
        // The cooldown window starts at provider-confirmed deletion.
        last_scale_down: summary
            .removed
            .as_ref()
            .map(|r| r.completed_at.to_rfc3339()),
        last_blocked_reason: summary
            .blocked
            .first()
            .map(|(_, reason)| reason.to_string()),
        message: Some(message.clone()),
        ..Default::default()
    };
    patch_status(&ctx.client, &namespace, &name, &status).await?;

    println!(
        "[{}] {namespace}/{name}: {message} ({current} members, {ready} ready)",
        now.format("%H:%M:%S")
    );

    info!(
        group = %name,
        namespace = %namespace,
        current,
        ready,
        candidates = summary.candidates,
        blocked = summary.blocked.len(),
        errors = summary.errors.len(),
        removed = summary.removed.is_some(),
        "reconcile_evaluated"
    );

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

async fn patch_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &NodeGroupStatus,
) -> std::result::Result<(), kube::Error> {
    let groups: Api<NodeGroup> = Api::namespaced(client.clone(), namespace);
    groups
        .patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&serde_json::json!({ "status": status })),
        )
        .await?;
    info!(group = %name, "status_updated");
    Ok(())
}

/* ============================= ERROR POLICY ============================= */

fn error_policy(
    _group: Arc<NodeGroup>,
    error: &ReconcileError,
    _ctx: Arc<ReconcileContext>,
) -> Action {
    metrics::RECONCILE_ERRORS.inc();
    warn!(error = %error, "reconcile_error");
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_reconcile_router(state: Arc<Mutex<ReconcileState>>) -> Router {
    Router::new()
        .route("/metrics", get(reconcile_metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || reconcile_ready_handler(state.clone())
            }),
        )
}

async fn start_metrics_server(
    state: Arc<Mutex<ReconcileState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_reconcile_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server on :9090")?;

    info!(addr = %addr, "reconcile_metrics_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn reconcile_ready_handler(state: Arc<Mutex<ReconcileState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn reconcile_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics::REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */
