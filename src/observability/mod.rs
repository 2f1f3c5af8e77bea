//! Logging, metrics and diagnostic dumps for the lock manager.

use crate::ast::AstKind;
use crate::config::ObservabilityConfig;
use crate::error::{DlmError, Result};
use crate::namespace::Namespace;
use ::tracing::{info, warn};
use metrics::{counter, gauge};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding log directives for the lock manager. Takes
/// precedence over `RUST_LOG`.
pub const LOG_ENV: &str = "DLM_LOG";

/// Install the global subscriber: directives from `DLM_LOG`, then
/// `RUST_LOG`, then `config.log_level`; JSON lines when `json_logs` is set.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let directives = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok();
    let filter = log_filter(directives.as_deref(), &config.log_level)?;

    let (json, plain) = if config.json_logs {
        (Some(fmt::layer().json()), None)
    } else {
        (None, Some(fmt::layer().with_target(true)))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init()
        .map_err(|e| DlmError::Internal(format!("logging already initialized: {}", e)))?;

    info!(
        level = %config.log_level,
        json = config.json_logs,
        metrics = config.metrics_enabled,
        "lock manager logging ready"
    );
    Ok(())
}

/// Parse `directives` from the environment, or `level` when there are none.
pub fn log_filter(directives: Option<&str>, level: &str) -> Result<EnvFilter> {
    let (field, source) = match directives.filter(|d| !d.trim().is_empty()) {
        Some(directives) => (LOG_ENV, directives),
        None => ("observability.log_level", level),
    };
    EnvFilter::try_new(source).map_err(|e| DlmError::InvalidConfig {
        field: field.into(),
        reason: e.to_string(),
    })
}

/// Record an enqueue request by outcome ("granted", "blocked", "failed").
pub fn record_enqueue(namespace: &str, outcome: &'static str) {
    counter!(
        "dlm_enqueue_total",
        "namespace" => namespace.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a grant, immediate or from reprocessing.
pub fn record_grant(namespace: &str) {
    counter!("dlm_grants_total", "namespace" => namespace.to_string()).increment(1);
}

/// Record a callback sent.
pub fn record_ast(kind: AstKind) {
    counter!("dlm_ast_sent_total", "kind" => kind.as_str()).increment(1);
}

/// Record a callback that failed.
pub fn record_ast_failure(kind: AstKind, status: i32) {
    counter!(
        "dlm_ast_failures_total",
        "kind" => kind.as_str(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record an evicted export.
pub fn record_eviction() {
    counter!("dlm_evictions_total").increment(1);
}

/// Record locks given back from the unused cache.
pub fn record_lru_cancel(count: usize) {
    counter!("dlm_lru_cancels_total").increment(count as u64);
}

/// Update the number of locks waiting for a callback reply.
pub fn set_waiting_locks(count: usize) {
    gauge!("dlm_waiting_locks").set(count as f64);
}

/// Destination for diagnostic dumps.
///
/// Dumps are fire-and-forget: implementations must not block.
pub trait DumpSink: Send + Sync {
    fn dump(&self, reason: &str, ns: &Namespace);
}

/// Writes every resource and lock of a namespace to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDump;

impl DumpSink for TracingDump {
    fn dump(&self, reason: &str, ns: &Namespace) {
        warn!(
            namespace = ns.name(),
            reason,
            resources = ns.resource_count(),
            locks = ns.lock_count(),
            unused = ns.unused_count(),
            "namespace dump"
        );
        for res in ns.resources() {
            let locks = res.locks();
            info!(resource = %res.id(), lock_type = %res.lock_type(), count = locks.len(), "resource");
            for lock in locks {
                info!("  {}", lock.debug());
            }
        }
    }
}
