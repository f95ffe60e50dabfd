//! Activity audit trail.
//!
//! Every authoritative state change gets one audit record. The sink is
//! fire-and-forget; losing an audit line never fails the operation that
//! produced it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::types::UserId;

/// One audit record. `actor` is None for system-initiated changes
/// (scheduler fires, sweep closes).
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub actor: Option<UserId>,
    pub action: &'static str,
    pub subject: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn record(&self, entry: ActivityEntry);
}

/// Spawning wrapper, same fire-and-forget discipline as the
/// notification fanout.
#[derive(Clone)]
pub struct Audit {
    log: Arc<dyn ActivityLog>,
}

impl Audit {
    pub fn new(log: Arc<dyn ActivityLog>) -> Self {
        Self { log }
    }

    pub fn record(&self, actor: Option<UserId>, action: &'static str, subject: String) {
        let log = Arc::clone(&self.log);
        let entry = ActivityEntry {
            actor,
            action,
            subject,
            at: Utc::now(),
        };
        tokio::spawn(async move {
            log.record(entry).await;
        });
    }
}

/// Default sink: a dedicated tracing target, so audit lines can be
/// filtered and shipped separately from operational logs.
pub struct TracingActivityLog;

#[async_trait]
impl ActivityLog for TracingActivityLog {
    async fn record(&self, entry: ActivityEntry) {
        tracing::info!(
            target: "gavel::audit",
            actor = ?entry.actor,
            action = entry.action,
            subject = %entry.subject,
            "activity"
        );
    }
}
