//! Audit trail boundary.
//!
//! The engine describes every mutating attempt as an [`AuditEvent`] and hands it to an
//! [`AuditSink`]. Storage and querying belong to the sink. Sink failures are absorbed by
//! [`Auditor`] so they can never abort the state transition being audited.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    ResourceCreated,
    ResourceStatusUpdated,
    ResourceDeleted,
    UserRegistered,
    ReservationCreated,
    ReservationReleased,
    ReservationExpired,
    DeviceStatusUpdate,
    DeviceAutoRelease,
    DeviceCommandSent,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ResourceCreated => "RESOURCE_CREATED",
            AuditAction::ResourceStatusUpdated => "RESOURCE_STATUS_UPDATED",
            AuditAction::ResourceDeleted => "RESOURCE_DELETED",
            AuditAction::UserRegistered => "USER_REGISTERED",
            AuditAction::ReservationCreated => "RESERVATION_CREATED",
            AuditAction::ReservationReleased => "RESERVATION_RELEASED",
            AuditAction::ReservationExpired => "RESERVATION_EXPIRED",
            AuditAction::DeviceStatusUpdate => "DEVICE_STATUS_UPDATE",
            AuditAction::DeviceAutoRelease => "DEVICE_AUTO_RELEASE",
            AuditAction::DeviceCommandSent => "DEVICE_COMMAND_SENT",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// Label used for actions the engine performs on its own behalf.
pub const SYSTEM_ACTOR: &str = "SYSTEM";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub actor_id: Option<Ulid>,
    pub actor_label: String,
    pub action: AuditAction,
    pub target_id: Option<Ulid>,
    pub target_label: String,
    pub outcome: AuditOutcome,
    pub detail: String,
    pub error_detail: Option<String>,
    pub at: Ms,
}

impl AuditEvent {
    pub fn new(
        actor_id: Option<Ulid>,
        actor_label: impl Into<String>,
        action: AuditAction,
        target_id: Option<Ulid>,
        target_label: impl Into<String>,
        at: Ms,
    ) -> Self {
        Self {
            actor_id,
            actor_label: actor_label.into(),
            action,
            target_id,
            target_label: target_label.into(),
            outcome: AuditOutcome::Success,
            detail: String::new(),
            error_detail: None,
            at,
        }
    }

    pub fn system(
        action: AuditAction,
        target_id: Option<Ulid>,
        target_label: impl Into<String>,
        at: Ms,
    ) -> Self {
        Self::new(None, SYSTEM_ACTOR, action, target_id, target_label, at)
    }

    pub fn success(mut self, detail: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Success;
        self.detail = detail.into();
        self
    }

    pub fn failure(mut self, detail: impl Into<String>, error: impl fmt::Display) -> Self {
        self.outcome = AuditOutcome::Failure;
        self.detail = detail.into();
        self.error_detail = Some(error.to_string());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
    #[error("audit event rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Writes audit events to the `tracing` log only.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        match event.outcome {
            AuditOutcome::Success => info!(
                target: "occupant::audit",
                action = %event.action,
                actor = %event.actor_label,
                target_label = %event.target_label,
                "{}",
                event.detail
            ),
            AuditOutcome::Failure => warn!(
                target: "occupant::audit",
                action = %event.action,
                actor = %event.actor_label,
                target_label = %event.target_label,
                error = event.error_detail.as_deref().unwrap_or(""),
                "{}",
                event.detail
            ),
        }
        Ok(())
    }
}

/// Keeps every event in memory. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn of_action(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// Fire-and-forget front for an [`AuditSink`].
#[derive(Clone)]
pub struct Auditor {
    sink: Arc<dyn AuditSink>,
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub async fn emit(&self, event: AuditEvent) {
        let action = event.action;
        if let Err(e) = self.sink.record(event).await {
            metrics::counter!(crate::observability::AUDIT_FAILURES_TOTAL).increment(1);
            error!(%action, "failed to record audit event: {e}");
        }
    }
}
