//! Device reconciler: folds device-reported state into canonical resource status.
//!
//! Devices are unauthenticated and may retry, so every entry point validates its
//! payload, resolves the resource by its device-facing id, and treats a redundant
//! notification as a logged no-op rather than an error.

use tracing::{debug, error, info, warn};

use crate::audit::{AuditAction, AuditEvent};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::now_ms;
use super::{Engine, EngineError, Entity};

fn validate_device_id(device_id: &str) -> Result<(), EngineError> {
    if device_id.trim().is_empty() {
        return Err(EngineError::InvalidArgument("resource id cannot be blank".into()));
    }
    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(EngineError::InvalidArgument("resource id too long".into()));
    }
    Ok(())
}

/// What a status report changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub previous: ResourceStatus,
    pub current: ResourceStatus,
    /// First-connection handshake moved the resource out of INACTIVE.
    pub auto_activated: bool,
}

impl Engine {
    /// Apply a device's self-reported status. `timestamp` is the device's own clock
    /// and is only recorded, never trusted for ordering.
    pub async fn report_status(
        &self,
        device_id: &str,
        raw_status: &str,
        timestamp: Ms,
        first_connection: bool,
    ) -> Result<StatusReport, EngineError> {
        let now = now_ms();
        let result = self
            .try_report_status(device_id, raw_status, timestamp, first_connection, now)
            .await;
        metrics::counter!(observability::DEVICE_REPORTS_TOTAL, "status" => observability::status_label(&result))
            .increment(1);
        if let Err(e) = &result {
            error!(device = %device_id, "failed to update device status: {e}");
            self.emit(
                AuditEvent::system(AuditAction::DeviceStatusUpdate, None, device_id, now)
                    .failure(format!("failed to apply device status {raw_status:?}"), e),
            )
            .await;
        }
        result
    }

    async fn try_report_status(
        &self,
        device_id: &str,
        raw_status: &str,
        timestamp: Ms,
        first_connection: bool,
        now: Ms,
    ) -> Result<StatusReport, EngineError> {
        validate_device_id(device_id)?;
        if raw_status.len() > MAX_DEVICE_STATUS_LEN {
            return Err(EngineError::InvalidArgument("device status too long".into()));
        }
        // Map before touching anything: an unknown status must leave no trace.
        let mapped = ResourceStatus::from_device(raw_status).ok_or_else(|| {
            EngineError::InvalidArgument(format!("unknown device status: {raw_status}"))
        })?;
        let handle = self.resolve_device(device_id)?;

        let mut audits = Vec::new();
        // Audits for writes that already reached the journal go out even if a later
        // write in the same report fails.
        let report = async {
            let _gate = self.journal_gate.read().await;
            let mut guard = handle.write().await;
            if guard.resource.record.deleted {
                return Err(EngineError::not_found(Entity::Resource, device_id));
            }
            let public_id = guard.resource.record.public_id;
            let name = guard.resource.name.clone();
            let previous = guard.resource.status;

            let auto_activated = first_connection && previous == ResourceStatus::Inactive;
            if auto_activated {
                info!(device = %device_id, "first connection, auto-activating");
                let event = Event::ResourceStatusChanged {
                    id: guard.id(),
                    status: ResourceStatus::Free,
                    at: now,
                };
                self.persist_and_apply(&mut guard, event).await?;
                audits.push(
                    AuditEvent::system(AuditAction::DeviceStatusUpdate, Some(public_id), &name, now)
                        .success(format!("device auto-activated on first connection at {timestamp}")),
                );
            } else if first_connection {
                debug!(device = %device_id, status = %previous, "first connection on an already active device");
            }

            let before = guard.resource.status;
            if before != mapped {
                if mapped != ResourceStatus::Reserved
                    && let Some(r) = guard.occupying(now).next()
                {
                    warn!(
                        device = %device_id,
                        reservation = %r.record.public_id,
                        "device reports {mapped} while a reservation is open"
                    );
                }
                let event = Event::ResourceStatusChanged {
                    id: guard.id(),
                    status: mapped,
                    at: now,
                };
                self.persist_and_apply(&mut guard, event).await?;
                let suffix = if auto_activated { " (device auto-activated)" } else { "" };
                info!(device = %device_id, from = %before, to = %mapped, "device status updated{suffix}");
                audits.push(
                    AuditEvent::system(AuditAction::DeviceStatusUpdate, Some(public_id), &name, now)
                        .success(format!(
                            "device updated status from {before} to {mapped} at {timestamp}{suffix}"
                        )),
                );
            } else if auto_activated {
                info!(device = %device_id, "device auto-activated without status change");
            }

            Ok::<_, EngineError>(StatusReport {
                previous,
                current: guard.resource.status,
                auto_activated,
            })
        }
        .await;

        for event in audits {
            self.emit(event).await;
        }
        report
    }

    /// Device signals it was physically vacated.
    pub async fn process_auto_release(
        &self,
        device_id: &str,
        reason: Option<&str>,
        timestamp: Ms,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        self.process_auto_release_at(device_id, reason, timestamp, now_ms())
            .await
    }

    /// Frees the resource and closes every open reservation on it through the shared
    /// finish path. A no-op (logged) unless the resource is RESERVED: devices retry.
    pub async fn process_auto_release_at(
        &self,
        device_id: &str,
        reason: Option<&str>,
        timestamp: Ms,
        now: Ms,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        let result = self.try_auto_release(device_id, reason, timestamp, now).await;
        metrics::counter!(observability::DEVICE_AUTO_RELEASES_TOTAL, "status" => observability::status_label(&result))
            .increment(1);
        let reason = reason.unwrap_or("unspecified");
        match &result {
            Ok(Some((public_id, name, closed))) => {
                for info in closed {
                    metrics::counter!(observability::RESERVATIONS_FINISHED_TOTAL, "cause" => FinishCause::DeviceAutoRelease.as_str())
                        .increment(1);
                    debug!(reservation = %info.id, "closed by device auto-release");
                }
                info!(device = %device_id, reason, closed = closed.len(), "device auto-released resource");
                self.emit(
                    AuditEvent::system(AuditAction::DeviceAutoRelease, Some(*public_id), name, now)
                        .success(format!(
                            "device auto-released resource at {timestamp} (reason: {reason})"
                        )),
                )
                .await;
            }
            Ok(None) => {}
            Err(e) => {
                error!(device = %device_id, "failed to process auto-release: {e}");
                self.emit(
                    AuditEvent::system(AuditAction::DeviceAutoRelease, None, device_id, now)
                        .failure("failed to process auto-release", e),
                )
                .await;
            }
        }
        result.map(|r| r.map(|(_, _, closed)| closed).unwrap_or_default())
    }

    #[allow(clippy::type_complexity)]
    async fn try_auto_release(
        &self,
        device_id: &str,
        reason: Option<&str>,
        timestamp: Ms,
        now: Ms,
    ) -> Result<Option<(ulid::Ulid, String, Vec<ReservationInfo>)>, EngineError> {
        validate_device_id(device_id)?;
        if reason.is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::InvalidArgument("reason too long".into()));
        }
        let handle = self.resolve_device(device_id)?;

        let _gate = self.journal_gate.read().await;
        let mut guard = handle.write().await;
        if guard.resource.record.deleted {
            return Err(EngineError::not_found(Entity::Resource, device_id));
        }
        if guard.resource.status != ResourceStatus::Reserved {
            warn!(
                device = %device_id,
                status = %guard.resource.status,
                timestamp,
                "auto-release ignored: resource not reserved"
            );
            return Ok(None);
        }

        let open: Vec<ulid::Ulid> = guard.active().map(|r| r.id).collect();
        let mut closed = Vec::with_capacity(open.len());
        for id in open {
            match self.finish_locked(&mut guard, id, now).await {
                Ok(finished) => closed.push(finished.info),
                Err(EngineError::InvalidState(msg)) => debug!("auto-release skip: {msg}"),
                Err(e) => return Err(e),
            }
        }
        if guard.resource.status != ResourceStatus::Free {
            let event = Event::ResourceStatusChanged {
                id: guard.id(),
                status: ResourceStatus::Free,
                at: now,
            };
            self.persist_and_apply(&mut guard, event).await?;
        }
        Ok(Some((
            guard.resource.record.public_id,
            guard.resource.name.clone(),
            closed,
        )))
    }

    /// Read-only projection for a device. When RESERVED, names the occupant.
    ///
    /// More than one open reservation whose window contains `now` is reported as
    /// `Integrity` instead of picking one.
    pub async fn get_status(&self, device_id: &str) -> Result<DeviceStatusView, EngineError> {
        self.get_status_at(device_id, now_ms()).await
    }

    pub async fn get_status_at(&self, device_id: &str, now: Ms) -> Result<DeviceStatusView, EngineError> {
        validate_device_id(device_id)?;
        let handle = self.resolve_device(device_id)?;
        let guard = handle.read().await;
        if guard.resource.record.deleted {
            return Err(EngineError::not_found(Entity::Resource, device_id));
        }

        let mut occupant = None;
        if guard.resource.status == ResourceStatus::Reserved {
            let occupying: Vec<&Reservation> = guard.occupying(now).collect();
            let covering: Vec<&Reservation> =
                occupying.iter().copied().filter(|r| r.covers(now)).collect();
            let holder = match covering.as_slice() {
                // Only overdue reservations left: the latest one still holds the resource
                [] => occupying.last().copied(),
                [r] => Some(*r),
                many => {
                    metrics::counter!(observability::INTEGRITY_VIOLATIONS_TOTAL).increment(1);
                    let ids: Vec<String> = many.iter().map(|r| r.record.public_id.to_string()).collect();
                    error!(device = %device_id, reservations = ?ids, "multiple reservations occupy one resource");
                    return Err(EngineError::Integrity {
                        resource: guard.resource.record.public_id,
                        active: many.len(),
                    });
                }
            };
            match holder {
                None => debug!(device = %device_id, "RESERVED with no occupying reservation"),
                Some(r) => {
                    occupant = Some(OccupantSummary {
                        username: self.user_label(&r.user_id),
                        start: r.start,
                        predicted_end: r.predicted_end,
                    });
                }
            }
        }

        Ok(DeviceStatusView {
            resource_id: guard.resource.device_id.clone(),
            status: guard.resource.status,
            occupant,
        })
    }
}
