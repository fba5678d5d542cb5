use tracing::{debug, error, info};
use ulid::Ulid;

use crate::audit::{AuditAction, AuditEvent};
use crate::limits::MAX_RESERVATIONS_PER_RESOURCE;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, now_ms, validate_window};
use super::{Engine, EngineError, Entity, SharedResourceState};

/// Outcome of closing one reservation.
#[derive(Debug, Clone)]
pub(super) struct Finished {
    pub info: ReservationInfo,
    pub device_id: String,
    /// The resource went back to FREE as part of the close.
    pub freed: bool,
}

/// Result of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub closed: Vec<ReservationInfo>,
    /// Records that could not be closed this time; the next sweep retries them.
    pub failed: usize,
}

impl Engine {
    pub async fn create_reservation(
        &self,
        resource_id: Ulid,
        user_id: Ulid,
        start: Ms,
        predicted_end: Ms,
    ) -> Result<ReservationInfo, EngineError> {
        self.create_reservation_at(resource_id, user_id, start, predicted_end, now_ms())
            .await
    }

    /// `create_reservation` with an explicit clock reading.
    pub async fn create_reservation_at(
        &self,
        resource_id: Ulid,
        user_id: Ulid,
        start: Ms,
        predicted_end: Ms,
        now: Ms,
    ) -> Result<ReservationInfo, EngineError> {
        let result = self
            .try_create_reservation(resource_id, user_id, start, predicted_end, now)
            .await;

        let actor = self.user_label(&user_id);
        match &result {
            Ok((info, occupied)) => {
                metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
                info!(reservation = %info.id, resource = %resource_id, user = %user_id, "reservation created");
                self.emit(
                    AuditEvent::new(
                        Some(user_id),
                        actor,
                        AuditAction::ReservationCreated,
                        Some(resource_id),
                        info.resource_name.clone(),
                        now,
                    )
                    .success(format!("reservation created from {start} to {predicted_end}")),
                )
                .await;
                if let Some(device_id) = occupied {
                    self.send_command(
                        resource_id,
                        &info.resource_name,
                        DeviceCommand::Reserve {
                            resource_id: device_id.clone(),
                            reservation_id: info.id,
                        },
                        now,
                    )
                    .await;
                }
            }
            Err(e) => {
                metrics::counter!(observability::RESERVATIONS_REJECTED_TOTAL, "kind" => e.kind())
                    .increment(1);
                debug!(resource = %resource_id, user = %user_id, "reservation rejected: {e}");
                let label = self.resource_label(&resource_id).await;
                self.emit(
                    AuditEvent::new(
                        Some(user_id),
                        actor,
                        AuditAction::ReservationCreated,
                        Some(resource_id),
                        label,
                        now,
                    )
                    .failure(
                        format!("failed to reserve window from {start} to {predicted_end}"),
                        e,
                    ),
                )
                .await;
            }
        }
        result.map(|(info, _)| info)
    }

    /// Returns the reservation and, when it occupies the resource right away,
    /// the device id to notify.
    async fn try_create_reservation(
        &self,
        resource_id: Ulid,
        user_id: Ulid,
        start: Ms,
        predicted_end: Ms,
        now: Ms,
    ) -> Result<(ReservationInfo, Option<String>), EngineError> {
        let span = validate_window(start, predicted_end)?;
        self.user(&user_id)?;
        let handle = self.resolve_public(&resource_id)?;

        let _gate = self.journal_gate.read().await;
        let mut guard = handle.write().await;
        if guard.resource.record.deleted {
            return Err(EngineError::not_found(Entity::Resource, resource_id));
        }
        if guard.resource.status != ResourceStatus::Free {
            return Err(EngineError::InvalidState(format!(
                "resource {} is {}, not FREE",
                guard.resource.name, guard.resource.status
            )));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }
        check_no_conflict(&guard, &span)?;

        // A future-dated reservation leaves the resource FREE; nothing flips it later.
        let occupies = start <= now;
        let public_id = Ulid::new();
        let event = Event::ReservationCreated {
            id: Ulid::new(),
            public_id,
            resource_id: guard.id(),
            user_id,
            start,
            predicted_end,
            at: now,
            occupies,
        };
        self.persist_and_apply(&mut guard, event).await?;

        let reservation = guard
            .find(&public_id)
            .ok_or_else(|| EngineError::not_found(Entity::Reservation, public_id))?;
        let info = ReservationInfo::new(&guard.resource, reservation);
        let device = occupies.then(|| guard.resource.device_id.clone());
        Ok((info, device))
    }

    pub async fn release_reservation(
        &self,
        reservation_id: Ulid,
        requesting_user_id: Ulid,
    ) -> Result<ReservationInfo, EngineError> {
        self.release_reservation_at(reservation_id, requesting_user_id, now_ms())
            .await
    }

    /// `release_reservation` with an explicit clock reading.
    pub async fn release_reservation_at(
        &self,
        reservation_id: Ulid,
        requesting_user_id: Ulid,
        now: Ms,
    ) -> Result<ReservationInfo, EngineError> {
        let result = self
            .try_release(reservation_id, requesting_user_id, now)
            .await;

        let actor = self.user_label(&requesting_user_id);
        match &result {
            Ok(finished) => {
                metrics::counter!(observability::RESERVATIONS_FINISHED_TOTAL, "cause" => FinishCause::UserRelease.as_str())
                    .increment(1);
                info!(reservation = %reservation_id, user = %requesting_user_id, freed = finished.freed, "reservation released");
                self.emit(
                    AuditEvent::new(
                        Some(requesting_user_id),
                        actor,
                        AuditAction::ReservationReleased,
                        Some(finished.info.resource_id),
                        finished.info.resource_name.clone(),
                        now,
                    )
                    .success(format!("reservation {reservation_id} released at {now}")),
                )
                .await;
                self.after_finish(finished, now).await;
            }
            Err(e) => {
                debug!(reservation = %reservation_id, "release rejected: {e}");
                self.emit(
                    AuditEvent::new(
                        Some(requesting_user_id),
                        actor,
                        AuditAction::ReservationReleased,
                        Some(reservation_id),
                        "Unknown",
                        now,
                    )
                    .failure(format!("failed to release reservation {reservation_id}"), e),
                )
                .await;
            }
        }
        result.map(|f| f.info)
    }

    async fn try_release(
        &self,
        reservation_id: Ulid,
        requesting_user_id: Ulid,
        now: Ms,
    ) -> Result<Finished, EngineError> {
        let _gate = self.journal_gate.read().await;
        let mut guard = self.resolve_reservation_write(&reservation_id).await?;
        let reservation = guard
            .find(&reservation_id)
            .filter(|r| !r.record.deleted)
            .ok_or_else(|| EngineError::not_found(Entity::Reservation, reservation_id))?;
        if reservation.user_id != requesting_user_id {
            return Err(EngineError::Forbidden(
                "users can only release their own reservations".into(),
            ));
        }
        if !reservation.active {
            return Err(EngineError::InvalidState(format!(
                "reservation {reservation_id} is already inactive"
            )));
        }
        let id = reservation.id;
        self.finish_locked(&mut guard, id, now).await
    }

    /// The single finish path shared by release, device auto-release and expiry.
    ///
    /// Conditional on the reservation still being active under the held write lock:
    /// of several racing callers exactly one succeeds, the rest get `InvalidState`.
    /// The resource returns to FREE only if it is RESERVED, this reservation had
    /// started, and no other open reservation still occupies it at `now`.
    pub(super) async fn finish_locked(
        &self,
        rs: &mut ResourceState,
        id: Ulid,
        now: Ms,
    ) -> Result<Finished, EngineError> {
        let reservation = rs
            .reservations
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| EngineError::not_found(Entity::Reservation, id))?;
        if !reservation.active {
            return Err(EngineError::InvalidState(format!(
                "reservation {} is already inactive",
                reservation.record.public_id
            )));
        }
        let public_id = reservation.record.public_id;
        let frees = rs.resource.status == ResourceStatus::Reserved
            && reservation.start <= now
            && rs.occupying(now).all(|other| other.id == id);

        let event = Event::ReservationFinished {
            id,
            resource_id: rs.id(),
            end: now,
            frees,
        };
        self.persist_and_apply(rs, event).await?;

        let reservation = rs
            .find(&public_id)
            .ok_or_else(|| EngineError::not_found(Entity::Reservation, public_id))?;
        Ok(Finished {
            info: ReservationInfo::new(&rs.resource, reservation),
            device_id: rs.resource.device_id.clone(),
            freed: frees,
        })
    }

    /// Tell the device its resource is free again. Called after the lock is dropped.
    async fn after_finish(&self, finished: &Finished, now: Ms) {
        if finished.freed {
            self.send_command(
                finished.info.resource_id,
                &finished.info.resource_name,
                DeviceCommand::Release {
                    resource_id: finished.device_id.clone(),
                },
                now,
            )
            .await;
        }
    }

    pub(super) async fn send_command(
        &self,
        resource_id: Ulid,
        resource_name: &str,
        command: DeviceCommand,
        now: Ms,
    ) {
        let (device_id, verb) = match &command {
            DeviceCommand::Reserve { resource_id, .. } => (resource_id.clone(), "RESERVE"),
            DeviceCommand::Release { resource_id } => (resource_id.clone(), "RELEASE"),
        };
        let receivers = self.notify.send(&device_id, command);
        debug!(device = %device_id, receivers, "{verb} command published");
        self.emit(
            AuditEvent::system(AuditAction::DeviceCommandSent, Some(resource_id), resource_name, now)
                .success(format!("{verb} command sent to device ({receivers} listening)")),
        )
        .await;
    }

    /// Close every open reservation whose predicted end is before `now`, freeing
    /// resources. The recorded end is `now`, not the predicted end.
    ///
    /// Safe to run concurrently with releases: each close is re-checked under the
    /// resource lock, and a reservation someone else already closed is skipped.
    pub async fn handle_expired(&self, now: Ms) -> SweepReport {
        let mut candidates: Vec<(SharedResourceState, Ulid)> = Vec::new();
        for handle in self.store.resource_handles() {
            let guard = handle.read().await;
            for r in guard.expired(now) {
                candidates.push((handle.clone(), r.id));
            }
        }

        let mut report = SweepReport::default();
        for (handle, id) in candidates {
            let result = {
                let _gate = self.journal_gate.read().await;
                let mut guard = handle.write().await;
                let still_expired = guard
                    .reservations
                    .iter()
                    .any(|r| r.id == id && r.is_open() && r.end.is_none() && r.predicted_end < now);
                if !still_expired {
                    debug!(reservation = %id, "expired reservation already closed");
                    continue;
                }
                self.finish_locked(&mut guard, id, now).await
            };

            match result {
                Ok(finished) => {
                    metrics::counter!(observability::RESERVATIONS_FINISHED_TOTAL, "cause" => FinishCause::Expired.as_str())
                        .increment(1);
                    info!(reservation = %finished.info.id, resource = %finished.info.resource_id, "reservation expired");
                    self.emit(
                        AuditEvent::system(
                            AuditAction::ReservationExpired,
                            Some(finished.info.resource_id),
                            finished.info.resource_name.clone(),
                            now,
                        )
                        .success(format!(
                            "reservation {} expired (predicted end {})",
                            finished.info.id, finished.info.predicted_end
                        )),
                    )
                    .await;
                    self.after_finish(&finished, now).await;
                    report.closed.push(finished.info);
                }
                Err(EngineError::InvalidState(msg)) => debug!("sweep skip: {msg}"),
                Err(e) => {
                    error!(reservation = %id, "failed to close expired reservation: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
