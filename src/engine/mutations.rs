use tracing::{info, warn};
use ulid::Ulid;

use crate::audit::{AuditAction, AuditEvent};
use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError, Entity};

fn require_text(field: &'static str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidArgument(format!("{field} cannot be blank")));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded(field));
    }
    Ok(())
}

impl Engine {
    pub async fn register_user(
        &self,
        id: Ulid,
        username: &str,
        role: Role,
    ) -> Result<(), EngineError> {
        require_text("username", username, MAX_USERNAME_LEN)?;
        if self.store.user_count() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        let now = now_ms();
        let user = User {
            id,
            username: username.to_string(),
            role,
            record: Record::new(id, now),
        };

        let gate = self.journal_gate.read().await;
        if !self.store.insert_user(user) {
            return Err(EngineError::AlreadyExists {
                entity: Entity::User,
                id: id.to_string(),
            });
        }
        let event = Event::UserRegistered {
            id,
            username: username.to_string(),
            role,
            at: now,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.store.remove_user(&id);
            return Err(e);
        }
        drop(gate);

        self.emit(
            AuditEvent::system(AuditAction::UserRegistered, Some(id), username, now)
                .success(format!("user registered with role {role:?}")),
        )
        .await;
        Ok(())
    }

    pub async fn create_resource(&self, new: NewResource) -> Result<ResourceInfo, EngineError> {
        let now = now_ms();
        let result = self.try_create_resource(&new, now).await;
        match &result {
            Ok(info) => {
                info!(resource = %info.id, device = %info.device_id, "resource created");
                self.emit(
                    AuditEvent::system(AuditAction::ResourceCreated, Some(info.id), &info.name, now)
                        .success(format!("resource created: {}", info.device_id)),
                )
                .await;
            }
            Err(e) => {
                self.emit(
                    AuditEvent::system(AuditAction::ResourceCreated, None, &new.name, now)
                        .failure("failed to create resource", e),
                )
                .await;
            }
        }
        result
    }

    async fn try_create_resource(&self, new: &NewResource, now: Ms) -> Result<ResourceInfo, EngineError> {
        require_text("device id", &new.device_id, MAX_DEVICE_ID_LEN)?;
        require_text("resource name", &new.name, MAX_NAME_LEN)?;
        require_text("resource type", &new.kind, MAX_KIND_LEN)?;
        if new.timeout_minutes > MAX_TIMEOUT_MINUTES {
            return Err(EngineError::LimitExceeded("timeout too long"));
        }
        if self.store.live_resource_count() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let _gate = self.journal_gate.read().await;
        let id = Ulid::new();
        if !self.store.claim_device(&new.device_id, id) {
            return Err(EngineError::AlreadyExists {
                entity: Entity::Resource,
                id: new.device_id.clone(),
            });
        }
        let event = Event::ResourceCreated {
            id,
            public_id: Ulid::new(),
            device_id: new.device_id.clone(),
            name: new.name.clone(),
            kind: new.kind.clone(),
            status: new.status.unwrap_or(ResourceStatus::Inactive),
            timeout_minutes: new.timeout_minutes,
            locked_for_admin: new.locked_for_admin,
            at: now,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.store.release_device(&new.device_id, &id);
            return Err(e);
        }
        let state = self
            .store
            .create_from_event(&event)
            .ok_or_else(|| EngineError::not_found(Entity::Resource, id))?;
        let guard = state.read().await;
        Ok(ResourceInfo::from(&guard.resource))
    }

    /// Administrative status change.
    ///
    /// INACTIVE⇄FREE freely; RESERVED→FREE only once nothing occupies the resource.
    /// RESERVED is entered only through reservations or device reports, and is never
    /// left straight for INACTIVE.
    pub async fn update_resource_status(
        &self,
        resource_id: Ulid,
        status: ResourceStatus,
    ) -> Result<ResourceInfo, EngineError> {
        let now = now_ms();
        let result = self.try_update_status(resource_id, status, now).await;
        match &result {
            Ok((info, old)) => {
                info!(resource = %resource_id, from = %old, to = %status, "resource status updated");
                self.emit(
                    AuditEvent::system(AuditAction::ResourceStatusUpdated, Some(resource_id), &info.name, now)
                        .success(format!("status changed from {old} to {status}")),
                )
                .await;
            }
            Err(e) => {
                let label = self.resource_label(&resource_id).await;
                self.emit(
                    AuditEvent::system(AuditAction::ResourceStatusUpdated, Some(resource_id), label, now)
                        .failure(format!("failed to set status {status}"), e),
                )
                .await;
            }
        }
        result.map(|(info, _)| info)
    }

    async fn try_update_status(
        &self,
        resource_id: Ulid,
        status: ResourceStatus,
        now: Ms,
    ) -> Result<(ResourceInfo, ResourceStatus), EngineError> {
        let handle = self.resolve_public(&resource_id)?;
        let _gate = self.journal_gate.read().await;
        let mut guard = handle.write().await;
        if guard.resource.record.deleted {
            return Err(EngineError::not_found(Entity::Resource, resource_id));
        }
        let old = guard.resource.status;
        if old == status {
            return Ok((ResourceInfo::from(&guard.resource), old));
        }
        match (old, status) {
            (_, ResourceStatus::Reserved) => {
                return Err(EngineError::InvalidState(
                    "RESERVED is only entered through a reservation".into(),
                ));
            }
            (ResourceStatus::Reserved, ResourceStatus::Inactive) => {
                return Err(EngineError::InvalidState(
                    "close the occupying reservation before deactivating".into(),
                ));
            }
            (ResourceStatus::Reserved, ResourceStatus::Free) => {
                if let Some(r) = guard.occupying(now).next() {
                    return Err(EngineError::InvalidState(format!(
                        "reservation {} still occupies the resource",
                        r.record.public_id
                    )));
                }
                warn!(resource = %resource_id, "clearing RESERVED status with no occupying reservation");
            }
            _ => {}
        }
        let event = Event::ResourceStatusChanged {
            id: guard.id(),
            status,
            at: now,
        };
        self.persist_and_apply(&mut guard, event).await?;
        Ok((ResourceInfo::from(&guard.resource), old))
    }

    /// Soft delete. Refused while any reservation on the resource is still open.
    pub async fn delete_resource(&self, resource_id: Ulid) -> Result<(), EngineError> {
        let now = now_ms();
        let result = self.try_delete_resource(resource_id, now).await;
        match &result {
            Ok((name, device_id)) => {
                self.notify.remove(device_id);
                info!(resource = %resource_id, device = %device_id, "resource deleted");
                self.emit(
                    AuditEvent::system(AuditAction::ResourceDeleted, Some(resource_id), name, now)
                        .success(format!("resource deleted: {device_id}")),
                )
                .await;
            }
            Err(e) => {
                self.emit(
                    AuditEvent::system(AuditAction::ResourceDeleted, Some(resource_id), "Unknown", now)
                        .failure("failed to delete resource", e),
                )
                .await;
            }
        }
        result.map(|_| ())
    }

    async fn try_delete_resource(&self, resource_id: Ulid, now: Ms) -> Result<(String, String), EngineError> {
        let handle = self.resolve_public(&resource_id)?;
        let _gate = self.journal_gate.read().await;
        let mut guard = handle.write().await;
        if guard.resource.record.deleted {
            return Err(EngineError::not_found(Entity::Resource, resource_id));
        }
        if let Some(r) = guard.active().next() {
            return Err(EngineError::InvalidState(format!(
                "reservation {} is still active",
                r.record.public_id
            )));
        }
        let event = Event::ResourceDeleted {
            id: guard.id(),
            at: now,
        };
        self.persist_and_apply(&mut guard, event).await?;
        Ok((guard.resource.name.clone(), guard.resource.device_id.clone()))
    }
}
