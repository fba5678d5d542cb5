use ulid::Ulid;

use crate::limits::MAX_PAGE_SIZE;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError, Entity};

impl Engine {
    pub async fn list_active_for_user(&self, user_id: Ulid) -> Result<Vec<ReservationInfo>, EngineError> {
        self.list_active_for_user_at(user_id, now_ms()).await
    }

    /// Open reservations owned by the user whose predicted end is still ahead of `now`.
    /// Overdue ones the sweeper has not reached yet are left out.
    pub async fn list_active_for_user_at(
        &self,
        user_id: Ulid,
        now: Ms,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        self.user(&user_id)?;
        let mut out = Vec::new();
        for handle in self.store.resource_handles() {
            let guard = handle.read().await;
            out.extend(
                guard
                    .active()
                    .filter(|r| r.user_id == user_id && r.end.is_none() && r.predicted_end > now)
                    .map(|r| ReservationInfo::new(&guard.resource, r)),
            );
        }
        out.sort_by_key(|r| (r.start, r.id));
        Ok(out)
    }

    /// Open and closed reservations, newest first, one page at a time.
    pub async fn list_history(
        &self,
        scope: HistoryScope,
        page: Page,
    ) -> Result<Paged<ReservationInfo>, EngineError> {
        if page.size == 0 || page.size > MAX_PAGE_SIZE {
            return Err(EngineError::InvalidArgument(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if let HistoryScope::User(user_id) = scope {
            self.user(&user_id)?;
        }

        let mut all = Vec::new();
        for handle in self.store.resource_handles() {
            let guard = handle.read().await;
            all.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| !r.record.deleted)
                    .filter(|r| match scope {
                        HistoryScope::User(user_id) => r.user_id == user_id,
                        HistoryScope::All => true,
                    })
                    .map(|r| ReservationInfo::new(&guard.resource, r)),
            );
        }
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = all.len();
        let items = all
            .into_iter()
            .skip(page.number.saturating_mul(page.size))
            .take(page.size)
            .collect();
        Ok(Paged {
            items,
            total,
            number: page.number,
            size: page.size,
        })
    }

    /// Non-deleted resources in creation order. Admin-locked ones are only shown to admins.
    pub async fn list_resources(&self, role: Role) -> Vec<ResourceInfo> {
        let mut out = Vec::new();
        for handle in self.store.resource_handles() {
            let guard = handle.read().await;
            let r = &guard.resource;
            if r.record.deleted || (role != Role::Admin && r.locked_for_admin) {
                continue;
            }
            out.push(ResourceInfo::from(r));
        }
        out.sort_by_key(|r| (r.created_at, r.id));
        out
    }

    pub async fn get_resource(&self, resource_id: Ulid) -> Result<ResourceInfo, EngineError> {
        let handle = self.resolve_public(&resource_id)?;
        let guard = handle.read().await;
        if guard.resource.record.deleted {
            return Err(EngineError::not_found(Entity::Resource, resource_id));
        }
        Ok(ResourceInfo::from(&guard.resource))
    }

    /// Open reservations on one resource, by start time.
    pub async fn reservations_for_resource(
        &self,
        resource_id: Ulid,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        let handle = self.resolve_public(&resource_id)?;
        let guard = handle.read().await;
        if guard.resource.record.deleted {
            return Err(EngineError::not_found(Entity::Resource, resource_id));
        }
        Ok(guard
            .active()
            .map(|r| ReservationInfo::new(&guard.resource, r))
            .collect())
    }

    /// True if a live resource reports under `device_id`.
    pub fn device_exists(&self, device_id: &str) -> bool {
        self.store.key_for_device(device_id).is_some()
    }

    pub fn get_user(&self, user_id: Ulid) -> Result<User, EngineError> {
        self.user(&user_id)
    }
}
