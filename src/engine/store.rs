use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::*;

use super::SharedResourceState;

/// Canonical in-memory state: resources (each with its reservations) and the user
/// directory, plus lookup indexes. Records are only mutated through `apply_event`
/// while the owning resource's write lock is held.
pub struct InMemoryStore {
    resources: DashMap<Ulid, SharedResourceState>,
    by_public_id: DashMap<Ulid, Ulid>,
    by_device_id: DashMap<String, Ulid>,
    /// Reservation public id → resource key.
    reservation_to_resource: DashMap<Ulid, Ulid>,
    users: DashMap<Ulid, User>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            by_public_id: DashMap::new(),
            by_device_id: DashMap::new(),
            reservation_to_resource: DashMap::new(),
            users: DashMap::new(),
        }
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Resources that are not soft-deleted. Each one holds exactly one device id.
    pub fn live_resource_count(&self) -> usize {
        self.by_device_id.len()
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn insert_resource(&self, id: Ulid, public_id: Ulid, state: SharedResourceState) {
        self.resources.insert(id, state);
        self.by_public_id.insert(public_id, id);
    }

    /// Undo a resource insert whose journal append failed.
    pub fn remove_resource(&self, id: &Ulid, public_id: &Ulid) {
        self.resources.remove(id);
        self.by_public_id.remove(public_id);
    }

    pub fn resource_handles(&self) -> Vec<SharedResourceState> {
        self.resources.iter().map(|e| e.value().clone()).collect()
    }

    pub fn key_for_public(&self, public_id: &Ulid) -> Option<Ulid> {
        self.by_public_id.get(public_id).map(|e| *e.value())
    }

    // ── Device index ─────────────────────────────────────────

    pub fn key_for_device(&self, device_id: &str) -> Option<Ulid> {
        self.by_device_id.get(device_id).map(|e| *e.value())
    }

    /// Claim `device_id` for resource `id`. False if another live resource holds it.
    pub fn claim_device(&self, device_id: &str, id: Ulid) -> bool {
        match self.by_device_id.entry(device_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(id);
                true
            }
        }
    }

    /// Drop the device mapping, but only if it still points at `id`.
    pub fn release_device(&self, device_id: &str, id: &Ulid) {
        self.by_device_id.remove_if(device_id, |_, v| v == id);
    }

    // ── Reservation index ────────────────────────────────────

    pub fn resource_for_reservation(&self, reservation_public_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_resource
            .get(reservation_public_id)
            .map(|e| *e.value())
    }

    // ── Users ────────────────────────────────────────────────

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users
            .get(id)
            .filter(|u| !u.record.deleted)
            .map(|u| u.value().clone())
    }

    /// Insert unless the id is taken. Returns false on duplicate.
    pub fn insert_user(&self, user: User) -> bool {
        match self.users.entry(user.id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(user);
                true
            }
        }
    }

    pub fn remove_user(&self, id: &Ulid) {
        self.users.remove(id);
    }

    pub fn users(&self) -> Vec<User> {
        self.users.iter().map(|e| e.value().clone()).collect()
    }

    // ── Event application ────────────────────────────────────

    /// Build the state for a `ResourceCreated` event and register it.
    pub fn create_from_event(&self, event: &Event) -> Option<SharedResourceState> {
        let Event::ResourceCreated {
            id,
            public_id,
            device_id,
            name,
            kind,
            status,
            timeout_minutes,
            locked_for_admin,
            at,
        } = event
        else {
            return None;
        };
        let resource = Resource {
            id: *id,
            device_id: device_id.clone(),
            name: name.clone(),
            kind: kind.clone(),
            status: *status,
            timeout_minutes: *timeout_minutes,
            locked_for_admin: *locked_for_admin,
            record: Record::new(*public_id, *at),
        };
        let state = std::sync::Arc::new(tokio::sync::RwLock::new(ResourceState::new(resource)));
        self.insert_resource(*id, *public_id, state.clone());
        Some(state)
    }

    /// Apply a per-resource event. The caller holds the resource's write lock.
    pub fn apply_event(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::ResourceStatusChanged { status, at, .. } => {
                rs.resource.set_status(*status, *at);
            }
            Event::ResourceDeleted { id, at } => {
                rs.resource.record.mark_deleted(*at);
                self.release_device(&rs.resource.device_id, id);
            }
            Event::ReservationCreated {
                id,
                public_id,
                resource_id,
                user_id,
                start,
                predicted_end,
                at,
                occupies,
            } => {
                rs.insert_reservation(Reservation {
                    id: *id,
                    resource_id: *resource_id,
                    user_id: *user_id,
                    start: *start,
                    predicted_end: *predicted_end,
                    end: None,
                    active: true,
                    record: Record::new(*public_id, *at),
                });
                self.reservation_to_resource.insert(*public_id, *resource_id);
                if *occupies {
                    rs.resource.set_status(ResourceStatus::Reserved, *at);
                }
            }
            Event::ReservationFinished { id, end, frees, .. } => {
                if let Some(r) = rs.find_mut_by_id(id) {
                    r.finish(*end);
                }
                if *frees {
                    rs.resource.set_status(ResourceStatus::Free, *end);
                }
            }
            // Handled at the map level, not here
            Event::ResourceCreated { .. } | Event::UserRegistered { .. } => {}
        }
    }
}
