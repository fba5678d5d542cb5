mod conflict;
mod device;
mod error;
mod mutations;
mod queries;
mod reservations;
mod store;

pub use conflict::{check_no_conflict, find_conflict, now_ms, validate_window};
pub use device::StatusReport;
pub use error::{EngineError, Entity};
pub use reservations::SweepReport;
pub use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::audit::{AuditEvent, AuditSink, Auditor};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{Wal, WalHandle};

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// The reservation/reconciliation engine.
///
/// Every resource lives behind its own `RwLock`; a mutation holds that write lock across
/// its checks, the journal append and the in-memory apply, so two requests against the
/// same resource are serialized while different resources proceed in parallel.
pub struct Engine {
    pub(super) store: InMemoryStore,
    wal: WalHandle,
    pub notify: Arc<NotifyHub>,
    pub(super) audit: Auditor,
    /// Mutations hold this shared; compaction holds it exclusively so no append can
    /// land between the snapshot and the file swap. Always acquired before any
    /// resource lock, never twice in one call chain.
    pub(super) journal_gate: RwLock<()>,
    /// Appends left before the journal starts failing.
    #[cfg(test)]
    pub(super) wal_budget: std::sync::atomic::AtomicU64,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        audit: Arc<dyn AuditSink>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let wal = WalHandle::spawn(wal);

        let engine = Self {
            store: InMemoryStore::new(),
            wal,
            notify,
            audit: Auditor::new(audit),
            journal_gate: RwLock::new(()),
            #[cfg(test)]
            wal_budget: std::sync::atomic::AtomicU64::new(u64::MAX),
        };

        // We're the sole owner of these Arcs, so try_write always succeeds. Never use
        // blocking_write here: this runs inside an async context.
        for event in &events {
            match event {
                Event::ResourceCreated { id, device_id, .. } => {
                    engine.store.create_from_event(event);
                    engine.store.claim_device(device_id, *id);
                }
                Event::UserRegistered { id, username, role, at } => {
                    engine.store.insert_user(User {
                        id: *id,
                        username: username.clone(),
                        role: *role,
                        record: Record::new(*id, *at),
                    });
                }
                other => {
                    let Some(resource_id) = event_resource_id(other) else { continue };
                    if let Some(rs) = engine.store.get_resource(&resource_id)
                        && let Ok(mut guard) = rs.try_write()
                    {
                        engine.store.apply_event(&mut guard, other);
                    }
                }
            }
        }

        if !events.is_empty() {
            tracing::info!(
                events = events.len(),
                resources = engine.store.resource_count(),
                users = engine.store.user_count(),
                "replayed journal"
            );
        }
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self
                .wal_budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
            {
                return Err(EngineError::WalError("journal unavailable".into()));
            }
        }
        self.wal.append(event.clone()).await.map_err(EngineError::from)
    }

    /// WAL-append then apply. Caller holds the resource's write lock and the journal gate.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.store.apply_event(rs, &event);
        Ok(())
    }

    /// Public id → live resource handle.
    pub(super) fn resolve_public(&self, public_id: &Ulid) -> Result<SharedResourceState, EngineError> {
        self.store
            .key_for_public(public_id)
            .and_then(|key| self.store.get_resource(&key))
            .ok_or_else(|| EngineError::not_found(Entity::Resource, public_id))
    }

    /// Device-facing id → live resource handle.
    pub(super) fn resolve_device(&self, device_id: &str) -> Result<SharedResourceState, EngineError> {
        self.store
            .key_for_device(device_id)
            .and_then(|key| self.store.get_resource(&key))
            .ok_or_else(|| EngineError::not_found(Entity::Resource, device_id))
    }

    /// Reservation public id → write-locked owning resource.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let key = self
            .store
            .resource_for_reservation(reservation_id)
            .ok_or_else(|| EngineError::not_found(Entity::Reservation, reservation_id))?;
        let rs = self
            .store
            .get_resource(&key)
            .ok_or_else(|| EngineError::not_found(Entity::Reservation, reservation_id))?;
        Ok(rs.write_owned().await)
    }

    pub(super) fn user(&self, id: &Ulid) -> Result<User, EngineError> {
        self.store
            .get_user(id)
            .ok_or_else(|| EngineError::not_found(Entity::User, id))
    }

    /// Username for audit labels; never fails.
    pub(super) fn user_label(&self, id: &Ulid) -> String {
        self.store
            .get_user(id)
            .map(|u| u.username)
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Resource name for audit labels; never fails.
    pub(super) async fn resource_label(&self, public_id: &Ulid) -> String {
        match self.resolve_public(public_id) {
            Ok(rs) => rs.read().await.resource.name.clone(),
            Err(_) => "Unknown".to_string(),
        }
    }

    pub(super) async fn emit(&self, event: AuditEvent) {
        self.audit.emit(event).await;
    }

    /// Rewrite the WAL with the minimal event set that recreates the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.journal_gate.write().await;

        let mut events = Vec::new();
        let mut users = self.store.users();
        users.sort_by_key(|u| u.id);
        for u in users {
            events.push(Event::UserRegistered {
                id: u.id,
                username: u.username,
                role: u.role,
                at: u.record.created_at,
            });
        }

        let mut snapshots = Vec::new();
        for handle in self.store.resource_handles() {
            snapshots.push(handle.read().await.clone());
        }
        // Creation order keeps a deleted resource's events ahead of a successor that
        // reuses its device id.
        snapshots.sort_by_key(|rs| (rs.resource.record.created_at, rs.resource.id));

        for rs in snapshots {
            let r = &rs.resource;
            events.push(Event::ResourceCreated {
                id: r.id,
                public_id: r.record.public_id,
                device_id: r.device_id.clone(),
                name: r.name.clone(),
                kind: r.kind.clone(),
                status: r.status,
                timeout_minutes: r.timeout_minutes,
                locked_for_admin: r.locked_for_admin,
                at: r.record.created_at,
            });
            for res in &rs.reservations {
                events.push(Event::ReservationCreated {
                    id: res.id,
                    public_id: res.record.public_id,
                    resource_id: r.id,
                    user_id: res.user_id,
                    start: res.start,
                    predicted_end: res.predicted_end,
                    at: res.record.created_at,
                    occupies: false,
                });
                if let Some(end) = res.end {
                    events.push(Event::ReservationFinished {
                        id: res.id,
                        resource_id: r.id,
                        end,
                        frees: false,
                    });
                }
            }
            if r.record.deleted {
                events.push(Event::ResourceDeleted {
                    id: r.id,
                    at: r.record.updated_at,
                });
            }
        }

        let count = events.len();
        self.wal.compact(events).await?;
        tracing::info!(events = count, "compacted journal");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}

/// Extract the resource key from a per-resource event.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ResourceStatusChanged { id, .. } | Event::ResourceDeleted { id, .. } => Some(*id),
        Event::ReservationCreated { resource_id, .. }
        | Event::ReservationFinished { resource_id, .. } => Some(*resource_id),
        Event::ResourceCreated { .. } | Event::UserRegistered { .. } => None,
    }
}
