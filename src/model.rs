use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Status ───────────────────────────────────────────────────────

/// Canonical resource status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    /// Never completed a device handshake, or explicitly deactivated.
    Inactive,
    Free,
    Reserved,
}

const FREE_SYNONYMS: &[&str] = &["LIVRE", "FREE", "AVAILABLE"];
const OCCUPIED_SYNONYMS: &[&str] = &["OCUPADO", "OCCUPIED", "RESERVED", "BUSY"];
const OFFLINE_SYNONYMS: &[&str] = &["INDISPONIVEL", "UNAVAILABLE", "INACTIVE", "OFFLINE"];

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Inactive => "INACTIVE",
            ResourceStatus::Free => "FREE",
            ResourceStatus::Reserved => "RESERVED",
        }
    }

    /// Map a raw device-reported status to its canonical value.
    /// Case-insensitive; surrounding whitespace is ignored.
    pub fn from_device(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_uppercase();
        let upper = upper.as_str();
        if FREE_SYNONYMS.contains(&upper) {
            Some(ResourceStatus::Free)
        } else if OCCUPIED_SYNONYMS.contains(&upper) {
            Some(ResourceStatus::Reserved)
        } else if OFFLINE_SYNONYMS.contains(&upper) {
            Some(ResourceStatus::Inactive)
        } else {
            None
        }
    }

    /// Parse one of the three canonical names, case-insensitively.
    pub fn parse_canonical(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "INACTIVE" => Some(ResourceStatus::Inactive),
            "FREE" => Some(ResourceStatus::Free),
            "RESERVED" => Some(ResourceStatus::Reserved),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    User,
}

// ── Entities ─────────────────────────────────────────────────────

/// Fields shared by every persisted entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub public_id: Ulid,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub deleted: bool,
}

impl Record {
    pub fn new(public_id: Ulid, at: Ms) -> Self {
        Self {
            public_id,
            created_at: at,
            updated_at: at,
            deleted: false,
        }
    }

    pub fn touch(&mut self, at: Ms) {
        self.updated_at = at;
    }

    pub fn mark_deleted(&mut self, at: Ms) {
        self.deleted = true;
        self.touch(at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: Ulid,
    /// Identifier the physical device reports under.
    pub device_id: String,
    pub name: String,
    pub kind: String,
    pub status: ResourceStatus,
    pub timeout_minutes: u32,
    /// Hidden from non-admin listings.
    pub locked_for_admin: bool,
    pub record: Record,
}

impl Resource {
    pub fn set_status(&mut self, status: ResourceStatus, at: Ms) {
        self.status = status;
        self.record.touch(at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: Ulid,
    pub start: Ms,
    pub predicted_end: Ms,
    /// `None` while the reservation is open.
    pub end: Option<Ms>,
    pub active: bool,
    pub record: Record,
}

impl Reservation {
    pub fn is_open(&self) -> bool {
        self.active && !self.record.deleted
    }

    pub fn effective_end(&self) -> Ms {
        self.end.unwrap_or(self.predicted_end)
    }

    /// Effective window `[start, end ?? predicted_end)` intersects `span`.
    /// A reservation closed before its start has an empty window.
    pub fn overlaps(&self, span: &Span) -> bool {
        self.start < span.end && span.start < self.effective_end()
    }

    pub fn covers(&self, now: Ms) -> bool {
        self.start <= now && now < self.effective_end()
    }

    /// One-way close. Returns false (and changes nothing) if already closed.
    pub fn finish(&mut self, at: Ms) -> bool {
        if !self.active {
            return false;
        }
        self.end = Some(at);
        self.active = false;
        self.record.touch(at);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub username: String,
    pub role: Role,
    pub record: Record,
}

// ── Per-resource state ───────────────────────────────────────────

/// A resource and every reservation ever made against it. Guarded by one lock.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    /// Sorted by `start`.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.resource.id
    }

    /// Insert reservation maintaining sort order by start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.start <= reservation.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn find(&self, public_id: &Ulid) -> Option<&Reservation> {
        self.reservations
            .iter()
            .find(|r| r.record.public_id == *public_id)
    }

    pub fn find_mut_by_id(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Open reservations whose effective window intersects `query`.
    /// Binary search skips reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self.reservations.partition_point(|r| r.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.is_open() && r.overlaps(query))
    }

    pub fn active(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_open())
    }

    /// Open reservations that have started by `now`. Includes overdue ones the
    /// sweeper has not closed yet: they still hold the resource.
    pub fn occupying(&self, now: Ms) -> impl Iterator<Item = &Reservation> {
        self.active().filter(move |r| r.start <= now)
    }

    /// Open reservations whose predicted end has passed.
    pub fn expired(&self, now: Ms) -> impl Iterator<Item = &Reservation> {
        self.active()
            .filter(move |r| r.end.is_none() && r.predicted_end < now)
    }
}

// ── Journal ──────────────────────────────────────────────────────

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        public_id: Ulid,
        device_id: String,
        name: String,
        kind: String,
        status: ResourceStatus,
        timeout_minutes: u32,
        locked_for_admin: bool,
        at: Ms,
    },
    ResourceStatusChanged {
        id: Ulid,
        status: ResourceStatus,
        at: Ms,
    },
    ResourceDeleted {
        id: Ulid,
        at: Ms,
    },
    UserRegistered {
        id: Ulid,
        username: String,
        role: Role,
        at: Ms,
    },
    ReservationCreated {
        id: Ulid,
        public_id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        start: Ms,
        predicted_end: Ms,
        at: Ms,
        /// Resource flips to RESERVED in the same entry.
        occupies: bool,
    },
    ReservationFinished {
        id: Ulid,
        resource_id: Ulid,
        end: Ms,
        /// Resource flips to FREE in the same entry.
        frees: bool,
    },
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewResource {
    pub device_id: String,
    pub name: String,
    pub kind: String,
    /// Defaults to INACTIVE.
    pub status: Option<ResourceStatus>,
    pub timeout_minutes: u32,
    pub locked_for_admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryScope {
    User(Ulid),
    All,
}

/// Zero-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: usize,
    pub size: usize,
}

impl Page {
    pub fn new(number: usize, size: usize) -> Self {
        Self { number, size }
    }
}

/// Why a reservation was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishCause {
    UserRelease,
    DeviceAutoRelease,
    Expired,
}

impl FinishCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishCause::UserRelease => "user_release",
            FinishCause::DeviceAutoRelease => "device_auto_release",
            FinishCause::Expired => "expired",
        }
    }
}

/// Instruction pushed to a subscribed device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceCommand {
    Reserve { resource_id: String, reservation_id: Ulid },
    Release { resource_id: String },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub device_id: String,
    pub name: String,
    pub kind: String,
    pub status: ResourceStatus,
    pub timeout_minutes: u32,
    pub locked_for_admin: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl From<&Resource> for ResourceInfo {
    fn from(r: &Resource) -> Self {
        Self {
            id: r.record.public_id,
            device_id: r.device_id.clone(),
            name: r.name.clone(),
            kind: r.kind.clone(),
            status: r.status,
            timeout_minutes: r.timeout_minutes,
            locked_for_admin: r.locked_for_admin,
            created_at: r.record.created_at,
            updated_at: r.record.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub resource_name: String,
    pub user_id: Ulid,
    pub start: Ms,
    pub predicted_end: Ms,
    pub end: Option<Ms>,
    pub active: bool,
    pub created_at: Ms,
}

impl ReservationInfo {
    pub fn new(resource: &Resource, r: &Reservation) -> Self {
        Self {
            id: r.record.public_id,
            resource_id: resource.record.public_id,
            resource_name: resource.name.clone(),
            user_id: r.user_id,
            start: r.start,
            predicted_end: r.predicted_end,
            end: r.end,
            active: r.active,
            created_at: r.record.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OccupantSummary {
    pub username: String,
    pub start: Ms,
    pub predicted_end: Ms,
}

/// What a device sees when it asks for its resource's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatusView {
    pub resource_id: String,
    pub status: ResourceStatus,
    pub occupant: Option<OccupantSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub number: usize,
    pub size: usize,
}
