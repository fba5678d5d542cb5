use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Shape check for a requested window: `predicted_end > start`, within sane bounds.
pub fn validate_window(start: Ms, predicted_end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if predicted_end <= start {
        return Err(EngineError::InvalidArgument(format!(
            "predicted end {predicted_end} must be after start {start}"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || predicted_end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, predicted_end);
    if span.duration_ms() > MAX_WINDOW_MS {
        return Err(EngineError::LimitExceeded("reservation window too wide"));
    }
    Ok(span)
}

/// First open reservation whose effective window intersects `span`, if any.
pub fn find_conflict(rs: &ResourceState, span: &Span) -> Option<Ulid> {
    rs.overlapping(span).next().map(|r| r.record.public_id)
}

/// Must run under the same write guard as the insert that follows it.
pub fn check_no_conflict(rs: &ResourceState, span: &Span) -> Result<(), EngineError> {
    match find_conflict(rs, span) {
        Some(existing) => Err(EngineError::Conflict(existing)),
        None => Ok(()),
    }
}

impl Engine {
    /// True iff an open reservation on the resource overlaps `[start, end)`.
    /// Read-only; the answer may be stale by the time the caller acts on it.
    pub async fn overlaps(&self, resource_id: Ulid, start: Ms, end: Ms) -> Result<bool, EngineError> {
        if end <= start {
            return Err(EngineError::InvalidArgument(format!(
                "window end {end} must be after start {start}"
            )));
        }
        let rs = self.resolve_public(&resource_id)?;
        let guard = rs.read().await;
        Ok(find_conflict(&guard, &Span::new(start, end)).is_some())
    }
}
