//! Per-call retry bookkeeping

/// Which one-shot recoveries a logical call has already used.
///
/// Each flag flips from `false` to `true` at most once. The value is copied
/// and extended, never mutated in place, and lives across transient retries
/// of the same call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub attempted_auth_refresh: bool,
    pub attempted_csrf_refresh: bool,
}

impl RequestContext {
    pub fn with_auth_refresh(self) -> Self {
        Self {
            attempted_auth_refresh: true,
            ..self
        }
    }

    pub fn with_csrf_refresh(self) -> Self {
        Self {
            attempted_csrf_refresh: true,
            ..self
        }
    }
}
