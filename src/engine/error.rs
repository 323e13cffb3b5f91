use ulid::Ulid;

use crate::model::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Station,
    Person,
    Booking,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Station => write!(f, "station"),
            Entity::Person => write!(f, "person"),
            Entity::Booking => write!(f, "booking"),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Entity, Ulid),
    AlreadyExists(&'static str, String),
    InvalidInterval(&'static str),
    /// Overlaps a live booking; carries the clashing booking so the caller can pick another slot.
    Conflict {
        booking_id: Ulid,
        span: Span,
    },
    InactivePerson(Ulid),
    StationWithdrawn(Ulid),
    InvalidTransition {
        id: Ulid,
        from: &'static str,
        to: &'static str,
    },
    QuotaExhausted(Ulid),
    Forbidden(&'static str),
    /// Lock not acquired within the configured wait. Safe to retry.
    Busy(Entity, Ulid),
    LimitExceeded(&'static str),
    /// A request that can't be acted on as given, such as a missing station for a day booking.
    InvalidArgument(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy(..))
    }

    /// Stable snake_case code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) => "not_found",
            EngineError::AlreadyExists(..) => "already_exists",
            EngineError::InvalidInterval(_) => "invalid_interval",
            EngineError::Conflict { .. } => "conflict",
            EngineError::InactivePerson(_) => "inactive_person",
            EngineError::StationWithdrawn(_) => "station_withdrawn",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::QuotaExhausted(_) => "quota_exhausted",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Busy(..) => "busy",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::WalError(_) => "storage_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            EngineError::AlreadyExists(what, value) => write!(f, "{what} already exists: {value}"),
            EngineError::InvalidInterval(msg) => write!(f, "invalid interval: {msg}"),
            EngineError::Conflict { booking_id, span } => write!(
                f,
                "conflict with booking {booking_id} at [{}, {})",
                span.start, span.end
            ),
            EngineError::InactivePerson(id) => write!(f, "person {id} is inactive"),
            EngineError::StationWithdrawn(id) => write!(f, "station {id} is withdrawn from service"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "{id}: cannot go from {from} to {to}")
            }
            EngineError::QuotaExhausted(id) => write!(f, "person {id} has no usage quota left"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::Busy(entity, id) => write!(f, "{entity} {id} is busy, retry"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
