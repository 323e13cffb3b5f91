use crate::limits::*;
use crate::model::*;

use super::{EngineConfig, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Shape checks on a requested booking window, before any lock is taken.
pub(crate) fn validate_interval(span: &Span, now: Ms, config: &EngineConfig) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInterval("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    if span.end <= now - config.past_grace_ms {
        return Err(EngineError::InvalidInterval("interval is in the past"));
    }
    if let Some(step) = config.granularity_ms
        && step > 0
        && (span.start.rem_euclid(step) != 0 || span.end.rem_euclid(step) != 0)
    {
        return Err(EngineError::InvalidInterval("not aligned to booking granularity"));
    }
    Ok(())
}

/// First live booking on the station overlapping `span`.
/// Cancelled and completed bookings never block.
pub(crate) fn find_conflict<'a>(rs: &'a StationState, span: &Span) -> Option<&'a Booking> {
    rs.overlapping(span).find(|b| b.status.is_live())
}

pub(crate) fn check_no_conflict(rs: &StationState, span: &Span) -> Result<(), EngineError> {
    match find_conflict(rs, span) {
        Some(b) => Err(EngineError::Conflict {
            booking_id: b.id,
            span: b.span,
        }),
        None => Ok(()),
    }
}

pub(crate) fn validate_text(value: &str, max_len: usize, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::LimitExceeded(what));
    }
    if value.len() > max_len {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const HOUR: Ms = 3_600_000;
    const T0: Ms = 1_700_000_000_000;

    fn station(bookings: &[(Ms, Ms, BookingStatus)]) -> StationState {
        let mut rs = StationState::new(Ulid::new(), "pc-01".into(), 0);
        for &(start, end, status) in bookings {
            rs.bookings.push(Booking {
                id: Ulid::new(),
                station_id: rs.id(),
                person_id: Ulid::new(),
                span: Span::new(start, end),
                status,
                created_at: 0,
            });
        }
        rs.bookings.sort_by_key(|b| b.span.start);
        rs
    }

    #[test]
    fn inverted_and_empty_intervals_rejected() {
        let cfg = EngineConfig::default();
        for span in [Span { start: T0, end: T0 }, Span { start: T0 + 1, end: T0 }] {
            assert!(matches!(
                validate_interval(&span, T0, &cfg),
                Err(EngineError::InvalidInterval(_))
            ));
        }
    }

    #[test]
    fn past_interval_rejected_within_grace_allowed() {
        let cfg = EngineConfig {
            past_grace_ms: 5 * 60_000,
            ..EngineConfig::default()
        };
        let now = T0 + 10 * HOUR;
        assert!(matches!(
            validate_interval(&Span::new(T0, T0 + HOUR), now, &cfg),
            Err(EngineError::InvalidInterval("interval is in the past"))
        ));
        // ends one minute ago, still inside the grace window
        assert!(validate_interval(&Span::new(now - HOUR, now - 60_000), now, &cfg).is_ok());
    }

    #[test]
    fn granularity_enforced_when_configured() {
        let cfg = EngineConfig {
            granularity_ms: Some(30 * 60_000),
            ..EngineConfig::default()
        };
        let aligned = T0 - T0.rem_euclid(HOUR);
        assert!(validate_interval(&Span::new(aligned, aligned + HOUR), T0 - HOUR, &cfg).is_ok());
        assert!(matches!(
            validate_interval(&Span::new(aligned + 1, aligned + HOUR), T0 - HOUR, &cfg),
            Err(EngineError::InvalidInterval(_))
        ));
    }

    #[test]
    fn too_long_and_out_of_range_rejected() {
        let cfg = EngineConfig::default();
        assert!(matches!(
            validate_interval(&Span::new(T0, T0 + 8 * 24 * HOUR), T0, &cfg),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_interval(&Span::new(1, 2), 0, &cfg),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn touching_bookings_do_not_conflict() {
        let rs = station(&[(T0, T0 + HOUR, BookingStatus::Scheduled)]);
        assert!(check_no_conflict(&rs, &Span::new(T0 + HOUR, T0 + 2 * HOUR)).is_ok());
        assert!(check_no_conflict(&rs, &Span::new(T0 - HOUR, T0)).is_ok());
    }

    #[test]
    fn overlap_reports_clashing_booking() {
        let rs = station(&[(T0, T0 + 2 * HOUR, BookingStatus::Active)]);
        let existing = rs.bookings[0].clone();
        match check_no_conflict(&rs, &Span::new(T0 + HOUR, T0 + 3 * HOUR)) {
            Err(EngineError::Conflict { booking_id, span }) => {
                assert_eq!(booking_id, existing.id);
                assert_eq!(span, existing.span);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn terminal_bookings_never_block() {
        let rs = station(&[
            (T0, T0 + HOUR, BookingStatus::Cancelled),
            (T0, T0 + HOUR, BookingStatus::Completed),
        ]);
        assert!(find_conflict(&rs, &Span::new(T0, T0 + HOUR)).is_none());
    }

    #[test]
    fn text_limits() {
        assert!(validate_text("pc-01", 8, "name").is_ok());
        assert!(validate_text("   ", 8, "name").is_err());
        assert!(validate_text("much-too-long", 8, "name").is_err());
    }
}
