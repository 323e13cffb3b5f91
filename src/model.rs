use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

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

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Stations ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationStatus {
    Free,
    Occupied,
    Withdrawn,
}

impl StationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StationStatus::Free => "free",
            StationStatus::Occupied => "occupied",
            StationStatus::Withdrawn => "withdrawn",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub id: Ulid,
    pub name: String,
    pub status: StationStatus,
    pub occupant: Option<Ulid>,
    pub updated_at: Ms,
}

// ── People ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: Ulid,
    pub external_id: String,
    pub contact: String,
    pub name: String,
    pub active: bool,
    /// `None` means unlimited.
    pub remaining: Option<u32>,
    /// Last value set by registration or grant.
    pub granted: Option<u32>,
    pub registered_at: Ms,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Scheduled,
    Active,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Scheduled and active bookings take part in overlap checks.
    pub fn is_live(&self) -> bool {
        matches!(self, BookingStatus::Scheduled | BookingStatus::Active)
    }

    pub fn can_become(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Scheduled, BookingStatus::Active)
                | (BookingStatus::Active, BookingStatus::Completed)
                | (BookingStatus::Scheduled, BookingStatus::Cancelled)
                | (BookingStatus::Active, BookingStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Active => "active",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub station_id: Ulid,
    pub person_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
}

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Admin,
    Person(Ulid),
    System,
}

// ── Row state ────────────────────────────────────────────────────

/// A station row plus every booking ever made against it.
#[derive(Debug, Clone)]
pub struct StationState {
    pub station: Station,
    /// Sorted by `span.start`; history is never removed.
    pub bookings: Vec<Booking>,
    /// Set once the station is deleted so late lock holders see it gone.
    pub deleted: bool,
}

impl StationState {
    pub fn new(id: Ulid, name: String, at: Ms) -> Self {
        Self {
            station: Station {
                id,
                name,
                status: StationStatus::Free,
                occupant: None,
                updated_at: at,
            },
            bookings: Vec::new(),
            deleted: false,
        }
    }

    pub fn id(&self) -> Ulid {
        self.station.id
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings whose span overlaps the query window, any status.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn live_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.status.is_live())
    }
}

#[derive(Debug, Clone)]
pub struct PersonState {
    pub person: Person,
    pub removed: bool,
}

// ── Write-ahead log records ──────────────────────────────────────

/// A single row mutation. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    StationCreated {
        id: Ulid,
        name: String,
        at: Ms,
    },
    StationDeleted {
        id: Ulid,
    },
    StationUpdated {
        id: Ulid,
        status: StationStatus,
        occupant: Option<Ulid>,
        at: Ms,
    },
    PersonRegistered {
        id: Ulid,
        external_id: String,
        contact: String,
        name: String,
        quota: Option<u32>,
        at: Ms,
    },
    PersonRemoved {
        id: Ulid,
    },
    PersonActiveSet {
        id: Ulid,
        active: bool,
    },
    QuotaSet {
        id: Ulid,
        remaining: Option<u32>,
    },
    QuotaDecremented {
        id: Ulid,
        remaining: u32,
    },
    BookingInserted {
        booking: Booking,
    },
    BookingStatusSet {
        id: Ulid,
        station_id: Ulid,
        person_id: Ulid,
        status: BookingStatus,
    },
    /// History of a deleted station. Only written by compaction.
    BookingArchived {
        booking: Booking,
    },
}

/// One logical operation. Every change in a commit is applied, or none is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub seq: u64,
    pub at: Ms,
    pub changes: Vec<Change>,
}

// ── Broadcast events ─────────────────────────────────────────────

/// State changes fanned out to observers, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StationEvent {
    StationStatusUpdate {
        seq: u64,
        station_id: Ulid,
        status: StationStatus,
        occupant: Option<Ulid>,
        timestamp: Ms,
    },
    BookingCreated {
        seq: u64,
        booking_id: Ulid,
        station_id: Ulid,
        person_id: Ulid,
        start: Ms,
        end: Ms,
        timestamp: Ms,
    },
    BookingCancelled {
        seq: u64,
        booking_id: Ulid,
        station_id: Ulid,
        person_id: Ulid,
        timestamp: Ms,
    },
    BookingActivated {
        seq: u64,
        booking_id: Ulid,
        station_id: Ulid,
        person_id: Ulid,
        timestamp: Ms,
    },
    BookingCompleted {
        seq: u64,
        booking_id: Ulid,
        station_id: Ulid,
        person_id: Ulid,
        timestamp: Ms,
    },
    StationCreated {
        seq: u64,
        station_id: Ulid,
        name: String,
        timestamp: Ms,
    },
    StationDeleted {
        seq: u64,
        station_id: Ulid,
        timestamp: Ms,
    },
    PersonUpdated {
        seq: u64,
        person_id: Ulid,
        active: bool,
        remaining: Option<u32>,
        timestamp: Ms,
    },
}

impl StationEvent {
    pub fn seq(&self) -> u64 {
        match self {
            StationEvent::StationStatusUpdate { seq, .. }
            | StationEvent::BookingCreated { seq, .. }
            | StationEvent::BookingCancelled { seq, .. }
            | StationEvent::BookingActivated { seq, .. }
            | StationEvent::BookingCompleted { seq, .. }
            | StationEvent::StationCreated { seq, .. }
            | StationEvent::StationDeleted { seq, .. }
            | StationEvent::PersonUpdated { seq, .. } => *seq,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StationEvent::StationStatusUpdate { .. } => "station_status_update",
            StationEvent::BookingCreated { .. } => "booking_created",
            StationEvent::BookingCancelled { .. } => "booking_cancelled",
            StationEvent::BookingActivated { .. } => "booking_activated",
            StationEvent::BookingCompleted { .. } => "booking_completed",
            StationEvent::StationCreated { .. } => "station_created",
            StationEvent::StationDeleted { .. } => "station_deleted",
            StationEvent::PersonUpdated { .. } => "person_updated",
        }
    }

    /// Derive the observer-facing event for a committed change, if it has one.
    pub fn from_change(seq: u64, at: Ms, change: &Change) -> Option<Self> {
        match change {
            Change::StationCreated { id, name, .. } => Some(StationEvent::StationCreated {
                seq,
                station_id: *id,
                name: name.clone(),
                timestamp: at,
            }),
            Change::StationDeleted { id } => Some(StationEvent::StationDeleted {
                seq,
                station_id: *id,
                timestamp: at,
            }),
            Change::StationUpdated { id, status, occupant, at } => {
                Some(StationEvent::StationStatusUpdate {
                    seq,
                    station_id: *id,
                    status: *status,
                    occupant: *occupant,
                    timestamp: *at,
                })
            }
            Change::BookingInserted { booking } => Some(StationEvent::BookingCreated {
                seq,
                booking_id: booking.id,
                station_id: booking.station_id,
                person_id: booking.person_id,
                start: booking.span.start,
                end: booking.span.end,
                timestamp: at,
            }),
            Change::BookingStatusSet { id, station_id, person_id, status } => {
                let (booking_id, station_id, person_id) = (*id, *station_id, *person_id);
                match status {
                    BookingStatus::Active => Some(StationEvent::BookingActivated {
                        seq,
                        booking_id,
                        station_id,
                        person_id,
                        timestamp: at,
                    }),
                    BookingStatus::Completed => Some(StationEvent::BookingCompleted {
                        seq,
                        booking_id,
                        station_id,
                        person_id,
                        timestamp: at,
                    }),
                    BookingStatus::Cancelled => Some(StationEvent::BookingCancelled {
                        seq,
                        booking_id,
                        station_id,
                        person_id,
                        timestamp: at,
                    }),
                    BookingStatus::Scheduled => None,
                }
            }
            // Person changes are summarised into one PersonUpdated by the engine.
            Change::PersonRegistered { .. }
            | Change::PersonRemoved { .. }
            | Change::PersonActiveSet { .. }
            | Change::QuotaSet { .. }
            | Change::QuotaDecremented { .. } => None,
            Change::BookingArchived { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            station_id: Ulid::new(),
            person_id: Ulid::new(),
            span: Span::new(start, end),
            status,
            created_at: 0,
        }
    }

    fn station_with(bookings: Vec<Booking>) -> StationState {
        let mut rs = StationState::new(Ulid::new(), "pc-01".into(), 0);
        for b in bookings {
            let pos = rs.bookings.partition_point(|x| x.span.start <= b.span.start);
            rs.bookings.insert(pos, b);
        }
        rs
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // touching, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_contains_instant_is_half_open() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200));
    }

    #[test]
    fn booking_status_transitions() {
        use BookingStatus::*;
        assert!(Scheduled.can_become(Active));
        assert!(Active.can_become(Completed));
        assert!(Scheduled.can_become(Cancelled));
        assert!(Active.can_become(Cancelled));
        assert!(!Completed.can_become(Cancelled));
        assert!(!Cancelled.can_become(Scheduled));
        assert!(!Completed.can_become(Active));
        assert!(!Scheduled.can_become(Completed));
    }

    #[test]
    fn live_statuses() {
        assert!(BookingStatus::Scheduled.is_live());
        assert!(BookingStatus::Active.is_live());
        assert!(!BookingStatus::Completed.is_live());
        assert!(!BookingStatus::Cancelled.is_live());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let rs = station_with(vec![
            booking(100, 200, BookingStatus::Completed),
            booking(450, 600, BookingStatus::Scheduled),
            booking(1000, 1100, BookingStatus::Scheduled),
        ]);
        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let rs = station_with(vec![booking(100, 200, BookingStatus::Scheduled)]);
        assert_eq!(rs.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(rs.overlapping(&Span::new(0, 100)).count(), 0);
    }

    #[test]
    fn overlapping_wide_booking_spanning_query() {
        let rs = station_with(vec![booking(0, 10_000, BookingStatus::Active)]);
        assert_eq!(rs.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn live_bookings_filters_terminal() {
        let rs = station_with(vec![
            booking(0, 10, BookingStatus::Completed),
            booking(10, 20, BookingStatus::Cancelled),
            booking(20, 30, BookingStatus::Active),
            booking(30, 40, BookingStatus::Scheduled),
        ]);
        assert_eq!(rs.live_bookings().count(), 2);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let sid = Ulid::new();
        let event = StationEvent::StationStatusUpdate {
            seq: 7,
            station_id: sid,
            status: StationStatus::Occupied,
            occupant: None,
            timestamp: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "station_status_update");
        assert_eq!(json["status"], "occupied");
        assert_eq!(json["station_id"], sid.to_string());
        assert!(json["occupant"].is_null());
        assert_eq!(event.kind(), "station_status_update");
        assert_eq!(event.seq(), 7);
    }

    #[test]
    fn cancelled_status_change_becomes_booking_cancelled() {
        let bid = Ulid::new();
        let sid = Ulid::new();
        let pid = Ulid::new();
        let change = Change::BookingStatusSet {
            id: bid,
            station_id: sid,
            person_id: pid,
            status: BookingStatus::Cancelled,
        };
        let event = StationEvent::from_change(3, 99, &change).unwrap();
        assert_eq!(
            event,
            StationEvent::BookingCancelled {
                seq: 3,
                booking_id: bid,
                station_id: sid,
                person_id: pid,
                timestamp: 99,
            }
        );
    }

    #[test]
    fn quota_changes_have_no_direct_event() {
        let change = Change::QuotaDecremented {
            id: Ulid::new(),
            remaining: 2,
        };
        assert!(StationEvent::from_change(1, 1, &change).is_none());
    }

    #[test]
    fn commit_bincode_roundtrip() {
        let commit = Commit {
            seq: 1,
            at: 5,
            changes: vec![
                Change::StationCreated {
                    id: Ulid::new(),
                    name: "pc-01".into(),
                    at: 5,
                },
                Change::QuotaSet {
                    id: Ulid::new(),
                    remaining: None,
                },
            ],
        };
        let bytes = bincode::serialize(&commit).unwrap();
        let decoded: Commit = bincode::deserialize(&bytes).unwrap();
        assert_eq!(commit, decoded);
    }
}
