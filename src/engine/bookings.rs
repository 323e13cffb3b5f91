use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_PER_STATION;
use crate::model::*;
use crate::notify::Outbox;
use crate::observability::SWEEP_TRANSITIONS_TOTAL;

use super::calendar::workday_span;
use super::conflict::{check_no_conflict, now_ms, validate_interval};
use super::store::{Locked, Txn};
use super::{Engine, EngineError, Entity};

/// What one pass of `advance_due_bookings` did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub activated: usize,
    pub completed: usize,
    /// Bookings cancelled because their owner could no longer use them.
    pub cancelled: usize,
    /// Bookings left untouched this pass (lock timeout, WAL error); retried next pass.
    pub failed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// What `toggle_day` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "toggled", rename_all = "snake_case")]
pub enum DayToggle {
    Added { booking: Booking },
    Removed { booking: Booking },
}

enum Outcome {
    Activated,
    Completed,
    Cancelled,
}

impl Engine {
    /// Reserve `span` on a station for a person.
    ///
    /// The overlap check and the insert happen under the station's write lock,
    /// so two concurrent requests for overlapping windows can't both win.
    pub async fn create_booking(
        &self,
        station_id: Ulid,
        person_id: Ulid,
        span: Span,
    ) -> Result<Booking, EngineError> {
        let now = now_ms();
        validate_interval(&span, now, &self.config)?;

        let station = self.lock_station(station_id).await?;
        if station.station.status == StationStatus::Withdrawn {
            return Err(EngineError::StationWithdrawn(station_id));
        }
        if !has_room_for_booking(&station) {
            return Err(EngineError::LimitExceeded("too many bookings on station"));
        }
        let person = self.lock_person(person_id).await?;
        if !person.person.active {
            return Err(EngineError::InactivePerson(person_id));
        }
        check_no_conflict(&station, &span)?;

        let booking = Booking {
            id: Ulid::new(),
            station_id,
            person_id,
            span,
            status: BookingStatus::Scheduled,
            created_at: now,
        };
        let mut txn = Txn::new(now);
        txn.insert_booking(booking.clone());

        let mut rows = Locked::default();
        rows.push_station(station);
        rows.push_person(person);
        let outbox = self.commit(&mut rows, txn).await?;
        drop(rows);
        self.publish(outbox);
        debug!(booking = %booking.id, station = %station_id, "booking created");
        Ok(booking)
    }

    /// Cancel a scheduled or active booking.
    ///
    /// A person may only cancel their own bookings. Cancelling an already
    /// cancelled booking is a no-op; cancelling a completed one is refused.
    /// An active booking whose owner occupies the station frees it.
    pub async fn cancel_booking(&self, booking_id: Ulid, actor: Actor) -> Result<Booking, EngineError> {
        let Some(station_id) = self.store.station_for_booking(&booking_id) else {
            return self.cancel_archived(booking_id, actor);
        };
        let station = match self.lock_station(station_id).await {
            Ok(guard) => guard,
            // station deleted while we waited; its bookings moved to the archive
            Err(EngineError::NotFound(Entity::Station, _)) => {
                return self.cancel_archived(booking_id, actor);
            }
            Err(e) => return Err(e),
        };
        let booking = station
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Booking, booking_id))?;
        authorize_cancel(&booking, actor)?;
        if booking.status == BookingStatus::Cancelled {
            return Ok(booking);
        }

        let mut txn = Txn::new(now_ms());
        txn.update_booking_status(&booking, BookingStatus::Cancelled)?;
        if booking.status == BookingStatus::Active
            && station.station.status == StationStatus::Occupied
            && station.station.occupant == Some(booking.person_id)
        {
            txn.update_station(station_id, StationStatus::Free, None);
        }

        let mut rows = Locked::default();
        rows.push_station(station);
        let outbox = self.commit(&mut rows, txn).await?;
        drop(rows);
        self.publish(outbox);
        debug!(booking = %booking_id, ?actor, "booking cancelled");
        Ok(Booking {
            status: BookingStatus::Cancelled,
            ..booking
        })
    }

    /// Flip a person's booking for one lab day. A live booking of theirs
    /// during that day's lab hours is cancelled; otherwise `station_id` is
    /// booked for the whole of those hours, subject to the usual checks.
    pub async fn toggle_day(
        &self,
        person_id: Ulid,
        date: NaiveDate,
        station_id: Option<Ulid>,
    ) -> Result<DayToggle, EngineError> {
        let span = workday_span(date, self.config.utc_offset)
            .ok_or(EngineError::InvalidArgument("date out of range"))?;
        self.get_person(person_id).await?;

        let existing = self
            .list_bookings(None, Some(person_id))
            .await?
            .into_iter()
            .find(|b| b.status.is_live() && b.span.overlaps(&span));
        if let Some(booking) = existing {
            let booking = self.cancel_booking(booking.id, Actor::Admin).await?;
            info!(booking = %booking.id, person = %person_id, %date, "day booking removed");
            return Ok(DayToggle::Removed { booking });
        }

        let station_id =
            station_id.ok_or(EngineError::InvalidArgument("station_id is required to add a day booking"))?;
        let booking = self.create_booking(station_id, person_id, span).await?;
        info!(booking = %booking.id, person = %person_id, %date, "day booking added");
        Ok(DayToggle::Added { booking })
    }

    fn cancel_archived(&self, booking_id: Ulid, actor: Actor) -> Result<Booking, EngineError> {
        let booking = self
            .store
            .archived_booking(&booking_id)
            .ok_or(EngineError::NotFound(Entity::Booking, booking_id))?;
        authorize_cancel(&booking, actor)?;
        match booking.status {
            BookingStatus::Cancelled => Ok(booking),
            other => Err(EngineError::InvalidTransition {
                id: booking_id,
                from: other.as_str(),
                to: "cancelled",
            }),
        }
    }

    /// Move every booking whose time has come: active bookings past their end
    /// complete, scheduled bookings past their start activate.
    ///
    /// Each booking is its own commit. A failure on one is logged and counted,
    /// and the pass carries on; the next pass retries it.
    pub async fn advance_due_bookings(&self, now: Ms) -> SweepReport {
        let mut report = SweepReport::default();
        for sid in self.store.station_ids() {
            match self.advance_station(sid, now, &mut report).await {
                Ok(()) => {}
                Err(EngineError::NotFound(..)) => {}
                Err(e) => {
                    warn!(station = %sid, "sweep skipped station: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn advance_station(&self, station_id: Ulid, now: Ms, report: &mut SweepReport) -> Result<(), EngineError> {
        let guard = self.lock_station(station_id).await?;
        let due_end: Vec<Booking> = guard
            .bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Active && b.span.end <= now)
            .cloned()
            .collect();
        let due_start: Vec<Booking> = guard
            .bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Scheduled && b.span.start <= now)
            .cloned()
            .collect();
        if due_end.is_empty() && due_start.is_empty() {
            return Ok(());
        }

        let mut rows = Locked::default();
        rows.push_station(guard);
        let mut outboxes = Vec::new();
        for booking in due_end.iter().chain(due_start.iter()) {
            let step = if booking.status == BookingStatus::Active {
                self.complete_booking(&mut rows, booking, now).await
            } else {
                self.activate_booking(&mut rows, booking, now).await
            };
            match step {
                Ok((outcome, outbox)) => {
                    let label = match outcome {
                        Outcome::Activated => {
                            report.activated += 1;
                            "activated"
                        }
                        Outcome::Completed => {
                            report.completed += 1;
                            "completed"
                        }
                        Outcome::Cancelled => {
                            report.cancelled += 1;
                            "cancelled"
                        }
                    };
                    metrics::counter!(SWEEP_TRANSITIONS_TOTAL, "outcome" => label).increment(1);
                    outboxes.push(outbox);
                }
                Err(e) => {
                    warn!(booking = %booking.id, "sweep could not advance booking: {e}");
                    report.failed += 1;
                }
            }
        }
        drop(rows);
        for outbox in outboxes {
            self.publish(outbox);
        }
        Ok(())
    }

    async fn complete_booking(
        &self,
        rows: &mut Locked,
        booking: &Booking,
        now: Ms,
    ) -> Result<(Outcome, Outbox), EngineError> {
        let mut txn = Txn::new(now);
        txn.update_booking_status(booking, BookingStatus::Completed)?;
        if let Some(station) = rows.get_station(booking.station_id)
            && station.occupant == Some(booking.person_id)
        {
            txn.update_station(booking.station_id, StationStatus::Free, None);
        }
        let outbox = self.commit(rows, txn).await?;
        Ok((Outcome::Completed, outbox))
    }

    /// Start a scheduled booking. Activation seats the person and charges one
    /// unit of quota, as a manual assignment would.
    async fn activate_booking(
        &self,
        rows: &mut Locked,
        booking: &Booking,
        now: Ms,
    ) -> Result<(Outcome, Outbox), EngineError> {
        let mut txn = Txn::new(now);

        // Window already over: record that it ran, without seating anyone.
        if booking.span.end <= now {
            txn.update_booking_status(booking, BookingStatus::Active)?;
            let active = Booking {
                status: BookingStatus::Active,
                ..booking.clone()
            };
            txn.update_booking_status(&active, BookingStatus::Completed)?;
            let outbox = self.commit(rows, txn).await?;
            return Ok((Outcome::Completed, outbox));
        }

        let person = match self.lock_person(booking.person_id).await {
            Ok(guard) => Some(guard),
            Err(EngineError::NotFound(Entity::Person, _)) => None,
            Err(e) => return Err(e),
        };
        let usable = person.as_ref().is_some_and(|p| p.person.active);
        let mut charge = None;
        if let Some(p) = person.as_ref()
            && usable
        {
            let mut trial = Txn::new(now);
            match trial.compare_and_decrement_quota(&p.person) {
                Ok(_) => charge = Some(trial.changes),
                Err(EngineError::QuotaExhausted(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let outcome = match (usable, charge) {
            (true, Some(quota_changes)) => {
                txn.update_booking_status(booking, BookingStatus::Active)?;
                let station = rows
                    .get_station(booking.station_id)
                    .ok_or(EngineError::NotFound(Entity::Station, booking.station_id))?;
                if station.status == StationStatus::Free {
                    txn.changes.extend(quota_changes);
                    txn.update_station(booking.station_id, StationStatus::Occupied, Some(booking.person_id));
                } else if station.occupant != Some(booking.person_id) {
                    info!(
                        booking = %booking.id,
                        station = %booking.station_id,
                        status = station.status.as_str(),
                        "booking started but station is not free"
                    );
                }
                Outcome::Activated
            }
            _ => {
                info!(booking = %booking.id, person = %booking.person_id, "owner can't use booking, cancelling");
                txn.update_booking_status(booking, BookingStatus::Cancelled)?;
                Outcome::Cancelled
            }
        };

        let locked_person = person.is_some();
        if let Some(guard) = person {
            rows.push_person(guard);
        }
        let result = self.commit(rows, txn).await;
        if locked_person {
            rows.pop_person();
        }
        Ok((outcome, result?))
    }
}

/// Only live bookings count towards the per-station cap; history never blocks new bookings.
pub(super) fn has_room_for_booking(station: &StationState) -> bool {
    station.live_bookings().count() < MAX_BOOKINGS_PER_STATION
}

fn authorize_cancel(booking: &Booking, actor: Actor) -> Result<(), EngineError> {
    match actor {
        Actor::Admin | Actor::System => Ok(()),
        Actor::Person(pid) if pid == booking.person_id => Ok(()),
        Actor::Person(_) => Err(EngineError::Forbidden("booking belongs to someone else")),
    }
}
