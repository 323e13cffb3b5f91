use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::calendar::{local_date, school_week, whole_day_span, workday_span};
use super::{Engine, EngineError, Entity};

const DAY_MS: Ms = 24 * 3_600_000;

/// Everything a lab display needs in one read.
#[derive(Debug, Clone, Serialize)]
pub struct LabStatus {
    pub stations: Vec<Station>,
    /// Live bookings overlapping the next 24 hours, by start time.
    pub upcoming: Vec<Booking>,
    pub timestamp: Ms,
}

/// One person on one day of the week grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleCell {
    pub date: NaiveDate,
    pub has_booking: bool,
    pub booking_id: Option<Ulid>,
    pub station_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleRow {
    pub person_id: Ulid,
    pub name: String,
    pub days: Vec<ScheduleCell>,
}

/// People by weekday for one Monday-to-Friday week. Each cell shows the
/// person's earliest live booking during that day's lab hours.
#[derive(Debug, Clone, Serialize)]
pub struct WeekSchedule {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    /// Weekday names, in column order.
    pub days: Vec<String>,
    pub stations: Vec<Station>,
    pub rows: Vec<ScheduleRow>,
}

impl Engine {
    pub async fn get_station(&self, id: Ulid) -> Result<Station, EngineError> {
        Ok(self.read_station(id).await?.station.clone())
    }

    /// All stations, by name.
    pub async fn list_stations(&self) -> Result<Vec<Station>, EngineError> {
        let mut out = Vec::with_capacity(self.store.station_count());
        for sid in self.store.station_ids() {
            match self.read_station(sid).await {
                Ok(rs) => out.push(rs.station.clone()),
                Err(EngineError::NotFound(..)) => {}
                Err(e) => return Err(e),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub async fn get_person(&self, id: Ulid) -> Result<Person, EngineError> {
        Ok(self.read_person(id).await?.person.clone())
    }

    pub async fn find_person_by_external_id(&self, external_id: &str) -> Result<Option<Person>, EngineError> {
        let Some(id) = self.store.person_by_external_id(external_id) else {
            return Ok(None);
        };
        match self.get_person(id).await {
            Ok(p) => Ok(Some(p)),
            Err(EngineError::NotFound(..)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list_people(&self) -> Result<Vec<Person>, EngineError> {
        let mut out = Vec::with_capacity(self.store.person_count());
        for pid in self.store.person_ids() {
            match self.read_person(pid).await {
                Ok(ps) => out.push(ps.person.clone()),
                Err(EngineError::NotFound(..)) => {}
                Err(e) => return Err(e),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Looks in live stations first, then in the history of deleted ones.
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        if let Some(sid) = self.store.station_for_booking(&id) {
            match self.read_station(sid).await {
                Ok(rs) => {
                    if let Some(b) = rs.booking(id) {
                        return Ok(b.clone());
                    }
                }
                Err(EngineError::NotFound(..)) => {}
                Err(e) => return Err(e),
            }
        }
        self.store
            .archived_booking(&id)
            .ok_or(EngineError::NotFound(Entity::Booking, id))
    }

    /// Bookings of any status, optionally narrowed to one station and/or one
    /// person, ordered by start time.
    pub async fn list_bookings(
        &self,
        station_id: Option<Ulid>,
        person_id: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        let station_ids = match station_id {
            Some(sid) => vec![sid],
            None => self.store.station_ids(),
        };
        let mut out = Vec::new();
        for sid in station_ids {
            let rs = match self.read_station(sid).await {
                Ok(rs) => rs,
                Err(EngineError::NotFound(..)) if station_id.is_none() => continue,
                Err(e) => return Err(e),
            };
            out.extend(
                rs.bookings
                    .iter()
                    .filter(|b| person_id.is_none_or(|pid| b.person_id == pid))
                    .cloned(),
            );
        }
        if station_id.is_none() {
            out.extend(
                self.store
                    .archived_bookings()
                    .into_iter()
                    .filter(|b| person_id.is_none_or(|pid| b.person_id == pid)),
            );
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    pub async fn lab_status(&self, now: Ms) -> Result<LabStatus, EngineError> {
        let stations = self.list_stations().await?;
        let upcoming = self.live_bookings_within(Span::new(now, now + DAY_MS)).await?;
        Ok(LabStatus {
            stations,
            upcoming,
            timestamp: now,
        })
    }

    /// Scheduled and active bookings overlapping `window`, by start time.
    async fn live_bookings_within(&self, window: Span) -> Result<Vec<Booking>, EngineError> {
        let mut out = Vec::new();
        for sid in self.store.station_ids() {
            let rs = match self.read_station(sid).await {
                Ok(rs) => rs,
                Err(EngineError::NotFound(..)) => continue,
                Err(e) => return Err(e),
            };
            out.extend(
                rs.overlapping(&window)
                    .filter(|b| b.status.is_live())
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    /// The week grid for the school week holding `at`, in lab-local time.
    pub async fn week_schedule(&self, at: Ms) -> Result<WeekSchedule, EngineError> {
        let offset = self.config.utc_offset;
        let out_of_range = EngineError::InvalidArgument("date out of range");
        let Some(days) = local_date(at, offset).and_then(school_week) else {
            return Err(out_of_range);
        };
        let Some(hours) = days
            .iter()
            .map(|d| workday_span(*d, offset))
            .collect::<Option<Vec<Span>>>()
        else {
            return Err(out_of_range);
        };
        let (Some(&week_start), Some(&week_end), Some(first), Some(last)) =
            (days.first(), days.last(), hours.first(), hours.last())
        else {
            return Err(out_of_range);
        };

        let stations = self.list_stations().await?;
        let live = self.live_bookings_within(Span::new(first.start, last.end)).await?;
        let rows = self
            .list_people()
            .await?
            .into_iter()
            .map(|person| {
                let days = days
                    .iter()
                    .zip(&hours)
                    .map(|(date, span)| {
                        let first = live
                            .iter()
                            .find(|b| b.person_id == person.id && b.span.overlaps(span));
                        ScheduleCell {
                            date: *date,
                            has_booking: first.is_some(),
                            booking_id: first.map(|b| b.id),
                            station_id: first.map(|b| b.station_id),
                        }
                    })
                    .collect();
                ScheduleRow {
                    person_id: person.id,
                    name: person.name,
                    days,
                }
            })
            .collect();

        Ok(WeekSchedule {
            week_start,
            week_end,
            days: days.iter().map(|d| d.format("%A").to_string()).collect(),
            stations,
            rows,
        })
    }

    /// Bookings of any status starting on the local day `date`, optionally
    /// for one person only.
    pub async fn bookings_on_day(&self, date: NaiveDate, person_id: Option<Ulid>) -> Result<Vec<Booking>, EngineError> {
        let day = whole_day_span(date, self.config.utc_offset)
            .ok_or(EngineError::InvalidArgument("date out of range"))?;
        Ok(self
            .list_bookings(None, person_id)
            .await?
            .into_iter()
            .filter(|b| day.contains_instant(b.span.start))
            .collect())
    }
}
