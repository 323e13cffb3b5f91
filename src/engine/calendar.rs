use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime, TimeZone};

use crate::model::{Ms, Span};

/// A lab day runs 09:00 to 17:00 local time.
pub const WORKDAY_START_HOUR: u32 = 9;
pub const WORKDAY_END_HOUR: u32 = 17;

/// Days shown in the week schedule, Monday first.
pub const SCHEDULE_DAYS: u64 = 5;

/// The local calendar date of an instant.
pub fn local_date(at: Ms, offset: FixedOffset) -> Option<NaiveDate> {
    Some(DateTime::from_timestamp_millis(at)?.with_timezone(&offset).date_naive())
}

fn local_instant(date: NaiveDate, time: NaiveTime, offset: FixedOffset) -> Option<Ms> {
    let local = offset.from_local_datetime(&date.and_time(time)).single()?;
    Some(local.timestamp_millis())
}

/// The bookable hours of `date`.
pub fn workday_span(date: NaiveDate, offset: FixedOffset) -> Option<Span> {
    let start = local_instant(date, NaiveTime::from_hms_opt(WORKDAY_START_HOUR, 0, 0)?, offset)?;
    let end = local_instant(date, NaiveTime::from_hms_opt(WORKDAY_END_HOUR, 0, 0)?, offset)?;
    Some(Span::new(start, end))
}

/// Local midnight to the next local midnight.
pub fn whole_day_span(date: NaiveDate, offset: FixedOffset) -> Option<Span> {
    let midnight = NaiveTime::from_hms_opt(0, 0, 0)?;
    let start = local_instant(date, midnight, offset)?;
    let end = local_instant(date.succ_opt()?, midnight, offset)?;
    Some(Span::new(start, end))
}

/// Monday through Friday of the week holding `date`.
pub fn school_week(date: NaiveDate) -> Option<Vec<NaiveDate>> {
    let monday = date.checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))?;
    (0..SCHEDULE_DAYS)
        .map(|i| monday.checked_add_days(Days::new(i)))
        .collect()
}
