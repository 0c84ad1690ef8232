use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

pub fn reference_date(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// UTC instant of 00:00 on `date` in `tz`. Zones that skip midnight for DST
/// resolve to the first local instant that exists after it.
pub fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    (0..=4)
        .find_map(|step| {
            tz.from_local_datetime(&(naive + Duration::minutes(30 * step)))
                .earliest()
        })
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

pub fn today_midnight(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    local_midnight(reference_date(now, tz), tz)
}

/// True when `started_at` falls on an earlier reference date than `now`.
pub fn started_before_today(started_at: DateTime<Utc>, now: DateTime<Utc>, tz: Tz) -> bool {
    reference_date(started_at, tz) < reference_date(now, tz)
}

pub fn is_within_rollover_window(now: DateTime<Utc>, tz: Tz, window: Duration) -> bool {
    let since_midnight = now - today_midnight(now, tz);
    since_midnight >= Duration::zero() && since_midnight < window
}

/// True within `margin` on either side of the next or the last local midnight.
pub fn is_near_midnight(now: DateTime<Utc>, tz: Tz, margin: Duration) -> bool {
    let today = reference_date(now, tz);
    let last = local_midnight(today, tz);
    let next = today
        .succ_opt()
        .map(|tomorrow| local_midnight(tomorrow, tz))
        .unwrap_or(last);
    (now - last) <= margin || (next - now) <= margin
}
