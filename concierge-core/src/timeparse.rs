//! Natural-language date and time parsing for booking requests, plus the
//! human-readable formats used when reading slots back to a customer.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use regex::Regex;
use std::sync::LazyLock;

static SLASH_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})/(\d{1,2})(?:/(\d{2,4}))?$").expect("Invalid slash-date regex")
});

static IN_DAYS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^in (\d{1,3}) days?$").expect("Invalid in-days regex"));

static MONTH_DAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z]{3,9})\.? (\d{1,2})(?:st|nd|rd|th)?(?:,? (\d{4}))?$")
        .expect("Invalid month-day regex")
});

static DAY_MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})(?:st|nd|rd|th)?(?: of)? ([a-z]{3,9})(?:,? (\d{4}))?$")
        .expect("Invalid day-month regex")
});

static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:at )?(\d{1,2})(?::(\d{2}))?\s*(am|pm|a\.m\.?|p\.m\.?)?$")
        .expect("Invalid clock regex")
});

pub fn today_in(tz: Tz) -> NaiveDate {
    Utc::now().with_timezone(&tz).date_naive()
}

fn normalize(text: &str) -> String {
    text.trim()
        .trim_end_matches(['.', '!', '?', ','])
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn weekday_from(name: &str) -> Option<Weekday> {
    Some(match name {
        "monday" | "mon" => Weekday::Mon,
        "tuesday" | "tue" | "tues" => Weekday::Tue,
        "wednesday" | "wed" => Weekday::Wed,
        "thursday" | "thu" | "thur" | "thurs" => Weekday::Thu,
        "friday" | "fri" => Weekday::Fri,
        "saturday" | "sat" => Weekday::Sat,
        "sunday" | "sun" => Weekday::Sun,
        _ => return None,
    })
}

fn month_from(name: &str) -> Option<u32> {
    let key: String = name.chars().take(3).collect();
    Some(match key.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    })
}

/// Soonest date on or after `today` falling on `weekday`.
fn upcoming(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let ahead = (7 + weekday.num_days_from_monday() as i64
        - today.weekday().num_days_from_monday() as i64)
        % 7;
    today + Duration::days(ahead)
}

/// A month/day with no year refers to the next occurrence.
fn roll_forward(today: NaiveDate, month: u32, day: u32) -> Option<NaiveDate> {
    let this_year = NaiveDate::from_ymd_opt(today.year(), month, day)?;
    if this_year >= today {
        Some(this_year)
    } else {
        NaiveDate::from_ymd_opt(today.year() + 1, month, day)
    }
}

/// Parse a date as a customer would type it, relative to `today`.
///
/// Accepts ISO dates, `M/D[/YYYY]`, month-name dates, `today`, `tomorrow`,
/// `day after tomorrow`, weekday names with optional `this`/`next`,
/// `in N days` and `next week`.
pub fn parse_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let s = normalize(text);
    if s.is_empty() {
        return None;
    }

    if let Ok(d) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
        return Some(d);
    }

    match s.as_str() {
        "today" | "tonight" => return Some(today),
        "tomorrow" | "tmrw" => return Some(today + Duration::days(1)),
        "day after tomorrow" | "the day after tomorrow" => return Some(today + Duration::days(2)),
        "next week" => return Some(today + Duration::days(7)),
        _ => {}
    }

    if let Some(c) = SLASH_DATE_RE.captures(&s) {
        let month: u32 = c[1].parse().ok()?;
        let day: u32 = c[2].parse().ok()?;
        return match c.get(3) {
            Some(y) => {
                let mut year: i32 = y.as_str().parse().ok()?;
                if year < 100 {
                    year += 2000;
                }
                NaiveDate::from_ymd_opt(year, month, day)
            }
            None => roll_forward(today, month, day),
        };
    }

    if let Some(c) = IN_DAYS_RE.captures(&s) {
        let n: i64 = c[1].parse().ok()?;
        return Some(today + Duration::days(n));
    }

    let (prefix, rest) = match s.split_once(' ') {
        Some((p @ ("this" | "next" | "on"), rest)) => (p, rest),
        _ => ("", s.as_str()),
    };
    if let Some(weekday) = weekday_from(rest) {
        let soonest = upcoming(today, weekday);
        return Some(if prefix == "next" {
            soonest + Duration::days(7)
        } else {
            soonest
        });
    }

    if let Some(c) = MONTH_DAY_RE.captures(&s) {
        let month = month_from(&c[1])?;
        let day: u32 = c[2].parse().ok()?;
        return match c.get(3) {
            Some(y) => NaiveDate::from_ymd_opt(y.as_str().parse().ok()?, month, day),
            None => roll_forward(today, month, day),
        };
    }

    if let Some(c) = DAY_MONTH_RE.captures(&s) {
        let day: u32 = c[1].parse().ok()?;
        let month = month_from(&c[2])?;
        return match c.get(3) {
            Some(y) => NaiveDate::from_ymd_opt(y.as_str().parse().ok()?, month, day),
            None => roll_forward(today, month, day),
        };
    }

    None
}

/// Parse `3pm`, `3:30 pm`, `15:30`, `noon`, `midday`.
pub fn parse_time(text: &str) -> Option<NaiveTime> {
    let s = normalize(text);
    match s.as_str() {
        "noon" | "midday" => return NaiveTime::from_hms_opt(12, 0, 0),
        "midnight" => return NaiveTime::from_hms_opt(0, 0, 0),
        _ => {}
    }

    let c = CLOCK_RE.captures(&s)?;
    let mut hour: u32 = c[1].parse().ok()?;
    let minute: u32 = match c.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    if let Some(meridiem) = c.get(3) {
        if hour == 0 || hour > 12 {
            return None;
        }
        let pm = meridiem.as_str().starts_with('p');
        hour = match (pm, hour) {
            (false, 12) => 0,
            (true, 12) => 12,
            (true, h) => h + 12,
            (false, h) => h,
        };
    } else if c.get(2).is_none() {
        // A bare number is only a time when it carries a meridiem.
        return None;
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// `Tuesday, October 20, 2026`
pub fn format_date(date: NaiveDate) -> String {
    date.format("%A, %B %-d, %Y").to_string()
}

/// `3:30 PM`
pub fn format_time(time: NaiveTime) -> String {
    time.format("%-I:%M %p").to_string()
}

/// `Tuesday, October 20 at 3:30 PM`
pub fn format_slot(start: NaiveDateTime) -> String {
    format!(
        "{} at {}",
        start.format("%A, %B %-d"),
        format_time(start.time())
    )
}

/// Read a slot timestamp as wall-clock time.
///
/// RFC 3339 values keep their own offset's local time, so a slot
/// `2026-10-20T15:00:00-04:00` reads as 3:00 PM.
pub fn parse_slot_start(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2026-10-19 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn relative_words() {
        let today = monday();
        assert_eq!(parse_date("today", today), Some(today));
        assert_eq!(parse_date("Tomorrow!", today), Some(d(2026, 10, 20)));
        assert_eq!(parse_date("day after tomorrow", today), Some(d(2026, 10, 21)));
        assert_eq!(parse_date("in 3 days", today), Some(d(2026, 10, 22)));
        assert_eq!(parse_date("next week", today), Some(d(2026, 10, 26)));
    }

    #[test]
    fn weekdays() {
        let today = monday();
        assert_eq!(parse_date("monday", today), Some(today));
        assert_eq!(parse_date("Friday", today), Some(d(2026, 10, 23)));
        assert_eq!(parse_date("this fri", today), Some(d(2026, 10, 23)));
        assert_eq!(parse_date("next friday", today), Some(d(2026, 10, 30)));
        assert_eq!(parse_date("on sunday", today), Some(d(2026, 10, 25)));
    }

    #[test]
    fn explicit_dates() {
        let today = monday();
        assert_eq!(parse_date("2026-11-03", today), Some(d(2026, 11, 3)));
        assert_eq!(parse_date("11/3", today), Some(d(2026, 11, 3)));
        assert_eq!(parse_date("1/5", today), Some(d(2027, 1, 5)));
        assert_eq!(parse_date("12/24/26", today), Some(d(2026, 12, 24)));
        assert_eq!(parse_date("October 21st", today), Some(d(2026, 10, 21)));
        assert_eq!(parse_date("oct 2", today), Some(d(2027, 10, 2)));
        assert_eq!(parse_date("21 october 2027", today), Some(d(2027, 10, 21)));
        assert_eq!(parse_date("3rd of november", today), Some(d(2026, 11, 3)));
    }

    #[test]
    fn rejects_nonsense() {
        let today = monday();
        assert_eq!(parse_date("", today), None);
        assert_eq!(parse_date("whenever", today), None);
        assert_eq!(parse_date("13/45", today), None);
        assert_eq!(parse_date("3", today), None);
    }

    #[test]
    fn times() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0);
        assert_eq!(parse_time("3pm"), t(15, 0));
        assert_eq!(parse_time("3:30 PM"), t(15, 30));
        assert_eq!(parse_time("at 10 a.m."), t(10, 0));
        assert_eq!(parse_time("12am"), t(0, 0));
        assert_eq!(parse_time("12pm"), t(12, 0));
        assert_eq!(parse_time("15:30"), t(15, 30));
        assert_eq!(parse_time("noon"), t(12, 0));
        assert_eq!(parse_time("midday"), t(12, 0));
        assert_eq!(parse_time("13pm"), None);
        assert_eq!(parse_time("25:00"), None);
        assert_eq!(parse_time("3"), None);
    }

    #[test]
    fn formatting() {
        let date = d(2026, 10, 20);
        assert_eq!(format_date(date), "Tuesday, October 20, 2026");
        let time = NaiveTime::from_hms_opt(15, 30, 0).unwrap();
        assert_eq!(format_time(time), "3:30 PM");
        assert_eq!(
            format_slot(date.and_time(time)),
            "Tuesday, October 20 at 3:30 PM"
        );
    }

    #[test]
    fn slot_starts() {
        let start = parse_slot_start("2026-10-20T15:00:00-04:00").unwrap();
        assert_eq!(format_time(start.time()), "3:00 PM");
        assert!(parse_slot_start("2026-10-20 09:15").is_some());
        assert!(parse_slot_start("later").is_none());
    }
}
