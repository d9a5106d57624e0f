//! Date-time path segments: `yyyy-MM-dd['T'[HH][:mm][:ss][.SSS]][Z][z]`.
//!
//! Missing time fields default to zero and a missing offset means UTC.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};

/// Accepted layout as shown to clients, brackets mark optional parts.
pub const DATETIME_FORMAT_PATTERN: &str = "yyyy-MM-dd[T[HH][:mm][:ss][.SSS]][Z][z]";

pub fn parse_date_time(raw: &str) -> Result<DateTime<Utc>> {
    Cursor::new(raw).date_time().map_err(|reason| ServiceError::DateParse {
        pattern: DATETIME_FORMAT_PATTERN,
        reason: format!("Text '{raw}' could not be parsed: {reason}"),
    })
}

struct Cursor<'a> {
    raw: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(raw: &'a str) -> Self {
        Self { raw, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.raw[self.pos..]
    }

    fn eat(&mut self, prefix: &str) -> bool {
        if self.rest().starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    /// Exactly `count` ASCII digits.
    fn digits(&mut self, count: usize) -> Option<u32> {
        let rest = self.rest();
        if rest.len() < count || !rest.as_bytes()[..count].iter().all(u8::is_ascii_digit) {
            return None;
        }
        let value = rest[..count].parse().ok()?;
        self.pos += count;
        Some(value)
    }

    fn required(&mut self, count: usize, what: &str) -> std::result::Result<u32, String> {
        self.digits(count)
            .ok_or_else(|| format!("expected {count} digit {what} at index {}", self.pos))
    }

    fn date_time(mut self) -> std::result::Result<DateTime<Utc>, String> {
        let year = self.required(4, "year")?;
        if !self.eat("-") {
            return Err(format!("expected '-' at index {}", self.pos));
        }
        let month = self.required(2, "month")?;
        if !self.eat("-") {
            return Err(format!("expected '-' at index {}", self.pos));
        }
        let day = self.required(2, "day")?;
        let date = NaiveDate::from_ymd_opt(year as i32, month, day)
            .ok_or_else(|| format!("invalid calendar date {year:04}-{month:02}-{day:02}"))?;

        let (mut hour, mut minute, mut second, mut millis) = (0, 0, 0, 0);
        if self.eat("T") {
            if let Some(value) = self.digits(2) {
                hour = value;
            }
            if self.eat(":") {
                minute = self.required(2, "minute")?;
            }
            if self.eat(":") {
                second = self.required(2, "second")?;
            }
            if self.eat(".") {
                millis = self.required(3, "fraction")?;
            }
        }
        let time = NaiveTime::from_hms_milli_opt(hour, minute, second, millis)
            .ok_or_else(|| format!("invalid time {hour:02}:{minute:02}:{second:02}.{millis:03}"))?;
        let local = NaiveDateTime::new(date, time);

        let offset = self.offset()?;
        self.zone()?;
        if !self.rest().is_empty() {
            return Err(format!("unparsed text found at index {}", self.pos));
        }

        let offset = offset.unwrap_or_else(|| Utc.fix());
        offset
            .from_local_datetime(&local)
            .single()
            .map(|moment| moment.with_timezone(&Utc))
            .ok_or_else(|| "ambiguous local time".to_string())
    }

    /// `+HHMM` or `-HHMM`.
    fn offset(&mut self) -> std::result::Result<Option<FixedOffset>, String> {
        let sign = if self.eat("+") {
            1
        } else if self.eat("-") {
            -1
        } else {
            return Ok(None);
        };
        let hours = self.required(2, "offset hour")? as i32;
        self.eat(":");
        let minutes = self.required(2, "offset minute")? as i32;
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(Some)
            .ok_or_else(|| format!("offset out of range: {hours:02}{minutes:02}"))
    }

    /// Only zones equivalent to UTC are understood by name.
    fn zone(&mut self) -> std::result::Result<(), String> {
        let rest = self.rest();
        if rest.is_empty() {
            return Ok(());
        }
        for name in ["Z", "UTC", "GMT"] {
            if rest == name {
                self.pos = self.raw.len();
                return Ok(());
            }
        }
        Err(format!("unknown zone '{rest}'"))
    }
}
