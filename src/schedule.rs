//! Cron expression parsing and fire-time computation.
//!
//! Expressions use the classic five-field form (minute, hour, day-of-month,
//! month, day-of-week), interpreted in UTC at minute resolution. Each field
//! accepts `*`, single values, ranges (`a-b`), comma lists, and steps
//! (`*/n`, `a-b/n`, `a/n`).

use crate::error::{CronField, ScheduleError};

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Timelike, Utc};

/// Search horizon for `next_fire_time`. Expressions with no match within this
/// window are reported as unreachable instead of looping forever.
const HORIZON_DAYS: i64 = 4 * 366;

/// The parsed, normalized form of a cron expression.
///
/// Each field is a bitmask of accepted values. Immutable once parsed; a job
/// whose raw schedule string changes gets a freshly parsed expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleExpr {
  minutes: u64,
  hours: u64,
  days_of_month: u64,
  months: u64,
  days_of_week: u64,
  // Whether the raw field was something other than `*`. Needed for the
  // standard cron rule: when both day fields are restricted, a date matching
  // EITHER of them qualifies.
  dom_restricted: bool,
  dow_restricted: bool,
}

impl ScheduleExpr {
  /// Parses a five-field cron expression.
  pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
      return Err(ScheduleError::FieldCount(fields.len()));
    }

    let minutes = parse_field(fields[0], 0, 59, CronField::Minute)?;
    let hours = parse_field(fields[1], 0, 23, CronField::Hour)?;
    let days_of_month = parse_field(fields[2], 1, 31, CronField::DayOfMonth)?;
    let months = parse_field(fields[3], 1, 12, CronField::Month)?;
    let mut days_of_week = parse_field(fields[4], 0, 7, CronField::DayOfWeek)?;
    // Both 0 and 7 mean Sunday.
    if days_of_week & (1 << 7) != 0 {
      days_of_week = (days_of_week & !(1 << 7)) | 1;
    }

    Ok(Self {
      minutes,
      hours,
      days_of_month,
      months,
      days_of_week,
      dom_restricted: fields[2] != "*",
      dow_restricted: fields[4] != "*",
    })
  }

  /// Returns the earliest instant strictly greater than `after` that matches
  /// this expression, at minute resolution.
  ///
  /// The search is bounded: expressions with no match within roughly four
  /// years (e.g. day-of-month 31 with a month set of February only) yield
  /// `ScheduleError::Unreachable`.
  pub fn next_fire_time(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let mut t = minute_floor(after) + ChronoDuration::minutes(1);
    let horizon = after + ChronoDuration::days(HORIZON_DAYS);

    while t <= horizon {
      if !bit_set(self.months, t.month()) {
        t = first_of_next_month(t)?;
        continue;
      }
      if !self.day_matches(&t) {
        t = next_day(t)?;
        continue;
      }
      if !bit_set(self.hours, t.hour()) {
        t = t - ChronoDuration::minutes(i64::from(t.minute())) + ChronoDuration::hours(1);
        continue;
      }
      if !bit_set(self.minutes, t.minute()) {
        t += ChronoDuration::minutes(1);
        continue;
      }
      return Ok(t);
    }

    Err(ScheduleError::Unreachable)
  }

  fn day_matches(&self, t: &DateTime<Utc>) -> bool {
    let dom = bit_set(self.days_of_month, t.day());
    let dow = bit_set(self.days_of_week, t.weekday().num_days_from_sunday());
    match (self.dom_restricted, self.dow_restricted) {
      // Vixie cron: two restricted day fields are OR-ed, not AND-ed.
      (true, true) => dom || dow,
      (true, false) => dom,
      (false, true) => dow,
      (false, false) => true,
    }
  }
}

impl FromStr for ScheduleExpr {
  type Err = ScheduleError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

fn bit_set(mask: u64, value: u32) -> bool {
  value < 64 && mask & (1u64 << value) != 0
}

fn minute_floor(t: DateTime<Utc>) -> DateTime<Utc> {
  let naive = t
    .date_naive()
    .and_hms_opt(t.hour(), t.minute(), 0)
    .unwrap_or_else(|| t.naive_utc());
  DateTime::from_naive_utc_and_offset(naive, Utc)
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
  DateTime::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0).unwrap_or_default(), Utc)
}

fn next_day(t: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
  let date = t
    .date_naive()
    .succ_opt()
    .ok_or(ScheduleError::Unreachable)?;
  Ok(midnight(date))
}

fn first_of_next_month(t: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
  let (year, month) = if t.month() == 12 {
    (t.year() + 1, 1)
  } else {
    (t.year(), t.month() + 1)
  };
  let date = NaiveDate::from_ymd_opt(year, month, 1).ok_or(ScheduleError::Unreachable)?;
  Ok(midnight(date))
}

/// Parses one cron field into a bitmask of accepted values.
fn parse_field(text: &str, min: u32, max: u32, field: CronField) -> Result<u64, ScheduleError> {
  if text.is_empty() {
    return Err(parse_err(field, "empty field"));
  }
  let mut mask = 0u64;
  for part in text.split(',') {
    mask |= parse_term(part, min, max, field)?;
  }
  Ok(mask)
}

fn parse_term(term: &str, min: u32, max: u32, field: CronField) -> Result<u64, ScheduleError> {
  let (base, step) = match term.split_once('/') {
    Some((base, step_text)) => {
      let step: u32 = step_text
        .parse()
        .map_err(|_| parse_err(field, format!("malformed step '{step_text}'")))?;
      if step == 0 {
        return Err(parse_err(field, "step must be greater than zero"));
      }
      (base, step)
    }
    None => (term, 1),
  };
  let stepped = term.contains('/');

  let (lo, hi) = if base == "*" {
    (min, max)
  } else if let Some((a, b)) = base.split_once('-') {
    (parse_value(a, field)?, parse_value(b, field)?)
  } else {
    let v = parse_value(base, field)?;
    // `n/step` extends to the top of the field's domain, vixie-style.
    if stepped {
      (v, max)
    } else {
      (v, v)
    }
  };

  if lo < min || hi > max {
    return Err(parse_err(
      field,
      format!("value out of range ({min}-{max}) in '{term}'"),
    ));
  }
  if lo > hi {
    return Err(parse_err(field, format!("range start greater than end in '{term}'")));
  }

  let mut mask = 0u64;
  let mut v = lo;
  while v <= hi {
    mask |= 1u64 << v;
    v += step;
  }
  Ok(mask)
}

fn parse_value(text: &str, field: CronField) -> Result<u32, ScheduleError> {
  text
    .parse()
    .map_err(|_| parse_err(field, format!("malformed value '{text}'")))
}

fn parse_err(field: CronField, reason: impl Into<String>) -> ScheduleError {
  ScheduleError::Parse {
    field,
    reason: reason.into(),
  }
}
