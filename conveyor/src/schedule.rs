//! Schedule expressions and next-trigger calculation.

use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, LocalResult, Months, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use time::OffsetDateTime;

use crate::{
    error::{Error, Result},
    store::{from_ms, to_ms},
};

/// The unit of a fixed-interval schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    /// Whole seconds.
    Seconds,
    /// Whole minutes.
    Minutes,
    /// Whole hours.
    Hours,
    /// Calendar days, preserving the local wall-clock time across DST shifts.
    Days,
    /// Calendar months, landing on the same day-of-month where possible.
    Months,
    /// Calendar years.
    Years,
}

impl IntervalUnit {
    fn code(&self) -> &'static str {
        match self {
            IntervalUnit::Seconds => "s",
            IntervalUnit::Minutes => "m",
            IntervalUnit::Hours => "h",
            IntervalUnit::Days => "d",
            IntervalUnit::Months => "mo",
            IntervalUnit::Years => "y",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "s" => Some(IntervalUnit::Seconds),
            "m" => Some(IntervalUnit::Minutes),
            "h" => Some(IntervalUnit::Hours),
            "d" => Some(IntervalUnit::Days),
            "mo" => Some(IntervalUnit::Months),
            "y" => Some(IntervalUnit::Years),
            _ => None,
        }
    }

    /// The unit's length in seconds, for units that are plain elapsed time.
    /// Calendar units return `None`.
    fn fixed_seconds(&self) -> Option<i64> {
        match self {
            IntervalUnit::Seconds => Some(1),
            IntervalUnit::Minutes => Some(60),
            IntervalUnit::Hours => Some(3600),
            IntervalUnit::Days | IntervalUnit::Months | IntervalUnit::Years => None,
        }
    }
}

/// When a recurring schedule should fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleSpec {
    /// Fire every `every` units, counted from `anchor` when present or from
    /// the moment the next run is computed otherwise.
    Interval {
        /// How many units between runs.
        every: u32,
        /// The unit of the interval.
        unit: IntervalUnit,
        /// Optional fixed starting instant.
        anchor: Option<OffsetDateTime>,
    },
    /// A standard five-field cron expression, evaluated in the schedule's
    /// timezone.
    Cron {
        /// The cron expression.
        expr: String,
    },
}

impl ScheduleSpec {
    /// Encode this schedule into its compact stored form.
    ///
    /// Intervals become `B=<every> <unit>[ <anchor unix ms>]` and cron
    /// expressions become `C=<expr>`. [decode](Self::decode) reverses this
    /// exactly.
    pub fn encode(&self) -> String {
        match self {
            ScheduleSpec::Interval {
                every,
                unit,
                anchor,
            } => match anchor {
                Some(anchor) => format!("B={} {} {}", every, unit.code(), to_ms(*anchor)),
                None => format!("B={} {}", every, unit.code()),
            },
            ScheduleSpec::Cron { expr } => format!("C={expr}"),
        }
    }

    /// Decode a schedule from its stored form.
    pub fn decode(input: &str) -> Result<Self> {
        let (kind, value) = input.split_once('=').ok_or(Error::InvalidSchedule)?;
        match kind {
            "C" => Ok(ScheduleSpec::Cron {
                expr: value.to_string(),
            }),
            "B" => {
                let mut parts = value.split(' ');
                let every = parts
                    .next()
                    .and_then(|p| p.parse::<u32>().ok())
                    .ok_or(Error::InvalidSchedule)?;
                let unit = parts
                    .next()
                    .and_then(IntervalUnit::from_code)
                    .ok_or(Error::InvalidSchedule)?;
                let anchor = parts
                    .next()
                    .map(|p| {
                        let ms = p.parse::<i64>().map_err(|_| Error::InvalidSchedule)?;
                        from_ms(ms, "anchor")
                    })
                    .transpose()?;
                Ok(ScheduleSpec::Interval {
                    every,
                    unit,
                    anchor,
                })
            }
            _ => Err(Error::InvalidSchedule),
        }
    }

    /// Compute the next trigger instant after `now`.
    ///
    /// Interval math for day-or-larger units is done on the local calendar
    /// representation in `timezone`, so a daily schedule keeps firing at the
    /// same wall-clock time across DST transitions and a monthly one lands on
    /// the same day-of-month where the target month allows it. Sub-day units
    /// are plain elapsed time.
    pub fn next_run(&self, now: OffsetDateTime, timezone: &str) -> Result<OffsetDateTime> {
        let tz = parse_timezone(timezone)?;
        let now = to_chrono(now)?;

        let next = match self {
            ScheduleSpec::Interval {
                every,
                unit,
                anchor,
            } => {
                if *every == 0 {
                    return Err(Error::InvalidSchedule);
                }
                let base = match anchor {
                    Some(anchor) => to_chrono(*anchor)?,
                    None => now,
                };
                // An anchor in the past keeps its phase; the trigger must be
                // strictly in the future.
                match unit.fixed_seconds() {
                    Some(secs) => {
                        let step_ms = *every as i64 * secs * 1000;
                        let behind = (now - base).num_milliseconds();
                        let steps = if behind >= 0 { behind / step_ms + 1 } else { 1 };
                        base + ChronoDuration::milliseconds(step_ms * steps)
                    }
                    None => {
                        // Calendar units step one interval at a time; an
                        // anchor can only be a bounded number of them behind.
                        let mut next = base;
                        let mut steps = 0;
                        loop {
                            next = add_interval(next.with_timezone(&tz), *every, *unit)?;
                            if next > now {
                                break;
                            }
                            steps += 1;
                            if steps > 100_000 {
                                return Err(Error::InvalidSchedule);
                            }
                        }
                        next
                    }
                }
            }
            ScheduleSpec::Cron { expr } => {
                let schedule = cron::Schedule::from_str(&normalize_cron(expr))
                    .map_err(|_| Error::InvalidSchedule)?;
                schedule
                    .after(&now.with_timezone(&tz))
                    .next()
                    .ok_or(Error::InvalidSchedule)?
                    .with_timezone(&Utc)
            }
        };

        from_ms(next.timestamp_millis(), "next_run")
    }
}

fn to_chrono(t: OffsetDateTime) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(to_ms(t))
        .single()
        .ok_or(Error::TimestampOutOfRange("schedule instant"))
}

/// The `cron` crate requires a seconds field, so a standard five-field
/// expression gets a literal `0` prepended.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn add_interval(base: DateTime<Tz>, every: u32, unit: IntervalUnit) -> Result<DateTime<Utc>> {
    let next = match unit {
        IntervalUnit::Seconds => Some(base + ChronoDuration::seconds(every as i64)),
        IntervalUnit::Minutes => Some(base + ChronoDuration::minutes(every as i64)),
        IntervalUnit::Hours => Some(base + ChronoDuration::hours(every as i64)),
        IntervalUnit::Days => {
            let local = base.naive_local() + ChronoDuration::days(every as i64);
            resolve_local(base.timezone(), local)
        }
        IntervalUnit::Months => base
            .naive_local()
            .checked_add_months(Months::new(every))
            .and_then(|local| resolve_local(base.timezone(), local)),
        IntervalUnit::Years => base
            .naive_local()
            .checked_add_months(Months::new(every.saturating_mul(12)))
            .and_then(|local| resolve_local(base.timezone(), local)),
    };

    next.map(|d| d.with_timezone(&Utc))
        .ok_or(Error::InvalidSchedule)
}

/// Map a naive local time back onto the timezone. An ambiguous time (fall
/// back) takes the earlier offset; a nonexistent time (spring forward) slides
/// past the gap an hour at a time.
fn resolve_local(tz: Tz, mut local: NaiveDateTime) -> Option<DateTime<Tz>> {
    for _ in 0..24 {
        match tz.from_local_datetime(&local) {
            LocalResult::Single(d) => return Some(d),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest),
            LocalResult::None => local += ChronoDuration::hours(1),
        }
    }
    None
}

pub(crate) fn parse_timezone(tz: &str) -> Result<Tz> {
    tz.parse::<Tz>()
        .map_err(|_| Error::InvalidTimezone(tz.to_string()))
}
