// =============================================================================
// Time buckets — window alignment, resolutions and the cascade table
// =============================================================================
//
// All arithmetic is UTC. Fixed-width units (minute/hour/day) are floored in
// whole seconds from the Unix epoch, so a 2-hour window starts on hours
// 0, 2, 4, ... and a 3-day window on every third day since 1970-01-01.
// Months are indexed linearly from 1970-01 and years from 1970.
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeDelta, Utc};
use tracing::error;

use crate::error::AggregatorError;

const SECS_PER_MINUTE: i64 = 60;
const SECS_PER_HOUR: i64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: i64 = 24 * SECS_PER_HOUR;
const EPOCH_YEAR: i32 = 1970;
const LAST_YEAR: i32 = 9999;

/// Native period unit of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeriodUnit {
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

impl PeriodUnit {
    pub const ALL: [PeriodUnit; 5] = [
        PeriodUnit::Minute,
        PeriodUnit::Hour,
        PeriodUnit::Day,
        PeriodUnit::Month,
        PeriodUnit::Year,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// The next finer unit, whose 1× rows make up a window of this unit.
    pub const fn finer(self) -> Option<PeriodUnit> {
        match self {
            Self::Minute => None,
            Self::Hour => Some(Self::Minute),
            Self::Day => Some(Self::Hour),
            Self::Month => Some(Self::Day),
            Self::Year => Some(Self::Month),
        }
    }

    pub const fn coarser(self) -> Option<PeriodUnit> {
        match self {
            Self::Minute => Some(Self::Hour),
            Self::Hour => Some(Self::Day),
            Self::Day => Some(Self::Month),
            Self::Month => Some(Self::Year),
            Self::Year => None,
        }
    }

    const fn fixed_secs(self) -> Option<i64> {
        match self {
            Self::Minute => Some(SECS_PER_MINUTE),
            Self::Hour => Some(SECS_PER_HOUR),
            Self::Day => Some(SECS_PER_DAY),
            Self::Month | Self::Year => None,
        }
    }
}

impl std::fmt::Display for PeriodUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodUnit {
    type Err = AggregatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_ascii_lowercase();
        let singular = trimmed.strip_suffix('s').unwrap_or(trimmed.as_str());
        PeriodUnit::ALL
            .into_iter()
            .find(|unit| unit.as_str() == singular)
            .ok_or_else(|| AggregatorError::InvalidPeriod(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Window arithmetic
// ---------------------------------------------------------------------------

/// Whether `instant` falls in the range every window computation is defined
/// for (calendar years 1970 through 9999). Callers reject anything else.
pub fn is_supported(instant: DateTime<Utc>) -> bool {
    (EPOCH_YEAR..=LAST_YEAR).contains(&instant.year())
}

/// Start of the `multiple`×`unit` window containing `instant`.
pub fn aligned_start(instant: DateTime<Utc>, unit: PeriodUnit, multiple: u32) -> DateTime<Utc> {
    let multiple = multiple.max(1);
    match unit.fixed_secs() {
        Some(unit_secs) => {
            let width = unit_secs * i64::from(multiple);
            let rem = instant.timestamp().rem_euclid(width);
            instant
                - TimeDelta::seconds(rem)
                - TimeDelta::nanoseconds(i64::from(instant.timestamp_subsec_nanos()))
        }
        None if unit == PeriodUnit::Month => {
            let index = month_index(instant);
            let floored = index - index.rem_euclid(multiple as i32);
            month_start(floored)
        }
        None => {
            let years = instant.year() - EPOCH_YEAR;
            let floored = years - years.rem_euclid(multiple as i32);
            month_start(floored * 12)
        }
    }
}

/// Exclusive end of the window starting at `start`.
pub fn window_end(start: DateTime<Utc>, unit: PeriodUnit, multiple: u32) -> DateTime<Utc> {
    shift(start, unit, multiple as i32)
}

/// Move `instant` by `n` whole units (negative moves backwards).
pub fn shift(instant: DateTime<Utc>, unit: PeriodUnit, n: i32) -> DateTime<Utc> {
    if let Some(unit_secs) = unit.fixed_secs() {
        return instant + TimeDelta::seconds(unit_secs * i64::from(n));
    }
    let months = match unit {
        PeriodUnit::Year => n.saturating_mul(12),
        _ => n,
    };
    let delta = Months::new(months.unsigned_abs());
    let moved = if months >= 0 {
        instant.checked_add_months(delta)
    } else {
        instant.checked_sub_months(delta)
    };
    moved.unwrap_or_else(|| {
        error!(instant = %instant, unit = %unit, n, "window shift out of range");
        instant
    })
}

/// Oldest window start a tier keeps at `now`: the start of the previous
/// coarser unit (previous hour for minutes, previous day for hours, ...).
pub fn retention_floor(tier: PeriodUnit, now: DateTime<Utc>) -> DateTime<Utc> {
    match tier.coarser() {
        Some(parent) => shift(aligned_start(now, parent, 1), parent, -1),
        None => shift(aligned_start(now, tier, 1), tier, -1),
    }
}

/// Range `[start, end)` read from storage when seeding `period` at boot:
/// the previous and the current unit.
pub fn history_window(period: PeriodUnit, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let current = aligned_start(now, period, 1);
    (shift(current, period, -1), shift(current, period, 1))
}

fn month_index(instant: DateTime<Utc>) -> i32 {
    (instant.year() - EPOCH_YEAR) * 12 + instant.month0() as i32
}

fn month_start(index: i32) -> DateTime<Utc> {
    let year = EPOCH_YEAR + index.div_euclid(12);
    let month = index.rem_euclid(12) as u32 + 1;
    match NaiveDate::from_ymd_opt(year, month, 1) {
        Some(date) => date.and_time(chrono::NaiveTime::MIN).and_utc(),
        None => {
            error!(year, month, "month start out of range");
            DateTime::<Utc>::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Resolutions & cascade
// ---------------------------------------------------------------------------

/// One output resolution, e.g. 5×minute. Each has its own output table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resolution {
    pub multiple: u32,
    pub unit: PeriodUnit,
}

impl Resolution {
    pub const fn new(multiple: u32, unit: PeriodUnit) -> Self {
        Self { multiple, unit }
    }

    pub const fn base(unit: PeriodUnit) -> Self {
        Self::new(1, unit)
    }

    /// Table label, e.g. `5minute`.
    pub fn label(&self) -> String {
        format!("{}{}", self.multiple, self.unit)
    }

    pub fn aligned_start(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        aligned_start(instant, self.unit, self.multiple)
    }

    pub fn window_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        window_end(start, self.unit, self.multiple)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.multiple, self.unit)
    }
}

impl FromStr for Resolution {
    type Err = AggregatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.chars().take_while(char::is_ascii_digit).count();
        let (num, unit) = s.split_at(digits);
        let multiple: u32 = num
            .parse()
            .map_err(|_| AggregatorError::InvalidPeriod(s.to_string()))?;
        let resolution = Resolution::new(multiple, unit.parse()?);
        if OUTPUT_RESOLUTIONS.contains(&resolution) {
            Ok(resolution)
        } else {
            Err(AggregatorError::InvalidPeriod(s.to_string()))
        }
    }
}

/// The twelve output tables, finest first.
pub const OUTPUT_RESOLUTIONS: [Resolution; 12] = [
    Resolution::new(1, PeriodUnit::Minute),
    Resolution::new(5, PeriodUnit::Minute),
    Resolution::new(15, PeriodUnit::Minute),
    Resolution::new(30, PeriodUnit::Minute),
    Resolution::new(1, PeriodUnit::Hour),
    Resolution::new(2, PeriodUnit::Hour),
    Resolution::new(4, PeriodUnit::Hour),
    Resolution::new(1, PeriodUnit::Day),
    Resolution::new(3, PeriodUnit::Day),
    Resolution::new(7, PeriodUnit::Day),
    Resolution::new(1, PeriodUnit::Month),
    Resolution::new(1, PeriodUnit::Year),
];

/// A derived resolution and the base tier it is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadeStep {
    pub target: Resolution,
    pub source: PeriodUnit,
}

impl CascadeStep {
    const fn new(multiple: u32, unit: PeriodUnit, source: PeriodUnit) -> Self {
        Self {
            target: Resolution::new(multiple, unit),
            source,
        }
    }

    /// 1× rows below a year feed the next stage, so they are written back
    /// into the cache.
    pub fn feeds_cache(&self) -> bool {
        self.target.multiple == 1 && self.target.unit != PeriodUnit::Year
    }
}

/// Derived steps grouped in dependency order. Every step of a stage reads
/// only base tiers completed by earlier stages.
pub const CASCADE: [&[CascadeStep]; 4] = [
    &[
        CascadeStep::new(5, PeriodUnit::Minute, PeriodUnit::Minute),
        CascadeStep::new(15, PeriodUnit::Minute, PeriodUnit::Minute),
        CascadeStep::new(30, PeriodUnit::Minute, PeriodUnit::Minute),
        CascadeStep::new(1, PeriodUnit::Hour, PeriodUnit::Minute),
    ],
    &[
        CascadeStep::new(2, PeriodUnit::Hour, PeriodUnit::Hour),
        CascadeStep::new(4, PeriodUnit::Hour, PeriodUnit::Hour),
        CascadeStep::new(1, PeriodUnit::Day, PeriodUnit::Hour),
    ],
    &[
        CascadeStep::new(3, PeriodUnit::Day, PeriodUnit::Day),
        CascadeStep::new(7, PeriodUnit::Day, PeriodUnit::Day),
        CascadeStep::new(1, PeriodUnit::Month, PeriodUnit::Day),
    ],
    &[CascadeStep::new(1, PeriodUnit::Year, PeriodUnit::Month)],
];
