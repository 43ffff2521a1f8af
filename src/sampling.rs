//! Sample timestamps of a series.
//!
//! A backfill computes one historical data point per sample time. Sample times
//! step backwards from the series creation time (truncated to the minute) by
//! the series interval and are returned oldest first.

use chrono::{DateTime, DurationRound, Months, TimeDelta, Utc};

use crate::models::{IntervalUnit, Series};

/// Sampling cadence of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInterval {
    pub unit: IntervalUnit,
    pub value: i32,
}

impl SampleInterval {
    pub fn new(unit: IntervalUnit, value: i32) -> Self {
        Self { unit, value }
    }

    pub fn for_series(series: &Series) -> Self {
        Self::new(series.sample_interval_unit, series.sample_interval_value)
    }

    /// The instant one interval before `from`, or `None` past the representable range.
    pub fn step_backwards(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let value = self.value.max(1) as u32;
        match self.unit {
            IntervalUnit::Hour => from.checked_sub_signed(TimeDelta::hours(value.into())),
            IntervalUnit::Day => from.checked_sub_signed(TimeDelta::days(value.into())),
            IntervalUnit::Week => from.checked_sub_signed(TimeDelta::weeks(value.into())),
            IntervalUnit::Month => from.checked_sub_months(Months::new(value)),
            IntervalUnit::Year => from.checked_sub_months(Months::new(value.saturating_mul(12))),
        }
    }
}

/// Build `count` sample times ending at `from`, oldest first.
pub fn build_sample_times(
    count: usize,
    interval: SampleInterval,
    from: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let mut times = Vec::with_capacity(count);
    let mut current = Some(from);
    while times.len() < count {
        let Some(at) = current else {
            break;
        };
        times.push(at);
        current = interval.step_backwards(at);
    }
    times.reverse();
    times
}

/// Sample times for a series, anchored at its creation time truncated to the minute.
pub fn sample_times_for_series(series: &Series, count: usize) -> Vec<DateTime<Utc>> {
    let created = series.created_at.with_timezone(&Utc);
    let anchor = created
        .duration_trunc(TimeDelta::minutes(1))
        .unwrap_or(created);
    build_sample_times(count, SampleInterval::for_series(series), anchor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_monthly_sample_times_oldest_first() {
        let from = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
        let times = build_sample_times(3, SampleInterval::new(IntervalUnit::Month, 1), from);

        assert_eq!(
            times,
            vec![
                Utc.with_ymd_and_hms(2024, 1, 29, 12, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap(),
                from,
            ]
        );
    }

    #[test]
    fn test_weekly_and_hourly_steps() {
        let from = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();

        let weeks = build_sample_times(2, SampleInterval::new(IntervalUnit::Week, 2), from);
        assert_eq!(weeks[0], Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let hours = build_sample_times(12, SampleInterval::new(IntervalUnit::Hour, 1), from);
        assert_eq!(hours.len(), 12);
        assert_eq!(hours[0], from - TimeDelta::hours(11));
        assert!(hours.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_zero_count_is_empty() {
        let from = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert!(build_sample_times(0, SampleInterval::new(IntervalUnit::Day, 1), from).is_empty());
    }
}
