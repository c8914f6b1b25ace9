//! Enumeration of compositing periods from a temporal schema.
//!
//! A schema of `step`/`unit` produces consecutive periods anchored at the
//! requested start date. When a `cycle` is present, period boundaries restart
//! at each cycle boundary (e.g. 16-day periods restarting every January 1st),
//! and the last period of a cycle is truncated at the cycle end.

use chrono::{Datelike, Days, Months, NaiveDate};

use crate::models::{TemporalSchema, TimeUnit};

/// An inclusive `[start, end]` date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    /// The `start_end` key used in item ids and composite paths.
    pub fn key(&self) -> String {
        format!("{}_{}", self.start, self.end)
    }
}

fn advance(date: NaiveDate, step: u32, unit: TimeUnit) -> NaiveDate {
    match unit {
        TimeUnit::Day => date + Days::new(u64::from(step)),
        TimeUnit::Month => date + Months::new(step),
        TimeUnit::Year => date + Months::new(step * 12),
    }
}

/// First boundary of the cycle containing `date`.
fn cycle_start(date: NaiveDate, unit: TimeUnit) -> NaiveDate {
    match unit {
        TimeUnit::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).expect("jan 1st"),
        TimeUnit::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
            .expect("first of month"),
        TimeUnit::Day => date,
    }
}

/// Generate the ordered periods covering `[start, end]`.
///
/// The generator is pure: the same inputs always yield the same periods.
/// Periods may extend past `end` (or begin before `start` when a cycle
/// anchors them earlier); the orchestrator drops the ones that cross the
/// requested range.
pub fn mount(schema: &TemporalSchema, start: NaiveDate, end: NaiveDate) -> Vec<Period> {
    let mut periods = Vec::new();

    match &schema.cycle {
        None => {
            let mut cursor = start;
            while cursor <= end {
                let next = advance(cursor, schema.step, schema.unit);
                periods.push(Period { start: cursor, end: next - Days::new(1) });
                cursor = next;
            }
        }
        Some(cycle) => {
            let mut cycle_begin = cycle_start(start, cycle.unit);
            while cycle_begin <= end {
                let cycle_close =
                    advance(cycle_begin, cycle.step, cycle.unit) - Days::new(1);
                let mut cursor = cycle_begin;
                while cursor <= cycle_close {
                    let next = advance(cursor, schema.step, schema.unit);
                    let period_end = (next - Days::new(1)).min(cycle_close);
                    periods.push(Period { start: cursor, end: period_end });
                    cursor = next;
                }
                cycle_begin = cycle_close + Days::new(1);
            }
        }
    }

    periods
}
