//! Synchronization planning.
//!
//! Decides how much of a resource has to be re-fetched by comparing the
//! locally cached coverage with the upstream reference signal.

use checkpoint::CoverageRecord;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::plugin::Reference;

/// Start of the full window when nothing narrower is known.
pub const DEFAULT_EPOCH: &str = "1990-01-01";

/// An inclusive time window; open bounds are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn new(since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        Self { since, until }
    }

    pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self::new(Some(since), Some(until))
    }

    /// Unbounded on both sides.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.since.is_none() && self.until.is_none()
    }

    /// Both bounds known and `since` after `until`.
    pub fn is_empty(&self) -> bool {
        matches!((self.since, self.until), (Some(s), Some(u)) if s > u)
    }

    /// Intersect with a caller-supplied window. Bounds only move inward.
    pub fn narrow(&self, requested: &TimeRange) -> TimeRange {
        let since = match (self.since, requested.since) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let until = match (self.until, requested.until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        TimeRange { since, until }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Fetch this window
    Fetch(TimeRange),
    /// Local coverage is already current
    NoOp,
}

#[derive(Debug, Clone)]
pub struct Planner {
    epoch: DateTime<Utc>,
}

impl Planner {
    pub fn new(epoch: DateTime<Utc>) -> Self {
        Self { epoch }
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Epoch through `now`.
    pub fn full_range(&self, now: DateTime<Utc>) -> TimeRange {
        TimeRange::between(self.epoch, now)
    }

    /// Compute the minimal re-fetch window.
    ///
    /// - Without coverage, or with only one cached bound, the full window.
    /// - A range reference extending past the cached `until` plans from the
    ///   day after `until` to the reference end.
    /// - A freshness reference newer than the last synchronization plans from
    ///   the day after that synchronization to `now`.
    /// - Anything else is a no-op.
    ///
    /// The caller's window then narrows the result; a window narrowed to
    /// nothing is also a no-op.
    pub fn plan(
        &self,
        coverage: Option<&CoverageRecord>,
        reference: Option<&Reference>,
        requested: &TimeRange,
        now: DateTime<Utc>,
    ) -> Plan {
        let planned = match coverage {
            None => {
                debug!("No coverage, planning full window");
                self.full_range(now)
            }
            Some(c) if c.since.is_some() != c.until.is_some() => {
                debug!("Coverage '{}' has one cached bound, planning full window", c.tag);
                self.full_range(now)
            }
            Some(c) => match (reference, c.until) {
                (Some(Reference::Range { until: Some(ref_until), .. }), None) => {
                    TimeRange::new(Some(self.epoch), Some(*ref_until))
                }
                (Some(Reference::Range { until: Some(ref_until), .. }), Some(cached))
                    if *ref_until > cached =>
                {
                    TimeRange::between(cached + Duration::days(1), *ref_until)
                }
                (Some(Reference::Freshness(modified)), _)
                    if c.last_synced_at.map_or(true, |synced| *modified > synced) =>
                {
                    let since = c
                        .last_synced_at
                        .map(|synced| synced + Duration::days(1))
                        .unwrap_or(self.epoch);
                    TimeRange::between(since, now)
                }
                _ => {
                    debug!("Coverage '{}' is current", c.tag);
                    return Plan::NoOp;
                }
            },
        };

        let narrowed = planned.narrow(requested);
        if narrowed.is_empty() {
            debug!("Planned window {planned:?} does not intersect {requested:?}");
            return Plan::NoOp;
        }
        Plan::Fetch(narrowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn planner() -> Planner {
        Planner::new(day(1990, 1, 1))
    }

    fn coverage(since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> CoverageRecord {
        let mut record = CoverageRecord::new("X.id1");
        record.advance(since, until, None);
        record
    }

    #[test]
    fn test_no_coverage_plans_full_window() {
        let now = day(2022, 1, 1);
        let plan = planner().plan(None, None, &TimeRange::unbounded(), now);
        assert_eq!(plan, Plan::Fetch(TimeRange::between(day(1990, 1, 1), now)));
    }

    #[test]
    fn test_range_reference_extends_window() {
        let cached = coverage(Some(day(2020, 1, 1)), Some(day(2021, 6, 30)));
        let reference = Reference::Range {
            since: Some(day(2020, 1, 1)),
            until: Some(day(2021, 12, 31)),
        };
        let plan = planner().plan(
            Some(&cached),
            Some(&reference),
            &TimeRange::unbounded(),
            day(2022, 1, 5),
        );
        assert_eq!(
            plan,
            Plan::Fetch(TimeRange::between(day(2021, 7, 1), day(2021, 12, 31)))
        );
    }

    #[test]
    fn test_current_coverage_is_noop() {
        let cached = coverage(Some(day(2020, 1, 1)), Some(day(2021, 12, 31)));
        let reference = Reference::Range {
            since: None,
            until: Some(day(2021, 12, 31)),
        };
        let p = planner();
        let now = day(2022, 1, 5);
        assert_eq!(
            p.plan(Some(&cached), Some(&reference), &TimeRange::unbounded(), now),
            Plan::NoOp
        );
        // No reference signal at all
        assert_eq!(
            p.plan(Some(&cached), None, &TimeRange::unbounded(), now),
            Plan::NoOp
        );
    }

    #[test]
    fn test_freshness_reference() {
        let mut cached = coverage(Some(day(2020, 1, 1)), Some(day(2021, 1, 1)));
        cached.advance(None, None, Some(day(2021, 3, 1)));
        let now = day(2021, 4, 1);
        let p = planner();

        let newer = Reference::Freshness(day(2021, 3, 15));
        assert_eq!(
            p.plan(Some(&cached), Some(&newer), &TimeRange::unbounded(), now),
            Plan::Fetch(TimeRange::between(day(2021, 3, 2), now))
        );

        let older = Reference::Freshness(day(2021, 2, 1));
        assert_eq!(
            p.plan(Some(&cached), Some(&older), &TimeRange::unbounded(), now),
            Plan::NoOp
        );
    }

    #[test]
    fn test_asymmetric_coverage_plans_full_window() {
        let cached = coverage(None, Some(day(2021, 6, 30)));
        let now = day(2022, 1, 1);
        let reference = Reference::Range {
            since: None,
            until: Some(day(2021, 1, 1)),
        };
        assert_eq!(
            planner().plan(Some(&cached), Some(&reference), &TimeRange::unbounded(), now),
            Plan::Fetch(TimeRange::between(day(1990, 1, 1), now))
        );
    }

    #[test]
    fn test_requested_window_only_narrows() {
        let now = day(2022, 1, 1);
        let requested = TimeRange::between(day(1980, 1, 1), day(2000, 1, 1));
        assert_eq!(
            planner().plan(None, None, &requested, now),
            Plan::Fetch(TimeRange::between(day(1990, 1, 1), day(2000, 1, 1)))
        );

        let cached = coverage(Some(day(2020, 1, 1)), Some(day(2021, 6, 30)));
        let reference = Reference::Range {
            since: None,
            until: Some(day(2021, 12, 31)),
        };
        let disjoint = TimeRange::new(None, Some(day(2021, 1, 1)));
        assert_eq!(
            planner().plan(Some(&cached), Some(&reference), &disjoint, now),
            Plan::NoOp
        );
    }
}
