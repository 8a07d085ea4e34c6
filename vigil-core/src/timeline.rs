//! Status timeline segment math.
//!
//! A timeline is the ordered set of `(from_ms, status)` records for one
//! monitor. Each record holds from its `from_ms` until the next record starts;
//! the last record holds until "now". The timeline is kept canonical: no two
//! adjacent records carry the same status, and at most one record exists per
//! instant.

use crate::error::{CoreError, Result};
use crate::types::{MonitorId, MonitorStatus, StatusHistoryRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A maximal interval during which a monitor's status did not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSegment {
    /// Status held during the segment.
    pub status: MonitorStatus,
    /// Segment start (inclusive).
    pub from_ms: u64,
    /// Segment end (exclusive).
    pub to_ms: u64,
}

impl StatusSegment {
    /// Length of the segment in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.to_ms.saturating_sub(self.from_ms)
    }
}

/// Canonical status history of a single monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTimeline {
    entries: BTreeMap<u64, MonitorStatus>,
}

impl StatusTimeline {
    /// Create an empty timeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a timeline from raw records, in any order.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = (u64, MonitorStatus)>,
    {
        let mut timeline = Self::new();
        for (from_ms, status) in records {
            timeline.insert(from_ms, status);
        }
        timeline
    }

    /// Fold one reading into the timeline.
    ///
    /// Readings colliding on the same instant keep the more severe status. A
    /// reading equal to the status already in effect is dropped, and a later
    /// record that becomes redundant is removed. Returns `true` when the
    /// timeline changed.
    pub fn insert(&mut self, from_ms: u64, status: MonitorStatus) -> bool {
        let existing = self.entries.get(&from_ms).copied();
        let effective = match existing {
            Some(current) => {
                let merged = current.worst(status);
                if merged == current {
                    return false;
                }
                merged
            }
            None => status,
        };

        let before = self.status_before(from_ms);
        let mut changed = false;
        if before == effective {
            if existing.is_some() {
                self.entries.remove(&from_ms);
                changed = true;
            }
        } else {
            self.entries.insert(from_ms, effective);
            changed = true;
        }

        if !changed {
            return false;
        }

        let next = self
            .entries
            .range(from_ms.saturating_add(1)..)
            .next()
            .map(|(at, status)| (*at, *status));
        if let Some((next_at, next_status)) = next {
            if next_status == effective {
                self.entries.remove(&next_at);
            }
        }
        true
    }

    /// Status in effect at `at_ms`. `Unknown` before the first record.
    pub fn status_at(&self, at_ms: u64) -> MonitorStatus {
        self.entries
            .range(..=at_ms)
            .next_back()
            .map(|(_, status)| *status)
            .unwrap_or_default()
    }

    /// Latest record, if any.
    pub fn latest(&self) -> Option<(u64, MonitorStatus)> {
        self.entries
            .iter()
            .next_back()
            .map(|(at, status)| (*at, *status))
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the timeline holds no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records in start order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, MonitorStatus)> + '_ {
        self.entries.iter().map(|(at, status)| (*at, *status))
    }

    /// Records as history rows for `monitor_id`.
    pub fn records(&self, monitor_id: MonitorId) -> Vec<StatusHistoryRecord> {
        self.iter()
            .map(|(from_ms, status)| StatusHistoryRecord {
                monitor_id,
                from_ms,
                status,
            })
            .collect()
    }

    /// Contiguous segments covering `[from_ms, to_ms)`.
    ///
    /// Time before the first record is reported as an `Unknown` segment.
    pub fn segments(&self, from_ms: u64, to_ms: u64) -> Result<Vec<StatusSegment>> {
        if from_ms >= to_ms {
            return Err(CoreError::InvalidWindow { from_ms, to_ms });
        }

        let mut segments = Vec::new();
        let mut cursor = from_ms;
        let mut current = self.status_at(from_ms);

        for (at, status) in self.entries.range(from_ms.saturating_add(1)..to_ms) {
            segments.push(StatusSegment {
                status: current,
                from_ms: cursor,
                to_ms: *at,
            });
            cursor = *at;
            current = *status;
        }
        segments.push(StatusSegment {
            status: current,
            from_ms: cursor,
            to_ms,
        });

        Ok(merge_adjacent(segments))
    }

    /// Distinct status transitions in start order.
    ///
    /// Records that repeat the previous distinct status are skipped, so each
    /// returned entry is one genuine change.
    pub fn transitions(&self) -> Vec<(u64, MonitorStatus)> {
        let mut out: Vec<(u64, MonitorStatus)> = Vec::new();
        for (at, status) in self.iter() {
            if out.last().map(|(_, prev)| *prev) != Some(status) {
                out.push((at, status));
            }
        }
        out
    }

    /// Transitions that started strictly after `after_ms`.
    pub fn transitions_after(&self, after_ms: Option<u64>) -> Vec<(u64, MonitorStatus)> {
        self.transitions()
            .into_iter()
            .filter(|(at, _)| after_ms.map_or(true, |after| *at > after))
            .collect()
    }

    /// Drop records older than `horizon_ms`.
    ///
    /// The record in effect at the horizon survives so the current status is
    /// never lost. Returns the number of records removed.
    pub fn prune_before(&mut self, horizon_ms: u64) -> usize {
        let keep = match self.entries.range(..=horizon_ms).next_back() {
            Some((at, _)) => *at,
            None => return 0,
        };
        let retained = self.entries.split_off(&keep);
        let removed = self.entries.len();
        self.entries = retained;
        removed
    }

    /// Fraction of known time in `[from_ms, to_ms)` that the monitor was up.
    ///
    /// Returns `None` when the whole window is `Unknown`.
    pub fn availability(&self, from_ms: u64, to_ms: u64) -> Result<Option<f64>> {
        let mut known = 0u64;
        let mut up = 0u64;
        for segment in self.segments(from_ms, to_ms)? {
            if segment.status == MonitorStatus::Unknown {
                continue;
            }
            known += segment.duration_ms();
            if segment.status.is_up() {
                up += segment.duration_ms();
            }
        }
        if known == 0 {
            return Ok(None);
        }
        Ok(Some(up as f64 / known as f64))
    }

    fn status_before(&self, at_ms: u64) -> MonitorStatus {
        self.entries
            .range(..at_ms)
            .next_back()
            .map(|(_, status)| *status)
            .unwrap_or_default()
    }
}

fn merge_adjacent(segments: Vec<StatusSegment>) -> Vec<StatusSegment> {
    let mut merged: Vec<StatusSegment> = Vec::with_capacity(segments.len());
    for segment in segments {
        if segment.duration_ms() == 0 {
            continue;
        }
        match merged.last_mut() {
            Some(last) if last.status == segment.status && last.to_ms == segment.from_ms => {
                last.to_ms = segment.to_ms;
            }
            _ => merged.push(segment),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use MonitorStatus::*;

    fn sample() -> StatusTimeline {
        StatusTimeline::from_records([(100, Available), (200, Degraded), (300, Available)])
    }

    #[test]
    fn status_at_follows_segments() {
        let timeline = sample();
        assert_eq!(timeline.status_at(50), Unknown);
        assert_eq!(timeline.status_at(100), Available);
        assert_eq!(timeline.status_at(200), Degraded);
        assert_eq!(timeline.status_at(299), Degraded);
        assert_eq!(timeline.status_at(10_000), Available);
    }

    #[test]
    fn repeated_status_is_skipped() {
        let mut timeline = sample();
        assert!(!timeline.insert(150, Available));
        assert!(!timeline.insert(400, Available));
        assert_eq!(timeline.len(), 3);
    }

    #[test]
    fn collision_keeps_worst() {
        let mut timeline = sample();
        assert!(timeline.insert(200, Unavailable));
        assert_eq!(timeline.status_at(250), Unavailable);
        assert!(!timeline.insert(200, Available));
        assert_eq!(timeline.status_at(250), Unavailable);
    }

    #[test]
    fn insert_removes_redundant_successor() {
        let mut timeline = sample();
        // Degraded from 150 makes the Degraded record at 200 redundant.
        assert!(timeline.insert(150, Degraded));
        assert_eq!(
            timeline.iter().collect::<Vec<_>>(),
            vec![(100, Available), (150, Degraded), (300, Available)]
        );
    }

    #[test]
    fn out_of_order_insert_lands_in_place() {
        let mut timeline = StatusTimeline::new();
        timeline.insert(300, Unavailable);
        timeline.insert(100, Available);
        assert_eq!(timeline.status_at(200), Available);
        assert_eq!(timeline.status_at(300), Unavailable);
    }

    #[test]
    fn segments_cover_window() {
        let timeline = sample();
        let segments = timeline.segments(0, 400).unwrap();
        assert_eq!(
            segments,
            vec![
                StatusSegment { status: Unknown, from_ms: 0, to_ms: 100 },
                StatusSegment { status: Available, from_ms: 100, to_ms: 200 },
                StatusSegment { status: Degraded, from_ms: 200, to_ms: 300 },
                StatusSegment { status: Available, from_ms: 300, to_ms: 400 },
            ]
        );

        let inner = timeline.segments(250, 260).unwrap();
        assert_eq!(
            inner,
            vec![StatusSegment { status: Degraded, from_ms: 250, to_ms: 260 }]
        );

        assert!(timeline.segments(10, 10).is_err());
    }

    #[test]
    fn prune_keeps_record_in_effect() {
        let mut timeline = sample();
        assert_eq!(timeline.prune_before(250), 1);
        assert_eq!(timeline.status_at(250), Degraded);
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.prune_before(50), 0);
    }

    #[test]
    fn transitions_after_cursor() {
        let timeline = sample();
        assert_eq!(timeline.transitions().len(), 3);
        assert_eq!(
            timeline.transitions_after(Some(100)),
            vec![(200, Degraded), (300, Available)]
        );
    }

    #[test]
    fn availability_ignores_unknown() {
        let timeline = StatusTimeline::from_records([(100, Available), (200, Unavailable)]);
        let ratio = timeline.availability(0, 300).unwrap().unwrap();
        assert!((ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(StatusTimeline::new().availability(0, 10).unwrap(), None);
    }
}
