//! Tumbling-window engine.
//!
//! Purely synchronous and owned by exactly one task; it never locks. Readings
//! are bucketed by their own timestamp, never by arrival order. A window
//! `[start, start + length)` closes once the watermark reaches `start +
//! length`, and from then on it is immutable: readings that map into it are
//! rejected as late.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use crate::models::{AggregateRecord, Reading, WindowKey};

/// Start of the tumbling window containing `ts`:
/// `floor(ts / length) * length`, in whole seconds.
pub fn window_start(ts: DateTime<Utc>, length: ChronoDuration) -> DateTime<Utc> {
    // ---
    let length_secs = length.num_seconds().max(1);
    let bucket = ts.timestamp().div_euclid(length_secs) * length_secs;
    Utc.timestamp_opt(bucket, 0).single().unwrap_or(ts)
}

/// Running sums for one window and key. Averages are taken only at flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowAccumulator {
    pub count: u64,
    pub sum_surface_temperature: f64,
    pub sum_external_temperature: f64,
    pub sum_ice_thickness: f64,
    pub sum_snow_accumulation: f64,
}

impl WindowAccumulator {
    fn add(&mut self, reading: &Reading) {
        self.count += 1;
        self.sum_surface_temperature += reading.surface_temperature;
        self.sum_external_temperature += reading.external_temperature;
        self.sum_ice_thickness += reading.ice_thickness;
        self.sum_snow_accumulation += reading.snow_accumulation;
    }

    fn into_record(self, key: SeriesKey, window_start: DateTime<Utc>) -> AggregateRecord {
        let n = self.count as f64;
        AggregateRecord {
            source_id: key.source_id,
            location: key.location,
            avg_ice_thickness: self.sum_ice_thickness / n,
            avg_snow_accumulation: self.sum_snow_accumulation / n,
            avg_external_temperature: self.sum_external_temperature / n,
            avg_surface_temperature: self.sum_surface_temperature / n,
            event_time: window_start,
            reading_count: self.count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SeriesKey {
    source_id: String,
    location: String,
}

/// What happened to one offered reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accepted(WindowKey),
    /// The reading's window had already closed; nothing was changed.
    Late {
        key: WindowKey,
        watermark: DateTime<Utc>,
    },
}

/// Admission of one reading plus any windows its timestamp closed.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub admission: Admission,
    pub closed: Vec<AggregateRecord>,
}

#[derive(Debug)]
pub struct WindowAggregator {
    length: ChronoDuration,
    grace: ChronoDuration,
    /// Open windows ordered by start; inner map ordered by key so flush
    /// output is deterministic.
    open: BTreeMap<DateTime<Utc>, BTreeMap<SeriesKey, WindowAccumulator>>,
    watermark: Option<DateTime<Utc>>,
    late: u64,
}

impl WindowAggregator {
    pub fn new(length: ChronoDuration, grace: ChronoDuration) -> Self {
        Self {
            length: if length.num_seconds() < 1 {
                ChronoDuration::seconds(1)
            } else {
                length
            },
            grace: grace.max(ChronoDuration::zero()),
            open: BTreeMap::new(),
            watermark: None,
            late: 0,
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Readings rejected as late since construction.
    pub fn late_count(&self) -> u64 {
        self.late
    }

    /// Number of live accumulators across all open windows.
    pub fn open_accumulators(&self) -> usize {
        self.open.values().map(BTreeMap::len).sum()
    }

    fn window_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start
            .checked_add_signed(self.length)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn is_closed(&self, start: DateTime<Utc>) -> bool {
        self.watermark
            .map(|wm| self.window_end(start) <= wm)
            .unwrap_or(false)
    }

    /// Fold one reading in, then advance the watermark from its event time.
    pub fn ingest(&mut self, reading: &Reading) -> IngestOutcome {
        // ---
        let start = window_start(reading.timestamp, self.length);
        let key = WindowKey {
            source_id: reading.source_id.clone(),
            location: reading.location.clone(),
            window_start: start,
        };

        if let Some(watermark) = self.watermark.filter(|_| self.is_closed(start)) {
            self.late += 1;
            return IngestOutcome {
                admission: Admission::Late { key, watermark },
                closed: Vec::new(),
            };
        }

        self.open
            .entry(start)
            .or_default()
            .entry(SeriesKey {
                source_id: reading.source_id.clone(),
                location: reading.location.clone(),
            })
            .or_default()
            .add(reading);

        let closed = match reading.timestamp.checked_sub_signed(self.grace) {
            Some(candidate) => self.advance_watermark(candidate),
            None => Vec::new(),
        };
        IngestOutcome {
            admission: Admission::Accepted(key),
            closed,
        }
    }

    /// Move the watermark forward (never back) and close every window whose
    /// end it has reached.
    pub fn advance_watermark(&mut self, candidate: DateTime<Utc>) -> Vec<AggregateRecord> {
        // ---
        match self.watermark {
            Some(current) if candidate <= current => return Vec::new(),
            _ => self.watermark = Some(candidate),
        }

        let length = self.length;
        let mut closed = Vec::new();
        while let Some(entry) = self.open.first_entry() {
            let still_open = entry
                .key()
                .checked_add_signed(length)
                .map_or(true, |end| end > candidate);
            if still_open {
                break;
            }
            let (start, accumulators) = entry.remove_entry();
            closed.extend(
                accumulators
                    .into_iter()
                    .map(|(key, acc)| acc.into_record(key, start)),
            );
        }
        closed
    }

    /// Advance from processing time when no events are arriving.
    pub fn advance_to_wall_clock(&mut self, now: DateTime<Utc>) -> Vec<AggregateRecord> {
        match now.checked_sub_signed(self.grace) {
            Some(candidate) => self.advance_watermark(candidate),
            None => Vec::new(),
        }
    }

    /// Close every open window regardless of the watermark, for shutdown.
    /// The watermark moves past the newest flushed window so nothing can be
    /// re-admitted into it afterwards.
    pub fn flush_all(&mut self) -> Vec<AggregateRecord> {
        // ---
        let Some(last_start) = self.open.keys().next_back().copied() else {
            return Vec::new();
        };
        let past_last = self.window_end(last_start);
        let open = std::mem::take(&mut self.open);
        if self.watermark.map_or(true, |wm| wm < past_last) {
            self.watermark = Some(past_last);
        }

        open.into_iter()
            .flat_map(|(start, accumulators)| {
                accumulators
                    .into_iter()
                    .map(move |(key, acc)| acc.into_record(key, start))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_736_966_400 + secs, 0).unwrap()
    }

    fn reading(source: &str, location: &str, secs: i64, ice: f64) -> Reading {
        // ---
        Reading {
            source_id: source.into(),
            location: location.into(),
            surface_temperature: -4.0,
            external_temperature: -11.0,
            ice_thickness: ice,
            snow_accumulation: 2.0,
            humidity: None,
            timestamp: at(secs),
        }
    }

    fn five_minutes() -> WindowAggregator {
        WindowAggregator::new(ChronoDuration::seconds(300), ChronoDuration::zero())
    }

    #[test]
    fn test_window_start_floors_to_length() {
        // ---
        let len = ChronoDuration::seconds(300);
        assert_eq!(window_start(at(0), len), at(0));
        assert_eq!(window_start(at(299), len), at(0));
        assert_eq!(window_start(at(300), len), at(300));
        assert_eq!(window_start(at(301), len), at(300));
        // idempotent
        assert_eq!(window_start(window_start(at(451), len), len), at(300));
    }

    #[test]
    fn test_window_start_before_epoch() {
        // ---
        let ts = Utc.timestamp_opt(-1, 0).unwrap();
        let start = window_start(ts, ChronoDuration::seconds(300));
        assert_eq!(start.timestamp(), -300);
    }

    #[test]
    fn test_three_readings_average_ice_thickness() {
        // ---
        let mut agg = five_minutes();
        for (secs, ice) in [(10, 26.0), (20, 27.5), (30, 29.0)] {
            let out = agg.ingest(&reading("sensor2", "NAC", secs, ice));
            assert!(matches!(out.admission, Admission::Accepted(_)));
            assert!(out.closed.is_empty());
        }

        let out = agg.ingest(&reading("sensor2", "NAC", 300, 40.0));
        assert_eq!(out.closed.len(), 1);
        let record = &out.closed[0];
        assert_eq!(record.source_id, "sensor2");
        assert_eq!(record.location, "NAC");
        assert_eq!(record.avg_ice_thickness, 27.5);
        assert_eq!(record.event_time, at(0));
        assert_eq!(record.reading_count, 3);
    }

    #[test]
    fn test_average_equals_sum_over_count() {
        // ---
        let mut agg = five_minutes();
        let values = [0.1, 0.2, 0.3, 10.7, -3.3];
        for (i, v) in values.iter().enumerate() {
            agg.ingest(&reading("s", "NAC", i as i64, *v));
        }
        let records = agg.flush_all();
        let expected = values.iter().sum::<f64>() / values.len() as f64;
        assert_eq!(records[0].avg_ice_thickness, expected);
    }

    #[test]
    fn test_out_of_order_within_open_window_is_accepted() {
        // ---
        let mut agg = five_minutes();
        agg.ingest(&reading("a", "NAC", 200, 10.0));
        let out = agg.ingest(&reading("a", "NAC", 50, 20.0));
        assert!(matches!(out.admission, Admission::Accepted(_)));

        let records = agg.flush_all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reading_count, 2);
        assert_eq!(records[0].avg_ice_thickness, 15.0);
    }

    #[test]
    fn test_late_reading_rejected_and_counted() {
        // ---
        let mut agg = five_minutes();
        agg.ingest(&reading("a", "NAC", 10, 10.0));
        let closed = agg.ingest(&reading("a", "NAC", 310, 10.0)).closed;
        assert_eq!(closed.len(), 1);

        let out = agg.ingest(&reading("a", "NAC", 299, 99.0));
        match out.admission {
            Admission::Late { key, watermark } => {
                assert_eq!(key.window_start, at(0));
                assert_eq!(watermark, at(310));
            }
            other => panic!("expected late admission, got {other:?}"),
        }
        assert!(out.closed.is_empty());
        assert_eq!(agg.late_count(), 1);

        // a key with no accumulator in the closed window is just as late
        let out = agg.ingest(&reading("b", "Dow's Lake", 5, 1.0));
        assert!(matches!(out.admission, Admission::Late { .. }));
        assert_eq!(agg.late_count(), 2);
    }

    #[test]
    fn test_grace_period_keeps_window_open() {
        // ---
        let mut agg = WindowAggregator::new(ChronoDuration::seconds(300), ChronoDuration::seconds(30));
        agg.ingest(&reading("a", "NAC", 290, 10.0));
        assert!(agg.ingest(&reading("a", "NAC", 320, 10.0)).closed.is_empty());

        let out = agg.ingest(&reading("a", "NAC", 295, 20.0));
        assert!(matches!(out.admission, Admission::Accepted(_)));

        let closed = agg.ingest(&reading("a", "NAC", 330, 10.0)).closed;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reading_count, 2);
        assert_eq!(closed[0].avg_ice_thickness, 15.0);
    }

    #[test]
    fn test_keys_progress_independently_and_absent_keys_emit_nothing() {
        // ---
        let mut agg = five_minutes();
        for i in 0..50 {
            agg.ingest(&reading("busy", "NAC", i, 10.0));
        }
        agg.ingest(&reading("quiet", "Fifth Avenue", 100, 30.0));

        // second window: only "busy" reports
        let closed = agg.ingest(&reading("busy", "NAC", 305, 10.0)).closed;
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].source_id, "busy");
        assert_eq!(closed[0].reading_count, 50);
        assert_eq!(closed[1].source_id, "quiet");
        assert_eq!(closed[1].reading_count, 1);

        let closed = agg.ingest(&reading("busy", "NAC", 605, 10.0)).closed;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].source_id, "busy");
        assert_eq!(closed[0].event_time, at(300));
    }

    #[test]
    fn test_same_source_different_locations_are_separate_keys() {
        // ---
        let mut agg = five_minutes();
        agg.ingest(&reading("s", "NAC", 1, 10.0));
        agg.ingest(&reading("s", "Dow's Lake", 2, 20.0));
        let records = agg.flush_all();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_arrival_order_does_not_change_result() {
        // ---
        let inputs = [
            reading("a", "NAC", 12, 11.0),
            reading("b", "NAC", 40, 22.0),
            reading("a", "NAC", 250, 33.0),
            reading("b", "NAC", 100, 44.0),
            reading("a", "NAC", 301, 55.0),
        ];
        let mut forward = five_minutes();
        let mut reversed = WindowAggregator::new(ChronoDuration::seconds(300), ChronoDuration::seconds(600));
        let mut grace_forward = WindowAggregator::new(ChronoDuration::seconds(300), ChronoDuration::seconds(600));

        for r in &inputs {
            forward.ingest(r);
            grace_forward.ingest(r);
        }
        for r in inputs.iter().rev() {
            reversed.ingest(r);
        }
        let mut a = grace_forward.flush_all();
        let mut b = reversed.flush_all();
        a.sort_by(|x, y| x.key().cmp(&y.key()));
        b.sort_by(|x, y| x.key().cmp(&y.key()));
        assert_eq!(a, b);
        assert_eq!(forward.late_count(), 0);
    }

    #[test]
    fn test_watermark_never_moves_back() {
        // ---
        let mut agg = five_minutes();
        agg.advance_watermark(at(1000));
        assert!(agg.advance_watermark(at(10)).is_empty());
        assert_eq!(agg.watermark(), Some(at(1000)));
    }

    #[test]
    fn test_wall_clock_advance_closes_idle_windows() {
        // ---
        let mut agg = five_minutes();
        agg.ingest(&reading("a", "NAC", 10, 10.0));
        assert!(agg.advance_to_wall_clock(at(299)).is_empty());
        let closed = agg.advance_to_wall_clock(at(300));
        assert_eq!(closed.len(), 1);
        assert_eq!(agg.open_accumulators(), 0);
    }

    #[test]
    fn test_oversized_durations_do_not_overflow() {
        // ---
        let mut agg = WindowAggregator::new(ChronoDuration::seconds(300), ChronoDuration::MAX);
        let out = agg.ingest(&reading("a", "NAC", 10, 10.0));
        assert!(matches!(out.admission, Admission::Accepted(_)));
        assert!(out.closed.is_empty());
        assert_eq!(agg.watermark(), None);
        assert!(agg.advance_to_wall_clock(at(10_000)).is_empty());

        let mut agg = WindowAggregator::new(ChronoDuration::MAX, ChronoDuration::zero());
        agg.ingest(&reading("a", "NAC", 10, 10.0));
        assert!(agg.advance_watermark(at(1_000_000)).is_empty());
        assert_eq!(agg.flush_all().len(), 1);
    }

    #[test]
    fn test_flush_all_emits_each_open_key_once() {
        // ---
        let mut agg = five_minutes();
        agg.ingest(&reading("a", "NAC", 10, 10.0));
        agg.ingest(&reading("a", "NAC", 20, 20.0));
        agg.ingest(&reading("b", "Dow's Lake", 30, 30.0));

        let records = agg.flush_all();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].reading_count, 2);
        assert_eq!(records[1].reading_count, 1);
        assert!(agg.flush_all().is_empty());

        // flushed windows are closed for good
        let out = agg.ingest(&reading("a", "NAC", 40, 1.0));
        assert!(matches!(out.admission, Admission::Late { .. }));
    }
}
