//! In-memory stream storage with exact aggregate computation.

use std::collections::BTreeMap;

use rill_client_api::MAX_TIME;
use rill_client_api::MIN_TIME;
use rill_client_api::RawPoint;
use rill_client_api::StatPoint;
use rill_client_api::Status;

/// One stream's points and metadata.
///
/// Points live in a time-ordered map; the value of a point written twice at
/// the same timestamp is the last write. The store keeps only the latest
/// version of the stream; queries for an explicit historical version are
/// answered from the latest snapshot.
pub(crate) struct StreamStore {
    pub(crate) collection: String,
    pub(crate) tags: BTreeMap<String, String>,
    pub(crate) annotation: Option<Vec<u8>>,
    points: BTreeMap<i64, f64>,
    version: u64,
}

impl StreamStore {
    pub(crate) fn new(
        collection: String,
        tags: BTreeMap<String, String>,
        annotation: Option<Vec<u8>>,
    ) -> Self {
        Self { collection, tags, annotation, points: BTreeMap::new(), version: 1 }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn insert(&mut self, points: &[RawPoint]) -> Result<(), Status> {
        for point in points {
            if point.time < MIN_TIME || point.time >= MAX_TIME {
                return Err(Status::new(
                    rill_client_api::codes::INVALID_TIME_RANGE,
                    format!("time {} outside valid range", point.time),
                ));
            }
        }
        for point in points {
            self.points.insert(point.time, point.value);
        }
        self.version += 1;
        Ok(())
    }

    pub(crate) fn delete_range(&mut self, start: i64, end: i64) -> Result<(), Status> {
        validate_query_range(start, end)?;
        self.points.retain(|time, _| *time < start || *time >= end);
        self.version += 1;
        Ok(())
    }

    pub(crate) fn raw_values(&self, start: i64, end: i64) -> Result<Vec<RawPoint>, Status> {
        validate_query_range(start, end)?;
        Ok(self
            .points
            .range(start..end)
            .map(|(time, value)| RawPoint { time: *time, value: *value })
            .collect())
    }

    /// Exact statistics of consecutive `width`-nanosecond windows covering
    /// `[start, end)`. A window that would overrun `end` is not emitted, and
    /// empty windows are omitted.
    pub(crate) fn windows(&self, start: i64, end: i64, width: u64) -> Result<Vec<StatPoint>, Status> {
        validate_query_range(start, end)?;
        if width == 0 {
            return Err(Status::invalid_arguments("window width must be nonzero"));
        }
        let width = width as i64;
        let mut out = Vec::new();
        let mut window_start = start;
        while window_start.saturating_add(width) <= end {
            let window_end = window_start + width;
            if let Some(stat) = self.window_stat(window_start, window_end) {
                out.push(stat);
            }
            window_start = window_end;
        }
        Ok(out)
    }

    /// Exact statistics of `1 << pointwidth` nanosecond windows aligned to
    /// multiples of the width. The first window starts at `start` rounded
    /// down to the alignment; empty windows are omitted.
    pub(crate) fn aligned_windows(
        &self,
        start: i64,
        end: i64,
        pointwidth: u8,
    ) -> Result<Vec<StatPoint>, Status> {
        validate_query_range(start, end)?;
        // 1 << 62 is the widest window whose aligned start stays within
        // i64 for every valid query start.
        if pointwidth >= 63 {
            return Err(Status::invalid_arguments("pointwidth must be below 63"));
        }
        let width = 1i64 << pointwidth;
        let mut out = Vec::new();
        let mut window_start = start.div_euclid(width) * width;
        while window_start.saturating_add(width) <= end {
            let window_end = window_start + width;
            if let Some(stat) = self.window_stat(window_start, window_end) {
                out.push(stat);
            }
            window_start = window_end;
        }
        Ok(out)
    }

    /// The nearest point forward from `time` (inclusive) or backward from
    /// `time` (exclusive).
    pub(crate) fn nearest(&self, time: i64, backward: bool) -> Result<RawPoint, Status> {
        let found = if backward {
            self.points.range(..time).next_back()
        } else {
            self.points.range(time..).next()
        };
        match found {
            Some((t, v)) => Ok(RawPoint { time: *t, value: *v }),
            None => Err(Status::new(
                rill_client_api::codes::NO_SUCH_POINT,
                "no point in the requested direction",
            )),
        }
    }

    fn window_stat(&self, window_start: i64, window_end: i64) -> Option<StatPoint> {
        let mut count = 0u64;
        let mut sum = 0.0f64;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut any_nan = false;
        for value in self.points.range(window_start..window_end).map(|(_, v)| *v) {
            count += 1;
            sum += value;
            if value.is_nan() {
                any_nan = true;
            } else {
                if value < min {
                    min = value;
                }
                if value > max {
                    max = value;
                }
            }
        }
        if count == 0 {
            return None;
        }
        if any_nan {
            // A NaN poisons the whole window.
            return Some(StatPoint {
                time: window_start,
                min: f64::NAN,
                mean: f64::NAN,
                max: f64::NAN,
                count,
            });
        }
        Some(StatPoint { time: window_start, min, mean: sum / count as f64, max, count })
    }
}

fn validate_query_range(start: i64, end: i64) -> Result<(), Status> {
    if start < MIN_TIME || end > MAX_TIME || start >= end {
        return Err(Status::new(
            rill_client_api::codes::INVALID_TIME_RANGE,
            format!("invalid interval [{start}, {end})"),
        ));
    }
    Ok(())
}
