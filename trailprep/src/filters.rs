//! Drop points or whole trajectories. Every filter works on one trajectory at a time, so they
//! all run through the executor.

use chrono::NaiveDateTime;

use crate::features::{distances, speeds};
use crate::geometry::{self, BoundingBox};
use crate::stats::percentile;
use crate::table::{seconds, LAT, LON};
use crate::{Error, Executor, Partition, Point, Result, TrajectoryTable};

// Scales the median absolute deviation to a standard deviation for normal data
const MAD_SCALE: f64 = 1.4826;
// Tukey's fences: values beyond this many interquartile ranges outside the quartiles are outliers
const IQR_FENCE: f64 = 1.5;

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// Keep points inside the box, or outside when `inside` is false
    BoundingBox { bbox: BoundingBox, inside: bool },
    /// Keep points within the time range. Both ends are inclusive.
    DateTimeRange {
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    },
    /// Drop points reached from the previous kept point faster than this many meters per second
    MaxSpeed(f64),
    /// Drop points reached from the previous kept point slower than this many meters per second
    MinSpeed(f64),
    /// Drop points closer than this many meters to the previous kept point
    MinDistance(f64),
    /// Drop points further than this many meters from the previous kept point
    MaxDistance(f64),
    /// Keep points within both limits, measured from the previous kept point
    MaxDistanceAndSpeed { max_distance: f64, max_speed: f64 },
    /// Keep points reaching both minimums, measured from the previous kept point
    MinDistanceAndSpeed { min_distance: f64, min_speed: f64 },
    /// Drop points whose distance from the previous point lies outside the trajectory's fences
    DistanceOutliers,
    /// Drop points whose speed from the previous point lies outside the trajectory's fences
    SpeedOutliers,
    /// Drop trajectories with fewer points
    MinPoints(usize),
    /// Drop outliers in a numeric column, judged against the median of a sliding window
    Hampel {
        column: String,
        half_window: usize,
        n_sigmas: f64,
    },
}

impl Filter {
    fn name(&self) -> &'static str {
        match self {
            Filter::BoundingBox { .. } => "filter_bounding_box",
            Filter::DateTimeRange { .. } => "filter_datetime_range",
            Filter::MaxSpeed(_) => "filter_max_speed",
            Filter::MinSpeed(_) => "filter_min_speed",
            Filter::MinDistance(_) => "filter_min_distance",
            Filter::MaxDistance(_) => "filter_max_distance",
            Filter::MaxDistanceAndSpeed { .. } => "filter_max_distance_and_speed",
            Filter::MinDistanceAndSpeed { .. } => "filter_min_distance_and_speed",
            Filter::DistanceOutliers => "filter_distance_outliers",
            Filter::SpeedOutliers => "filter_speed_outliers",
            Filter::MinPoints(_) => "filter_min_points",
            Filter::Hampel { .. } => "filter_hampel",
        }
    }

    pub fn validate(&self, table: &TrajectoryTable) -> Result<()> {
        let op = self.name();
        let bad = |reason: String| Err(Error::InvalidConfig { op, reason });
        match self {
            Filter::BoundingBox { bbox, .. } => {
                if !(bbox.min_lat <= bbox.max_lat && bbox.min_lon <= bbox.max_lon) {
                    return bad(format!("inverted bounding box {bbox:?}"));
                }
            }
            Filter::DateTimeRange {
                start: Some(start),
                end: Some(end),
            } => {
                if start > end {
                    return bad(format!("{start} is after {end}"));
                }
            }
            Filter::DateTimeRange { .. } => {}
            Filter::MaxSpeed(speed) => {
                if !(speed.is_finite() && *speed > 0.0) {
                    return bad(format!("max speed must be positive, not {speed}"));
                }
            }
            Filter::MinSpeed(x) | Filter::MinDistance(x) | Filter::MaxDistance(x) => {
                if !(x.is_finite() && *x >= 0.0) {
                    return bad(format!("limit must be non-negative, not {x}"));
                }
            }
            Filter::MaxDistanceAndSpeed {
                max_distance: distance,
                max_speed: speed,
            }
            | Filter::MinDistanceAndSpeed {
                min_distance: distance,
                min_speed: speed,
            } => {
                for x in [distance, speed] {
                    if !(x.is_finite() && *x >= 0.0) {
                        return bad(format!("limit must be non-negative, not {x}"));
                    }
                }
            }
            Filter::MinPoints(_) | Filter::DistanceOutliers | Filter::SpeedOutliers => {}
            Filter::Hampel {
                column,
                half_window,
                n_sigmas,
            } => {
                if *half_window == 0 {
                    return bad("the window must include neighbors".to_string());
                }
                if !(n_sigmas.is_finite() && *n_sigmas > 0.0) {
                    return bad(format!("n_sigmas must be positive, not {n_sigmas}"));
                }
                if column != LAT && column != LON && !table.columns().contains(column) {
                    return Err(Error::schema(op, None, format!("no column {column}")));
                }
            }
        }
        Ok(())
    }

    /// Runs on one trajectory. An empty result removes the trajectory.
    pub fn apply(&self, mut partition: Partition) -> Result<Partition> {
        let op = self.name();
        match self {
            Filter::BoundingBox { bbox, inside } => {
                partition
                    .rows_mut()
                    .retain(|pt| bbox.contains(pt.lat, pt.lon) == *inside);
            }
            Filter::DateTimeRange { start, end } => {
                partition.rows_mut().retain(|pt| {
                    start.map(|t| pt.time >= t).unwrap_or(true)
                        && end.map(|t| pt.time <= t).unwrap_or(true)
                });
            }
            Filter::MaxSpeed(max_speed) => {
                partition = retain_from_kept(partition, |_, speed| speed <= *max_speed)?;
            }
            Filter::MinSpeed(min_speed) => {
                partition = retain_from_kept(partition, |_, speed| speed >= *min_speed)?;
            }
            Filter::MinDistance(min_distance) => {
                partition = retain_from_kept(partition, |dist, _| dist >= *min_distance)?;
            }
            Filter::MaxDistance(max_distance) => {
                partition = retain_from_kept(partition, |dist, _| dist <= *max_distance)?;
            }
            Filter::MaxDistanceAndSpeed {
                max_distance,
                max_speed,
            } => {
                partition = retain_from_kept(partition, |dist, speed| {
                    dist <= *max_distance && speed <= *max_speed
                })?;
            }
            Filter::MinDistanceAndSpeed {
                min_distance,
                min_speed,
            } => {
                partition = retain_from_kept(partition, |dist, speed| {
                    dist >= *min_distance && speed >= *min_speed
                })?;
            }
            Filter::DistanceOutliers | Filter::SpeedOutliers => {
                let values = {
                    let traj = partition.trajectory()?;
                    if matches!(self, Filter::DistanceOutliers) {
                        distances(traj)
                    } else {
                        speeds(traj)?
                    }
                };
                let outliers = iqr_outliers(&values);
                let mut idx = 0;
                partition.rows_mut().retain(|_| {
                    idx += 1;
                    !outliers[idx - 1]
                });
            }
            Filter::MinPoints(n) => {
                if partition.len() < *n {
                    partition.rows_mut().clear();
                }
            }
            Filter::Hampel {
                column,
                half_window,
                n_sigmas,
            } => {
                let values: Vec<Option<f64>> = partition
                    .rows()
                    .iter()
                    .map(|pt| pt.numeric(column))
                    .collect();
                let outliers = hampel_outliers(&values, *half_window, *n_sigmas);
                let mut idx = 0;
                partition.rows_mut().retain(|_| {
                    idx += 1;
                    !outliers[idx - 1]
                });
            }
        }
        if partition.is_empty() {
            debug!("{op}: dropped all of {}", partition.key());
        }
        Ok(partition)
    }
}

/// Walks the trajectory in time order, keeping the first point and every point for which `keep`
/// accepts the distance and speed from the previous kept point.
fn retain_from_kept<F: Fn(f64, f64) -> bool>(partition: Partition, keep: F) -> Result<Partition> {
    partition.trajectory()?;
    let key = partition.key().clone();
    let mut kept: Vec<Point> = Vec::with_capacity(partition.len());
    for pt in partition.into_rows() {
        if let Some(prev) = kept.last() {
            let dist = geometry::distance(prev, &pt);
            if !keep(dist, dist / seconds(pt.time - prev.time)) {
                continue;
            }
        }
        kept.push(pt);
    }
    Ok(Partition::new(key, kept))
}

/// Marks values outside Tukey's fences. NaN values, like the first point's, are never outliers.
fn iqr_outliers(values: &[f64]) -> Vec<bool> {
    let mut sorted: Vec<f64> = values.iter().cloned().filter(|x| !x.is_nan()).collect();
    if sorted.is_empty() {
        return vec![false; values.len()];
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q1 = percentile(&sorted, 0.25);
    let q3 = percentile(&sorted, 0.75);
    let fence = IQR_FENCE * (q3 - q1);
    values
        .iter()
        .map(|x| *x < q1 - fence || *x > q3 + fence)
        .collect()
}

fn median(xs: &mut [f64]) -> f64 {
    xs.sort_by(|a, b| a.total_cmp(b));
    let n = xs.len();
    if n % 2 == 1 {
        xs[n / 2]
    } else {
        (xs[n / 2 - 1] + xs[n / 2]) / 2.0
    }
}

/// Marks values further than `n_sigmas` scaled MADs from their window's median. Absent values are
/// never outliers, and don't count towards windows.
fn hampel_outliers(values: &[Option<f64>], half_window: usize, n_sigmas: f64) -> Vec<bool> {
    let mut outliers = vec![false; values.len()];
    for (i, value) in values.iter().enumerate() {
        let x = match value {
            Some(x) => *x,
            None => continue,
        };
        let lo = i.saturating_sub(half_window);
        let hi = (i + half_window + 1).min(values.len());
        let mut window: Vec<f64> = values[lo..hi].iter().flatten().cloned().collect();
        let center = median(&mut window);
        let mut deviations: Vec<f64> = window.iter().map(|w| (w - center).abs()).collect();
        let mad = MAD_SCALE * median(&mut deviations);
        outliers[i] = (x - center).abs() > n_sigmas * mad;
    }
    outliers
}

impl TrajectoryTable {
    pub fn filter(&self, executor: &Executor, filter: &Filter) -> Result<Self> {
        filter.validate(self)?;
        let f = filter.clone();
        let result = executor.map(filter.name(), self, move |partition| f.apply(partition))?;
        if result.len() < self.len() {
            info!(
                "{}: removed {} of {} points",
                filter.name(),
                self.len() - result.len(),
                self.len()
            );
        }
        Ok(result)
    }
}
