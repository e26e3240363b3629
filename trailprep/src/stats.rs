use std::collections::BTreeMap;

use serde::Serialize;

use crate::table::{LAT, LON};
use crate::{Error, Executor, Point, Result, Trajectory, TrajectoryID, TrajectoryTable};

/// Describes one numeric column of one trajectory. Cells that aren't numbers, or are NaN, are
/// skipped. With no values, everything except `count` is NaN.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColumnStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Sample standard deviation; NaN with fewer than 2 values
    pub std: f64,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

impl ColumnStats {
    pub fn new(mut values: Vec<f64>) -> ColumnStats {
        values.retain(|x| !x.is_nan());
        values.sort_by(|a, b| a.total_cmp(b));
        let count = values.len();
        if count == 0 {
            return ColumnStats {
                count,
                min: f64::NAN,
                max: f64::NAN,
                mean: f64::NAN,
                std: f64::NAN,
                p10: f64::NAN,
                p25: f64::NAN,
                p50: f64::NAN,
                p75: f64::NAN,
                p90: f64::NAN,
            };
        }

        let mean = values.iter().sum::<f64>() / count as f64;
        let std = if count < 2 {
            f64::NAN
        } else {
            let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            var.sqrt()
        };
        ColumnStats {
            count,
            min: values[0],
            max: values[count - 1],
            mean,
            std,
            p10: percentile(&values, 0.1),
            p25: percentile(&values, 0.25),
            p50: percentile(&values, 0.5),
            p75: percentile(&values, 0.75),
            p90: percentile(&values, 0.9),
        }
    }
}

// Linear interpolation between the closest ranks. `sorted` is non-empty.
pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn check_column(op: &'static str, table: &TrajectoryTable, column: &str) -> Result<()> {
    if column != LAT && column != LON && !table.columns().iter().any(|c| c == column) {
        return Err(Error::schema(op, None, format!("no column {column}")));
    }
    Ok(())
}

fn describe(points: &[Point], column: &str) -> ColumnStats {
    ColumnStats::new(points.iter().filter_map(|pt| pt.numeric(column)).collect())
}

/// Per-trajectory statistics of a numeric column, or of `lat` or `lon`.
pub fn column_stats(
    executor: &Executor,
    table: &TrajectoryTable,
    column: &str,
) -> Result<BTreeMap<TrajectoryID, ColumnStats>> {
    let op = "column_stats";
    check_column(op, table, column)?;
    let column = column.to_string();
    executor.for_each(op, table, move |traj| Ok(describe(traj.points(), &column)))
}

/// Splits a trajectory into windows of `num_days` calendar days, counted from the date of its
/// first point. Window `i` covers days `[i * num_days, (i + 1) * num_days)`; empty windows are
/// skipped, so the numbers can have gaps.
pub fn day_windows<'a>(traj: Trajectory<'a>, num_days: u32) -> Vec<(u32, &'a [Point])> {
    let pts = traj.points();
    let first_day = match pts.first() {
        Some(pt) => pt.time.date(),
        None => return Vec::new(),
    };
    let window = |pt: &Point| ((pt.time.date() - first_day).num_days() as u32) / num_days.max(1);

    let mut result = Vec::new();
    let mut start = 0;
    for i in 1..=pts.len() {
        if i == pts.len() || window(&pts[i]) != window(&pts[start]) {
            result.push((window(&pts[start]), &pts[start..i]));
            start = i;
        }
    }
    result
}

/// Like `column_stats`, but separately for every `num_days`-day window of each trajectory.
pub fn column_stats_by_days(
    executor: &Executor,
    table: &TrajectoryTable,
    column: &str,
    num_days: u32,
) -> Result<BTreeMap<(TrajectoryID, u32), ColumnStats>> {
    let op = "column_stats_by_days";
    if num_days == 0 {
        return Err(Error::InvalidConfig {
            op,
            reason: "windows must span at least one day".to_string(),
        });
    }
    check_column(op, table, column)?;
    let column = column.to_string();
    let per_trajectory = executor.for_each(op, table, move |traj| {
        Ok(day_windows(traj, num_days)
            .into_iter()
            .map(|(window, pts)| (window, describe(pts, &column)))
            .collect::<Vec<_>>())
    })?;

    let mut result = BTreeMap::new();
    for (id, windows) in per_trajectory {
        for (window, stats) in windows {
            result.insert((id.clone(), window), stats);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::{pt, time};
    use crate::{ExecutorConfig, Value};

    #[test]
    fn describe() {
        let stats = ColumnStats::new(vec![4.0, 1.0, f64::NAN, 3.0, 2.0, 5.0]);
        assert_eq!(stats.count, 5);
        assert_eq!((stats.min, stats.max, stats.mean), (1.0, 5.0, 3.0));
        assert!((stats.std - 2.5_f64.sqrt()).abs() < 1e-12);
        assert_eq!(stats.p50, 3.0);
        assert_eq!(stats.p25, 2.0);
        assert!((stats.p10 - 1.4).abs() < 1e-12);
        assert!((stats.p90 - 4.6).abs() < 1e-12);
    }

    #[test]
    fn nothing_numeric() {
        let stats = ColumnStats::new(Vec::new());
        assert_eq!(stats.count, 0);
        assert!(stats.mean.is_nan());
        assert!(ColumnStats::new(vec![7.0]).std.is_nan());
    }

    #[test]
    fn per_trajectory() {
        let table = TrajectoryTable::new(vec![
            pt("a", time(8, 0, 0), 1.0, 0.0).with_attr("speed", Value::Text("3".to_string())),
            pt("a", time(8, 1, 0), 2.0, 0.0).with_attr("speed", Value::Text("oops".to_string())),
            pt("b", time(8, 0, 0), 3.0, 0.0).with_attr("speed", Value::Float(1.5)),
        ])
        .unwrap();
        let executor = Executor::new(ExecutorConfig::default()).unwrap();

        let speed = column_stats(&executor, &table, "speed").unwrap();
        assert_eq!(speed[&TrajectoryID::from("a")].count, 1);
        assert_eq!(speed[&TrajectoryID::from("b")].mean, 1.5);

        let lat = column_stats(&executor, &table, LAT).unwrap();
        assert_eq!(lat[&TrajectoryID::from("a")].mean, 1.5);

        let err = column_stats(&executor, &table, "altitude").unwrap_err();
        assert!(matches!(err, Error::Schema { .. }));
    }

    fn on_day(day: u32, hour: u32) -> chrono::NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2021, 5, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn windows_of_days() {
        let table = TrajectoryTable::new(vec![
            pt("a", on_day(3, 23), 1.0, 0.0),
            pt("a", on_day(4, 1), 2.0, 0.0),
            pt("a", on_day(5, 8), 3.0, 0.0),
            pt("a", on_day(9, 8), 7.0, 0.0),
            pt("b", on_day(20, 8), 5.0, 0.0),
        ])
        .unwrap();
        let a = table.select(&TrajectoryID::from("a")).unwrap();

        let daily: Vec<(u32, usize)> = day_windows(a, 1)
            .into_iter()
            .map(|(window, pts)| (window, pts.len()))
            .collect();
        assert_eq!(daily, vec![(0, 1), (1, 1), (2, 1), (6, 1)]);
        let weekly: Vec<(u32, usize)> = day_windows(a, 7)
            .into_iter()
            .map(|(window, pts)| (window, pts.len()))
            .collect();
        assert_eq!(weekly, vec![(0, 4)]);

        let executor = Executor::new(ExecutorConfig::default()).unwrap();
        let stats = column_stats_by_days(&executor, &table, LAT, 2).unwrap();
        let keys: Vec<(String, u32)> = stats.keys().map(|(id, w)| (id.0.clone(), *w)).collect();
        assert_eq!(
            keys,
            vec![
                ("a".to_string(), 0),
                ("a".to_string(), 1),
                ("a".to_string(), 3),
                ("b".to_string(), 0)
            ]
        );
        assert_eq!(stats[&(TrajectoryID::from("a"), 0)].mean, 1.5);
        assert_eq!(stats[&(TrajectoryID::from("a"), 3)].count, 1);

        let err = column_stats_by_days(&executor, &table, LAT, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
