//! Columns derived from one trajectory at a time. Every feature produces exactly one value per
//! point. Features measured from the previous point use NaN for the first point.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::Serialize;

use crate::geometry::{self, BoundingBox};
use crate::table::seconds;
use crate::{Error, Executor, Result, Trajectory, TrajectoryID, TrajectoryTable, Value};

#[derive(Clone, Debug, PartialEq)]
pub enum Feature {
    Distance,
    DistanceFromStart,
    Speed,
    Acceleration,
    Jerk,
    Bearing,
    BearingRate,
    RateOfBearingRate,
    Date,
    Time,
    DayOfWeek,
    Weekend,
    TimeOfDay,
    DistanceFromPoint { lat: f64, lon: f64 },
    WithinRange { lat: f64, lon: f64, radius: f64 },
}

impl Feature {
    pub fn kinematic() -> Vec<Feature> {
        vec![
            Feature::Distance,
            Feature::DistanceFromStart,
            Feature::Speed,
            Feature::Acceleration,
            Feature::Jerk,
            Feature::Bearing,
            Feature::BearingRate,
            Feature::RateOfBearingRate,
        ]
    }

    pub fn temporal() -> Vec<Feature> {
        vec![
            Feature::Date,
            Feature::Time,
            Feature::DayOfWeek,
            Feature::Weekend,
            Feature::TimeOfDay,
        ]
    }

    /// The name of the column this feature fills in
    pub fn column(&self) -> String {
        match self {
            Feature::Distance => "Distance_prev_to_curr".to_string(),
            Feature::DistanceFromStart => "Distance_start_to_curr".to_string(),
            Feature::Speed => "Speed_prev_to_curr".to_string(),
            Feature::Acceleration => "Acceleration_prev_to_curr".to_string(),
            Feature::Jerk => "Jerk_prev_to_curr".to_string(),
            Feature::Bearing => "Bearing_between_consecutive".to_string(),
            Feature::BearingRate => "Bearing_rate_from_prev".to_string(),
            Feature::RateOfBearingRate => "Rate_of_bearing_rate_from_prev".to_string(),
            Feature::Date => "Date".to_string(),
            Feature::Time => "Time".to_string(),
            Feature::DayOfWeek => "Day_Of_Week".to_string(),
            Feature::Weekend => "Weekend".to_string(),
            Feature::TimeOfDay => "Time_Of_Day".to_string(),
            Feature::DistanceFromPoint { lat, lon } => format!("Distance_from_({lat}, {lon})"),
            Feature::WithinRange { lat, lon, radius } => {
                format!("Within_{radius}_m_from_({lat}, {lon})")
            }
        }
    }

    pub fn compute(&self, traj: Trajectory) -> Result<Vec<Value>> {
        let floats = |xs: Vec<f64>| -> Vec<Value> { xs.into_iter().map(Value::Float).collect() };
        let per_point = |f: &dyn Fn(NaiveDateTime) -> Value| -> Vec<Value> {
            traj.points().iter().map(|pt| f(pt.time)).collect()
        };
        Ok(match self {
            Feature::Distance => floats(distances(traj)),
            Feature::DistanceFromStart => floats(distances_from_start(traj)),
            Feature::Speed => floats(speeds(traj)?),
            Feature::Acceleration => floats(accelerations(traj)?),
            Feature::Jerk => floats(jerks(traj)?),
            Feature::Bearing => floats(bearings(traj)),
            Feature::BearingRate => floats(bearing_rates(traj)?),
            Feature::RateOfBearingRate => floats(rate_of_bearing_rates(traj)?),
            Feature::Date => per_point(&|t| Value::Text(t.format("%Y-%m-%d").to_string())),
            Feature::Time => per_point(&|t| Value::Text(t.format("%H:%M:%S").to_string())),
            Feature::DayOfWeek => per_point(&|t| Value::Text(t.format("%A").to_string())),
            Feature::Weekend => per_point(&|t| {
                Value::Bool(matches!(t.weekday(), Weekday::Sat | Weekday::Sun))
            }),
            Feature::TimeOfDay => {
                per_point(&|t| Value::Text(time_of_day(t.hour()).to_string()))
            }
            Feature::DistanceFromPoint { lat, lon } => traj
                .points()
                .iter()
                .map(|pt| Value::Float(geometry::haversine(*lat, *lon, pt.lat, pt.lon)))
                .collect(),
            Feature::WithinRange { lat, lon, radius } => traj
                .points()
                .iter()
                .map(|pt| Value::Bool(geometry::haversine(*lat, *lon, pt.lat, pt.lon) <= *radius))
                .collect(),
        })
    }
}

impl FromStr for Feature {
    type Err = String;

    /// Contextual features need parameters, so they can't be named this way
    fn from_str(x: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match x {
            "distance" => Feature::Distance,
            "distance-from-start" => Feature::DistanceFromStart,
            "speed" => Feature::Speed,
            "acceleration" => Feature::Acceleration,
            "jerk" => Feature::Jerk,
            "bearing" => Feature::Bearing,
            "bearing-rate" => Feature::BearingRate,
            "rate-of-bearing-rate" => Feature::RateOfBearingRate,
            "date" => Feature::Date,
            "time" => Feature::Time,
            "day-of-week" => Feature::DayOfWeek,
            "weekend" => Feature::Weekend,
            "time-of-day" => Feature::TimeOfDay,
            _ => return Err(format!("unknown feature {x}")),
        })
    }
}

pub fn time_of_day(hour: u32) -> &'static str {
    match hour {
        0..=4 => "Late Night",
        5..=8 => "Early Morning",
        9..=12 => "Morning",
        13..=16 => "Noon",
        17..=20 => "Evening",
        _ => "Night",
    }
}

pub fn distances(traj: Trajectory) -> Vec<f64> {
    let pts = traj.points();
    let mut result = Vec::with_capacity(pts.len());
    for i in 0..pts.len() {
        if i == 0 {
            result.push(f64::NAN);
        } else {
            result.push(geometry::distance(&pts[i - 1], &pts[i]));
        }
    }
    result
}

/// Cumulative distance along the path, starting at 0
pub fn distances_from_start(traj: Trajectory) -> Vec<f64> {
    let mut total = 0.0;
    distances(traj)
        .into_iter()
        .map(|d| {
            if !d.is_nan() {
                total += d;
            }
            total
        })
        .collect()
}

/// (x[i] - x[i - 1]) / dt. NaN inputs propagate.
fn rate_of_change(op: &'static str, traj: Trajectory, xs: &[f64]) -> Result<Vec<f64>> {
    let mut result = Vec::with_capacity(xs.len());
    for i in 0..xs.len() {
        if i == 0 {
            result.push(f64::NAN);
        } else {
            result.push((xs[i] - xs[i - 1]) / traj.time_delta(op, i)?);
        }
    }
    Ok(result)
}

/// Meters per second
pub fn speeds(traj: Trajectory) -> Result<Vec<f64>> {
    let op = "speed";
    let dists = distances(traj);
    let mut result = Vec::with_capacity(dists.len());
    for (i, dist) in dists.into_iter().enumerate() {
        if i == 0 {
            result.push(f64::NAN);
        } else {
            result.push(dist / traj.time_delta(op, i)?);
        }
    }
    Ok(result)
}

pub fn accelerations(traj: Trajectory) -> Result<Vec<f64>> {
    rate_of_change("acceleration", traj, &speeds(traj)?)
}

pub fn jerks(traj: Trajectory) -> Result<Vec<f64>> {
    rate_of_change("jerk", traj, &accelerations(traj)?)
}

/// Degrees in [0, 360) from the previous point
pub fn bearings(traj: Trajectory) -> Vec<f64> {
    let pts = traj.points();
    let mut result = Vec::with_capacity(pts.len());
    for i in 0..pts.len() {
        if i == 0 {
            result.push(f64::NAN);
        } else {
            result.push(geometry::bearing(
                pts[i - 1].lat,
                pts[i - 1].lon,
                pts[i].lat,
                pts[i].lon,
            ));
        }
    }
    result
}

/// Degrees per second. A turn is the smallest signed angle between bearings, so going from 350
/// to 10 degrees is +20, not -340.
pub fn bearing_rates(traj: Trajectory) -> Result<Vec<f64>> {
    let op = "bearing_rate";
    let bearings = bearings(traj);
    let mut result = Vec::with_capacity(bearings.len());
    for i in 0..bearings.len() {
        if i == 0 {
            result.push(f64::NAN);
        } else {
            let turn = (bearings[i] - bearings[i - 1] + 180.0).rem_euclid(360.0) - 180.0;
            result.push(turn / traj.time_delta(op, i)?);
        }
    }
    Ok(result)
}

pub fn rate_of_bearing_rates(traj: Trajectory) -> Result<Vec<f64>> {
    rate_of_change("rate_of_bearing_rate", traj, &bearing_rates(traj)?)
}

/// Describes one trajectory as a whole.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub duration_seconds: f64,
    /// (lat, lon)
    pub start: (f64, f64),
    pub end: (f64, f64),
    pub bbox: BoundingBox,
    /// Meters along the path
    pub total_distance: f64,
    pub num_points: usize,
}

impl Summary {
    pub fn new(traj: Trajectory) -> Result<Summary> {
        let pts = traj.points();
        let (first, last, bbox) = match (pts.first(), pts.last(), BoundingBox::covering(pts)) {
            (Some(first), Some(last), Some(bbox)) => (first, last, bbox),
            _ => {
                return Err(Error::InsufficientData {
                    op: "summarize",
                    traj_id: traj.id().clone(),
                    needed: 1,
                    found: 0,
                })
            }
        };
        Ok(Summary {
            start_time: first.time,
            end_time: last.time,
            duration_seconds: seconds(traj.duration()),
            start: (first.lat, first.lon),
            end: (last.lat, last.lon),
            bbox,
            total_distance: distances_from_start(traj).last().cloned().unwrap_or(0.0),
            num_points: pts.len(),
        })
    }
}

pub fn summarize(
    executor: &Executor,
    table: &TrajectoryTable,
) -> Result<BTreeMap<TrajectoryID, Summary>> {
    executor.for_each("summarize", table, Summary::new)
}

impl TrajectoryTable {
    /// Computes one feature sequentially, in place
    pub fn add_feature(&mut self, feature: &Feature) -> Result<()> {
        self.add_column(&feature.column(), |traj| feature.compute(traj))
    }

    /// Computes several features at once, one trajectory per worker. New columns appear in the
    /// order requested. Existing columns with the same name are replaced.
    pub fn with_features(&self, executor: &Executor, features: &[Feature]) -> Result<Self> {
        let mut order = self.columns().to_vec();
        for feature in features {
            let name = feature.column();
            if !order.contains(&name) {
                order.push(name);
            }
        }

        let features = features.to_vec();
        let mut result = executor.map("with_features", self, move |mut partition| {
            let mut columns = Vec::new();
            {
                let traj = partition.trajectory()?;
                for feature in &features {
                    columns.push((feature.column(), feature.compute(traj)?));
                }
            }
            for (name, values) in columns {
                for (pt, value) in partition.rows_mut().iter_mut().zip(values) {
                    pt.attrs.insert(name.clone(), value);
                }
            }
            Ok(partition)
        })?;
        result.set_column_order("with_features", order)?;
        Ok(result)
    }
}
