use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const TRAJ_ID: &str = "traj_id";
pub const DATETIME: &str = "DateTime";
pub const LAT: &str = "lat";
pub const LON: &str = "lon";
/// Marks points inserted by interpolation
pub const SYNTHETIC: &str = "synthetic";

pub const MANDATORY_COLUMNS: [&str; 4] = [TRAJ_ID, DATETIME, LAT, LON];

pub fn is_reserved(column: &str) -> bool {
    MANDATORY_COLUMNS.contains(&column) || column == SYNTHETIC
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrajectoryID(pub String);

impl TrajectoryID {
    /// The ID of the idx'th piece this trajectory is split into
    pub fn segment(&self, idx: usize) -> TrajectoryID {
        TrajectoryID(format!("{}_{}", self.0, idx))
    }
}

impl fmt::Display for TrajectoryID {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TrajectoryID {
    fn from(x: &str) -> Self {
        Self(x.to_string())
    }
}

impl From<String> for TrajectoryID {
    fn from(x: String) -> Self {
        Self(x)
    }
}

/// One cell of a non-mandatory column.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Float(f64),
    Text(String),
    Bool(bool),
    Missing,
}

static MISSING: Value = Value::Missing;

impl Value {
    /// Text cells from CSV input are parsed on demand
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Text(x) => x.trim().parse().ok(),
            Value::Bool(_) | Value::Missing => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(x) => Some(*x),
            Value::Text(x) => parse_bool(x),
            Value::Float(_) | Value::Missing => None,
        }
    }

    pub fn to_field(&self) -> String {
        match self {
            Value::Float(x) => x.to_string(),
            Value::Text(x) => x.clone(),
            Value::Bool(x) => x.to_string(),
            Value::Missing => String::new(),
        }
    }
}

pub(crate) fn parse_bool(x: &str) -> Option<bool> {
    match x.trim() {
        "true" | "True" | "TRUE" | "1" => Some(true),
        "false" | "False" | "FALSE" | "0" | "" => Some(false),
        _ => None,
    }
}

/// One observed (or interpolated) position.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    pub traj_id: TrajectoryID,
    pub time: NaiveDateTime,
    pub lat: f64,
    pub lon: f64,
    pub synthetic: bool,
    pub attrs: BTreeMap<String, Value>,
}

impl Point {
    pub fn new(traj_id: TrajectoryID, time: NaiveDateTime, lat: f64, lon: f64) -> Self {
        Self {
            traj_id,
            time,
            lat,
            lon,
            synthetic: false,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: Value) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    /// Missing if the point doesn't have this attribute
    pub fn attr(&self, name: &str) -> &Value {
        self.attrs.get(name).unwrap_or(&MISSING)
    }

    /// Any column as a number, including the coordinates. NaN counts as absent.
    pub fn numeric(&self, column: &str) -> Option<f64> {
        let x = match column {
            LAT => Some(self.lat),
            LON => Some(self.lon),
            _ => self.attr(column).as_f64(),
        }?;
        if x.is_nan() {
            None
        } else {
            Some(x)
        }
    }
}

pub(crate) fn check_coordinates(lat: f64, lon: f64) -> std::result::Result<(), String> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(format!("latitude {lat} outside [-90, 90]"));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(format!("longitude {lon} outside [-180, 180]"));
    }
    Ok(())
}

pub(crate) fn seconds(delta: Duration) -> f64 {
    match delta.num_nanoseconds() {
        Some(ns) => ns as f64 / 1e9,
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

/// An ordered view of the points of one trajectory. Timestamps are strictly increasing.
#[derive(Clone, Copy, Debug)]
pub struct Trajectory<'a> {
    id: &'a TrajectoryID,
    points: &'a [Point],
}

impl<'a> Trajectory<'a> {
    pub fn new(id: &'a TrajectoryID, points: &'a [Point]) -> Result<Self> {
        for pt in points {
            if &pt.traj_id != id {
                return Err(Error::integrity(
                    "Trajectory::new",
                    id,
                    format!("contains a point from {}", pt.traj_id),
                ));
            }
        }
        for pair in points.windows(2) {
            if pair[0].time >= pair[1].time {
                return Err(Error::integrity(
                    "Trajectory::new",
                    id,
                    format!("out-of-order: {} then {}", pair[0].time, pair[1].time),
                ));
            }
        }
        Ok(Self { id, points })
    }

    // Callers guarantee the invariants
    pub(crate) fn unchecked(id: &'a TrajectoryID, points: &'a [Point]) -> Self {
        Self { id, points }
    }

    pub fn id(&self) -> &'a TrajectoryID {
        self.id
    }

    pub fn points(&self) -> &'a [Point] {
        self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn start_time(&self) -> Option<NaiveDateTime> {
        self.points.first().map(|pt| pt.time)
    }

    pub fn end_time(&self) -> Option<NaiveDateTime> {
        self.points.last().map(|pt| pt.time)
    }

    pub fn duration(&self) -> Duration {
        match (self.start_time(), self.end_time()) {
            (Some(t1), Some(t2)) => t2 - t1,
            _ => Duration::zero(),
        }
    }

    /// Seconds from point i-1 to point i. Fails rather than returning zero.
    pub(crate) fn time_delta(&self, op: &'static str, i: usize) -> Result<f64> {
        let dt = seconds(self.points[i].time - self.points[i - 1].time);
        if dt <= 0.0 {
            return Err(Error::Division {
                op,
                traj_id: self.id.clone(),
                time: self.points[i].time,
            });
        }
        Ok(dt)
    }
}

/// The rows of one trajectory, owned by a single call of a partition function. The output
/// of that function may use different trajectory IDs; merging regroups rows by ID.
#[derive(Clone, Debug, PartialEq)]
pub struct Partition {
    key: TrajectoryID,
    rows: Vec<Point>,
}

impl Partition {
    pub fn new(key: TrajectoryID, rows: Vec<Point>) -> Self {
        Self { key, rows }
    }

    pub fn key(&self) -> &TrajectoryID {
        &self.key
    }

    pub fn rows(&self) -> &[Point] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut Vec<Point> {
        &mut self.rows
    }

    pub fn into_rows(self) -> Vec<Point> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Validates, since the rows may have been modified
    pub fn trajectory(&self) -> Result<Trajectory<'_>> {
        Trajectory::new(&self.key, &self.rows)
    }
}

/// A set of trajectories, logically keyed by (trajectory ID, timestamp).
#[derive(Clone, Debug, PartialEq)]
pub struct TrajectoryTable {
    // Each list is sorted by time, with no duplicates
    trajectories: BTreeMap<TrajectoryID, Vec<Point>>,
    // Names of the non-mandatory columns, in output order
    columns: Vec<String>,
}

impl TrajectoryTable {
    pub fn empty() -> Self {
        Self {
            trajectories: BTreeMap::new(),
            columns: Vec::new(),
        }
    }

    pub fn new(rows: Vec<Point>) -> Result<Self> {
        let op = "TrajectoryTable::new";
        let mut columns = Vec::new();
        let mut seen_columns = BTreeSet::new();
        let mut trajectories: BTreeMap<TrajectoryID, Vec<Point>> = BTreeMap::new();
        for pt in rows {
            check_coordinates(pt.lat, pt.lon)
                .map_err(|reason| Error::schema(op, Some(&pt.traj_id), reason))?;
            for name in pt.attrs.keys() {
                if seen_columns.insert(name.clone()) {
                    columns.push(name.clone());
                }
            }
            trajectories
                .entry(pt.traj_id.clone())
                .or_insert_with(Vec::new)
                .push(pt);
        }

        for (id, pts) in &mut trajectories {
            pts.sort_by_key(|pt| pt.time);
            for pair in pts.windows(2) {
                if pair[0].time == pair[1].time {
                    return Err(Error::schema(
                        op,
                        Some(id),
                        format!("duplicate key ({id}, {})", pair[0].time),
                    ));
                }
            }
        }

        let table = Self {
            trajectories,
            columns,
        };
        table.check_columns(op)?;
        Ok(table)
    }

    /// Regroups the output of partition functions. Partitions are visited in the given order,
    /// which callers keep stable.
    pub(crate) fn merge(
        op: &'static str,
        partitions: Vec<Partition>,
        base_columns: &[String],
    ) -> Result<Self> {
        let mut producer: BTreeMap<TrajectoryID, TrajectoryID> = BTreeMap::new();
        let mut trajectories: BTreeMap<TrajectoryID, Vec<Point>> = BTreeMap::new();
        let mut new_columns = BTreeSet::new();
        for partition in partitions {
            let key = partition.key;
            for pt in partition.rows {
                match producer.get(&pt.traj_id) {
                    Some(other) if other != &key => {
                        return Err(Error::integrity(
                            op,
                            &pt.traj_id,
                            format!("rows produced by both {other} and {key}"),
                        ));
                    }
                    Some(_) => {}
                    None => {
                        producer.insert(pt.traj_id.clone(), key.clone());
                    }
                }
                for name in pt.attrs.keys() {
                    if !base_columns.contains(name) {
                        new_columns.insert(name.clone());
                    }
                }
                trajectories
                    .entry(pt.traj_id.clone())
                    .or_insert_with(Vec::new)
                    .push(pt);
            }
        }

        for (id, pts) in &mut trajectories {
            pts.sort_by_key(|pt| pt.time);
            for pair in pts.windows(2) {
                if pair[0].time == pair[1].time {
                    return Err(Error::integrity(
                        op,
                        id,
                        format!("duplicate key at {}", pair[0].time),
                    ));
                }
            }
            for pt in pts.iter() {
                check_coordinates(pt.lat, pt.lon)
                    .map_err(|reason| Error::integrity(op, id, reason))?;
            }
        }

        let mut columns = base_columns.to_vec();
        columns.extend(new_columns);
        let table = Self {
            trajectories,
            columns,
        };
        table.check_columns(op)?;
        Ok(table)
    }

    // Columns not mentioned keep their relative order, after the given ones
    pub(crate) fn set_column_order(&mut self, op: &'static str, order: Vec<String>) -> Result<()> {
        let mut columns = order;
        for name in &self.columns {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
        let previous = std::mem::replace(&mut self.columns, columns);
        if let Err(err) = self.check_columns(op) {
            self.columns = previous;
            return Err(err);
        }
        Ok(())
    }

    fn check_columns(&self, op: &'static str) -> Result<()> {
        let mut seen = BTreeSet::new();
        for name in &self.columns {
            if is_reserved(name) {
                return Err(Error::Conflict {
                    op,
                    column: name.clone(),
                });
            }
            if !seen.insert(name) {
                return Err(Error::schema(op, None, format!("column {name} appears twice")));
            }
        }
        Ok(())
    }

    /// Verifies the composite key and coordinate invariants over the whole table.
    pub fn check_invariants(&self, op: &'static str) -> Result<()> {
        self.check_columns(op)?;
        for (id, pts) in &self.trajectories {
            if pts.is_empty() {
                return Err(Error::integrity(op, id, "no points"));
            }
            Trajectory::new(id, pts).map_err(|err| match err {
                Error::Integrity { reason, .. } => Error::integrity(op, id, reason),
                err => err,
            })?;
            for pt in pts {
                check_coordinates(pt.lat, pt.lon)
                    .map_err(|reason| Error::integrity(op, id, reason))?;
            }
        }
        Ok(())
    }

    pub fn select(&self, id: &TrajectoryID) -> Result<Trajectory<'_>> {
        match self.trajectories.get_key_value(id) {
            Some((id, pts)) => Ok(Trajectory::unchecked(id, pts)),
            None => Err(Error::NotFound {
                op: "select",
                traj_id: id.clone(),
            }),
        }
    }

    pub fn contains(&self, id: &TrajectoryID) -> bool {
        self.trajectories.contains_key(id)
    }

    /// Sorted
    pub fn ids(&self) -> impl Iterator<Item = &TrajectoryID> {
        self.trajectories.keys()
    }

    pub fn trajectories(&self) -> impl Iterator<Item = Trajectory<'_>> {
        self.trajectories
            .iter()
            .map(|(id, pts)| Trajectory::unchecked(id, pts))
    }

    /// Owned copies of every trajectory, in ID order
    pub fn partitions(&self) -> Vec<Partition> {
        self.trajectories
            .iter()
            .map(|(id, pts)| Partition::new(id.clone(), pts.clone()))
            .collect()
    }

    /// Extra columns, excluding the mandatory ones
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_synthetic(&self) -> bool {
        self.trajectories
            .values()
            .any(|pts| pts.iter().any(|pt| pt.synthetic))
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.trajectories.values().map(|pts| pts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn num_trajectories(&self) -> usize {
        self.trajectories.len()
    }

    /// Computes one column per trajectory. The producer must return exactly one value per point.
    pub fn add_column<F>(&mut self, name: &str, producer: F) -> Result<()>
    where
        F: Fn(Trajectory) -> Result<Vec<Value>>,
    {
        let op = "add_column";
        if is_reserved(name) {
            return Err(Error::Conflict {
                op,
                column: name.to_string(),
            });
        }
        let mut computed = Vec::new();
        for (id, pts) in &self.trajectories {
            let values = producer(Trajectory::unchecked(id, pts))?;
            if values.len() != pts.len() {
                return Err(Error::integrity(
                    op,
                    id,
                    format!(
                        "column {name} has {} values for {} points",
                        values.len(),
                        pts.len()
                    ),
                ));
            }
            computed.push(values);
        }
        // Only mutate once every trajectory succeeded
        for (pts, values) in self.trajectories.values_mut().zip(computed) {
            for (pt, value) in pts.iter_mut().zip(values) {
                pt.attrs.insert(name.to_string(), value);
            }
        }
        if !self.columns.iter().any(|c| c == name) {
            self.columns.push(name.to_string());
        }
        self.check_invariants(op)
    }

    /// Computes one column, one row at a time
    pub fn add_row_column<F>(&mut self, name: &str, producer: F) -> Result<()>
    where
        F: Fn(&Point) -> Value,
    {
        self.add_column(name, |traj| Ok(traj.points().iter().map(&producer).collect()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::NaiveDate;

    use super::*;

    pub fn time(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 5, 26)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    pub fn pt(id: &str, t: NaiveDateTime, lat: f64, lon: f64) -> Point {
        Point::new(TrajectoryID::from(id), t, lat, lon)
    }

    #[test]
    fn rows_are_grouped_and_sorted() {
        let table = TrajectoryTable::new(vec![
            pt("b", time(8, 0, 0), 1.0, 1.0),
            pt("a", time(8, 5, 0), 0.0, 0.1),
            pt("a", time(8, 0, 0), 0.0, 0.0),
        ])
        .unwrap();
        assert_eq!(table.num_trajectories(), 2);
        assert_eq!(table.len(), 3);
        let a = table.select(&TrajectoryID::from("a")).unwrap();
        let times: Vec<_> = a.points().iter().map(|pt| pt.time).collect();
        assert_eq!(times, vec![time(8, 0, 0), time(8, 5, 0)]);
        assert_eq!(a.duration(), Duration::minutes(5));
    }

    #[test]
    fn duplicate_key_is_a_schema_error() {
        let err = TrajectoryTable::new(vec![
            pt("a", time(8, 0, 0), 0.0, 0.0),
            pt("a", time(8, 0, 0), 0.0, 1.0),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Schema { .. }), "{err}");
        assert_eq!(err.traj_id(), Some(&TrajectoryID::from("a")));
    }

    #[test]
    fn bad_coordinates_are_rejected() {
        for (lat, lon) in [(91.0, 0.0), (0.0, -180.5), (f64::NAN, 0.0)] {
            let err = TrajectoryTable::new(vec![pt("a", time(8, 0, 0), lat, lon)]).unwrap_err();
            assert!(matches!(err, Error::Schema { .. }), "{err}");
        }
    }

    #[test]
    fn unknown_id() {
        let table = TrajectoryTable::new(vec![pt("a", time(8, 0, 0), 0.0, 0.0)]).unwrap();
        let err = table.select(&TrajectoryID::from("zzz")).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn add_column_rules() {
        let mut table = TrajectoryTable::new(vec![
            pt("a", time(8, 0, 0), 0.0, 0.0),
            pt("a", time(8, 1, 0), 0.0, 0.0),
        ])
        .unwrap();

        let err = table
            .add_row_column(LAT, |_| Value::Float(1.0))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let err = table
            .add_column("short", |_| Ok(vec![Value::Missing]))
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        // A failed add leaves the table alone
        assert!(table.columns().is_empty());

        table
            .add_row_column("hour", |pt| Value::Text(pt.time.format("%H").to_string()))
            .unwrap();
        assert_eq!(table.columns(), &["hour".to_string()]);
        let a = table.select(&TrajectoryID::from("a")).unwrap();
        assert_eq!(a.points()[1].attr("hour"), &Value::Text("08".to_string()));
        assert_eq!(a.points()[1].attr("nope"), &Value::Missing);
    }

    #[test]
    fn merge_detects_collisions() {
        let base = Vec::new();
        let err = TrajectoryTable::merge(
            "test",
            vec![
                Partition::new("a".into(), vec![pt("x", time(8, 0, 0), 0.0, 0.0)]),
                Partition::new("b".into(), vec![pt("x", time(9, 0, 0), 0.0, 0.0)]),
            ],
            &base,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }), "{err}");

        let err = TrajectoryTable::merge(
            "test",
            vec![Partition::new(
                "a".into(),
                vec![
                    pt("a", time(8, 0, 0), 0.0, 0.0),
                    pt("a", time(8, 0, 0), 1.0, 0.0),
                ],
            )],
            &base,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }), "{err}");
    }

    #[test]
    fn column_order_stays_unique() {
        let mut table = TrajectoryTable::new(vec![pt("a", time(8, 0, 0), 0.0, 0.0)
            .with_attr("mode", Value::Text("walk".to_string()))])
        .unwrap();
        let err = table
            .set_column_order("test", vec!["mode".to_string(), "mode".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::Schema { .. }), "{err}");
        assert_eq!(table.columns(), &["mode".to_string()]);
        table.check_invariants("test").unwrap();
    }

    #[test]
    fn trajectory_view_validates() {
        let id = TrajectoryID::from("a");
        let pts = vec![
            pt("a", time(8, 1, 0), 0.0, 0.0),
            pt("a", time(8, 0, 0), 0.0, 0.0),
        ];
        assert!(Trajectory::new(&id, &pts).is_err());
        let pts = vec![pt("b", time(8, 1, 0), 0.0, 0.0)];
        assert!(Trajectory::new(&id, &pts).is_err());
    }
}
