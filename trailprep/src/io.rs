use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime};
use geojson::{Feature, FeatureCollection, GeoJson, Geometry};
use serde::{Deserialize, Serialize};

use crate::table::{parse_bool, DATETIME, LAT, LON, SYNTHETIC, TRAJ_ID};
use crate::{Error, Point, Result, TrajectoryID, TrajectoryTable, Value};

/// Used for output, and the first format tried on input
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

const INPUT_TIME_FORMATS: [&str; 4] = [
    TIME_FORMAT,
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
];

pub fn parse_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    for format in INPUT_TIME_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(t);
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.naive_utc())
}

/// Which input columns hold the mandatory fields. They're renamed to the library's names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub traj_id: String,
    pub datetime: String,
    pub lat: String,
    pub lon: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            traj_id: TRAJ_ID.to_string(),
            datetime: DATETIME.to_string(),
            lat: LAT.to_string(),
            lon: LON.to_string(),
        }
    }
}

/// Rectangular, untyped input
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn read_csv<R: std::io::Read>(reader: R) -> Result<Self> {
        let op = "read_csv";
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader
            .headers()
            .map_err(|err| Error::schema(op, None, err.to_string()))?
            .iter()
            .map(|x| x.to_string())
            .collect();
        let mut rows = Vec::new();
        for rec in reader.records() {
            let rec = rec.map_err(|err| Error::schema(op, None, err.to_string()))?;
            rows.push(rec.iter().map(|x| x.to_string()).collect());
        }
        Ok(Self { headers, rows })
    }
}

impl TrajectoryTable {
    /// Validates everything up-front. A missing mandatory column is an error here, never later.
    pub fn from_raw(raw: RawTable, mapping: &ColumnMapping) -> Result<Self> {
        Self::build_from_raw(raw, mapping, false)
    }

    /// Like `from_raw`, but rows exactly repeating an earlier row are dropped first
    pub fn from_raw_deduplicated(raw: RawTable, mapping: &ColumnMapping) -> Result<Self> {
        Self::build_from_raw(raw, mapping, true)
    }

    fn build_from_raw(raw: RawTable, mapping: &ColumnMapping, dedupe: bool) -> Result<Self> {
        let op = "from_raw";
        let find = |name: &str| {
            raw.headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| Error::schema(op, None, format!("missing mandatory column {name}")))
        };
        let id_idx = find(&mapping.traj_id)?;
        let time_idx = find(&mapping.datetime)?;
        let lat_idx = find(&mapping.lat)?;
        let lon_idx = find(&mapping.lon)?;
        let mandatory = [id_idx, time_idx, lat_idx, lon_idx];
        let synthetic_idx = raw.headers.iter().position(|h| h == SYNTHETIC);

        // Everything else is an extra column, kept verbatim
        let mut extra = Vec::new();
        for (idx, name) in raw.headers.iter().enumerate() {
            if mandatory.contains(&idx) || Some(idx) == synthetic_idx {
                continue;
            }
            if crate::table::is_reserved(name) {
                return Err(Error::Conflict {
                    op,
                    column: name.clone(),
                });
            }
            if extra.iter().any(|(_, other)| other == name) {
                return Err(Error::schema(op, None, format!("column {name} appears twice")));
            }
            extra.push((idx, name.clone()));
        }

        let mut points = Vec::new();
        for (row_num, row) in raw.rows.into_iter().enumerate() {
            if row.len() != raw.headers.len() {
                return Err(Error::schema(
                    op,
                    None,
                    format!(
                        "row {row_num} has {} fields, but there are {} columns",
                        row.len(),
                        raw.headers.len()
                    ),
                ));
            }
            let traj_id = TrajectoryID(row[id_idx].trim().to_string());
            if traj_id.0.is_empty() {
                return Err(Error::schema(op, None, format!("row {row_num} has no {TRAJ_ID}")));
            }
            let time = parse_time(&row[time_idx]).ok_or_else(|| {
                Error::schema(
                    op,
                    Some(&traj_id),
                    format!("row {row_num}: can't parse time {:?}", row[time_idx]),
                )
            })?;
            let lat = parse_coordinate(&row[lat_idx]).ok_or_else(|| {
                Error::schema(
                    op,
                    Some(&traj_id),
                    format!("row {row_num}: can't parse latitude {:?}", row[lat_idx]),
                )
            })?;
            let lon = parse_coordinate(&row[lon_idx]).ok_or_else(|| {
                Error::schema(
                    op,
                    Some(&traj_id),
                    format!("row {row_num}: can't parse longitude {:?}", row[lon_idx]),
                )
            })?;

            let mut pt = Point::new(traj_id, time, lat, lon);
            if let Some(idx) = synthetic_idx {
                pt.synthetic = parse_bool(&row[idx]).ok_or_else(|| {
                    Error::schema(
                        op,
                        Some(&pt.traj_id),
                        format!("row {row_num}: can't parse {SYNTHETIC} {:?}", row[idx]),
                    )
                })?;
            }
            for (idx, name) in &extra {
                let value = if row[*idx].is_empty() {
                    Value::Missing
                } else {
                    Value::Text(row[*idx].clone())
                };
                pt.attrs.insert(name.clone(), value);
            }
            points.push(pt);
        }
        if dedupe {
            points = remove_duplicate_rows(points);
        }

        let mut table = Self::new(points).map_err(|err| match err {
            Error::Schema {
                traj_id, reason, ..
            } => Error::Schema {
                op,
                traj_id,
                reason,
            },
            err => err,
        })?;
        // Keep the input's column order, even for columns that are entirely empty
        table.set_column_order(op, extra.into_iter().map(|(_, name)| name).collect())?;
        Ok(table)
    }

    pub fn load_csv<R: std::io::Read>(reader: R, mapping: &ColumnMapping) -> Result<Self> {
        let table = Self::from_raw(RawTable::read_csv(reader)?, mapping)?;
        info!(
            "Loaded {} rows in {} trajectories",
            table.len(),
            table.num_trajectories()
        );
        Ok(table)
    }

    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<()> {
        let op = "write_csv";
        let io_err = |err: csv::Error| Error::Io {
            op,
            reason: err.to_string(),
        };

        let synthetic = self.has_synthetic();
        let mut writer = csv::Writer::from_writer(writer);
        let mut header: Vec<&str> = vec![TRAJ_ID, DATETIME, LAT, LON];
        header.extend(self.columns().iter().map(|x| x.as_str()));
        if synthetic {
            header.push(SYNTHETIC);
        }
        writer.write_record(&header).map_err(io_err)?;

        for traj in self.trajectories() {
            for pt in traj.points() {
                let mut record = vec![
                    pt.traj_id.0.clone(),
                    pt.time.format(TIME_FORMAT).to_string(),
                    pt.lat.to_string(),
                    pt.lon.to_string(),
                ];
                for name in self.columns() {
                    record.push(pt.attr(name).to_field());
                }
                if synthetic {
                    record.push(pt.synthetic.to_string());
                }
                writer.write_record(&record).map_err(io_err)?;
            }
        }
        writer.flush().map_err(|err| Error::Io {
            op,
            reason: err.to_string(),
        })?;
        Ok(())
    }

    pub fn to_csv_string(&self) -> Result<String> {
        let mut out = Vec::new();
        self.write_csv(&mut out)?;
        String::from_utf8(out).map_err(|err| Error::Io {
            op: "to_csv_string",
            reason: err.to_string(),
        })
    }

    /// One LineString per trajectory
    pub fn to_geojson(&self) -> Result<String> {
        let mut features = Vec::new();
        for traj in self.trajectories() {
            let coords: Vec<Vec<f64>> = traj
                .points()
                .iter()
                .map(|pt| vec![pt.lon, pt.lat])
                .collect();
            // A single point can't be a LineString
            let geometry = if coords.len() == 1 {
                geojson::Value::Point(coords[0].clone())
            } else {
                geojson::Value::LineString(coords)
            };

            let mut properties = serde_json::Map::new();
            properties.insert(TRAJ_ID.to_string(), traj.id().0.clone().into());
            properties.insert("points".to_string(), traj.len().into());
            if let (Some(start), Some(end)) = (traj.start_time(), traj.end_time()) {
                properties.insert(
                    "start".to_string(),
                    start.format(TIME_FORMAT).to_string().into(),
                );
                properties.insert(
                    "end".to_string(),
                    end.format(TIME_FORMAT).to_string().into(),
                );
            }

            features.push(Feature {
                bbox: None,
                geometry: Some(Geometry::new(geometry)),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            });
        }
        let gj = GeoJson::FeatureCollection(FeatureCollection {
            features,
            bbox: None,
            foreign_members: None,
        });
        serde_json::to_string(&gj).map_err(|err| Error::Io {
            op: "to_geojson",
            reason: err.to_string(),
        })
    }
}

fn parse_coordinate(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok()
}

/// Drops rows that repeat all four mandatory fields of an earlier row, keeping the first.
/// Rows that only share the composite key still fail table construction.
pub fn remove_duplicate_rows(rows: Vec<Point>) -> Vec<Point> {
    let mut seen: BTreeMap<(TrajectoryID, NaiveDateTime), Vec<(f64, f64)>> = BTreeMap::new();
    let before = rows.len();
    let mut result = Vec::new();
    for pt in rows {
        let positions = seen
            .entry((pt.traj_id.clone(), pt.time))
            .or_insert_with(Vec::new);
        if positions.contains(&(pt.lat, pt.lon)) {
            continue;
        }
        positions.push((pt.lat, pt.lon));
        result.push(pt);
    }
    if result.len() != before {
        warn!("Removed {} duplicate rows", before - result.len());
    }
    result
}
