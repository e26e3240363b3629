#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

use std::io::Write;

use anyhow::Result;
use structopt::StructOpt;

use trailprep::filters::Filter;
use trailprep::{
    BoundingBox, ColumnMapping, Config, Executor, Feature, RawTable, Scheme, TrajectoryTable,
};

#[derive(StructOpt)]
#[structopt(about = "Preprocess trajectories stored in CSV files")]
struct Args {
    /// The path to a JSON config file. Flags override its settings.
    #[structopt(long)]
    config: Option<String>,
    /// How many trajectories to process at once
    #[structopt(long)]
    workers: Option<usize>,
    /// Give up if any one trajectory takes longer than this
    #[structopt(long)]
    timeout_seconds: Option<f64>,
    /// The input CSV file
    #[structopt(long)]
    input: String,
    /// Where to write the result. Defaults to stdout.
    #[structopt(long)]
    output: Option<String>,
    /// The input column with trajectory IDs
    #[structopt(long, default_value = "traj_id")]
    traj_id: String,
    /// The input column with timestamps
    #[structopt(long, default_value = "DateTime")]
    datetime: String,
    /// The input column with latitude
    #[structopt(long, default_value = "lat")]
    lat: String,
    /// The input column with longitude
    #[structopt(long, default_value = "lon")]
    lon: String,
    /// Drop rows exactly repeating an earlier row, instead of failing
    #[structopt(long)]
    dedupe: bool,
    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Add feature columns
    Features {
        /// A feature to compute, like speed or time-of-day. Repeat for more. Defaults to every
        /// kinematic and temporal feature.
        #[structopt(long)]
        feature: Vec<Feature>,
        /// Add the distance from a point, given as lat,lon
        #[structopt(long)]
        from_point: Option<String>,
        /// With --from-point, also add whether each point is within this many meters
        #[structopt(long)]
        within: Option<f64>,
    },
    /// Fill time gaps with synthetic points
    Interpolate {
        /// linear, cubic, random-walk, or kinematic
        #[structopt(long)]
        scheme: Option<Scheme>,
    },
    /// Split trajectories after every stop
    Segment,
    /// Drop points or whole trajectories. Filters given together are applied in order.
    Filter {
        /// Keep points inside min_lat,min_lon,max_lat,max_lon
        #[structopt(long)]
        bbox: Option<String>,
        /// With --bbox, keep points outside of it instead
        #[structopt(long)]
        outside: bool,
        /// Drop points before this time
        #[structopt(long)]
        start: Option<String>,
        /// Drop points after this time
        #[structopt(long)]
        end: Option<String>,
        /// Drop points reached faster than this, in meters per second
        #[structopt(long)]
        max_speed: Option<f64>,
        /// Drop points reached slower than this, in meters per second
        #[structopt(long)]
        min_speed: Option<f64>,
        /// Drop points closer than this many meters to the previous one
        #[structopt(long)]
        min_distance: Option<f64>,
        /// Drop points further than this many meters from the previous one
        #[structopt(long)]
        max_distance: Option<f64>,
        /// Drop points whose distance from the previous one is an outlier
        #[structopt(long)]
        distance_outliers: bool,
        /// Drop points whose speed from the previous one is an outlier
        #[structopt(long)]
        speed_outliers: bool,
        /// Drop trajectories with fewer points
        #[structopt(long)]
        min_points: Option<usize>,
        /// Drop outliers in this numeric column
        #[structopt(long)]
        hampel: Option<String>,
        #[structopt(long, default_value = "3")]
        half_window: usize,
        #[structopt(long, default_value = "3.0")]
        n_sigmas: f64,
    },
    /// Describe a numeric column of every trajectory, as JSON
    Stats {
        #[structopt(long)]
        column: String,
        /// Describe every window of this many days separately
        #[structopt(long)]
        by_days: Option<u32>,
    },
    /// Describe every trajectory, as JSON
    Summarize,
    /// Export one line per trajectory as GeoJSON
    Geojson,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::from_args();
    args.run()
}

impl Args {
    fn config(&self) -> Result<Config> {
        let mut config = match self.config {
            Some(ref path) => Config::load(fs_err::File::open(path)?)?,
            None => Config::default(),
        };
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.timeout_seconds.is_some() {
            config.timeout_seconds = self.timeout_seconds;
        }
        Ok(config)
    }

    fn load(&self) -> Result<TrajectoryTable> {
        let mapping = ColumnMapping {
            traj_id: self.traj_id.clone(),
            datetime: self.datetime.clone(),
            lat: self.lat.clone(),
            lon: self.lon.clone(),
        };
        let file = fs_err::File::open(&self.input)?;
        if !self.dedupe {
            return Ok(TrajectoryTable::load_csv(file, &mapping)?);
        }
        let table = TrajectoryTable::from_raw_deduplicated(RawTable::read_csv(file)?, &mapping)?;
        info!(
            "Loaded {} rows in {} trajectories",
            table.len(),
            table.num_trajectories()
        );
        Ok(table)
    }

    fn run(self) -> Result<()> {
        let config = self.config()?;
        let executor = Executor::new(config.executor()?)?;
        let table = self.load()?;

        match self.cmd {
            Command::Features {
                ref feature,
                ref from_point,
                within,
            } => {
                let mut features = feature.clone();
                if features.is_empty() {
                    features = Feature::kinematic();
                    features.extend(Feature::temporal());
                }
                if let Some(raw) = from_point {
                    let (lat, lon) = parse_point(raw)?;
                    features.push(Feature::DistanceFromPoint { lat, lon });
                    if let Some(radius) = within {
                        features.push(Feature::WithinRange { lat, lon, radius });
                    }
                } else if within.is_some() {
                    bail!("--within needs --from-point");
                }
                self.write_table(&table.with_features(&executor, &features)?)
            }
            Command::Interpolate { scheme } => {
                let mut interpolation = config.interpolation()?;
                if let Some(scheme) = scheme {
                    interpolation.scheme = scheme;
                }
                self.write_table(&table.interpolate(&executor, &interpolation)?)
            }
            Command::Segment => {
                self.write_table(&table.segment(&executor, &config.stop_criterion()?)?)
            }
            Command::Filter {
                ref bbox,
                outside,
                ref start,
                ref end,
                max_speed,
                min_speed,
                min_distance,
                max_distance,
                distance_outliers,
                speed_outliers,
                min_points,
                ref hampel,
                half_window,
                n_sigmas,
            } => {
                let mut filters = Vec::new();
                if let Some(raw) = bbox {
                    filters.push(Filter::BoundingBox {
                        bbox: parse_bbox(raw)?,
                        inside: !outside,
                    });
                }
                if start.is_some() || end.is_some() {
                    filters.push(Filter::DateTimeRange {
                        start: start.as_deref().map(parse_time).transpose()?,
                        end: end.as_deref().map(parse_time).transpose()?,
                    });
                }
                // Limits given together must hold together
                filters.extend(match (max_distance, max_speed) {
                    (Some(max_distance), Some(max_speed)) => Some(Filter::MaxDistanceAndSpeed {
                        max_distance,
                        max_speed,
                    }),
                    (Some(dist), None) => Some(Filter::MaxDistance(dist)),
                    (None, Some(speed)) => Some(Filter::MaxSpeed(speed)),
                    (None, None) => None,
                });
                filters.extend(match (min_distance, min_speed) {
                    (Some(min_distance), Some(min_speed)) => Some(Filter::MinDistanceAndSpeed {
                        min_distance,
                        min_speed,
                    }),
                    (Some(dist), None) => Some(Filter::MinDistance(dist)),
                    (None, Some(speed)) => Some(Filter::MinSpeed(speed)),
                    (None, None) => None,
                });
                if distance_outliers {
                    filters.push(Filter::DistanceOutliers);
                }
                if speed_outliers {
                    filters.push(Filter::SpeedOutliers);
                }
                if let Some(column) = hampel {
                    filters.push(Filter::Hampel {
                        column: column.clone(),
                        half_window,
                        n_sigmas,
                    });
                }
                // Last, so earlier filters can shrink trajectories below the minimum
                if let Some(n) = min_points {
                    filters.push(Filter::MinPoints(n));
                }
                if filters.is_empty() {
                    bail!("No filters specified");
                }

                let mut table = table;
                for filter in &filters {
                    table = table.filter(&executor, filter)?;
                }
                self.write_table(&table)
            }
            Command::Stats {
                ref column,
                by_days: None,
            } => {
                let stats = trailprep::stats::column_stats(&executor, &table, column)?;
                self.write_string(serde_json::to_string_pretty(&stats)?)
            }
            Command::Stats {
                ref column,
                by_days: Some(num_days),
            } => {
                let stats =
                    trailprep::stats::column_stats_by_days(&executor, &table, column, num_days)?;
                // JSON keys must be strings, so flatten the (trajectory, window) key
                let rows: Vec<serde_json::Value> = stats
                    .into_iter()
                    .map(|((traj_id, window), stats)| {
                        serde_json::json!({
                            "traj_id": traj_id,
                            "window": window,
                            "stats": stats,
                        })
                    })
                    .collect();
                self.write_string(serde_json::to_string_pretty(&rows)?)
            }
            Command::Summarize => {
                let summaries = trailprep::features::summarize(&executor, &table)?;
                self.write_string(serde_json::to_string_pretty(&summaries)?)
            }
            Command::Geojson => self.write_string(table.to_geojson()?),
        }
    }

    fn write_table(&self, table: &TrajectoryTable) -> Result<()> {
        match self.output {
            Some(ref path) => {
                table.write_csv(fs_err::File::create(path)?)?;
                info!(
                    "Wrote {} rows in {} trajectories to {}",
                    table.len(),
                    table.num_trajectories(),
                    path
                );
            }
            None => {
                table.write_csv(std::io::stdout().lock())?;
            }
        }
        Ok(())
    }

    fn write_string(&self, contents: String) -> Result<()> {
        match self.output {
            Some(ref path) => {
                fs_err::write(path, contents)?;
                info!("Wrote {}", path);
            }
            None => {
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{}", contents)?;
            }
        }
        Ok(())
    }
}

fn parse_numbers(raw: &str, expected: usize) -> Result<Vec<f64>> {
    let numbers = raw
        .split(',')
        .map(|x| x.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()?;
    if numbers.len() != expected {
        bail!("Expected {} comma-separated numbers, got {}", expected, raw);
    }
    Ok(numbers)
}

fn parse_point(raw: &str) -> Result<(f64, f64)> {
    let x = parse_numbers(raw, 2)?;
    Ok((x[0], x[1]))
}

fn parse_bbox(raw: &str) -> Result<BoundingBox> {
    let x = parse_numbers(raw, 4)?;
    Ok(BoundingBox {
        min_lat: x[0],
        min_lon: x[1],
        max_lat: x[2],
        max_lon: x[3],
    })
}

fn parse_time(raw: &str) -> Result<chrono::NaiveDateTime> {
    match trailprep::parse_time(raw) {
        Some(t) => Ok(t),
        None => bail!("Can't parse time {}", raw),
    }
}
