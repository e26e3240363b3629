//! Preprocessing for mobility data: a table of trajectories keyed by (trajectory, time), and
//! operations over it that run one trajectory at a time across a pool of workers.

#[macro_use]
extern crate log;

mod config;
mod error;
mod executor;
pub mod features;
pub mod filters;
pub mod geometry;
mod interpolate;
mod io;
mod segment;
pub mod stats;
mod table;

pub use config::Config;
pub use error::{Error, Result};
pub use executor::{default_workers, CancelHandle, Executor, ExecutorConfig};
pub use features::{Feature, Summary};
pub use geometry::BoundingBox;
pub use interpolate::{interpolate_trajectory, InterpolationConfig, Scheme};
pub use io::{parse_time, remove_duplicate_rows, ColumnMapping, RawTable, TIME_FORMAT};
pub use segment::{Segmenter, Segments, StopCriterion};
pub use stats::ColumnStats;
pub use table::{
    is_reserved, Partition, Point, Trajectory, TrajectoryID, TrajectoryTable, Value, DATETIME,
    LAT, LON, MANDATORY_COLUMNS, SYNTHETIC, TRAJ_ID,
};
