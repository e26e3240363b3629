use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::geometry::{self, clamp_lat};
use crate::table::seconds;
use crate::{Error, Executor, Partition, Point, Result, Trajectory, TrajectoryID, TrajectoryTable};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    /// Constant velocity between the two points around a gap
    Linear,
    /// A natural cubic spline through every point of the trajectory
    Cubic,
    /// Linear, plus a random walk
    RandomWalk,
    /// Cubic Hermite, matching the velocity on either side of a gap
    Kinematic,
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(x: &str) -> std::result::Result<Self, Self::Err> {
        match x {
            "linear" => Ok(Scheme::Linear),
            "cubic" => Ok(Scheme::Cubic),
            "random-walk" => Ok(Scheme::RandomWalk),
            "kinematic" => Ok(Scheme::Kinematic),
            _ => Err(format!("unknown interpolation scheme {x}")),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Scheme::Linear => "linear",
            Scheme::Cubic => "cubic",
            Scheme::RandomWalk => "random-walk",
            Scheme::Kinematic => "kinematic",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InterpolationConfig {
    pub scheme: Scheme,
    /// Spacing of the inserted points
    pub interval: Duration,
    /// Only gaps strictly longer than this are filled
    pub gap_threshold: Duration,
    /// Meters. The most a random walk moves per inserted point.
    pub random_walk_step: f64,
    pub seed: u64,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            scheme: Scheme::Linear,
            interval: Duration::seconds(60),
            gap_threshold: Duration::seconds(120),
            random_walk_step: 5.0,
            seed: 42,
        }
    }
}

impl InterpolationConfig {
    pub fn validate(&self) -> Result<()> {
        let op = "InterpolationConfig";
        if self.interval <= Duration::zero() {
            return Err(Error::InvalidConfig {
                op,
                reason: format!("interval must be positive, not {}", self.interval),
            });
        }
        if self.gap_threshold < Duration::zero() {
            return Err(Error::InvalidConfig {
                op,
                reason: format!("gap threshold can't be negative: {}", self.gap_threshold),
            });
        }
        if !self.random_walk_step.is_finite() || self.random_walk_step < 0.0 {
            return Err(Error::InvalidConfig {
                op,
                reason: format!("bad random walk step {}", self.random_walk_step),
            });
        }
        Ok(())
    }
}

struct Gap {
    // Index of the real point starting the gap
    idx: usize,
    times: Vec<NaiveDateTime>,
}

fn find_gaps(config: &InterpolationConfig, pts: &[Point]) -> Vec<Gap> {
    let mut gaps = Vec::new();
    for (idx, pair) in pts.windows(2).enumerate() {
        let (t0, t1) = (pair[0].time, pair[1].time);
        if t1 - t0 <= config.gap_threshold {
            continue;
        }
        let mut times = Vec::new();
        let mut t = t0 + config.interval;
        while t < t1 {
            times.push(t);
            t = t + config.interval;
        }
        if !times.is_empty() {
            gaps.push(Gap { idx, times });
        }
    }
    gaps
}

/// Returns every original point, untouched, with synthetic points filling the gaps.
pub fn interpolate_trajectory(
    config: &InterpolationConfig,
    traj: Trajectory,
) -> Result<Vec<Point>> {
    let op = "interpolate";
    let pts = traj.points();
    let gaps = find_gaps(config, pts);
    if gaps.is_empty() {
        return Ok(pts.to_vec());
    }

    let mut filler = match config.scheme {
        Scheme::Linear => Filler::Linear,
        Scheme::Cubic => {
            if pts.len() < 4 {
                return Err(Error::InsufficientData {
                    op,
                    traj_id: traj.id().clone(),
                    needed: 4,
                    found: pts.len(),
                });
            }
            let start = pts[0].time;
            let xs: Vec<f64> = pts.iter().map(|pt| seconds(pt.time - start)).collect();
            Filler::Cubic {
                start,
                lat: Spline::natural(&xs, &pts.iter().map(|pt| pt.lat).collect::<Vec<_>>()),
                lon: Spline::natural(&xs, &pts.iter().map(|pt| pt.lon).collect::<Vec<_>>()),
            }
        }
        Scheme::RandomWalk => Filler::RandomWalk {
            rng: StdRng::seed_from_u64(config.seed ^ stable_hash(traj.id())),
            step: config.random_walk_step,
        },
        Scheme::Kinematic => Filler::Kinematic,
    };

    let num_synthetic = gaps.iter().map(|g| g.times.len()).sum::<usize>();
    let mut result = Vec::with_capacity(pts.len() + num_synthetic);
    let mut next_gap = gaps.into_iter().peekable();
    for (idx, pt) in pts.iter().enumerate() {
        result.push(pt.clone());
        if let Some(gap) = next_gap.next_if(|gap| gap.idx == idx) {
            debug!(
                "{op}: {} synthetic points after {} in {}",
                gap.times.len(),
                pt.time,
                traj.id()
            );
            for (time, (lat, lon)) in gap.times.iter().zip(filler.fill(traj, idx, &gap.times)?) {
                let (lat, lon) = clamp(lat, lon);
                let mut synthetic = Point::new(traj.id().clone(), *time, lat, lon);
                synthetic.synthetic = true;
                result.push(synthetic);
            }
        }
    }
    Ok(result)
}

fn clamp(lat: f64, lon: f64) -> (f64, f64) {
    (clamp_lat(lat), lon.clamp(-180.0, 180.0))
}

// FNV-1a, so seeds don't depend on the standard library's hasher
fn stable_hash(id: &TrajectoryID) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in id.0.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

enum Filler {
    Linear,
    Cubic {
        start: NaiveDateTime,
        lat: Spline,
        lon: Spline,
    },
    RandomWalk {
        rng: StdRng,
        step: f64,
    },
    Kinematic,
}

impl Filler {
    /// Positions for the synthetic times in the gap after point `idx`
    fn fill(
        &mut self,
        traj: Trajectory,
        idx: usize,
        times: &[NaiveDateTime],
    ) -> Result<Vec<(f64, f64)>> {
        let pts = traj.points();
        let (p0, p1) = (&pts[idx], &pts[idx + 1]);
        let span = traj.time_delta("interpolate", idx + 1)?;
        let fraction = |t: &NaiveDateTime| seconds(*t - p0.time) / span;

        Ok(match self {
            Filler::Linear => times.iter().map(|t| lerp(p0, p1, fraction(t))).collect(),
            Filler::Cubic { start, lat, lon } => times
                .iter()
                .map(|t| {
                    let x = seconds(*t - *start);
                    (lat.eval(x), lon.eval(x))
                })
                .collect(),
            Filler::RandomWalk { rng, step } => {
                // Displacement from the linear path, in meters east and north
                let (mut east, mut north) = (0.0, 0.0);
                let mut result = Vec::new();
                for t in times {
                    let theta = rng.gen_range(0.0..360.0_f64).to_radians();
                    let dist = if *step > 0.0 {
                        rng.gen_range(0.0..=*step)
                    } else {
                        0.0
                    };
                    east += dist * theta.sin();
                    north += dist * theta.cos();

                    let (lat, lon) = lerp(p0, p1, fraction(t));
                    let offset = (east * east + north * north).sqrt();
                    if offset == 0.0 {
                        result.push((lat, lon));
                    } else {
                        let bearing = east.atan2(north).to_degrees();
                        result.push(geometry::destination(lat, lon, bearing, offset));
                    }
                }
                result
            }
            Filler::Kinematic => {
                // Degrees per second, on either side of the gap. At the ends of a trajectory,
                // there's no neighboring segment, so use the gap's own average velocity.
                let average = ((p1.lat - p0.lat) / span, (p1.lon - p0.lon) / span);
                let v0 = if idx > 0 {
                    let dt = traj.time_delta("interpolate", idx)?;
                    let prev = &pts[idx - 1];
                    ((p0.lat - prev.lat) / dt, (p0.lon - prev.lon) / dt)
                } else {
                    average
                };
                let v1 = if idx + 2 < pts.len() {
                    let dt = traj.time_delta("interpolate", idx + 2)?;
                    let next = &pts[idx + 2];
                    ((next.lat - p1.lat) / dt, (next.lon - p1.lon) / dt)
                } else {
                    average
                };
                times
                    .iter()
                    .map(|t| {
                        let s = fraction(t);
                        (
                            hermite(p0.lat, v0.0 * span, p1.lat, v1.0 * span, s),
                            hermite(p0.lon, v0.1 * span, p1.lon, v1.1 * span, s),
                        )
                    })
                    .collect()
            }
        })
    }
}

fn lerp(p0: &Point, p1: &Point, s: f64) -> (f64, f64) {
    (
        p0.lat + s * (p1.lat - p0.lat),
        p0.lon + s * (p1.lon - p0.lon),
    )
}

// m0 and m1 are tangents already scaled to the unit interval
fn hermite(p0: f64, m0: f64, p1: f64, m1: f64, s: f64) -> f64 {
    let s2 = s * s;
    let s3 = s2 * s;
    (2.0 * s3 - 3.0 * s2 + 1.0) * p0
        + (s3 - 2.0 * s2 + s) * m0
        + (-2.0 * s3 + 3.0 * s2) * p1
        + (s3 - s2) * m1
}

/// Natural cubic spline: the second derivative is zero at both ends.
struct Spline {
    xs: Vec<f64>,
    ys: Vec<f64>,
    // Second derivatives at each knot
    m: Vec<f64>,
}

impl Spline {
    // xs must be strictly increasing, with at least 2 knots
    fn natural(xs: &[f64], ys: &[f64]) -> Spline {
        let n = xs.len();
        let mut m = vec![0.0; n];
        if n > 2 {
            let h: Vec<f64> = xs.windows(2).map(|w| w[1] - w[0]).collect();
            // Thomas algorithm over the interior knots
            let mut diag = vec![0.0; n];
            let mut rhs = vec![0.0; n];
            for i in 1..n - 1 {
                diag[i] = 2.0 * (h[i - 1] + h[i]);
                rhs[i] = 6.0 * ((ys[i + 1] - ys[i]) / h[i] - (ys[i] - ys[i - 1]) / h[i - 1]);
            }
            for i in 2..n - 1 {
                let w = h[i - 1] / diag[i - 1];
                diag[i] -= w * h[i - 1];
                rhs[i] -= w * rhs[i - 1];
            }
            for i in (1..n - 1).rev() {
                m[i] = (rhs[i] - h[i] * m[i + 1]) / diag[i];
            }
        }
        Spline {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
            m,
        }
    }

    fn eval(&self, x: f64) -> f64 {
        let n = self.xs.len();
        let i = self
            .xs
            .partition_point(|knot| *knot <= x)
            .saturating_sub(1)
            .min(n - 2);
        let h = self.xs[i + 1] - self.xs[i];
        let a = self.xs[i + 1] - x;
        let b = x - self.xs[i];
        self.m[i] * a.powi(3) / (6.0 * h)
            + self.m[i + 1] * b.powi(3) / (6.0 * h)
            + (self.ys[i] / h - self.m[i] * h / 6.0) * a
            + (self.ys[i + 1] / h - self.m[i + 1] * h / 6.0) * b
    }
}

impl TrajectoryTable {
    /// Fills gaps in every trajectory, one trajectory per worker.
    pub fn interpolate(&self, executor: &Executor, config: &InterpolationConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Interpolating {} trajectories with the {} scheme",
            self.num_trajectories(),
            config.scheme
        );
        let config = config.clone();
        executor.map("interpolate", self, move |partition| {
            let rows = interpolate_trajectory(&config, partition.trajectory()?)?;
            Ok(Partition::new(partition.key().clone(), rows))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::{pt, time};
    use crate::{ExecutorConfig, Value};

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn config(scheme: Scheme) -> InterpolationConfig {
        InterpolationConfig {
            scheme,
            interval: Duration::minutes(5),
            gap_threshold: Duration::minutes(1),
            random_walk_step: 10.0,
            seed: 7,
        }
    }

    fn run(scheme: Scheme, pts: &[Point]) -> Result<Vec<Point>> {
        let id = pts[0].traj_id.clone();
        interpolate_trajectory(&config(scheme), Trajectory::new(&id, pts)?)
    }

    // Constant velocity eastward, one degree every 10 minutes
    fn steady() -> Vec<Point> {
        (0..4)
            .map(|i| pt("s", time(8, 10 * i, 0), 0.0, i as f64))
            .collect()
    }

    #[test]
    fn linear_midpoint() {
        let pts = vec![
            pt("a", time(8, 0, 0), 0.0, 0.0).with_attr("note", Value::Text("x".to_string())),
            pt("a", time(8, 10, 0), 0.0, 1.0),
        ];
        let result = run(Scheme::Linear, &pts).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0], pts[0]);
        assert_eq!(result[2], pts[1]);
        let mid = &result[1];
        assert!(mid.synthetic);
        assert_eq!(mid.time, time(8, 5, 0));
        assert_eq!((mid.lat, mid.lon), (0.0, 0.5));
        assert_eq!(mid.attr("note"), &Value::Missing);
    }

    #[test]
    fn short_gaps_are_left_alone() {
        let pts = vec![
            pt("a", time(8, 0, 0), 0.0, 0.0),
            pt("a", time(8, 0, 30), 0.0, 0.001),
        ];
        assert_eq!(run(Scheme::Linear, &pts).unwrap(), pts);
        // Even cubic is fine with too few points, when nothing needs filling
        assert_eq!(run(Scheme::Cubic, &pts).unwrap(), pts);
    }

    #[test]
    fn synthetic_times_stop_before_the_next_point() {
        let pts = vec![
            pt("a", time(8, 0, 0), 0.0, 0.0),
            pt("a", time(8, 12, 0), 0.0, 1.2),
        ];
        let result = run(Scheme::Linear, &pts).unwrap();
        let times: Vec<_> = result.iter().map(|pt| pt.time).collect();
        assert_eq!(
            times,
            vec![time(8, 0, 0), time(8, 5, 0), time(8, 10, 0), time(8, 12, 0)]
        );
    }

    #[test]
    fn cubic_needs_four_points() {
        let pts = vec![
            pt("c", time(8, 0, 0), 0.0, 0.0),
            pt("c", time(8, 10, 0), 0.0, 1.0),
            pt("c", time(8, 11, 0), 0.0, 1.1),
        ];
        match run(Scheme::Cubic, &pts).unwrap_err() {
            Error::InsufficientData {
                traj_id,
                needed,
                found,
                ..
            } => {
                assert_eq!(traj_id, TrajectoryID::from("c"));
                assert_eq!((needed, found), (4, 3));
            }
            err => panic!("wrong error {err}"),
        }
    }

    #[test]
    fn smooth_schemes_follow_a_straight_line() {
        for scheme in [Scheme::Cubic, Scheme::Kinematic] {
            let result = run(scheme, &steady()).unwrap();
            assert_eq!(result.len(), 7);
            let mid = &result[1];
            assert!(mid.synthetic);
            assert!(close(mid.lat, 0.0), "{scheme}: {}", mid.lat);
            assert!(close(mid.lon, 0.5), "{scheme}: {}", mid.lon);
        }
    }

    #[test]
    fn spline_hits_its_knots() {
        let xs = [0.0, 1.0, 3.0, 4.0, 7.0];
        let ys = [2.0, -1.0, 0.5, 4.0, 3.0];
        let spline = Spline::natural(&xs, &ys);
        for (x, y) in xs.iter().zip(ys.iter()) {
            assert!(close(spline.eval(*x), *y));
        }
        assert!(close(spline.m[0], 0.0) && close(spline.m[4], 0.0));
    }

    #[test]
    fn random_walk_is_reproducible_and_bounded() {
        let pts = vec![
            pt("r", time(8, 0, 0), 10.0, 10.0),
            pt("r", time(9, 0, 0), 10.0, 10.1),
        ];
        let first = run(Scheme::RandomWalk, &pts).unwrap();
        let second = run(Scheme::RandomWalk, &pts).unwrap();
        assert_eq!(first, second);

        let linear = run(Scheme::Linear, &pts).unwrap();
        assert_eq!(first.len(), linear.len());
        assert_ne!(first, linear);
        for (k, (walked, straight)) in first.iter().zip(linear.iter()).enumerate() {
            let offset = geometry::distance(walked, straight);
            assert!(offset <= 10.0 * k as f64 + 1e-6, "{offset} after {k} steps");
        }
        assert_eq!(first[0], pts[0]);
        assert_eq!(first.last(), pts.last());
    }

    #[test]
    fn clamped_into_range() {
        assert_eq!(clamp(90.3, -181.0), (90.0, -180.0));
    }

    #[test]
    fn invalid_config() {
        let mut cfg = config(Scheme::Linear);
        cfg.interval = Duration::zero();
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn whole_table() {
        let mut rows = steady();
        rows.push(pt("t", time(8, 0, 0), 1.0, 1.0));
        let table = TrajectoryTable::new(rows).unwrap();
        let executor = Executor::new(ExecutorConfig {
            workers: 2,
            ..Default::default()
        })
        .unwrap();
        let result = table
            .interpolate(&executor, &config(Scheme::Kinematic))
            .unwrap();
        assert_eq!(result.len(), 7 + 1);
        assert!(result.has_synthetic());
        let original: Vec<Point> = result
            .trajectories()
            .flat_map(|traj| traj.points().iter().filter(|pt| !pt.synthetic).cloned())
            .collect();
        assert_eq!(TrajectoryTable::new(original).unwrap(), table);
    }
}
