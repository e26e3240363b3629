use std::iter::FusedIterator;

use chrono::Duration;

use crate::geometry;
use crate::table::seconds;
use crate::{Error, Executor, Partition, Result, Trajectory, TrajectoryTable};

/// What counts as stopping
#[derive(Clone, Debug, PartialEq)]
pub struct StopCriterion {
    /// Meters per second. Points reached slower than this are stationary.
    pub speed_threshold: f64,
    /// A run of stationary points must last at least this long to split the trajectory
    pub min_duration: Duration,
}

impl Default for StopCriterion {
    fn default() -> Self {
        Self {
            speed_threshold: 0.5,
            min_duration: Duration::minutes(5),
        }
    }
}

/// Splits trajectories after every stop.
///
/// A stop is a maximal run of points each reached from the previous point below the speed
/// threshold. Its duration is measured from the point before the run, where the slow movement
/// began, to the last point of the run. The current piece ends with the last point of a long
/// enough stop, and the next piece starts right after it.
#[derive(Clone, Debug)]
pub struct Segmenter {
    criterion: StopCriterion,
}

impl Segmenter {
    pub fn new(criterion: StopCriterion) -> Result<Self> {
        let op = "Segmenter::new";
        if !criterion.speed_threshold.is_finite() || criterion.speed_threshold < 0.0 {
            return Err(Error::InvalidConfig {
                op,
                reason: format!("bad speed threshold {}", criterion.speed_threshold),
            });
        }
        if criterion.min_duration < Duration::zero() {
            return Err(Error::InvalidConfig {
                op,
                reason: format!("negative stop duration {}", criterion.min_duration),
            });
        }
        Ok(Self { criterion })
    }

    pub fn criterion(&self) -> &StopCriterion {
        &self.criterion
    }

    /// Lazily yields the pieces in order. Concatenated, they're exactly the input. Clone the
    /// iterator to start over.
    pub fn segments<'a>(&self, traj: Trajectory<'a>) -> Segments<'a> {
        Segments {
            traj,
            criterion: self.criterion.clone(),
            pos: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Segments<'a> {
    traj: Trajectory<'a>,
    criterion: StopCriterion,
    // Start of the next piece
    pos: usize,
}

impl<'a> Segments<'a> {
    fn is_slow(&self, i: usize) -> bool {
        let pts = self.traj.points();
        let dt = seconds(pts[i].time - pts[i - 1].time);
        dt > 0.0 && geometry::distance(&pts[i - 1], &pts[i]) / dt < self.criterion.speed_threshold
    }

    // Index of the last point of the next long enough stop, starting from pos
    fn next_stop_end(&self) -> Option<usize> {
        let pts = self.traj.points();
        let mut run_start = None;
        for i in self.pos.max(1)..pts.len() {
            let slow = self.is_slow(i);
            if slow && run_start.is_none() {
                run_start = Some(i);
            }
            let last = if !slow {
                i - 1
            } else if i == pts.len() - 1 {
                i
            } else {
                continue;
            };
            if let Some(start) = run_start.take() {
                if pts[last].time - pts[start - 1].time >= self.criterion.min_duration {
                    return Some(last);
                }
            }
        }
        None
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = Trajectory<'a>;

    fn next(&mut self) -> Option<Trajectory<'a>> {
        let pts = self.traj.points();
        if self.pos >= pts.len() {
            return None;
        }
        let end = self.next_stop_end().unwrap_or(pts.len() - 1);
        let piece = Trajectory::unchecked(self.traj.id(), &pts[self.pos..=end]);
        self.pos = end + 1;
        Some(piece)
    }
}

impl FusedIterator for Segments<'_> {}

impl TrajectoryTable {
    /// Replaces every trajectory `id` with pieces `id_0`, `id_1`, and so on.
    pub fn segment(&self, executor: &Executor, criterion: &StopCriterion) -> Result<Self> {
        let segmenter = Segmenter::new(criterion.clone())?;
        executor.map("segment", self, move |partition| {
            let key = partition.key().clone();
            let mut rows = Vec::with_capacity(partition.len());
            let mut pieces = 0;
            for (idx, piece) in segmenter.segments(partition.trajectory()?).enumerate() {
                let id = key.segment(idx);
                for pt in piece.points() {
                    let mut pt = pt.clone();
                    pt.traj_id = id.clone();
                    rows.push(pt);
                }
                pieces += 1;
            }
            debug!("segment: split {key} into {pieces} pieces");
            Ok(Partition::new(key, rows))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::{pt, time};
    use crate::{ExecutorConfig, Point, TrajectoryID};

    fn segmenter() -> Segmenter {
        Segmenter::new(StopCriterion {
            speed_threshold: 1.0,
            min_duration: Duration::minutes(5),
        })
        .unwrap()
    }

    // Roughly 18 m/s while driving, then parked at lon 0.02 for a while
    fn drive_park_drive(id: &str, park_minutes: u32) -> Vec<Point> {
        let mut pts = vec![
            pt(id, time(8, 0, 0), 0.0, 0.0),
            pt(id, time(8, 1, 0), 0.0, 0.01),
            pt(id, time(8, 2, 0), 0.0, 0.02),
        ];
        let mut minute = 2;
        while minute < 2 + park_minutes {
            minute += 1;
            pts.push(pt(id, time(8, minute, 0), 0.0, 0.02));
        }
        pts.push(pt(id, time(8, minute + 1, 0), 0.0, 0.03));
        pts.push(pt(id, time(8, minute + 2, 0), 0.0, 0.04));
        pts
    }

    fn lengths(pts: &[Point]) -> Vec<usize> {
        let id = pts[0].traj_id.clone();
        let traj = Trajectory::new(&id, pts).unwrap();
        segmenter().segments(traj).map(|piece| piece.len()).collect()
    }

    #[test]
    fn long_stop_splits() {
        let pts = drive_park_drive("a", 6);
        // 3 driving points, 6 parked, then 2 more
        assert_eq!(lengths(&pts), vec![9, 2]);
    }

    #[test]
    fn short_stop_doesnt_split() {
        let pts = drive_park_drive("a", 3);
        assert_eq!(lengths(&pts), vec![pts.len()]);
    }

    #[test]
    fn stop_at_the_end_leaves_no_empty_piece() {
        let mut pts = drive_park_drive("a", 6);
        pts.truncate(9);
        assert_eq!(lengths(&pts), vec![9]);
    }

    #[test]
    fn pieces_reassemble_and_restart() {
        let pts = drive_park_drive("a", 10);
        let id = TrajectoryID::from("a");
        let traj = Trajectory::new(&id, &pts).unwrap();
        let segments = segmenter().segments(traj);
        let again = segments.clone();

        let joined: Vec<Point> = segments
            .flat_map(|piece| piece.points().iter().cloned())
            .collect();
        assert_eq!(joined, pts);
        assert_eq!(again.count(), 2);
    }

    #[test]
    fn whole_table() {
        let mut rows = drive_park_drive("a", 6);
        rows.extend(drive_park_drive("b", 1));
        let table = TrajectoryTable::new(rows).unwrap();
        let executor = Executor::new(ExecutorConfig {
            workers: 2,
            ..Default::default()
        })
        .unwrap();
        let result = table.segment(&executor, segmenter().criterion()).unwrap();
        let ids: Vec<String> = result.ids().map(|id| id.0.clone()).collect();
        assert_eq!(ids, vec!["a_0", "a_1", "b_0"]);
        assert_eq!(result.len(), table.len());
    }

    #[test]
    fn ids_that_look_like_pieces() {
        let mut rows = drive_park_drive("a", 1);
        rows.push(pt("a_0", time(12, 0, 0), 1.0, 1.0));
        let table = TrajectoryTable::new(rows).unwrap();
        let executor = Executor::new(ExecutorConfig::default()).unwrap();
        let result = table
            .segment(&executor, segmenter().criterion())
            .unwrap();
        let ids: Vec<String> = result.ids().map(|id| id.0.clone()).collect();
        assert_eq!(ids, vec!["a_0", "a_0_0"]);
    }

    #[test]
    fn bad_criterion() {
        let err = Segmenter::new(StopCriterion {
            speed_threshold: f64::NAN,
            min_duration: Duration::zero(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
