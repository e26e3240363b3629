use std::time::Duration as StdDuration;

use chrono::Duration;

use trailprep::filters::Filter;
use trailprep::stats::column_stats;
use trailprep::{
    ColumnMapping, Error, Executor, ExecutorConfig, Feature, InterpolationConfig, Scheme,
    StopCriterion, TrajectoryID, TrajectoryTable,
};

fn executor(workers: usize) -> Executor {
    Executor::new(ExecutorConfig {
        workers,
        timeout: None,
        force_kill: false,
    })
    .unwrap()
}

fn load(csv: &str) -> Result<TrajectoryTable, Error> {
    TrajectoryTable::load_csv(csv.as_bytes(), &ColumnMapping::default())
}

fn linear(interval_minutes: i64) -> InterpolationConfig {
    InterpolationConfig {
        scheme: Scheme::Linear,
        interval: Duration::minutes(interval_minutes),
        gap_threshold: Duration::minutes(1),
        ..Default::default()
    }
}

#[test]
fn linear_gap_gets_one_midpoint() {
    let table = load(
        "traj_id,DateTime,lat,lon\n\
         a,2021-05-26 08:00:00,0,0\n\
         a,2021-05-26 08:10:00,0,1\n",
    )
    .unwrap();
    let result = table.interpolate(&executor(2), &linear(5)).unwrap();
    assert_eq!(
        result.to_csv_string().unwrap(),
        "traj_id,DateTime,lat,lon,synthetic\n\
         a,2021-05-26 08:00:00,0,0,false\n\
         a,2021-05-26 08:05:00,0,0.5,true\n\
         a,2021-05-26 08:10:00,0,1,false\n"
    );
}

#[test]
fn cubic_with_three_points_names_the_trajectory() {
    let table = load(
        "traj_id,DateTime,lat,lon\n\
         ok,2021-05-26 08:00:00,0,0\n\
         short,2021-05-26 08:00:00,0,0\n\
         short,2021-05-26 08:30:00,0,1\n\
         short,2021-05-26 08:31:00,0,1.01\n",
    )
    .unwrap();
    let config = InterpolationConfig {
        scheme: Scheme::Cubic,
        ..linear(5)
    };
    let err = table.interpolate(&executor(2), &config).unwrap_err();
    assert!(matches!(err, Error::InsufficientData { .. }), "{err}");
    assert_eq!(err.traj_id(), Some(&TrajectoryID::from("short")));
}

#[test]
fn construction_errors() {
    let err = load("traj_id,DateTime,lon\na,2021-05-26 08:00:00,0\n").unwrap_err();
    assert!(matches!(err, Error::Schema { .. }), "{err}");

    let err = load(
        "traj_id,DateTime,lat,lon\n\
         a,2021-05-26 08:00:00,0,0\n\
         a,2021-05-26 08:00:00,1,1\n",
    )
    .unwrap_err();
    assert!(matches!(err, Error::Schema { .. }), "{err}");
}

#[test]
fn select_is_time_ordered() {
    let table = load(
        "traj_id,DateTime,lat,lon\n\
         a,2021-05-26 08:20:00,0,2\n\
         a,2021-05-26 08:00:00,0,0\n\
         a,2021-05-26 08:10:00,0,1\n",
    )
    .unwrap();
    let traj = table.select(&TrajectoryID::from("a")).unwrap();
    assert!(traj.points().windows(2).all(|w| w[0].time < w[1].time));
    assert_eq!(traj.points()[0].lon, 0.0);
}

#[test]
fn a_stuck_partition_times_out_without_partial_results() {
    let table = load(
        "traj_id,DateTime,lat,lon\n\
         fast,2021-05-26 08:00:00,0,0\n\
         slow,2021-05-26 08:00:00,0,0\n",
    )
    .unwrap();
    let executor = Executor::new(ExecutorConfig {
        workers: 2,
        timeout: Some(StdDuration::from_millis(50)),
        force_kill: true,
    })
    .unwrap();
    let result = executor.map("stall", &table, |partition| {
        if partition.key().0 == "slow" {
            std::thread::sleep(StdDuration::from_secs(2));
        }
        Ok(partition)
    });
    match result {
        Err(Error::Timeout { traj_id, .. }) => assert_eq!(traj_id, TrajectoryID::from("slow")),
        Err(err) => panic!("wrong error {err}"),
        Ok(_) => panic!("a timed out call returned a table"),
    }
}

#[test]
fn full_pipeline() {
    // Two trips by one vehicle, with a 10 minute stop between them, and a GPS glitch
    let mut csv = String::from("vehicle,ts,y,x,driver\n");
    for minute in 0..5 {
        csv.push_str(&format!(
            "bus,2021-05-26 08:{minute:02}:00,44.6,{},kim\n",
            -63.6 + 0.005 * minute as f64
        ));
    }
    for minute in 5..16 {
        csv.push_str(&format!("bus,2021-05-26 08:{minute:02}:00,44.6,-63.575,kim\n"));
    }
    csv.push_str("bus,2021-05-26 08:16:30,45.6,-63.575,kim\n");
    for minute in 17..20 {
        csv.push_str(&format!(
            "bus,2021-05-26 08:{minute:02}:00,44.6,{},kim\n",
            -63.575 + 0.005 * (minute - 16) as f64
        ));
    }
    let mapping = ColumnMapping {
        traj_id: "vehicle".to_string(),
        datetime: "ts".to_string(),
        lat: "y".to_string(),
        lon: "x".to_string(),
    };
    let table = TrajectoryTable::load_csv(csv.as_bytes(), &mapping).unwrap();
    assert_eq!(table.len(), 20);

    let executor = executor(4);
    let table = table.filter(&executor, &Filter::MaxSpeed(50.0)).unwrap();
    assert_eq!(table.len(), 19);

    let table = table
        .with_features(&executor, &[Feature::Speed, Feature::TimeOfDay])
        .unwrap();
    assert_eq!(
        table.columns(),
        &[
            "driver".to_string(),
            "Speed_prev_to_curr".to_string(),
            "Time_Of_Day".to_string()
        ]
    );

    let segmented = table
        .segment(
            &executor,
            &StopCriterion {
                speed_threshold: 1.0,
                min_duration: Duration::minutes(5),
            },
        )
        .unwrap();
    let ids: Vec<String> = segmented.ids().map(|id| id.0.clone()).collect();
    assert_eq!(ids, vec!["bus_0", "bus_1"]);
    assert_eq!(segmented.len(), table.len());

    let stats = column_stats(&executor, &segmented, "Speed_prev_to_curr").unwrap();
    let second = &stats[&TrajectoryID::from("bus_1")];
    assert_eq!(second.count, 3);
    assert!(second.mean > 5.0);

    let out = segmented.to_csv_string().unwrap();
    assert!(out.starts_with("traj_id,DateTime,lat,lon,driver,Speed_prev_to_curr,Time_Of_Day\n"));
    assert!(out.contains(",kim,"));
}
