//! Spherical-earth formulas. Coordinates are in degrees, distances in meters.

use serde::{Deserialize, Serialize};

use crate::Point;

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

pub fn distance(pt1: &Point, pt2: &Point) -> f64 {
    haversine(pt1.lat, pt1.lon, pt2.lat, pt2.lon)
}

/// Initial bearing (forward azimuth) from the first point to the second, in [0, 360)
pub fn bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let dlon = (lon2 - lon1).to_radians();
    let y = lat2.cos() * dlon.sin();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

/// Where you end up after travelling some distance along a bearing
pub fn destination(lat: f64, lon: f64, bearing_degrees: f64, dist: f64) -> (f64, f64) {
    let angular = dist / EARTH_RADIUS_METERS;
    let theta = bearing_degrees.to_radians();
    let lat1 = lat.to_radians();
    let lon1 = lon.to_radians();
    let lat2 = (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * theta.cos()).asin();
    let lon2 = lon1
        + (theta.sin() * angular.sin() * lat1.cos()).atan2(angular.cos() - lat1.sin() * lat2.sin());
    (lat2.to_degrees(), normalize_lon(lon2.to_degrees()))
}

pub fn normalize_lon(lon: f64) -> f64 {
    (lon + 540.0).rem_euclid(360.0) - 180.0
}

pub fn clamp_lat(lat: f64) -> f64 {
    lat.clamp(-90.0, 90.0)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// The smallest box covering some points. None if there are no points.
    pub fn covering(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = Self {
            min_lat: first.lat,
            min_lon: first.lon,
            max_lat: first.lat,
            max_lon: first.lon,
        };
        for pt in points {
            bbox.min_lat = bbox.min_lat.min(pt.lat);
            bbox.min_lon = bbox.min_lon.min(pt.lon);
            bbox.max_lat = bbox.max_lat.max(pt.lat);
            bbox.max_lon = bbox.max_lon.max(pt.lon);
        }
        Some(bbox)
    }

    /// A box extending roughly `radius` meters from a center point in each direction
    pub fn around(lat: f64, lon: f64, radius: f64) -> Self {
        let lat_rad = lat.to_radians();
        let lat_delta = radius / EARTH_RADIUS_METERS;
        let min_lat = clamp_lat((lat_rad - lat_delta).to_degrees());
        let max_lat = clamp_lat((lat_rad + lat_delta).to_degrees());
        let ratio = lat_delta.sin() / lat_rad.cos();
        // A circle reaching a pole, or too wide for its latitude, spans every longitude
        if ratio.is_nan() || ratio >= 1.0 || min_lat <= -90.0 || max_lat >= 90.0 {
            return Self {
                min_lat,
                min_lon: -180.0,
                max_lat,
                max_lon: 180.0,
            };
        }
        let lon_delta = ratio.asin();
        Self {
            min_lat,
            min_lon: (lon.to_radians() - lon_delta).to_degrees().max(-180.0),
            max_lat,
            max_lon: (lon.to_radians() + lon_delta).to_degrees().min(180.0),
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}
