//! Conversions between WGS84 geodetic coordinates, ECEF and a local East-North-Up frame.

use cv_core::nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

pub const WGS84_A: f64 = 6_378_137.0;
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;
const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);

/// A WGS84 position with latitude and longitude in degrees and the ellipsoidal height in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeodeticPosition {
    pub lat: f64,
    pub lon: f64,
    pub h: f64,
}

impl GeodeticPosition {
    pub fn new(lat: f64, lon: f64, h: f64) -> Self {
        Self { lat, lon, h }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.h.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

fn prime_vertical_radius(sin_lat: f64) -> f64 {
    WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt()
}

pub fn geodetic_to_ecef(p: &GeodeticPosition) -> Vector3<f64> {
    let (sin_lat, cos_lat) = p.lat.to_radians().sin_cos();
    let (sin_lon, cos_lon) = p.lon.to_radians().sin_cos();
    let n = prime_vertical_radius(sin_lat);
    Vector3::new(
        (n + p.h) * cos_lat * cos_lon,
        (n + p.h) * cos_lat * sin_lon,
        (n * (1.0 - WGS84_E2) + p.h) * sin_lat,
    )
}

pub fn ecef_to_geodetic(ecef: &Vector3<f64>) -> GeodeticPosition {
    let lon = ecef.y.atan2(ecef.x);
    let p = ecef.x.hypot(ecef.y);
    let mut lat = ecef.z.atan2(p * (1.0 - WGS84_E2));
    let mut h = 0.0;
    for _ in 0..16 {
        let (sin_lat, cos_lat) = lat.sin_cos();
        let n = prime_vertical_radius(sin_lat);
        // Stable at the poles, unlike p / cos(lat) - n.
        h = p * cos_lat + ecef.z * sin_lat - WGS84_A * WGS84_A / n;
        let next = ecef.z.atan2(p * (1.0 - WGS84_E2 * n / (n + h)));
        let done = (next - lat).abs() < 1e-15;
        lat = next;
        if done {
            break;
        }
    }
    GeodeticPosition {
        lat: lat.to_degrees(),
        lon: lon.to_degrees(),
        h,
    }
}

/// Rows are the east, north and up axes expressed in ECEF.
fn ecef_to_enu_rotation(reference: &GeodeticPosition) -> Matrix3<f64> {
    let (sin_lat, cos_lat) = reference.lat.to_radians().sin_cos();
    let (sin_lon, cos_lon) = reference.lon.to_radians().sin_cos();
    Matrix3::new(
        -sin_lon,
        cos_lon,
        0.0,
        -sin_lat * cos_lon,
        -sin_lat * sin_lon,
        cos_lat,
        cos_lat * cos_lon,
        cos_lat * sin_lon,
        sin_lat,
    )
}

pub fn enu_to_geodetic(enu: &Vector3<f64>, reference: &GeodeticPosition) -> GeodeticPosition {
    let ecef = geodetic_to_ecef(reference) + ecef_to_enu_rotation(reference).transpose() * enu;
    ecef_to_geodetic(&ecef)
}

pub fn geodetic_to_enu(p: &GeodeticPosition, reference: &GeodeticPosition) -> Vector3<f64> {
    ecef_to_enu_rotation(reference) * (geodetic_to_ecef(p) - geodetic_to_ecef(reference))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ecef_round_trip() {
        for &(lat, lon, h) in &[
            (47.48591791954986, 19.079377689751166, 120.0),
            (-33.9, 151.2, -20.0),
            (89.9999, -45.0, 10.0),
            (0.0, 180.0, 0.0),
        ] {
            let p = GeodeticPosition::new(lat, lon, h);
            let back = ecef_to_geodetic(&geodetic_to_ecef(&p));
            assert_relative_eq!(back.lat, lat, epsilon = 1e-9);
            assert_relative_eq!(back.lon.rem_euclid(360.0), lon.rem_euclid(360.0), epsilon = 1e-9);
            assert_relative_eq!(back.h, h, epsilon = 1e-6);
        }
    }

    #[test]
    fn east_moves_longitude_only() {
        let reference = GeodeticPosition::new(47.5, 19.0, 100.0);
        let p = enu_to_geodetic(&Vector3::new(100.0, 0.0, 0.0), &reference);
        assert!(p.lon > reference.lon);
        assert_relative_eq!(p.lat, reference.lat, epsilon = 1e-6);
        assert_relative_eq!(
            geodetic_to_enu(&p, &reference),
            Vector3::new(100.0, 0.0, 0.0),
            epsilon = 1e-6
        );
    }

    #[test]
    fn up_moves_height() {
        let reference = GeodeticPosition::new(-10.0, 120.0, 5.0);
        let p = enu_to_geodetic(&Vector3::new(0.0, 0.0, 7.5), &reference);
        assert_relative_eq!(p.h, 12.5, epsilon = 1e-6);
        assert_relative_eq!(p.lat, reference.lat, epsilon = 1e-9);
    }
}
