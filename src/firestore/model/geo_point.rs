use std::cmp::Ordering;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};

const LATITUDE_RANGE: RangeInclusive<f64> = -90.0..=90.0;
const LONGITUDE_RANGE: RangeInclusive<f64> = -180.0..=180.0;

/// A latitude/longitude pair in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> FirestoreResult<Self> {
        check_degrees("latitude", latitude, LATITUDE_RANGE)?;
        check_degrees("longitude", longitude, LONGITUDE_RANGE)?;
        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Orders by latitude, then longitude.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.latitude
            .total_cmp(&other.latitude)
            .then_with(|| self.longitude.total_cmp(&other.longitude))
    }
}

fn check_degrees(name: &str, value: f64, range: RangeInclusive<f64>) -> FirestoreResult<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(invalid_argument(format!(
            "{name} {value} is outside [{}, {}]",
            range.start(),
            range.end()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(GeoPoint::new(90.0, -180.0).is_ok());
        assert_eq!(
            GeoPoint::new(90.5, 0.0).unwrap_err().code_str(),
            "firestore/invalid-argument"
        );
        assert!(GeoPoint::new(0.0, 181.0).is_err());
    }

    #[test]
    fn orders_by_latitude_first() {
        let south = GeoPoint::new(-10.0, 50.0).unwrap();
        let north = GeoPoint::new(10.0, -50.0).unwrap();
        assert_eq!(south.compare(&north), Ordering::Less);
        let east = GeoPoint::new(10.0, 20.0).unwrap();
        assert_eq!(north.compare(&east), Ordering::Less);
    }
}
