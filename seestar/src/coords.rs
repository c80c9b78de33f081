//! Equatorial to horizon coordinate conversion
//!
//! Alt/az goto needs the target's azimuth and altitude for the observer at
//! the moment of the slew. Catalog coordinates are J2000; they are precessed
//! to the equinox of date (IAU 1976), rotated by local mean sidereal time
//! (IAU 1982 GMST) and projected onto the local horizon. No refraction is
//! applied. UTC is used in place of TT, which shifts results by well under
//! an arcsecond.

use crate::error::{SeestarError, SeestarResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const ARCSEC_TO_RAD: f64 = std::f64::consts::PI / (180.0 * 3600.0);
const J2000_JD: f64 = 2451545.0;
const UNIX_EPOCH_JD: f64 = 2440587.5;
const DAYS_PER_CENTURY: f64 = 36525.0;

/// Where the telescope stands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObserverLocation {
    /// Geodetic latitude in degrees, north positive
    pub latitude: f64,
    /// Longitude in degrees, east positive
    pub longitude: f64,
    /// Height above sea level in meters
    #[serde(default)]
    pub elevation_m: f64,
}

impl ObserverLocation {
    pub fn new(latitude: f64, longitude: f64, elevation_m: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation_m,
        }
    }

    pub fn validate(&self) -> SeestarResult<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(SeestarError::CoordinateConversion(format!(
                "latitude {} out of range",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=360.0).contains(&self.longitude) {
            return Err(SeestarError::CoordinateConversion(format!(
                "longitude {} out of range",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// Local horizon coordinates in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HorizontalCoordinates {
    /// Measured from north through east, in [0, 360)
    pub azimuth: f64,
    pub altitude: f64,
}

/// Equatorial coordinates: right ascension in hours, declination in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EquatorialCoordinates {
    pub ra_hours: f64,
    pub dec_degrees: f64,
}

/// Julian date of a UTC instant
pub fn julian_date(when: DateTime<Utc>) -> f64 {
    let seconds = when.timestamp() as f64 + f64::from(when.timestamp_subsec_nanos()) * 1e-9;
    seconds / 86400.0 + UNIX_EPOCH_JD
}

fn centuries_since_j2000(jd: f64) -> f64 {
    (jd - J2000_JD) / DAYS_PER_CENTURY
}

fn normalize_degrees(deg: f64) -> f64 {
    let d = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if d >= 360.0 {
        0.0
    } else {
        d
    }
}

/// Greenwich mean sidereal time in degrees
pub fn gmst_degrees(jd: f64) -> f64 {
    let t = centuries_since_j2000(jd);
    normalize_degrees(
        280.46061837 + 360.98564736629 * (jd - J2000_JD) + 0.000387933 * t * t
            - t * t * t / 38_710_000.0,
    )
}

/// IAU 1976 precession angles (zeta, z, theta) in radians
fn precession_angles(jd: f64) -> (f64, f64, f64) {
    let t = centuries_since_j2000(jd);
    let t2 = t * t;
    let t3 = t2 * t;
    let zeta = (2306.2181 * t + 0.30188 * t2 + 0.017998 * t3) * ARCSEC_TO_RAD;
    let z = (2306.2181 * t + 1.09468 * t2 + 0.018203 * t3) * ARCSEC_TO_RAD;
    let theta = (2004.3109 * t - 0.42665 * t2 - 0.041833 * t3) * ARCSEC_TO_RAD;
    (zeta, z, theta)
}

/// Precess J2000 coordinates (radians) to the equinox of `jd`
fn precess_to_date(ra: f64, dec: f64, jd: f64) -> (f64, f64) {
    let (zeta, z, theta) = precession_angles(jd);
    let a = dec.cos() * (ra + zeta).sin();
    let b = theta.cos() * dec.cos() * (ra + zeta).cos() - theta.sin() * dec.sin();
    let c = theta.sin() * dec.cos() * (ra + zeta).cos() + theta.cos() * dec.sin();
    (a.atan2(b) + z, c.clamp(-1.0, 1.0).asin())
}

/// Inverse of [`precess_to_date`]
fn precess_to_j2000(ra: f64, dec: f64, jd: f64) -> (f64, f64) {
    let (zeta, z, theta) = precession_angles(jd);
    let a = dec.cos() * (ra - z).sin();
    let b = theta.cos() * dec.cos() * (ra - z).cos() + theta.sin() * dec.sin();
    let c = -theta.sin() * dec.cos() * (ra - z).cos() + theta.cos() * dec.sin();
    (a.atan2(b) - zeta, c.clamp(-1.0, 1.0).asin())
}

fn validate_equatorial(ra_hours: f64, dec_degrees: f64) -> SeestarResult<()> {
    if !ra_hours.is_finite() || !(0.0..24.0).contains(&ra_hours) {
        return Err(SeestarError::CoordinateConversion(format!(
            "right ascension {}h out of range [0, 24)",
            ra_hours
        )));
    }
    if !dec_degrees.is_finite() || !(-90.0..=90.0).contains(&dec_degrees) {
        return Err(SeestarError::CoordinateConversion(format!(
            "declination {}° out of range [-90, 90]",
            dec_degrees
        )));
    }
    Ok(())
}

/// Convert J2000 RA/Dec to azimuth/altitude for `location` at `when`
pub fn equatorial_to_horizontal(
    ra_hours: f64,
    dec_degrees: f64,
    location: &ObserverLocation,
    when: DateTime<Utc>,
) -> SeestarResult<HorizontalCoordinates> {
    validate_equatorial(ra_hours, dec_degrees)?;
    location.validate()?;

    let jd = julian_date(when);
    let (ra, dec) = precess_to_date((ra_hours * 15.0).to_radians(), dec_degrees.to_radians(), jd);

    let lst = normalize_degrees(gmst_degrees(jd) + location.longitude).to_radians();
    let hour_angle = lst - ra;
    let lat = location.latitude.to_radians();

    let sin_alt = lat.sin() * dec.sin() + lat.cos() * dec.cos() * hour_angle.cos();
    let altitude = sin_alt.clamp(-1.0, 1.0).asin();
    let azimuth = (-dec.cos() * hour_angle.sin())
        .atan2(dec.sin() * lat.cos() - dec.cos() * hour_angle.cos() * lat.sin());

    let result = HorizontalCoordinates {
        azimuth: normalize_degrees(azimuth.to_degrees()),
        altitude: altitude.to_degrees(),
    };
    if !result.azimuth.is_finite() || !result.altitude.is_finite() {
        return Err(SeestarError::CoordinateConversion(
            "transform produced a non-finite result".to_string(),
        ));
    }
    Ok(result)
}

/// Convert azimuth/altitude back to J2000 RA/Dec
pub fn horizontal_to_equatorial(
    horizontal: HorizontalCoordinates,
    location: &ObserverLocation,
    when: DateTime<Utc>,
) -> SeestarResult<EquatorialCoordinates> {
    location.validate()?;
    if !horizontal.azimuth.is_finite() || !horizontal.altitude.is_finite() {
        return Err(SeestarError::CoordinateConversion(
            "horizon coordinates must be finite".to_string(),
        ));
    }

    let jd = julian_date(when);
    let lat = location.latitude.to_radians();
    let az = horizontal.azimuth.to_radians();
    let alt = horizontal.altitude.to_radians();

    let sin_dec = alt.sin() * lat.sin() + alt.cos() * lat.cos() * az.cos();
    let dec = sin_dec.clamp(-1.0, 1.0).asin();
    let hour_angle = (-az.sin() * alt.cos()).atan2(alt.sin() * lat.cos() - alt.cos() * lat.sin() * az.cos());

    let lst = normalize_degrees(gmst_degrees(jd) + location.longitude).to_radians();
    let (ra, dec) = precess_to_j2000(lst - hour_angle, dec, jd);

    Ok(EquatorialCoordinates {
        ra_hours: normalize_degrees(ra.to_degrees()) / 15.0,
        dec_degrees: dec.to_degrees(),
    })
}
