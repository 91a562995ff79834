use nalgebra::Vector3;
use ndarray::ArrayView1;

use crate::ndarray_utils::min_max;

/// Unit vector of a sky position given in degrees.
pub(crate) fn radec_to_unit(ra: f64, dec: f64) -> Vector3<f64> {
    let (ra, dec) = (ra.to_radians(), dec.to_radians());
    Vector3::new(dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin())
}

/// Great-circle distance in degrees, using the haversine formula.
pub(crate) fn angular_separation(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let (ra1, dec1, ra2, dec2) = (
        ra1.to_radians(),
        dec1.to_radians(),
        ra2.to_radians(),
        dec2.to_radians(),
    );
    let sdec = ((dec2 - dec1) / 2.).sin();
    let sra = ((ra2 - ra1) / 2.).sin();
    let h = sdec * sdec + dec1.cos() * dec2.cos() * sra * sra;
    2. * h.sqrt().min(1.).asin().to_degrees()
}

/// Squared chord length between two unit vectors separated by `angle` degrees.
pub(crate) fn chord_sq(angle: f64) -> f64 {
    let chord = 2. * (angle.to_radians() / 2.).sin();
    chord * chord
}

/// Approximate center `(ra, dec)` of a field, in degrees.
///
/// Right ascensions are first unwrapped around the first source so that fields
/// straddling `ra = 0` get a sensible center. Both coordinates use the mid-range.
pub(crate) fn field_center(ra: ArrayView1<f64>, dec: ArrayView1<f64>) -> Option<(f64, f64)> {
    let ra_ref = *ra.first()?;
    let delta = 180. - ra_ref;
    let unwrapped = ra.mapv(|r| (r + delta).rem_euclid(360.) - delta);
    let (ra_min, ra_max) = min_max(unwrapped.view())?;
    let (dec_min, dec_max) = min_max(dec)?;
    let ra_center = ((ra_min + ra_max) / 2.).rem_euclid(360.);
    Some((ra_center, (dec_min + dec_max) / 2.))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;

    #[test]
    fn separation() {
        assert_abs_diff_eq!(angular_separation(10., 0., 11., 0.), 1., epsilon = 1e-12);
        assert_abs_diff_eq!(angular_separation(0., 89., 180., 89.), 2., epsilon = 1e-10);
        assert_abs_diff_eq!(angular_separation(359.5, 0., 0.5, 0.), 1., epsilon = 1e-12);
    }

    #[test]
    fn chord_matches_unit_vectors() {
        let a = radec_to_unit(30., 20.);
        let b = radec_to_unit(30.5, 20.2);
        let angle = angular_separation(30., 20., 30.5, 20.2);
        assert_abs_diff_eq!((a - b).norm_squared(), chord_sq(angle), epsilon = 1e-14);
    }

    #[test]
    fn center_across_zero() {
        let ra = array![359.8, 0.1, 359.9, 0.2];
        let dec = array![-1., 1., 0.5, 0.];
        let (ra_c, dec_c) = field_center(ra.view(), dec.view()).unwrap();
        assert!((0. ..360.).contains(&ra_c));
        assert_abs_diff_eq!(angular_separation(ra_c, 0., 0., 0.), 0., epsilon = 1e-9);
        assert_abs_diff_eq!(dec_c, 0., epsilon = 1e-12);

        let ra = array![120., 121., 122.];
        let (ra_c, _) = field_center(ra.view(), dec.view()).unwrap();
        assert_abs_diff_eq!(ra_c, 121., epsilon = 1e-12);
    }
}
