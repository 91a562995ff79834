//! Linear color-term correction.
//!
//! Some surveys do not offer a bandpass close to the observed one. For those, the offset
//! `y = mag_b - obs_mag` between the reference filter `b` and the observation is modelled as
//! `y = slope * (mag_a - mag_b) + intercept`, and the observations are shifted by
//! `slope * color` before the zero point is fitted.

use itertools::izip;
use log::debug;
use nalgebra::dvector;
use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};

use crate::ndarray_utils::{finite_mask, mad, median, select};
use crate::simplex::NelderMead;

const MIN_POINTS: usize = 3;
const CLIP_SIGMA: f64 = 3.;

/// Fitted color term.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColorTermFit {
    /// Slope of the color dependence.
    pub slope: f64,
    /// Offset at zero color.
    pub intercept: f64,
    /// Number of stars entering the final fit.
    pub npoints: usize,
}

/// Color term together with the stars it is valid for.
#[derive(Clone, Debug)]
pub(crate) struct ColorCorrection {
    pub(crate) fit: ColorTermFit,
    /// Stars with usable colors; all other stars are dropped from the zero-point fit.
    pub(crate) valid: Array1<bool>,
    /// `mag_a - mag_b` of every star, `NaN` where not valid.
    pub(crate) color: Array1<f64>,
}

impl ColorCorrection {
    /// Color-corrected observed magnitudes of the valid stars.
    pub(crate) fn corrected(&self, obs_mag: ArrayView1<f64>) -> Array1<f64> {
        let shifted = &obs_mag + &(&self.color * self.fit.slope);
        select(shifted.view(), self.valid.view())
    }
}

/// Error-weighted sum of squared residuals of a line.
fn chi_square(
    slope: f64,
    intercept: f64,
    color: ArrayView1<f64>,
    y: ArrayView1<f64>,
    y_err: ArrayView1<f64>,
) -> f64 {
    izip!(color, y, y_err)
        .map(|(c, y, e)| ((y - (slope * c + intercept)) / e).powi(2))
        .sum()
}

fn fit_line(color: ArrayView1<f64>, y: ArrayView1<f64>, y_err: ArrayView1<f64>) -> (f64, f64) {
    let result = NelderMead::new()
        .with_xatol(1e-8)
        .with_fatol(1e-10)
        .with_max_iter(2000)
        .minimize(|p| chi_square(p[0], p[1], color, y, y_err), &dvector![-1., 0.]);
    (result.x[0], result.x[1])
}

/// Fit the color term of a survey.
///
/// # Arguments
/// - `obs_mag`, `obs_err`: Observed magnitudes and errors.
/// - `(mag_a, err_a)`, `(mag_b, err_b)`: Catalog magnitudes of the two reference filters.
/// - `max_err`: Ceiling for the combined errors of the color and of `y`.
///
/// Returns `None` if fewer than three stars have usable colors.
pub(crate) fn fit_color_term(
    obs: (ArrayView1<f64>, ArrayView1<f64>),
    a: (ArrayView1<f64>, ArrayView1<f64>),
    b: (ArrayView1<f64>, ArrayView1<f64>),
    max_err: f64,
) -> Option<ColorCorrection> {
    let (obs_mag, obs_err) = obs;
    let (mag_a, err_a) = a;
    let (mag_b, err_b) = b;

    let color = &mag_a - &mag_b;
    let color_err = Zip::from(&err_a)
        .and(&err_b)
        .map_collect(|ea, eb| (ea * ea + eb * eb).sqrt());
    let y = &mag_b - &obs_mag;
    let y_err = Zip::from(&err_b)
        .and(&obs_err)
        .map_collect(|eb, eo| (eb * eb + eo * eo).sqrt());

    let mut valid = finite_mask(&[color.view(), color_err.view(), y.view(), y_err.view()]);
    Zip::from(&mut valid)
        .and(&color_err)
        .and(&y_err)
        .for_each(|v, ce, ye| *v = *v && *ce < max_err && *ye < max_err);

    let c = select(color.view(), valid.view());
    let yv = select(y.view(), valid.view());
    let ye = select(y_err.view(), valid.view());
    if c.len() < MIN_POINTS {
        debug!("Only {} stars with usable colors, no color term.", c.len());
        return None;
    }

    let (mut slope, mut intercept) = fit_line(c.view(), yv.view(), ye.view());
    let mut npoints = c.len();

    // One clipping pass on the normalized residuals.
    let z: Array1<f64> = izip!(&c, &yv, &ye)
        .map(|(c, y, e)| (y - (slope * c + intercept)) / e)
        .collect();
    if let Some(center) = median(z.view()) {
        let spread = 1.4826 * mad(z.view(), center).unwrap_or(0.);
        if spread > 0. {
            let keep = z.mapv(|z| (z - center).abs() < CLIP_SIGMA * spread);
            let kept = keep.iter().filter(|k| **k).count();
            if kept >= MIN_POINTS && kept < c.len() {
                (slope, intercept) = fit_line(
                    select(c.view(), keep.view()).view(),
                    select(yv.view(), keep.view()).view(),
                    select(ye.view(), keep.view()).view(),
                );
                npoints = kept;
            }
        }
    }

    debug!("Color term slope = {slope:.4}, intercept = {intercept:.4} from {npoints} stars.");
    let color = Zip::from(&color)
        .and(&valid)
        .map_collect(|c, v| if *v { *c } else { f64::NAN });
    Some(ColorCorrection {
        fit: ColorTermFit {
            slope,
            intercept,
            npoints,
        },
        valid,
        color,
    })
}
