//! Robust zero-point fit.
//!
//! The residuals `r = obs_mag - cat_mag` of matched stars are modelled as a mixture of
//! - inliers: a normal distribution around the zero point `A` whose width combines the
//!   intrinsic scatter `σ` with the catalog and observed errors of each star, and
//! - outliers: a Laplace distribution of fixed scale [`OUTLIER_SCALE`] around `A`,
//!   weighted by the outlier fraction `frac`.
//!
//! The likelihood is maximized with the [Nelder–Mead simplex](crate::simplex) over unconstrained
//! parameters; [`mapper`] and [`sigma_mapper`] map them onto `frac ∈ (0, 1)` and `σ ≥ ε`.

use std::f64::consts::PI;

use itertools::izip;
use log::debug;
use nalgebra::dvector;
use ndarray::{Array1, ArrayView1};

use crate::colorterm::ColorTermFit;
use crate::error::QueryError;
use crate::ndarray_utils::{finite_mask, mad, median, select};
use crate::simplex::NelderMead;

/// Scale in magnitudes of the outlier component.
pub const OUTLIER_SCALE: f64 = 3.;
/// Smallest scatter the fit can report.
pub const MIN_SCATTER: f64 = 1e-4;
/// Added to every per-star likelihood so that single stars cannot produce `log(0)`.
pub const LIKELIHOOD_FLOOR: f64 = 1e-30;
/// Log-likelihood reported for parameters producing a non-finite sum.
pub const LOG_LIKELIHOOD_SENTINEL: f64 = -1e100;

/// Normal-consistent scale of the median absolute deviation.
const MAD_SCALE: f64 = 1.4826;
/// Bounds of the initial outlier fraction.
const MIN_INITIAL_FRACTION: f64 = 1e-3;
const MAX_INITIAL_FRACTION: f64 = 0.5;

/// Map `-inf..inf` onto `0..1`.
pub fn mapper(x: f64) -> f64 {
    x.atan() / PI + 0.5
}

/// Inverse of [`mapper`].
pub fn mapper_inv(frac: f64) -> f64 {
    ((frac - 0.5) * PI).tan()
}

/// Map `-inf..inf` onto `MIN_SCATTER..inf`.
pub fn sigma_mapper(y: f64) -> f64 {
    y * y + MIN_SCATTER
}

/// Inverse of [`sigma_mapper`] on its non-negative branch.
pub fn sigma_mapper_inv(sigma: f64) -> f64 {
    (sigma - MIN_SCATTER).max(0.).sqrt()
}

/// Matched magnitudes of one survey filter, aligned by star.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchedPairs {
    /// Observed (instrumental) magnitudes.
    pub obs_mag: Array1<f64>,
    /// Errors of `obs_mag`.
    pub obs_magerr: Array1<f64>,
    /// Catalog magnitudes.
    pub cat_mag: Array1<f64>,
    /// Errors of `cat_mag`.
    pub cat_magerr: Array1<f64>,
}

impl MatchedPairs {
    /// Bundle four aligned columns.
    ///
    /// # Errors
    /// Returns [`QueryError::Shape`] if the columns differ in length.
    pub fn new(
        obs_mag: Array1<f64>,
        obs_magerr: Array1<f64>,
        cat_mag: Array1<f64>,
        cat_magerr: Array1<f64>,
    ) -> Result<Self, QueryError> {
        let len = obs_mag.len();
        if [obs_magerr.len(), cat_mag.len(), cat_magerr.len()]
            .iter()
            .any(|l| *l != len)
        {
            return Err(QueryError::Shape(format!(
                "matched columns have lengths {}, {}, {}, {}",
                len,
                obs_magerr.len(),
                cat_mag.len(),
                cat_magerr.len()
            )));
        }
        Ok(Self {
            obs_mag,
            obs_magerr,
            cat_mag,
            cat_magerr,
        })
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.obs_mag.len()
    }

    /// Whether there are no pairs.
    pub fn is_empty(&self) -> bool {
        self.obs_mag.is_empty()
    }

    /// Keep the pairs with finite values and a catalog error below `max_cat_err`.
    pub fn usable(&self, max_cat_err: f64) -> MatchedPairs {
        let mut mask = finite_mask(&[
            self.obs_mag.view(),
            self.obs_magerr.view(),
            self.cat_mag.view(),
            self.cat_magerr.view(),
        ]);
        mask.zip_mut_with(&self.cat_magerr, |m, err| *m = *m && *err < max_cat_err);
        MatchedPairs {
            obs_mag: select(self.obs_mag.view(), mask.view()),
            obs_magerr: select(self.obs_magerr.view(), mask.view()),
            cat_mag: select(self.cat_mag.view(), mask.view()),
            cat_magerr: select(self.cat_magerr.view(), mask.view()),
        }
    }
}

/// Zero-point fit of one survey filter.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationResult {
    /// Zero point `A`; calibrated magnitudes are `obs_mag - zeropoint`.
    pub zeropoint: f64,
    /// Intrinsic scatter `σ` of the inliers.
    pub scatter: f64,
    /// Weight of the outlier component.
    pub outlier_fraction: f64,
    /// Number of stars used in the fit.
    pub npoints: usize,
    /// Catalog magnitudes used in the fit.
    pub cmag: Array1<f64>,
    /// Observed magnitudes used in the fit, after any color correction.
    pub omag: Array1<f64>,
    /// Maximized log-likelihood.
    pub log_likelihood: f64,
    /// Whether the optimizer reached its tolerances.
    pub converged: bool,
    /// Color correction applied to `omag`, if any.
    pub color_term: Option<ColorTermFit>,
}

/// Log-likelihood of the mixture model.
///
/// # Arguments
/// - `params`: `[A, x, y]` with `frac = mapper(x)` and `σ = sigma_mapper(y)`.
/// - `residuals`: `obs_mag - cat_mag`.
/// - `cat_err`, `obs_err`: Per-star errors, added in quadrature to `σ`.
///
/// Returns [`LOG_LIKELIHOOD_SENTINEL`] instead of a non-finite value.
pub fn log_likelihood(
    params: [f64; 3],
    residuals: ArrayView1<f64>,
    cat_err: ArrayView1<f64>,
    obs_err: ArrayView1<f64>,
) -> f64 {
    let [zeropoint, x, y] = params;
    let frac = mapper(x);
    let sigma = sigma_mapper(y);
    let sigma_sq = sigma * sigma;
    let norm = (2. * PI).sqrt();

    let total: f64 = izip!(residuals, cat_err, obs_err)
        .map(|(r, ecat, eobs)| {
            let dev = r - zeropoint;
            let width = (sigma_sq + ecat * ecat + eobs * eobs).sqrt();
            let inlier = (-0.5 * (dev / width).powi(2)).exp() / (width * norm);
            let outlier = (-dev.abs() / OUTLIER_SCALE).exp() / (2. * OUTLIER_SCALE);
            (frac * outlier + (1. - frac) * inlier + LIKELIHOOD_FLOOR).ln()
        })
        .sum();

    if total.is_finite() {
        total
    } else {
        LOG_LIKELIHOOD_SENTINEL
    }
}

/// Initial `(A, σ, frac)` from the median and the median absolute deviation.
fn initial_guess(residuals: ArrayView1<f64>) -> Option<(f64, f64, f64)> {
    let center = median(residuals)?;
    let sigma = MAD_SCALE * mad(residuals, center)?;
    let n_out = residuals
        .iter()
        .filter(|r| (*r - center).abs() > 3. * sigma)
        .count();
    let frac = (n_out as f64 / residuals.len() as f64)
        .clamp(MIN_INITIAL_FRACTION, MAX_INITIAL_FRACTION);
    Some((center, sigma, frac))
}

/// Fit the zero point of one survey filter.
///
/// Only pairs passing [`MatchedPairs::usable`] with `max_cat_err` enter the fit.
/// Returns `None` if no pair is left.
pub fn fit_zeropoint(pairs: &MatchedPairs, max_cat_err: f64) -> Option<CalibrationResult> {
    let used = pairs.usable(max_cat_err);
    if used.is_empty() {
        return None;
    }

    let residuals = &used.obs_mag - &used.cat_mag;
    let (center, sigma, frac) = initial_guess(residuals.view())?;
    let x0 = dvector![center, mapper_inv(frac), sigma_mapper_inv(sigma)];

    let result = NelderMead::new()
        .with_max_iter(2000)
        .with_xatol(1e-6)
        .with_fatol(1e-6)
        .with_spread_map(|p| dvector![p[0], mapper(p[1]), sigma_mapper(p[2])])
        .minimize(
            |p| {
                -log_likelihood(
                    [p[0], p[1], p[2]],
                    residuals.view(),
                    used.cat_magerr.view(),
                    used.obs_magerr.view(),
                )
            },
            &x0,
        );

    let calibration = CalibrationResult {
        zeropoint: result.x[0],
        scatter: sigma_mapper(result.x[2]),
        outlier_fraction: mapper(result.x[1]),
        npoints: used.len(),
        cmag: used.cat_mag,
        omag: used.obs_mag,
        log_likelihood: -result.fun,
        converged: result.converged,
        color_term: None,
    };
    debug!(
        "Fitted ZP = {:.4}, σ = {:.4}, f_out = {:.3} from {} stars in {} iterations.",
        calibration.zeropoint,
        calibration.scatter,
        calibration.outlier_fraction,
        calibration.npoints,
        result.iterations
    );
    Some(calibration)
}

#[cfg(test)]
pub(crate) mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_rand::rand_distr::{Distribution, Normal, Uniform};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    /// Draw from a Laplace distribution by inverting its CDF.
    pub(crate) fn laplace(rng: &mut StdRng, scale: f64) -> f64 {
        let u: f64 = Uniform::new(-0.5, 0.5).sample(rng);
        -scale * u.signum() * (1. - 2. * u.abs()).ln()
    }

    #[test]
    fn mapper_roundtrip() {
        for i in -200..=200 {
            let x = f64::from(i) * 0.05;
            assert!((mapper_inv(mapper(x)) - x).abs() < 1e-10, "x = {x}");
        }
        assert!((mapper_inv(mapper(0.5)) - 0.5).abs() < 1e-10);
        assert_abs_diff_eq!(mapper(0.), 0.5);
    }

    #[test]
    fn sigma_mapper_roundtrip() {
        assert_eq!(sigma_mapper_inv(sigma_mapper(1.)), 1.);
        for i in 0..=100 {
            let x = f64::from(i) * 0.01;
            assert_abs_diff_eq!(sigma_mapper_inv(sigma_mapper(x)), x, epsilon = 1e-9);
        }
        assert_eq!(sigma_mapper_inv(0.), 0.);
        assert!(sigma_mapper(-3.) >= MIN_SCATTER);
    }

    #[test]
    fn degenerate_likelihood_is_sentinel() {
        let e = array![0.01, 0.01];
        let r = array![f64::NAN, 0.];
        assert_eq!(
            log_likelihood([0., 0., 0.1], r.view(), e.view(), e.view()),
            LOG_LIKELIHOOD_SENTINEL
        );
        let r = array![0.01, 0.];
        assert_eq!(
            log_likelihood([f64::NAN, 0., 0.1], r.view(), e.view(), e.view()),
            LOG_LIKELIHOOD_SENTINEL
        );
        // A far outlier only hits the floor.
        let r = array![f64::INFINITY, 0.];
        assert!(log_likelihood([0., 0., 0.1], r.view(), e.view(), e.view()).is_finite());
        let r = array![0.01, -0.01];
        assert!(log_likelihood([0., 0., 0.1], r.view(), e.view(), e.view()).is_finite());
    }

    #[test]
    fn contamination_recovery() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 1000;
        let inlier = Normal::new(0., 0.05).unwrap();
        let uniform = Uniform::new(0., 1.);

        let cat_mag: Array1<f64> = (0..n).map(|_| 12. + 6. * uniform.sample(&mut rng)).collect();
        let residuals: Array1<f64> = (0..n)
            .map(|i| {
                if i % 10 == 0 {
                    25. + laplace(&mut rng, 3.)
                } else {
                    25. + inlier.sample(&mut rng)
                }
            })
            .collect();
        let pairs = MatchedPairs::new(
            &cat_mag + &residuals,
            Array1::zeros(n),
            cat_mag,
            Array1::zeros(n),
        )
        .unwrap();

        let result = fit_zeropoint(&pairs, 0.1).unwrap();
        assert!(result.converged);
        assert_eq!(result.npoints, n);
        assert_abs_diff_eq!(result.zeropoint, 25., epsilon = 0.05);
        assert!(result.scatter > 0.025 && result.scatter < 0.1, "σ = {}", result.scatter);
        assert_abs_diff_eq!(result.outlier_fraction, 0.1, epsilon = 0.05);
    }

    #[test]
    fn clean_field_converges() {
        // No outliers and all of the spread explained by the errors: frac and σ run to
        // their bounds.
        let n = 200;
        let cat_mag = Array1::linspace(13., 18., n);
        let offsets: Array1<f64> = (0..n).map(|i| 0.01 * ((i % 5) as f64 - 2.)).collect();
        let pairs = MatchedPairs::new(
            &cat_mag + 24. + &offsets,
            Array1::from_elem(n, 0.01),
            cat_mag,
            Array1::from_elem(n, 0.01),
        )
        .unwrap();

        let result = fit_zeropoint(&pairs, 0.1).unwrap();
        assert!(result.converged);
        assert_abs_diff_eq!(result.zeropoint, 24., epsilon = 0.005);
        assert!(result.outlier_fraction < 0.01, "frac = {}", result.outlier_fraction);
        assert!(result.scatter < 0.01, "σ = {}", result.scatter);
    }

    #[test]
    fn errors_widen_inliers() {
        let mut rng = StdRng::seed_from_u64(11);
        let noise = Normal::new(0., 0.1).unwrap();
        let n = 400;
        let cat_mag = Array1::from_elem(n, 15.);
        let obs_mag: Array1<f64> = (0..n).map(|_| 10. + noise.sample(&mut rng)).collect();
        // All of the spread is explained by the per-star errors.
        let pairs = MatchedPairs::new(
            obs_mag,
            Array1::from_elem(n, 0.07),
            cat_mag,
            Array1::from_elem(n, 0.07),
        )
        .unwrap();

        let result = fit_zeropoint(&pairs, 0.1).unwrap();
        assert_abs_diff_eq!(result.zeropoint, -5., epsilon = 0.02);
        assert!(result.scatter < 0.05, "σ = {}", result.scatter);
    }

    #[test]
    fn masking_and_empty_input() {
        let pairs = MatchedPairs::new(
            array![10., 11., f64::NAN, 13.],
            array![0.01, 0.01, 0.01, 0.01],
            array![12., f64::NAN, 14., 15.],
            array![0.01, 0.01, 0.01, 0.5],
        )
        .unwrap();
        let usable = pairs.usable(0.1);
        assert_eq!(usable.len(), 1);
        assert_eq!(usable.cat_mag, array![12.]);

        let empty = MatchedPairs::new(
            Array1::zeros(0),
            Array1::zeros(0),
            Array1::zeros(0),
            Array1::zeros(0),
        )
        .unwrap();
        assert!(fit_zeropoint(&empty, 0.1).is_none());

        let all_bad = MatchedPairs::new(array![1.], array![0.1], array![2.], array![0.3]).unwrap();
        assert!(fit_zeropoint(&all_bad, 0.1).is_none());
    }

    #[test]
    fn ragged_pairs_are_rejected() {
        let err = MatchedPairs::new(array![1., 2.], array![0.1], array![1., 2.], array![0.1, 0.1]);
        assert!(matches!(err, Err(QueryError::Shape(_))));
    }
}
