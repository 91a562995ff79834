#![warn(missing_docs)]

//! Robust photometric calibration of source catalogs against reference sky surveys. \
//! Given a catalog of instrumental magnitudes extracted from an image (e.g. by SExtractor),
//! the catalog is cross-matched against a set of reference surveys and a zero point is fitted
//! for every survey filter. The fit is a maximum-likelihood mixture of a Gaussian inlier
//! population and a broad Laplacian outlier population, so mismatches, variable stars and
//! blends do not drag the zero point. The best calibration across all surveys is then selected.
//!
//! ## Interface
//! The central struct of this library is [`Calibrator`]. It holds a reference to an immutable
//! [`SurveyRegistry`] and a [`QueryBackend`] that performs the positional cross-matches.
//! Additional parameters are set via `Calibrator::with_*()` functions.
//!
//! Example:
//! ```rust,ignore
//! let registry = SurveyRegistry::builtin()?;
//! let catalog = ObservedCatalog::from_path("field.cat", None)?;
//! let decision = Calibrator::new(&registry, backend)
//!     .with_match_dist(2. / 3600.)
//!     .with_target(271.52, -29.11)
//!     .run(&catalog)?;
//! ```
//!
//! The returned [`CalibrationDecision`] is always complete: if no survey produced a good
//! calibration, its status is [`CalibrationStatus::NotFound`] instead of an error.
//! Only problems with the input catalog or an unknown survey/filter request abort a job.
//!
//! ## Parameters
//! - `match_dist`: Maximum separation, in degrees, between an observed source and a catalog entry.
//! - `max_cat_err`: Catalog magnitudes with larger errors are not used in the fit.
//! - `max_outlier_fraction`, `min_points`, `min_precision`: Thresholds a fit must pass to count
//!     as good.
//!     The good fit with the smallest scatter wins.
//! - `good_max_mag`: Observed magnitudes at or beyond this value are unreliable.
//!     Used for upper limits of undetected targets.
//!
//! All defaults live in [`CalibConfig`].
//!
//! ## Features
//! - `parallel`: [`Calibrator::run_par()`] processes surveys on the `rayon` thread pool.
//! - `fits`: FITS catalogs and footprint maps.
//! - `plot`: [`plot::PlotRenderer`], a PNG grid of the good fits.

pub mod backend;
pub mod catalog;
pub(crate) mod colorterm;
pub mod config;
pub mod engine;
pub mod error;
#[cfg(feature = "fits")]
pub(crate) mod fits;
pub(crate) mod geometry;
pub mod healpix;
pub(crate) mod matching;
pub mod mixture;
pub(crate) mod ndarray_utils;
#[cfg(feature = "plot")]
pub mod plot;
pub mod quality;
pub(crate) mod sextractor;
pub mod simplex;
pub mod survey;

pub use backend::{LocalBackend, MatchedColumns, QueryBackend, ReferenceCatalog};
pub use catalog::{CatalogType, ObservedCatalog};
pub use colorterm::ColorTermFit;
pub use config::CalibConfig;
pub use engine::{
    CalibrationDecision, CalibrationStatus, Calibrator, GoodCalibration, ResultObserver,
    SurveySelection, TargetPhotometry, UPPER_LIMIT_ERR,
};
pub use error::{CalibError, QueryError};
pub use mixture::{CalibrationResult, MatchedPairs};
pub use ndarray_utils::IntoNdarray1;
pub use quality::{CandidateStatus, FitOutcome, QualityThresholds, Selection};
pub use survey::{ColorTerm, Footprint, Survey, SurveyRegistry};

/// A generic float trait such that the numerical helpers are generic over `f32`/`f64`.
///
/// This trait is automatically implemented for all types implementing the supertraits.
/// Particularly, this includes `f32` and `f64`.
/// [`num_traits::Float`] is not a supertrait: both traits define the basic math functions,
/// and every call would have to name its provider.
pub trait Float: Copy + Default + nalgebra::RealField + num_traits::FromPrimitive {}

impl<F> Float for F where F: Copy + Default + nalgebra::RealField + num_traits::FromPrimitive {}

/// Lossless conversion of an `f64` literal into `F`.
#[inline]
pub(crate) fn lit<F: Float>(x: f64) -> F {
    nalgebra::convert(x)
}
