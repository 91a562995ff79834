//! Calibration jobs: query every survey, fit, select, and report.

use std::error::Error;
use std::time::Instant;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::backend::{MatchedColumns, QueryBackend};
use crate::catalog::ObservedCatalog;
use crate::colorterm::{ColorTermFit, fit_color_term};
use crate::config::CalibConfig;
use crate::error::{CalibError, QueryError};
use crate::geometry::field_center;
use crate::matching::SkyTree;
use crate::mixture::{CalibrationResult, fit_zeropoint};
use crate::ndarray_utils::max_below;
use crate::quality::{CandidateStatus, FitOutcome, select};
use crate::survey::{Survey, SurveyRegistry};

/// Magnitude error marking an upper limit.
pub const UPPER_LIMIT_ERR: f64 = -1.;

/// Which surveys a job queries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SurveySelection {
    /// Every survey of the registry.
    #[default]
    All,
    /// A single survey, by name.
    Named(String),
    /// Every survey offering the filter; fitting is restricted to it.
    /// A different filter forced with [`Calibrator::with_filter`] is a configuration error.
    OfferingFilter(String),
}

/// Outcome of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum CalibrationStatus {
    /// A good calibration was found.
    Good,
    /// No survey produced a good calibration.
    NotFound,
}

impl CalibrationStatus {
    /// Numeric status: `0` for [`Good`](Self::Good), `-1` for [`NotFound`](Self::NotFound).
    pub fn code(self) -> i32 {
        match self {
            CalibrationStatus::Good => 0,
            CalibrationStatus::NotFound => -1,
        }
    }
}

impl From<CalibrationStatus> for i32 {
    fn from(status: CalibrationStatus) -> Self {
        status.code()
    }
}

impl TryFrom<i32> for CalibrationStatus {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(CalibrationStatus::Good),
            -1 => Ok(CalibrationStatus::NotFound),
            _ => Err(format!("invalid calibration status {code}")),
        }
    }
}

/// Calibrated magnitude of the target.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetPhotometry {
    /// Calibrated magnitude, or the limiting magnitude if the target was not detected.
    pub mag: f64,
    /// Magnitude error; [`UPPER_LIMIT_ERR`] for upper limits.
    pub magerr: f64,
}

impl TargetPhotometry {
    /// Whether this is an upper limit rather than a detection.
    pub fn is_upper_limit(&self) -> bool {
        self.magerr == UPPER_LIMIT_ERR
    }
}

/// Complete result of a calibration job.
///
/// The calibration fields are `None` unless `status` is [`CalibrationStatus::Good`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDecision {
    /// Whether a good calibration was found.
    pub status: CalibrationStatus,
    /// Survey of the selected calibration.
    pub survey: Option<String>,
    /// Filter of the selected calibration.
    pub filter: Option<String>,
    /// Zero point; calibrated magnitudes are `mag - zeropoint`.
    pub zeropoint: Option<f64>,
    /// Intrinsic scatter of the selected fit.
    pub scatter: Option<f64>,
    /// Outlier fraction of the selected fit.
    pub outlier_fraction: Option<f64>,
    /// Number of stars in the selected fit.
    pub npoints: Option<usize>,
    /// Color term applied before the selected fit.
    pub color_term: Option<ColorTermFit>,
    /// Wall-clock duration of the job.
    pub execution_time_seconds: f64,
    /// Photometry of the target, if one was given and a calibration was found.
    pub target: Option<TargetPhotometry>,
    /// All good calibrations in declaration order, the selected one flagged.
    pub candidates: Vec<CandidateStatus>,
}

impl CalibrationDecision {
    fn not_found(start: Instant, candidates: Vec<CandidateStatus>) -> Self {
        Self {
            status: CalibrationStatus::NotFound,
            survey: None,
            filter: None,
            zeropoint: None,
            scatter: None,
            outlier_fraction: None,
            npoints: None,
            color_term: None,
            execution_time_seconds: start.elapsed().as_secs_f64(),
            target: None,
            candidates,
        }
    }
}

/// A good calibration as handed to a [`ResultObserver`].
#[derive(Clone, Copy, Debug)]
pub struct GoodCalibration<'r> {
    /// Survey name.
    pub survey: &'r str,
    /// Filter name.
    pub filter: &'r str,
    /// The fit.
    pub result: &'r CalibrationResult,
    /// Whether this is the selected calibration.
    pub selected: bool,
}

/// Consumer of the good calibrations of a job, called after selection.
///
/// Errors are logged and do not affect the decision.
pub trait ResultObserver {
    /// Receive all good calibrations in declaration order.
    fn observe(&mut self, good: &[GoodCalibration<'_>]) -> Result<(), Box<dyn Error>>;
}

/// Survey of a job together with the indices of the filters to fit.
#[derive(Clone, Debug)]
struct Planned<'r> {
    survey: &'r Survey,
    filters: Vec<usize>,
}

/// Builder and runner of calibration jobs.
///
/// For details, check the crate-level documentation.
pub struct Calibrator<'a, B: QueryBackend> {
    registry: &'a SurveyRegistry,
    backend: B,
    config: CalibConfig,
    selection: SurveySelection,
    filter: Option<String>,
    target: Option<(f64, f64)>,
    target_radius: Option<f64>,
    observers: Vec<Box<dyn ResultObserver>>,
    notify: bool,
}

impl<'a, B: QueryBackend> Calibrator<'a, B> {
    /// Create a new instance with the default [`CalibConfig`], querying all surveys.
    /// Use `with_` functions to set parameters.
    pub fn new(registry: &'a SurveyRegistry, backend: B) -> Self {
        Self {
            registry,
            backend,
            config: CalibConfig::default(),
            selection: SurveySelection::All,
            filter: None,
            target: None,
            target_radius: None,
            observers: Vec::new(),
            notify: true,
        }
    }

    /// Replace all tunable parameters.
    pub fn with_config(mut self, config: CalibConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the cross-match radius in degrees.
    pub fn with_match_dist(mut self, match_dist: f64) -> Self {
        self.config.match_dist = match_dist;
        self
    }

    /// Report photometry of the source at `(ra, dec)` degrees.
    pub fn with_target(mut self, ra: f64, dec: f64) -> Self {
        self.target = Some((ra, dec));
        self
    }

    /// Set the radius, in degrees, within which a source counts as the target.
    /// Defaults to the match radius.
    pub fn with_target_radius(mut self, radius: f64) -> Self {
        self.target_radius = Some(radius);
        self
    }

    /// Choose the surveys to query.
    pub fn with_surveys(mut self, selection: SurveySelection) -> Self {
        self.selection = selection;
        self
    }

    /// Fit only this filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Hand the good calibrations to `observer` after selection.
    pub fn with_observer(mut self, observer: impl ResultObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Do not call any observer, e.g. to skip plotting.
    pub fn without_observers(mut self) -> Self {
        self.notify = false;
        self
    }

    /// Parameters of the job.
    pub fn config(&self) -> &CalibConfig {
        &self.config
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Calibrate `catalog`, processing surveys one after another.
    ///
    /// # Errors
    /// Only invalid parameters or unknown survey/filter requests fail.
    /// Failing surveys are skipped.
    /// If none succeeds, the status is [`CalibrationStatus::NotFound`].
    pub fn run(&mut self, catalog: &ObservedCatalog) -> Result<CalibrationDecision, CalibError> {
        let start = Instant::now();
        let Some(plan) = self.prepare(catalog)? else {
            return Ok(CalibrationDecision::not_found(start, Vec::new()));
        };

        let outcomes = plan
            .iter()
            .flat_map(|planned| calibrate_survey(&self.backend, &self.config, planned))
            .collect();
        Ok(self.finish(catalog, outcomes, start))
    }

    /// Resolve the survey selection and forced filter.
    fn plan(&self) -> Result<Vec<Planned<'a>>, CalibError> {
        let surveys: Vec<&'a Survey> = match &self.selection {
            SurveySelection::All => self.registry.iter().collect(),
            SurveySelection::Named(name) => vec![self.registry.get(name)?],
            SurveySelection::OfferingFilter(filter) => {
                let surveys: Vec<_> = self
                    .registry
                    .iter()
                    .filter(|s| s.has_filter(filter))
                    .collect();
                if surveys.is_empty() {
                    return Err(CalibError::unknown_filter(filter, None));
                }
                surveys
            }
        };

        let filter = match (&self.filter, &self.selection) {
            (Some(forced), SurveySelection::OfferingFilter(offered)) if forced != offered => {
                return Err(CalibError::Config(format!(
                    "forced filter '{forced}' conflicts with surveys offering '{offered}'"
                )));
            }
            (Some(filter), _) => Some(filter),
            (None, SurveySelection::OfferingFilter(filter)) => Some(filter),
            (None, _) => None,
        };
        let Some(filter) = filter else {
            return Ok(surveys
                .into_iter()
                .map(|survey| Planned {
                    survey,
                    filters: (0..survey.filters().len()).collect(),
                })
                .collect());
        };

        if let SurveySelection::Named(_) = self.selection {
            let survey = surveys[0];
            return Ok(vec![Planned {
                survey,
                filters: vec![survey.filter_index(filter)?],
            }]);
        }
        let plan: Vec<_> = surveys
            .into_iter()
            .filter_map(|survey| {
                let index = survey.filter_index(filter).ok()?;
                Some(Planned {
                    survey,
                    filters: vec![index],
                })
            })
            .collect();
        if plan.is_empty() {
            return Err(CalibError::unknown_filter(filter, None));
        }
        Ok(plan)
    }

    /// Validate the request, upload the catalog and drop surveys not covering the field.
    ///
    /// Returns `None` if the upload failed.
    fn prepare(
        &mut self,
        catalog: &ObservedCatalog,
    ) -> Result<Option<Vec<Planned<'a>>>, CalibError> {
        self.config.validate()?;
        if let Some(radius) = self.target_radius
            && !(radius.is_finite() && radius > 0.)
        {
            return Err(CalibError::Config(format!(
                "target radius must be positive, got {radius}"
            )));
        }
        let plan = self.plan()?;
        info!(
            "Calibrating {} sources against {} surveys.",
            catalog.len(),
            plan.len()
        );

        if let Err(e) = self.backend.upload(catalog) {
            error!("Failed to upload the catalog: {e}");
            return Ok(None);
        }

        let Some((ra, dec)) = field_center(catalog.ra(), catalog.dec()) else {
            return Ok(Some(plan));
        };
        debug!("Field center at ({ra:.5}, {dec:.5}).");
        Ok(Some(
            plan.into_iter()
                .filter(|planned| {
                    let covered = planned.survey.check_pos(ra, dec);
                    if !covered {
                        info!("{} does not cover the field, skipped.", planned.survey.name());
                    }
                    covered
                })
                .collect(),
        ))
    }

    /// Select, notify observers and assemble the decision.
    fn finish(
        &mut self,
        catalog: &ObservedCatalog,
        outcomes: Vec<FitOutcome>,
        start: Instant,
    ) -> CalibrationDecision {
        let selection = select(&outcomes, &self.config.thresholds());

        if self.notify && !self.observers.is_empty() {
            let good: Vec<GoodCalibration> = selection
                .good
                .iter()
                .filter_map(|&i| {
                    let outcome = &outcomes[i];
                    Some(GoodCalibration {
                        survey: &outcome.survey,
                        filter: &outcome.filter,
                        result: outcome.result.as_ref()?,
                        selected: selection.best == Some(i),
                    })
                })
                .collect();
            for observer in &mut self.observers {
                if let Err(e) = observer.observe(&good) {
                    warn!("Result observer failed: {e}");
                }
            }
        }

        let candidates = selection.statuses(&outcomes);
        let best = selection.best.and_then(|i| {
            let outcome = &outcomes[i];
            outcome.result.as_ref().map(|result| (outcome, result))
        });
        let Some((outcome, result)) = best else {
            info!("No good calibration among {} fits.", outcomes.len());
            return CalibrationDecision::not_found(start, candidates);
        };

        let target = self.target_photometry(catalog, result.zeropoint);
        let decision = CalibrationDecision {
            status: CalibrationStatus::Good,
            survey: Some(outcome.survey.clone()),
            filter: Some(outcome.filter.clone()),
            zeropoint: Some(result.zeropoint),
            scatter: Some(result.scatter),
            outlier_fraction: Some(result.outlier_fraction),
            npoints: Some(result.npoints),
            color_term: result.color_term,
            execution_time_seconds: start.elapsed().as_secs_f64(),
            target,
            candidates,
        };
        info!(
            "Selected {} {}: ZP = {:.3} ± {:.3} from {} stars.",
            outcome.survey, outcome.filter, result.zeropoint, result.scatter, result.npoints
        );
        decision
    }

    /// Magnitude of the source nearest to the target, or an upper limit if there is none.
    fn target_photometry(
        &self,
        catalog: &ObservedCatalog,
        zeropoint: f64,
    ) -> Option<TargetPhotometry> {
        let (ra, dec) = self.target?;
        let radius = self.target_radius.unwrap_or(self.config.match_dist);

        let tree = SkyTree::new(catalog.ra(), catalog.dec());
        if let Some((i, separation)) = tree.nearest(ra, dec)
            && separation <= radius
        {
            debug!("Target is source {i}, {:.2}\" off.", separation * 3600.);
            return Some(TargetPhotometry {
                mag: catalog.mag()[i] - zeropoint,
                magerr: catalog.magerr()[i],
            });
        }

        let limit = max_below(catalog.mag(), self.config.good_max_mag)?;
        debug!("Target not detected, limit {limit:.3}.");
        Some(TargetPhotometry {
            mag: limit - zeropoint,
            magerr: UPPER_LIMIT_ERR,
        })
    }
}

/// Query one survey, retrying transient failures.
fn query<B: QueryBackend + ?Sized>(
    backend: &B,
    config: &CalibConfig,
    survey: &Survey,
) -> Result<MatchedColumns, QueryError> {
    let mut attempt = 0;
    loop {
        match backend.cross_match(survey, config.match_dist, config.query_timeout()) {
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                let backoff = config.retry_backoff(attempt);
                warn!(
                    "Query of {} failed ({e}), retrying in {backoff:?}.",
                    survey.name()
                );
                std::thread::sleep(backoff);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Apply the survey's color term, if it has one and enough stars have colors.
fn color_correct(
    survey: &Survey,
    columns: MatchedColumns,
    max_err: f64,
) -> (MatchedColumns, Option<ColorTermFit>) {
    let Some(color_term) = survey.color_term() else {
        return (columns, None);
    };
    let (Ok(blue), Ok(red)) = (
        survey.filter_index(&color_term.blue),
        survey.filter_index(&color_term.red),
    ) else {
        return (columns, None);
    };
    let (Some(blue), Some(red)) = (columns.catalog(blue), columns.catalog(red)) else {
        return (columns, None);
    };

    match fit_color_term((columns.obs_mag(), columns.obs_magerr()), blue, red, max_err) {
        Some(correction) => {
            debug!(
                "{}: color term {:.4} · ({} - {}).",
                survey.name(),
                correction.fit.slope,
                color_term.blue,
                color_term.red
            );
            let obs_mag = correction.corrected(columns.obs_mag());
            (
                columns.restrict(correction.valid.view(), obs_mag),
                Some(correction.fit),
            )
        }
        None => {
            warn!("{}: too few stars for a color term, fitting uncorrected.", survey.name());
            (columns, None)
        }
    }
}

/// Query one survey and fit its filters. A failing query yields no outcome.
fn calibrate_survey<B: QueryBackend + ?Sized>(
    backend: &B,
    config: &CalibConfig,
    planned: &Planned<'_>,
) -> Vec<FitOutcome> {
    let survey = planned.survey;
    info!("Querying {}.", survey.name());
    let columns = match query(backend, config, survey) {
        Ok(columns) => columns,
        Err(e) => {
            warn!("Skipping {}: {e}", survey.name());
            return Vec::new();
        }
    };
    debug!("{}: {} matches.", survey.name(), columns.len());

    let (columns, color_term) = color_correct(survey, columns, config.color_max_err);
    planned
        .filters
        .iter()
        .map(|&i| {
            let result = columns
                .pairs(i)
                .and_then(|pairs| fit_zeropoint(&pairs, config.max_cat_err))
                .map(|result| CalibrationResult {
                    color_term,
                    ..result
                });
            FitOutcome {
                survey: survey.name().to_string(),
                filter: survey.filters()[i].clone(),
                result,
            }
        })
        .collect()
}

#[cfg(feature = "parallel")]
mod parallel {
    use rayon::prelude::*;

    use super::*;

    impl<B: QueryBackend + Sync> Calibrator<'_, B> {
        /// Calibrate `catalog`, processing surveys in parallel.
        ///
        /// The decision is the same as with [`run`](Calibrator::run()).
        pub fn run_par(
            &mut self,
            catalog: &ObservedCatalog,
        ) -> Result<CalibrationDecision, CalibError> {
            let start = Instant::now();
            let Some(plan) = self.prepare(catalog)? else {
                return Ok(CalibrationDecision::not_found(start, Vec::new()));
            };

            let backend = &self.backend;
            let config = &self.config;
            let outcomes: Vec<Vec<FitOutcome>> = plan
                .par_iter()
                .map(|planned| calibrate_survey(backend, config, planned))
                .collect();
            Ok(self.finish(catalog, outcomes.into_iter().flatten().collect(), start))
        }
    }
}
