//! Quality gate and selection of the best calibration.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::mixture::CalibrationResult;

/// Thresholds a fit must pass to be considered good.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Upper bound (exclusive) of the outlier fraction.
    pub max_outlier_fraction: f64,
    /// Lower bound (inclusive) of the number of stars.
    pub min_points: usize,
    /// Upper bound (exclusive) of the scatter.
    pub min_precision: f64,
}

impl QualityThresholds {
    /// Whether `result` passes all thresholds. Fits that did not converge never do.
    pub fn is_good(&self, result: &CalibrationResult) -> bool {
        result.converged
            && result.outlier_fraction < self.max_outlier_fraction
            && result.npoints >= self.min_points
            && result.scatter < self.min_precision
    }
}

/// Fit of one survey filter, `None` if nothing could be fitted.
#[derive(Clone, Debug, PartialEq)]
pub struct FitOutcome {
    /// Survey name.
    pub survey: String,
    /// Filter name.
    pub filter: String,
    /// The fit, if there were usable matches.
    pub result: Option<CalibrationResult>,
}

/// Entry of the diagnostic status map: a good calibration and whether it was chosen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateStatus {
    /// Survey name.
    pub survey: String,
    /// Filter name.
    pub filter: String,
    /// Whether this candidate is the selected calibration.
    pub selected: bool,
}

/// Result of [`select`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    /// Index of the winning outcome.
    pub best: Option<usize>,
    /// Indices of all good outcomes, in declaration order.
    pub good: Vec<usize>,
}

impl Selection {
    /// Status map of all good outcomes.
    pub fn statuses(&self, outcomes: &[FitOutcome]) -> Vec<CandidateStatus> {
        self.good
            .iter()
            .map(|&i| CandidateStatus {
                survey: outcomes[i].survey.clone(),
                filter: outcomes[i].filter.clone(),
                selected: self.best == Some(i),
            })
            .collect()
    }
}

/// Pick the good outcome with the smallest scatter.
///
/// `outcomes` must be in declaration order; on exactly equal scatter the earlier one wins.
pub fn select(outcomes: &[FitOutcome], thresholds: &QualityThresholds) -> Selection {
    let mut best: Option<(usize, f64)> = None;
    let mut good = Vec::new();

    for (i, outcome) in outcomes.iter().enumerate() {
        let Some(result) = &outcome.result else {
            continue;
        };
        if !thresholds.is_good(result) {
            debug!(
                "Rejected {} {}: σ = {:.3}, f_out = {:.3}, n = {}.",
                outcome.survey,
                outcome.filter,
                result.scatter,
                result.outlier_fraction,
                result.npoints
            );
            continue;
        }
        good.push(i);
        if best.is_none_or(|(_, sigma)| result.scatter < sigma) {
            best = Some((i, result.scatter));
        }
    }

    Selection {
        best: best.map(|(i, _)| i),
        good,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ndarray::Array1;

    use super::*;

    pub(crate) fn result(scatter: f64, outlier_fraction: f64, npoints: usize) -> CalibrationResult {
        CalibrationResult {
            zeropoint: 24.,
            scatter,
            outlier_fraction,
            npoints,
            cmag: Array1::zeros(npoints),
            omag: Array1::zeros(npoints),
            log_likelihood: 0.,
            converged: true,
            color_term: None,
        }
    }

    fn outcome(survey: &str, filter: &str, result: Option<CalibrationResult>) -> FitOutcome {
        FitOutcome {
            survey: survey.into(),
            filter: filter.into(),
            result,
        }
    }

    fn thresholds() -> QualityThresholds {
        QualityThresholds {
            max_outlier_fraction: 0.3,
            min_points: 10,
            min_precision: 0.1,
        }
    }

    #[test]
    fn gate() {
        let t = thresholds();
        assert!(t.is_good(&result(0.05, 0.1, 10)));
        assert!(!t.is_good(&result(0.1, 0.1, 10)));
        assert!(!t.is_good(&result(0.05, 0.3, 10)));
        assert!(!t.is_good(&result(0.05, 0.1, 9)));

        let mut unconverged = result(0.05, 0.1, 100);
        unconverged.converged = false;
        assert!(!t.is_good(&unconverged));
    }

    #[test]
    fn smaller_scatter_wins_in_any_order() {
        let a = outcome("SDSS", "r", Some(result(0.05, 0.1, 50)));
        let b = outcome("PS1", "r", Some(result(0.03, 0.1, 50)));

        let forward = [a.clone(), b.clone()];
        let selection = select(&forward, &thresholds());
        assert_eq!(forward[selection.best.unwrap()].survey, "PS1");

        let backward = [b, a];
        let selection = select(&backward, &thresholds());
        assert_eq!(backward[selection.best.unwrap()].survey, "PS1");
    }

    #[test]
    fn ties_go_to_declaration_order() {
        let outcomes = [
            outcome("SDSS", "r", Some(result(0.04, 0.1, 50))),
            outcome("PS1", "r", Some(result(0.04, 0.1, 50))),
        ];
        let selection = select(&outcomes, &thresholds());
        assert_eq!(selection.best, Some(0));
    }

    #[test]
    fn missing_and_bad_results() {
        let outcomes = [
            outcome("GAIA", "G", None),
            outcome("2MASS", "J", Some(result(0.5, 0.1, 50))),
        ];
        let selection = select(&outcomes, &thresholds());
        assert_eq!(selection.best, None);
        assert!(selection.good.is_empty());
        assert!(selection.statuses(&outcomes).is_empty());
    }

    #[test]
    fn status_map_flags_winner() {
        let outcomes = [
            outcome("SDSS", "g", Some(result(0.06, 0.1, 50))),
            outcome("SDSS", "r", None),
            outcome("SDSS", "i", Some(result(0.02, 0.1, 50))),
            outcome("SDSS", "z", Some(result(0.08, 0.5, 50))),
        ];
        let selection = select(&outcomes, &thresholds());
        let statuses = selection.statuses(&outcomes);
        assert_eq!(statuses.len(), 2);
        assert!(!statuses[0].selected);
        assert_eq!(statuses[1].filter, "i");
        assert!(statuses[1].selected);
    }

    #[test]
    fn tightening_never_adds_good_results() {
        let outcomes: Vec<FitOutcome> = (0..60)
            .map(|i| {
                let f = i as f64;
                outcome(
                    "S",
                    &i.to_string(),
                    Some(result(0.01 + 0.003 * f, (f * 0.37) % 0.6, 5 + (i * 7) % 40)),
                )
            })
            .collect();
        let base = thresholds();
        let n_base = select(&outcomes, &base).good.len();

        let tighter = [
            QualityThresholds { max_outlier_fraction: 0.2, ..base },
            QualityThresholds { min_points: 20, ..base },
            QualityThresholds { min_precision: 0.05, ..base },
            QualityThresholds { max_outlier_fraction: 0.1, min_points: 30, min_precision: 0.03 },
        ];
        for t in tighter {
            assert!(select(&outcomes, &t).good.len() <= n_base);
        }
        assert!(n_base > 0);
    }
}
