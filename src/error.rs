//! Error types.
//!
//! Two kinds are kept apart:
//! [`CalibError`] aborts a calibration job, while [`QueryError`] only
//! disqualifies the survey whose query produced it.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that abort a calibration job.
#[derive(Debug, Error)]
pub enum CalibError {
    /// The observed catalog could not be read or lacks required columns.
    #[error("catalog format error: {0}")]
    CatalogFormat(String),

    /// A survey was requested by name but is not in the registry.
    #[error("unknown survey '{0}'")]
    UnknownSurvey(String),

    /// A filter was requested that no selected survey provides.
    #[error("unknown filter '{filter}'{}", for_survey(survey))]
    UnknownFilter {
        /// Requested filter.
        filter: String,
        /// Survey the filter was looked up in, if a single one was.
        survey: Option<String>,
    },

    /// Invalid configuration or survey registry.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Reading a file failed.
    #[error("failed to read '{path}': {source}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The FITS library reported an error.
    #[cfg(feature = "fits")]
    #[error("failed to read FITS file '{path}': {source}")]
    Fits {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        source: fitsio::errors::Error,
    },
}

impl CalibError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        CalibError::CatalogFormat(msg.into())
    }

    pub(crate) fn unknown_filter(filter: &str, survey: Option<&str>) -> Self {
        CalibError::UnknownFilter {
            filter: filter.to_string(),
            survey: survey.map(str::to_string),
        }
    }
}

/// Errors of a single cross-match query. The affected survey is skipped.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The query did not finish within its time budget.
    #[error("query exceeded timeout of {0:?}")]
    Timeout(Duration),

    /// The backend failed to execute the query.
    #[error("backend error: {message}")]
    Backend {
        /// Backend message.
        message: String,
        /// Whether repeating the query may succeed.
        transient: bool,
    },

    /// The backend returned ragged or miscounted columns.
    #[error("malformed query result: {0}")]
    Shape(String),

    /// `cross_match` was called before the catalog was uploaded.
    #[error("no observed catalog uploaded")]
    NotUploaded,

    /// The backend holds no reference data for the survey.
    #[error("backend has no reference catalog for survey '{0}'")]
    UnknownSurvey(String),
}

impl QueryError {
    /// Whether a retry of the same query may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::Backend { transient: true, .. })
    }
}

fn for_survey(survey: &Option<String>) -> String {
    survey
        .as_ref()
        .map(|s| format!(" for survey '{s}'"))
        .unwrap_or_default()
}
