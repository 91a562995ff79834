//! Cross-match backends.
//!
//! A [`QueryBackend`] receives the observed catalog once per job and then answers one
//! positional cross-match per survey. Production deployments run the survey query templates
//! against a database holding the reference surveys; [`LocalBackend`] performs the same join
//! in memory.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use ndarray::{Array1, ArrayView1};

use crate::catalog::ObservedCatalog;
use crate::error::QueryError;
use crate::matching::{cross_match, SkyTree};
use crate::mixture::MatchedPairs;
use crate::ndarray_utils::select;
use crate::survey::Survey;

/// Executes positional cross-matches against reference surveys.
pub trait QueryBackend {
    /// Make `catalog` available to all following queries.
    fn upload(&mut self, catalog: &ObservedCatalog) -> Result<(), QueryError>;

    /// Match the uploaded catalog against `survey` within `match_dist` degrees.
    ///
    /// Must return within roughly `timeout`, or fail with [`QueryError::Timeout`].
    fn cross_match(
        &self,
        survey: &Survey,
        match_dist: f64,
        timeout: Duration,
    ) -> Result<MatchedColumns, QueryError>;
}

/// Column-aligned result of one cross-match query.
///
/// One row per matched pair: the observed magnitude and error, then one catalog magnitude
/// and one catalog error per survey filter.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchedColumns {
    obs_mag: Array1<f64>,
    obs_magerr: Array1<f64>,
    cat_mags: Vec<Array1<f64>>,
    cat_magerrs: Vec<Array1<f64>>,
}

impl MatchedColumns {
    /// Build from the raw result columns in query order:
    /// `obs_mag, obs_magerr, mag_1..mag_n, err_1..err_n`.
    ///
    /// # Errors
    /// Returns [`QueryError::Shape`] if there are not `2 + 2 * nfilters` columns or their
    /// lengths differ.
    pub fn from_columns(columns: Vec<Array1<f64>>, nfilters: usize) -> Result<Self, QueryError> {
        if columns.len() != 2 + 2 * nfilters {
            return Err(QueryError::Shape(format!(
                "expected {} columns for {nfilters} filters, got {}",
                2 + 2 * nfilters,
                columns.len()
            )));
        }
        let len = columns[0].len();
        if let Some(bad) = columns.iter().find(|c| c.len() != len) {
            return Err(QueryError::Shape(format!(
                "ragged columns of lengths {len} and {}",
                bad.len()
            )));
        }

        let mut columns = columns.into_iter();
        let mut next = || columns.next().unwrap_or_default();
        let obs_mag = next();
        let obs_magerr = next();
        let cat_mags = (0..nfilters).map(|_| next()).collect();
        let cat_magerrs = (0..nfilters).map(|_| next()).collect();
        Ok(Self {
            obs_mag,
            obs_magerr,
            cat_mags,
            cat_magerrs,
        })
    }

    /// Number of matched pairs.
    pub fn len(&self) -> usize {
        self.obs_mag.len()
    }

    /// Whether nothing matched.
    pub fn is_empty(&self) -> bool {
        self.obs_mag.is_empty()
    }

    /// Number of survey filters.
    pub fn nfilters(&self) -> usize {
        self.cat_mags.len()
    }

    /// Observed magnitudes.
    pub fn obs_mag(&self) -> ArrayView1<'_, f64> {
        self.obs_mag.view()
    }

    /// Errors of the observed magnitudes.
    pub fn obs_magerr(&self) -> ArrayView1<'_, f64> {
        self.obs_magerr.view()
    }

    /// Catalog magnitudes and errors of filter `filter`.
    pub fn catalog(&self, filter: usize) -> Option<(ArrayView1<'_, f64>, ArrayView1<'_, f64>)> {
        Some((
            self.cat_mags.get(filter)?.view(),
            self.cat_magerrs.get(filter)?.view(),
        ))
    }

    /// Pairs of filter `filter`, ready for the zero-point fit.
    pub fn pairs(&self, filter: usize) -> Option<MatchedPairs> {
        let (cat_mag, cat_magerr) = self.catalog(filter)?;
        Some(MatchedPairs {
            obs_mag: self.obs_mag.clone(),
            obs_magerr: self.obs_magerr.clone(),
            cat_mag: cat_mag.to_owned(),
            cat_magerr: cat_magerr.to_owned(),
        })
    }

    /// Keep the rows flagged in `mask` and replace the observed magnitudes.
    ///
    /// `obs_mag` must already be restricted to the kept rows.
    pub(crate) fn restrict(&self, mask: ArrayView1<bool>, obs_mag: Array1<f64>) -> Self {
        let keep = |a: &Array1<f64>| select(a.view(), mask);
        Self {
            obs_mag,
            obs_magerr: keep(&self.obs_magerr),
            cat_mags: self.cat_mags.iter().map(keep).collect(),
            cat_magerrs: self.cat_magerrs.iter().map(keep).collect(),
        }
    }
}

/// Reference catalog of one survey: positions plus one magnitude and error column per filter.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceCatalog {
    ra: Array1<f64>,
    dec: Array1<f64>,
    mags: Vec<Array1<f64>>,
    magerrs: Vec<Array1<f64>>,
}

impl ReferenceCatalog {
    /// Bundle the columns of a survey, in the survey's filter order.
    ///
    /// # Errors
    /// Returns [`QueryError::Shape`] if column lengths or counts disagree.
    pub fn new(
        ra: Array1<f64>,
        dec: Array1<f64>,
        mags: Vec<Array1<f64>>,
        magerrs: Vec<Array1<f64>>,
    ) -> Result<Self, QueryError> {
        if mags.len() != magerrs.len() {
            return Err(QueryError::Shape(format!(
                "{} magnitude columns but {} error columns",
                mags.len(),
                magerrs.len()
            )));
        }
        let len = ra.len();
        if dec.len() != len || mags.iter().chain(&magerrs).any(|c| c.len() != len) {
            return Err(QueryError::Shape(
                "reference columns differ in length".into(),
            ));
        }
        Ok(Self {
            ra,
            dec,
            mags,
            magerrs,
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.ra.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.ra.is_empty()
    }

    /// Number of filters.
    pub fn nfilters(&self) -> usize {
        self.mags.len()
    }
}

struct IndexedCatalog {
    catalog: ReferenceCatalog,
    tree: SkyTree,
}

/// In-memory backend joining the uploaded catalog against reference catalogs held per survey.
#[derive(Default)]
pub struct LocalBackend {
    surveys: HashMap<String, IndexedCatalog>,
    uploaded: Option<ObservedCatalog>,
}

impl LocalBackend {
    /// Backend without reference data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the reference catalog of the survey named `survey`, replacing any previous one.
    pub fn with_catalog(mut self, survey: impl Into<String>, catalog: ReferenceCatalog) -> Self {
        self.insert(survey, catalog);
        self
    }

    /// Add the reference catalog of the survey named `survey`, replacing any previous one.
    pub fn insert(&mut self, survey: impl Into<String>, catalog: ReferenceCatalog) {
        let tree = SkyTree::new(catalog.ra.view(), catalog.dec.view());
        self.surveys
            .insert(survey.into(), IndexedCatalog { catalog, tree });
    }
}

impl QueryBackend for LocalBackend {
    fn upload(&mut self, catalog: &ObservedCatalog) -> Result<(), QueryError> {
        self.uploaded = Some(catalog.clone());
        Ok(())
    }

    fn cross_match(
        &self,
        survey: &Survey,
        match_dist: f64,
        timeout: Duration,
    ) -> Result<MatchedColumns, QueryError> {
        let observed = self.uploaded.as_ref().ok_or(QueryError::NotUploaded)?;
        let IndexedCatalog { catalog, tree } = self
            .surveys
            .get(survey.name())
            .ok_or_else(|| QueryError::UnknownSurvey(survey.name().to_string()))?;

        let pairs = cross_match(observed.ra(), observed.dec(), tree, match_dist, timeout)?;
        debug!("{}: {} pairs within {match_dist:e} deg.", survey.name(), pairs.len());

        let take = |column: ArrayView1<f64>, side: usize| -> Array1<f64> {
            pairs.iter().map(|p| column[p[side]]).collect()
        };
        let mut columns = vec![take(observed.mag(), 0), take(observed.magerr(), 0)];
        columns.extend(catalog.mags.iter().map(|c| take(c.view(), 1)));
        columns.extend(catalog.magerrs.iter().map(|c| take(c.view(), 1)));
        MatchedColumns::from_columns(columns, survey.filters().len())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    const ARCSEC: f64 = 1. / 3600.;

    fn survey() -> Survey {
        Survey::new("MOCK", ["g", "r"], "select 1")
    }

    fn reference() -> ReferenceCatalog {
        ReferenceCatalog::new(
            array![10., 10.01, 10.02],
            array![20., 20., 20.],
            vec![array![15., 16., 17.], array![14.5, 15.5, 16.5]],
            vec![array![0.01, 0.02, 0.03], array![0.011, 0.021, 0.031]],
        )
        .unwrap()
    }

    #[test]
    fn matched_columns_shape() {
        let ok = MatchedColumns::from_columns(vec![Array1::zeros(3); 4], 1).unwrap();
        assert_eq!(ok.len(), 3);
        assert_eq!(ok.nfilters(), 1);
        assert!(ok.pairs(1).is_none());

        let miscounted = MatchedColumns::from_columns(vec![Array1::zeros(3); 5], 1);
        assert!(matches!(miscounted, Err(QueryError::Shape(_))));

        let mut ragged = vec![Array1::zeros(3); 4];
        ragged[3] = Array1::zeros(2);
        assert!(matches!(
            MatchedColumns::from_columns(ragged, 1),
            Err(QueryError::Shape(_))
        ));

        let empty = MatchedColumns::from_columns(vec![Array1::zeros(0); 6], 2).unwrap();
        assert!(empty.is_empty());
        assert!(empty.pairs(1).unwrap().is_empty());
    }

    #[test]
    fn local_cross_match() {
        let mut backend = LocalBackend::new().with_catalog("MOCK", reference());
        assert!(matches!(
            backend.cross_match(&survey(), ARCSEC, Duration::from_secs(1)),
            Err(QueryError::NotUploaded)
        ));

        let observed = ObservedCatalog::new(
            vec![10.02, 30., 10.],
            vec![20., 0., 20.],
            vec![-7., -8., -9.],
            vec![0.1, 0.2, 0.3],
        )
        .unwrap();
        backend.upload(&observed).unwrap();

        let columns = backend
            .cross_match(&survey(), ARCSEC, Duration::from_secs(1))
            .unwrap();
        assert_eq!(columns.obs_mag(), array![-7., -9.]);
        let r = columns.pairs(1).unwrap();
        assert_eq!(r.cat_mag, array![16.5, 14.5]);
        assert_eq!(r.cat_magerr, array![0.031, 0.011]);
        assert_eq!(r.obs_magerr, array![0.1, 0.3]);
    }

    #[test]
    fn unknown_survey_and_filter_count() {
        let mut backend = LocalBackend::new().with_catalog("MOCK", reference());
        backend
            .upload(&ObservedCatalog::new(vec![10.], vec![20.], vec![1.], vec![0.1]).unwrap())
            .unwrap();

        let other = Survey::new("OTHER", ["g"], "select 1");
        assert!(matches!(
            backend.cross_match(&other, ARCSEC, Duration::from_secs(1)),
            Err(QueryError::UnknownSurvey(_))
        ));

        let wrong_filters = Survey::new("MOCK", ["g", "r", "i"], "select 1");
        assert!(matches!(
            backend.cross_match(&wrong_filters, ARCSEC, Duration::from_secs(1)),
            Err(QueryError::Shape(_))
        ));
    }

    #[test]
    fn restrict_rows() {
        let columns = MatchedColumns::from_columns(
            vec![
                array![1., 2., 3.],
                array![0.1, 0.2, 0.3],
                array![11., 12., 13.],
                array![0.01, 0.02, 0.03],
            ],
            1,
        )
        .unwrap();
        let restricted = columns.restrict(array![true, false, true].view(), array![5., 6.]);
        assert_eq!(restricted.obs_mag(), array![5., 6.]);
        assert_eq!(restricted.obs_magerr(), array![0.1, 0.3]);
        assert_eq!(restricted.catalog(0).unwrap().0, array![11., 13.]);
    }

    #[test]
    fn blended_reference_entries() {
        let n = 240;
        let mut ra = Array1::linspace(10., 10.1, n);
        let mut dec = Array1::from_elem(n, 5.);
        for i in 0..40 {
            ra[i] = 0.;
            dec[i] = 0.;
        }
        let mags = Array1::linspace(12., 18., n);
        let reference =
            ReferenceCatalog::new(ra, dec, vec![mags.clone()], vec![Array1::from_elem(n, 0.01)])
                .unwrap();
        let mut backend = LocalBackend::new().with_catalog("BLEND", reference);
        let observed =
            ObservedCatalog::new(vec![0., 50.], vec![0., 50.], vec![-9., -8.], vec![0.01, 0.01])
                .unwrap();
        backend.upload(&observed).unwrap();

        let survey = Survey::new("BLEND", ["r"], "select 1");
        let columns = backend
            .cross_match(&survey, ARCSEC, Duration::from_secs(1))
            .unwrap();
        assert_eq!(columns.len(), 40);
        assert!(columns.obs_mag().iter().all(|m| *m == -9.));
        assert_eq!(columns.catalog(0).unwrap().0, mags.slice(ndarray::s![..40]));
    }

    #[test]
    fn ragged_reference() {
        let result = ReferenceCatalog::new(
            array![1., 2.],
            array![1., 2.],
            vec![array![1.]],
            vec![array![1., 2.]],
        );
        assert!(matches!(result, Err(QueryError::Shape(_))));
    }
}
