//! Reference surveys.
//!
//! A [`Survey`] declares the filters a reference catalog provides, the query used to
//! cross-match against it and, optionally, its sky coverage and a color term.
//! Surveys are collected in an immutable [`SurveyRegistry`], which is built once and then
//! shared by reference.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::CalibError;
use crate::healpix;

/// Placeholder for the match radius in degrees in query templates.
pub const MATCH_DIST_PLACEHOLDER: &str = "{matchDist}";

const BUILTIN_SURVEYS: &str = include_str!("../data/surveys.toml");

/// Reference filter pair of a color term.
///
/// The color is `blue - red`, and the observed magnitudes are compared against `red`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorTerm {
    /// Bluer filter of the color index.
    pub blue: String,
    /// Redder filter of the color index; also the reference magnitude.
    pub red: String,
}

impl ColorTerm {
    /// Create a new instance.
    pub fn new(blue: impl Into<String>, red: impl Into<String>) -> Self {
        Self {
            blue: blue.into(),
            red: red.into(),
        }
    }
}

/// Sky coverage of a survey as a set of HEALPix pixels (NESTED ordering).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Footprint {
    nside: u32,
    pixels: HashSet<u64>,
}

impl Footprint {
    /// Footprint covering the given pixels.
    pub fn from_pixels(
        nside: u32,
        pixels: impl IntoIterator<Item = u64>,
    ) -> Result<Self, CalibError> {
        if !healpix::is_valid_nside(nside) {
            return Err(CalibError::Config(format!(
                "footprint nside {nside} is not a power of two"
            )));
        }
        let npix = healpix::npix(nside);
        let pixels: HashSet<u64> = pixels.into_iter().collect();
        if let Some(bad) = pixels.iter().find(|p| **p >= npix) {
            return Err(CalibError::Config(format!(
                "footprint pixel {bad} out of range for nside {nside}"
            )));
        }
        Ok(Self { nside, pixels })
    }

    /// Footprint from a full-sky map; pixels with a positive value are covered.
    pub fn from_map(nside: u32, map: &[f64]) -> Result<Self, CalibError> {
        let npix = healpix::npix(nside);
        if map.len() as u64 != npix {
            return Err(CalibError::Config(format!(
                "footprint map has {} pixels, expected {npix} for nside {nside}",
                map.len()
            )));
        }
        let covered = map
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > 0.)
            .map(|(i, _)| i as u64);
        Self::from_pixels(nside, covered)
    }

    /// Resolution of the map.
    pub fn nside(&self) -> u32 {
        self.nside
    }

    /// Number of covered pixels.
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    /// Whether no pixel is covered.
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Whether the pixel of `(ra, dec)` or one of its neighbours is covered.
    pub fn contains(&self, ra: f64, dec: f64) -> bool {
        let pix = healpix::ang2pix_nest(self.nside, ra, dec);
        self.pixels.contains(&pix)
            || healpix::neighbours_nest(self.nside, pix)
                .into_iter()
                .flatten()
                .any(|nb| self.pixels.contains(&nb))
    }
}

/// A reference survey.
#[derive(Clone, Debug, PartialEq)]
pub struct Survey {
    name: String,
    filters: Vec<String>,
    query: String,
    footprint: Option<Footprint>,
    color_term: Option<ColorTerm>,
}

impl Survey {
    /// Create a survey without footprint or color term.
    /// Use `with_` functions to add them.
    ///
    /// # Arguments
    /// - `name`: Unique name.
    /// - `filters`: Filters in the order the query returns their columns.
    /// - `query`: Cross-match query template, see [`MATCH_DIST_PLACEHOLDER`].
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        filters: impl IntoIterator<Item = S>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            filters: filters.into_iter().map(Into::into).collect(),
            query: query.into(),
            footprint: None,
            color_term: None,
        }
    }

    /// Restrict the survey to a footprint.
    pub fn with_footprint(mut self, footprint: Footprint) -> Self {
        self.footprint = Some(footprint);
        self
    }

    /// Correct observations with a color term before fitting.
    pub fn with_color_term(mut self, color_term: ColorTerm) -> Self {
        self.color_term = Some(color_term);
        self
    }

    /// Name of the survey.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filters in column order.
    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Whether the survey provides `filter`.
    pub fn has_filter(&self, filter: &str) -> bool {
        self.filters.iter().any(|f| f == filter)
    }

    /// Column position of `filter`.
    pub fn filter_index(&self, filter: &str) -> Result<usize, CalibError> {
        self.filters
            .iter()
            .position(|f| f == filter)
            .ok_or_else(|| CalibError::unknown_filter(filter, Some(&self.name)))
    }

    /// Sky coverage, if declared.
    pub fn footprint(&self) -> Option<&Footprint> {
        self.footprint.as_ref()
    }

    /// Color term, if the survey requires one.
    pub fn color_term(&self) -> Option<&ColorTerm> {
        self.color_term.as_ref()
    }

    /// Raw query template.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Query with the match radius filled in.
    pub fn render_query(&self, match_dist: f64) -> String {
        self.query
            .replace(MATCH_DIST_PLACEHOLDER, &format!("{match_dist:e}"))
    }

    /// Whether `(ra, dec)` in degrees may lie inside the survey.
    ///
    /// Always true if no footprint is declared.
    pub fn check_pos(&self, ra: f64, dec: f64) -> bool {
        self.footprint
            .as_ref()
            .is_none_or(|footprint| footprint.contains(ra, dec))
    }

    fn validate(&self) -> Result<(), CalibError> {
        if self.name.is_empty() {
            return Err(CalibError::Config("survey without name".into()));
        }
        if self.filters.is_empty() {
            return Err(CalibError::Config(format!(
                "survey '{}' declares no filters",
                self.name
            )));
        }
        if let Some(duplicate) = self.filters.iter().duplicates().next() {
            return Err(CalibError::Config(format!(
                "survey '{}' declares filter '{duplicate}' twice",
                self.name
            )));
        }
        if let Some(color_term) = &self.color_term {
            for filter in [&color_term.blue, &color_term.red] {
                if !self.has_filter(filter) {
                    return Err(CalibError::Config(format!(
                        "color term of survey '{}' uses missing filter '{filter}'",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A survey as declared in a registry file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct SurveySpec {
    name: String,
    filters: Vec<String>,
    query: String,
    #[serde(default)]
    footprint: Option<PathBuf>,
    #[serde(default)]
    color_term: Option<ColorTerm>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct RegistryFile {
    #[serde(rename = "survey", default)]
    surveys: Vec<SurveySpec>,
}

/// Ordered, immutable collection of surveys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SurveyRegistry {
    surveys: Vec<Survey>,
}

impl SurveyRegistry {
    /// Build a registry; the order of `surveys` is the declaration order.
    ///
    /// # Errors
    /// Returns [`CalibError::Config`] for duplicate names, empty filter lists or
    /// color terms referring to filters the survey does not have.
    pub fn new(surveys: Vec<Survey>) -> Result<Self, CalibError> {
        for survey in &surveys {
            survey.validate()?;
        }
        if let Some(duplicate) = surveys.iter().map(Survey::name).duplicates().next() {
            return Err(CalibError::Config(format!(
                "survey '{duplicate}' declared twice"
            )));
        }
        Ok(Self { surveys })
    }

    /// The surveys shipped with this crate.
    ///
    /// Footprints are not included; load a registry file that declares them if needed.
    pub fn builtin() -> Result<Self, CalibError> {
        Self::from_toml_str(BUILTIN_SURVEYS, None)
    }

    /// Parse a registry from TOML.
    ///
    /// Relative footprint paths are resolved against `base_dir`, or the working directory.
    pub fn from_toml_str(toml: &str, base_dir: Option<&Path>) -> Result<Self, CalibError> {
        let file: RegistryFile = toml::from_str(toml)
            .map_err(|e| CalibError::Config(format!("invalid survey registry: {e}")))?;

        let surveys = file
            .surveys
            .into_iter()
            .map(|spec| {
                let mut survey = Survey::new(spec.name, spec.filters, spec.query);
                if let Some(color_term) = spec.color_term {
                    survey = survey.with_color_term(color_term);
                }
                if let Some(path) = spec.footprint {
                    let path = match base_dir {
                        Some(dir) if path.is_relative() => dir.join(path),
                        _ => path,
                    };
                    survey = survey.with_footprint(load_footprint(&path)?);
                }
                Ok(survey)
            })
            .collect::<Result<Vec<_>, CalibError>>()?;

        let registry = Self::new(surveys)?;
        debug!(
            "Loaded survey registry: {}.",
            registry.names().join(", ")
        );
        Ok(registry)
    }

    /// Load a registry file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibError> {
        let path = path.as_ref();
        let toml = std::fs::read_to_string(path).map_err(|source| CalibError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&toml, path.parent())
    }

    /// Look up a survey by name.
    pub fn get(&self, name: &str) -> Result<&Survey, CalibError> {
        self.surveys
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CalibError::UnknownSurvey(name.to_string()))
    }

    /// Surveys in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Survey> {
        self.surveys.iter()
    }

    /// Survey names in declaration order.
    pub fn names(&self) -> Vec<&str> {
        self.surveys.iter().map(Survey::name).collect()
    }

    /// Number of surveys.
    pub fn len(&self) -> usize {
        self.surveys.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.surveys.is_empty()
    }
}

#[cfg(feature = "fits")]
fn load_footprint(path: &Path) -> Result<Footprint, CalibError> {
    crate::fits::read_footprint(path)
}

#[cfg(not(feature = "fits"))]
fn load_footprint(path: &Path) -> Result<Footprint, CalibError> {
    Err(CalibError::Config(format!(
        "footprint '{}' requires the `fits` feature",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry() {
        let registry = SurveyRegistry::builtin().unwrap();
        assert_eq!(
            registry.names(),
            ["SDSS", "APASS", "GAIA", "VSTATLAS", "2MASS", "OGLE3", "PS1", "DECAPS"]
        );
        let apass = registry.get("APASS").unwrap();
        assert_eq!(apass.color_term(), Some(&ColorTerm::new("V", "i")));
        assert_eq!(apass.filter_index("g").unwrap(), 2);
        assert!(registry.get("GAIA").unwrap().color_term().is_none());
        assert!(registry.iter().all(|s| s.query().contains(MATCH_DIST_PLACEHOLDER)));
    }

    #[test]
    fn unknown_lookups() {
        let registry = SurveyRegistry::builtin().unwrap();
        assert!(matches!(registry.get("USNO"), Err(CalibError::UnknownSurvey(_))));
        assert!(matches!(
            registry.get("GAIA").unwrap().filter_index("V"),
            Err(CalibError::UnknownFilter { .. })
        ));
    }

    #[test]
    fn invalid_registries() {
        let twice = vec![Survey::new("A", ["g"], ""), Survey::new("A", ["r"], "")];
        assert!(matches!(SurveyRegistry::new(twice), Err(CalibError::Config(_))));

        let no_filters = vec![Survey::new("A", Vec::<String>::new(), "")];
        assert!(SurveyRegistry::new(no_filters).is_err());

        let bad_color =
            vec![Survey::new("A", ["g", "r"], "").with_color_term(ColorTerm::new("g", "i"))];
        assert!(SurveyRegistry::new(bad_color).is_err());

        assert!(SurveyRegistry::from_toml_str("[[survey]]\nname = 1", None).is_err());
    }

    #[test]
    fn render_query() {
        let survey = Survey::new("A", ["g"], "q3c_join(m.ra, m.dec, p.ra, p.dec, {matchDist})");
        assert_eq!(
            survey.render_query(0.5),
            "q3c_join(m.ra, m.dec, p.ra, p.dec, 5e-1)"
        );
    }

    #[test]
    fn footprint_checks() {
        let nside = 32;
        let inside = healpix::ang2pix_nest(nside, 80., -20.);
        let footprint = Footprint::from_pixels(nside, [inside]).unwrap();
        let survey = Survey::new("A", ["g"], "").with_footprint(footprint);

        assert!(survey.check_pos(80., -20.));
        // A neighbouring pixel is still accepted.
        for nb in healpix::neighbours_nest(nside, inside).into_iter().flatten() {
            let (ra, dec) = healpix::pix2ang_nest(nside, nb);
            assert!(survey.check_pos(ra, dec));
        }
        assert!(!survey.check_pos(260., 20.));
        assert!(Survey::new("B", ["g"], "").check_pos(260., 20.));
    }

    #[test]
    fn footprint_from_map() {
        let mut map = vec![0.; healpix::npix(1) as usize];
        map[4] = 1.;
        let footprint = Footprint::from_map(1, &map).unwrap();
        assert_eq!(footprint.len(), 1);
        assert!(footprint.contains(0., 0.));

        assert!(Footprint::from_map(2, &map).is_err());
        assert!(Footprint::from_pixels(3, [0]).is_err());
        assert!(Footprint::from_pixels(1, [12]).is_err());
    }
}
