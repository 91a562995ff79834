//! Observed source catalogs.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::info;
use ndarray::{Array1, ArrayView1};

use crate::error::CalibError;
use crate::ndarray_utils::IntoNdarray1;
use crate::sextractor::SextractorTable;

/// Right ascension column (degrees).
pub const RA_COLUMN: &str = "ALPHA_J2000";
/// Declination column (degrees).
pub const DEC_COLUMN: &str = "DELTA_J2000";
/// Magnitude/error column pairs, in order of preference.
pub const MAG_COLUMNS: [(&str, &str); 3] = [
    ("MAG_BEST", "MAGERR_BEST"),
    ("MAG_AUTO", "MAGERR_AUTO"),
    ("MAG_APER", "MAGERR_APER"),
];

const FITS_SIGNATURE: &[u8] = b"SIMPLE  =";

/// Pick the preferred magnitude/error pair among the available columns.
pub fn select_mag_columns(columns: &[&str]) -> Option<(&'static str, &'static str)> {
    MAG_COLUMNS
        .into_iter()
        .find(|(mag, err)| columns.contains(mag) && columns.contains(err))
}

/// File format of a catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatalogType {
    /// SExtractor `ASCII_HEAD` table.
    Ascii,
    /// FITS binary or ASCII table extensions.
    Fits,
}

impl CatalogType {
    /// Guess the format from the first bytes of a file.
    ///
    /// Returns `None` if the content is neither recognizably FITS nor ASCII.
    pub fn detect(head: &[u8]) -> Option<Self> {
        if head.starts_with(FITS_SIGNATURE) {
            return Some(CatalogType::Fits);
        }
        let text = String::from_utf8_lossy(head);
        let first = text.lines().map(str::trim).find(|l| !l.is_empty())?;
        first.starts_with('#').then_some(CatalogType::Ascii)
    }
}

/// Readers of the supported formats. All of them produce an [`ObservedCatalog`].
#[derive(Clone, Copy, Debug)]
pub(crate) enum TableReader<'a> {
    Ascii(&'a Path),
    Fits(&'a Path),
}

impl<'a> TableReader<'a> {
    pub(crate) fn new(path: &'a Path, kind: CatalogType) -> Self {
        match kind {
            CatalogType::Ascii => TableReader::Ascii(path),
            CatalogType::Fits => TableReader::Fits(path),
        }
    }

    pub(crate) fn read(self) -> Result<ObservedCatalog, CalibError> {
        match self {
            TableReader::Ascii(path) => {
                let file = File::open(path).map_err(|source| CalibError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                ObservedCatalog::from_sextractor(BufReader::new(file))
            }
            #[cfg(feature = "fits")]
            TableReader::Fits(path) => crate::fits::read_catalog(path),
            #[cfg(not(feature = "fits"))]
            TableReader::Fits(path) => Err(CalibError::format(format!(
                "'{}' is a FITS catalog, but the `fits` feature is disabled",
                path.display()
            ))),
        }
    }
}

/// Sources detected on an image.
///
/// All columns have the same length. Magnitudes and errors may be `NaN`.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedCatalog {
    ra: Array1<f64>,
    dec: Array1<f64>,
    mag: Array1<f64>,
    magerr: Array1<f64>,
}

impl ObservedCatalog {
    /// Create a catalog from four columns.
    ///
    /// # Errors
    /// Returns [`CalibError::CatalogFormat`] if the columns differ in length.
    pub fn new<N>(ra: N, dec: N, mag: N, magerr: N) -> Result<Self, CalibError>
    where
        N: IntoNdarray1<Elem = f64>,
    {
        let (ra, dec, mag, magerr) = (
            ra.into_ndarray1(),
            dec.into_ndarray1(),
            mag.into_ndarray1(),
            magerr.into_ndarray1(),
        );
        let len = ra.len();
        if dec.len() != len || mag.len() != len || magerr.len() != len {
            return Err(CalibError::format(format!(
                "catalog columns have lengths {}, {}, {}, {}",
                len,
                dec.len(),
                mag.len(),
                magerr.len()
            )));
        }
        Ok(Self {
            ra,
            dec,
            mag,
            magerr,
        })
    }

    /// Load a catalog file.
    ///
    /// # Arguments
    /// - `path`: The catalog file.
    /// - `hint`: Format of the file. If `None`, it is detected from the content.
    pub fn from_path(
        path: impl AsRef<Path>,
        hint: Option<CatalogType>,
    ) -> Result<Self, CalibError> {
        let path = path.as_ref();
        let kind = match hint {
            Some(kind) => kind,
            None => {
                let mut head = Vec::with_capacity(2880);
                File::open(path)
                    .and_then(|f| f.take(2880).read_to_end(&mut head))
                    .map_err(|source| CalibError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                CatalogType::detect(&head).ok_or_else(|| {
                    CalibError::format(format!(
                        "cannot tell whether '{}' is a FITS or an ASCII catalog",
                        path.display()
                    ))
                })?
            }
        };

        let catalog = TableReader::new(path, kind).read()?;
        info!(
            "Loaded {} sources from {:?} catalog '{}'.",
            catalog.len(),
            kind,
            path.display()
        );
        Ok(catalog)
    }

    /// Parse a SExtractor ASCII catalog.
    pub fn from_sextractor<R: std::io::BufRead>(reader: R) -> Result<Self, CalibError> {
        let table = SextractorTable::parse(reader)?;
        if table.n_rows() == 0 {
            return Err(CalibError::format("catalog contains no sources"));
        }
        let names: Vec<&str> = table.column_names().collect();
        let (mag_col, err_col) = select_mag_columns(&names).ok_or_else(|| {
            CalibError::format("no MAG_BEST, MAG_AUTO or MAG_APER column with its error")
        })?;
        let column = |name: &str| {
            table
                .column(name)
                .ok_or_else(|| CalibError::format(format!("missing column {name}")))
        };
        Self::new(
            column(RA_COLUMN)?,
            column(DEC_COLUMN)?,
            column(mag_col)?,
            column(err_col)?,
        )
    }

    /// Append the rows of `other`.
    pub(crate) fn extend(&mut self, other: &ObservedCatalog) {
        let append = |a: &mut Array1<f64>, b: &Array1<f64>| {
            *a = a.iter().chain(b).copied().collect();
        };
        append(&mut self.ra, &other.ra);
        append(&mut self.dec, &other.dec);
        append(&mut self.mag, &other.mag);
        append(&mut self.magerr, &other.magerr);
    }

    /// Right ascensions in degrees.
    pub fn ra(&self) -> ArrayView1<'_, f64> {
        self.ra.view()
    }

    /// Declinations in degrees.
    pub fn dec(&self) -> ArrayView1<'_, f64> {
        self.dec.view()
    }

    /// Instrumental magnitudes.
    pub fn mag(&self) -> ArrayView1<'_, f64> {
        self.mag.view()
    }

    /// Errors of the instrumental magnitudes.
    pub fn magerr(&self) -> ArrayView1<'_, f64> {
        self.magerr.view()
    }

    /// Number of sources.
    pub fn len(&self) -> usize {
        self.ra.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.ra.is_empty()
    }
}
