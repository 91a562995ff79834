//! FITS catalogs and HEALPix footprint maps.

use std::path::Path;

use fitsio::FitsFile;
use fitsio::hdu::{FitsHdu, HduInfo};
use log::{debug, warn};
use ndarray::Array1;

use crate::catalog::{DEC_COLUMN, ObservedCatalog, RA_COLUMN, select_mag_columns};
use crate::error::CalibError;
use crate::survey::Footprint;

/// cfitsio status for moving past the last HDU.
const END_OF_FILE: i32 = 107;

fn is_end_of_file(err: &fitsio::errors::Error) -> bool {
    matches!(err, fitsio::errors::Error::Fits(e) if e.status == END_OF_FILE)
}

/// Read one column. Vector columns keep their first element per row.
fn read_column(
    hdu: &FitsHdu,
    fptr: &mut FitsFile,
    name: &str,
    num_rows: usize,
) -> fitsio::errors::Result<Array1<f64>> {
    let values: Vec<f64> = hdu.read_col(fptr, name)?;
    if num_rows > 0 && values.len() > num_rows && values.len() % num_rows == 0 {
        let repeat = values.len() / num_rows;
        return Ok(values.into_iter().step_by(repeat).collect());
    }
    Ok(Array1::from_vec(values))
}

/// Load the sources of all usable table extensions.
///
/// The magnitude pair is chosen on the first extension with positions and magnitudes.
/// Later extensions are appended only if they offer the same pair.
pub(crate) fn read_catalog(path: &Path) -> Result<ObservedCatalog, CalibError> {
    let fits_err = |source: fitsio::errors::Error| CalibError::Fits {
        path: path.to_path_buf(),
        source,
    };
    let mut fptr = FitsFile::open(path).map_err(fits_err)?;

    let mut catalog: Option<ObservedCatalog> = None;
    let mut chosen: Option<(&str, &str)> = None;
    let mut index = 1;
    loop {
        let hdu = match fptr.hdu(index) {
            Ok(hdu) => hdu,
            Err(e) if is_end_of_file(&e) => break,
            Err(e) => return Err(fits_err(e)),
        };
        index += 1;
        let HduInfo::TableInfo {
            column_descriptions,
            num_rows,
        } = &hdu.info
        else {
            continue;
        };
        let names: Vec<&str> = column_descriptions.iter().map(|c| c.name.as_str()).collect();
        if !(names.contains(&RA_COLUMN) && names.contains(&DEC_COLUMN)) {
            debug!("Skipping extension {} without positions.", index - 1);
            continue;
        }
        let Some(pair) = select_mag_columns(&names) else {
            debug!("Skipping extension {} without magnitudes.", index - 1);
            continue;
        };
        match chosen {
            None => chosen = Some(pair),
            Some(first) if first != pair => {
                warn!(
                    "Skipping extension {}: it offers {} instead of {}.",
                    index - 1,
                    pair.0,
                    first.0
                );
                continue;
            }
            Some(_) => {}
        }

        let part = ObservedCatalog::new(
            read_column(&hdu, &mut fptr, RA_COLUMN, *num_rows).map_err(fits_err)?,
            read_column(&hdu, &mut fptr, DEC_COLUMN, *num_rows).map_err(fits_err)?,
            read_column(&hdu, &mut fptr, pair.0, *num_rows).map_err(fits_err)?,
            read_column(&hdu, &mut fptr, pair.1, *num_rows).map_err(fits_err)?,
        )?;
        match catalog.as_mut() {
            Some(catalog) => catalog.extend(&part),
            None => catalog = Some(part),
        }
    }

    let catalog = catalog.ok_or_else(|| {
        CalibError::format(format!(
            "'{}' has no table with {RA_COLUMN}, {DEC_COLUMN} and a magnitude/error pair",
            path.display()
        ))
    })?;
    if catalog.is_empty() {
        return Err(CalibError::format(format!(
            "'{}' contains no sources",
            path.display()
        )));
    }
    Ok(catalog)
}

/// Load a HEALPix footprint map.
///
/// The map is the primary image in NESTED ordering with its `NSIDE` header key.
/// Pixels with a value above zero are covered.
pub(crate) fn read_footprint(path: &Path) -> Result<Footprint, CalibError> {
    let fits_err = |source: fitsio::errors::Error| CalibError::Fits {
        path: path.to_path_buf(),
        source,
    };
    let mut fptr = FitsFile::open(path).map_err(fits_err)?;
    let hdu = fptr.primary_hdu().map_err(fits_err)?;

    if !matches!(&hdu.info, HduInfo::ImageInfo { shape, .. } if !shape.is_empty()) {
        return Err(CalibError::Config(format!(
            "footprint '{}' has no primary image",
            path.display()
        )));
    }
    if let Ok(ordering) = hdu.read_key::<String>(&mut fptr, "ORDERING")
        && !ordering.trim().eq_ignore_ascii_case("NESTED")
    {
        return Err(CalibError::Config(format!(
            "footprint '{}' uses {} ordering, only NESTED is supported",
            path.display(),
            ordering.trim()
        )));
    }

    let nside: i64 = hdu.read_key(&mut fptr, "NSIDE").map_err(fits_err)?;
    let nside = u32::try_from(nside).map_err(|_| {
        CalibError::Config(format!("footprint '{}' has NSIDE {nside}", path.display()))
    })?;
    let map: Vec<f64> = hdu.read_image(&mut fptr).map_err(fits_err)?;
    Footprint::from_map(nside, &map)
}
