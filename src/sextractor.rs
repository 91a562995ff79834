//! Reader for SExtractor ASCII catalogs (`CATALOG_TYPE ASCII_HEAD`).
//!
//! The header is a block of lines of the form
//! ```text
//! #   1 NUMBER          Running object number
//! #   2 ALPHA_J2000     Right ascension of barycenter (J2000)   [deg]
//! #   4 MAG_APER        Fixed aperture magnitude vector         [mag]
//! #   7 MAGERR_APER     RMS error vector for fixed aperture mag [mag]
//! ```
//! Gaps in the column numbers belong to vector parameters; the name refers to the first element.

use std::collections::HashMap;
use std::io::BufRead;

use ndarray::Array1;

use crate::error::CalibError;

/// Parsed table, stored column-major.
#[derive(Clone, Debug, Default)]
pub(crate) struct SextractorTable {
    names: HashMap<String, usize>,
    columns: Vec<Vec<f64>>,
}

impl SextractorTable {
    pub(crate) fn parse<R: BufRead>(reader: R) -> Result<Self, CalibError> {
        let mut names = HashMap::new();
        let mut n_header_cols = 0;
        let mut columns: Vec<Vec<f64>> = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| {
                CalibError::format(format!("failed to read line {}: {e}", line_no + 1))
            })?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(header) = line.strip_prefix('#') {
                let mut tokens = header.split_whitespace();
                let (Some(number), Some(name)) = (tokens.next(), tokens.next()) else {
                    continue;
                };
                let Ok(number) = number.parse::<usize>() else {
                    continue;
                };
                if number == 0 {
                    return Err(CalibError::format(format!(
                        "invalid column number 0 in header line {}",
                        line_no + 1
                    )));
                }
                names.entry(name.to_string()).or_insert(number - 1);
                n_header_cols = n_header_cols.max(number);
                continue;
            }

            if names.is_empty() {
                return Err(CalibError::format(
                    "data before any SExtractor column header",
                ));
            }
            let values: Vec<f64> = line
                .split_whitespace()
                .map(|token| token.parse().unwrap_or(f64::NAN))
                .collect();
            if values.len() < n_header_cols {
                return Err(CalibError::format(format!(
                    "line {} has {} values, the header declares {} columns",
                    line_no + 1,
                    values.len(),
                    n_header_cols
                )));
            }
            if columns.is_empty() {
                columns = vec![Vec::new(); values.len()];
            } else if values.len() != columns.len() {
                return Err(CalibError::format(format!(
                    "line {} has {} values instead of {}",
                    line_no + 1,
                    values.len(),
                    columns.len()
                )));
            }
            for (column, value) in columns.iter_mut().zip(values) {
                column.push(value);
            }
        }

        if names.is_empty() {
            return Err(CalibError::format("no SExtractor column header found"));
        }
        Ok(Self { names, columns })
    }

    pub(crate) fn column_names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }

    pub(crate) fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub(crate) fn column(&self, name: &str) -> Option<Array1<f64>> {
        let idx = *self.names.get(name)?;
        if self.columns.is_empty() {
            return Some(Array1::zeros(0));
        }
        self.columns.get(idx).map(|c| Array1::from_vec(c.clone()))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    const CATALOG: &str = "\
#   1 NUMBER                 Running object number
#   2 ALPHA_J2000            Right ascension of barycenter (J2000)           [deg]
#   3 DELTA_J2000            Declination of barycenter (J2000)               [deg]
#   4 MAG_APER               Fixed aperture magnitude vector                 [mag]
#   6 MAGERR_APER            RMS error vector for fixed aperture mag.        [mag]
#   8 FLAGS                  Extraction flags
       1 271.5012345 -29.1012345  -9.1234  -9.3000   0.0123   0.0150   0
       2 271.5023456 -29.1023456  -8.5000  -8.6000   0.0210   0.0250   2

       3 271.5034567 -29.1034567  99.0000  99.0000  99.0000  99.0000   4
";

    #[test]
    fn parse_vector_columns() {
        let table = SextractorTable::parse(CATALOG.as_bytes()).unwrap();
        assert_eq!(table.n_rows(), 3);
        assert_eq!(table.column("MAG_APER").unwrap(), array![-9.1234, -8.5, 99.]);
        assert_eq!(table.column("MAGERR_APER").unwrap(), array![0.0123, 0.021, 99.]);
        assert_eq!(table.column("FLAGS").unwrap(), array![0., 2., 4.]);
        assert!(table.column("MAG_AUTO").is_none());
        assert_eq!(table.column_names().count(), 6);
    }

    #[test]
    fn bad_tokens_become_nan() {
        let text = "# 1 ALPHA_J2000\n# 2 DELTA_J2000\n10.0 nan\n11.0 --\n";
        let table = SextractorTable::parse(text.as_bytes()).unwrap();
        let dec = table.column("DELTA_J2000").unwrap();
        assert!(dec.iter().all(|d| d.is_nan()));
    }

    #[test]
    fn short_rows_are_rejected() {
        let text = "# 1 ALPHA_J2000\n# 2 DELTA_J2000\n# 3 MAG_AUTO\n10.0 20.0\n";
        assert!(matches!(
            SextractorTable::parse(text.as_bytes()),
            Err(CalibError::CatalogFormat(_))
        ));
    }

    #[test]
    fn headerless_text_is_rejected() {
        assert!(SextractorTable::parse("1 2 3\n4 5 6\n".as_bytes()).is_err());
        assert!(SextractorTable::parse("".as_bytes()).is_err());
    }
}
