//! Positional cross-matching on the sphere.

use std::time::{Duration, Instant};

use kiddo::float::distance::SquaredEuclidean;
use kiddo::immutable::float::kdtree::ImmutableKdTree;
use log::debug;
use ndarray::ArrayView1;

use crate::error::QueryError;
use crate::geometry::{angular_separation, chord_sq, radec_to_unit};

/// k-d tree over the unit vectors of a set of sky positions.
///
/// Positions with a non-finite coordinate are left out, but indices refer to the input rows.
/// Any number of rows may share a position.
pub(crate) struct SkyTree {
    tree: Option<ImmutableKdTree<f64, u64, 3, 32>>,
    /// Input row of every tree item.
    rows: Vec<usize>,
    ra: Vec<f64>,
    dec: Vec<f64>,
}

impl SkyTree {
    pub(crate) fn new(ra: ArrayView1<f64>, dec: ArrayView1<f64>) -> Self {
        let (rows, points): (Vec<usize>, Vec<[f64; 3]>) = ra
            .iter()
            .zip(dec)
            .enumerate()
            .filter(|(_, (r, d))| r.is_finite() && d.is_finite())
            .map(|(i, (r, d))| {
                let v = radec_to_unit(*r, *d);
                (i, [v.x, v.y, v.z])
            })
            .unzip();
        let tree = (!points.is_empty()).then(|| ImmutableKdTree::new_from_slice(&points));

        Self {
            tree,
            rows,
            ra: ra.to_vec(),
            dec: dec.to_vec(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Indices of all positions within `radius` degrees, ascending.
    pub(crate) fn within(&self, ra: f64, dec: f64, radius: f64) -> Vec<usize> {
        let Some(tree) = &self.tree else {
            return Vec::new();
        };
        if !(ra.is_finite() && dec.is_finite()) {
            return Vec::new();
        }
        let v = radec_to_unit(ra, dec);
        let mut found: Vec<usize> = tree
            .within_unsorted::<SquaredEuclidean>(&[v.x, v.y, v.z], chord_sq(radius))
            .into_iter()
            .map(|m| self.rows[m.item as usize])
            .collect();
        found.sort_unstable();
        found
    }

    /// Index of the nearest position and its separation in degrees.
    pub(crate) fn nearest(&self, ra: f64, dec: f64) -> Option<(usize, f64)> {
        let tree = self.tree.as_ref()?;
        if !(ra.is_finite() && dec.is_finite()) {
            return None;
        }
        let v = radec_to_unit(ra, dec);
        let i = self.rows[tree.nearest_one::<SquaredEuclidean>(&[v.x, v.y, v.z]).item as usize];
        Some((i, angular_separation(ra, dec, self.ra[i], self.dec[i])))
    }
}

/// All pairs `[observed, reference]` closer than `radius` degrees.
///
/// Pairs are ordered by observed index, then by reference index. Every observed source
/// may match several reference entries and vice versa.
///
/// # Errors
/// Returns [`QueryError::Timeout`] once matching takes longer than `timeout`.
pub(crate) fn cross_match(
    obs_ra: ArrayView1<f64>,
    obs_dec: ArrayView1<f64>,
    reference: &SkyTree,
    radius: f64,
    timeout: Duration,
) -> Result<Vec<[usize; 2]>, QueryError> {
    let start = Instant::now();
    let mut pairs = Vec::new();

    for (i, (ra, dec)) in obs_ra.iter().zip(obs_dec).enumerate() {
        if start.elapsed() >= timeout {
            return Err(QueryError::Timeout(timeout));
        }
        pairs.extend(reference.within(*ra, *dec, radius).into_iter().map(|j| [i, j]));
    }

    debug!(
        "Matched {} pairs between {} sources and {} reference entries in {:?}.",
        pairs.len(),
        obs_ra.len(),
        reference.len(),
        start.elapsed()
    );
    Ok(pairs)
}
