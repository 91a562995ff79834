//! A collection of various utilities needed in this library.
//! The two main groups are conversions into one-dimensional `ndarray` columns
//! and robust statistics on such columns.

use itertools::Itertools;
use nalgebra::{DVector, Scalar};
use ndarray::{Array1, ArrayView1, Zip};

use crate::{Float, lit};

/// Conversion of column-like containers into an [`Array1`].
pub trait IntoNdarray1 {
    /// Element type.
    type Elem;

    /// Perform the conversion.
    fn into_ndarray1(self) -> Array1<Self::Elem>;
}

impl<N: Scalar> IntoNdarray1 for Array1<N> {
    type Elem = N;

    fn into_ndarray1(self) -> Array1<N> {
        self
    }
}

impl<N: Scalar> IntoNdarray1 for Vec<N> {
    type Elem = N;

    fn into_ndarray1(self) -> Array1<N> {
        Array1::from_vec(self)
    }
}

impl<N: Scalar> IntoNdarray1 for DVector<N> {
    type Elem = N;

    fn into_ndarray1(self) -> Array1<N> {
        Array1::from_iter(self.iter().cloned())
    }
}

/// Median of the finite values, `None` if there are none.
pub(crate) fn median<F: Float>(arr: ArrayView1<F>) -> Option<F> {
    let sorted = arr
        .iter()
        .copied()
        .filter(|x| x.is_finite())
        .sorted_by(|a, b| a.partial_cmp(b).expect("filtered nan"))
        .collect_vec();
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) * lit(0.5)),
    }
}

/// Median absolute deviation around `center`, unscaled.
pub(crate) fn mad<F: Float>(arr: ArrayView1<F>, center: F) -> Option<F> {
    let deviations = arr.mapv(|x| (x - center).abs());
    median(deviations.view())
}

/// Elementwise `is_finite` of all given columns.
pub(crate) fn finite_mask<F: Float>(columns: &[ArrayView1<F>]) -> Array1<bool> {
    let len = columns.first().map_or(0, |c| c.len());
    let mut mask = Array1::from_elem(len, true);
    for column in columns {
        Zip::from(&mut mask)
            .and(column)
            .for_each(|m, x| *m = *m && x.is_finite());
    }
    mask
}

/// Keep the elements where `mask` is set.
pub(crate) fn select<F: Float>(arr: ArrayView1<F>, mask: ArrayView1<bool>) -> Array1<F> {
    arr.iter()
        .zip(mask)
        .filter_map(|(x, keep)| keep.then_some(*x))
        .collect()
}

/// Largest value strictly below `cutoff`. NaN never qualifies.
pub(crate) fn max_below<F: Float>(arr: ArrayView1<F>, cutoff: F) -> Option<F> {
    arr.iter()
        .copied()
        .filter(|x| *x < cutoff)
        .reduce(|acc, x| if x > acc { x } else { acc })
}

/// Smallest and largest finite values.
pub(crate) fn min_max<F: Float>(arr: ArrayView1<F>) -> Option<(F, F)> {
    arr.iter()
        .copied()
        .filter(|x| x.is_finite())
        .fold(None, |acc, x| match acc {
            None => Some((x, x)),
            Some((lo, hi)) => Some((if x < lo { x } else { lo }, if x > hi { x } else { hi })),
        })
}

#[cfg(test)]
mod tests {
    use nalgebra::dvector;
    use ndarray::array;

    use super::*;

    #[test]
    fn vector_to_array1() {
        let vector = dvector![1., 2., 3.];
        assert_eq!(vector.into_ndarray1(), array![1., 2., 3.]);
        assert_eq!(vec![4., 5.].into_ndarray1(), array![4., 5.]);
    }

    #[test]
    fn median_odd_even() {
        assert_eq!(median(array![3., 1., 2.].view()), Some(2.));
        assert_eq!(median(array![4., 1., 3., 2.].view()), Some(2.5));
        assert_eq!(median(array![f64::NAN, 1., 5.].view()), Some(3.));
        assert_eq!(median(Array1::<f64>::zeros(0).view()), None);
    }

    #[test]
    fn mad_of_symmetric() {
        let arr = array![1., 2., 3., 4., 5.];
        assert_eq!(mad(arr.view(), 3.), Some(1.));
    }

    #[test]
    fn mask_and_select() {
        let a = array![1., f64::NAN, 3., 4.];
        let b = array![1., 2., f64::INFINITY, 4.];
        let mask = finite_mask(&[a.view(), b.view()]);
        assert_eq!(mask, array![true, false, false, true]);
        assert_eq!(select(a.view(), mask.view()), array![1., 4.]);
    }

    #[test]
    fn extrema() {
        let arr = array![5., f64::NAN, -1., 99., 12.];
        assert_eq!(max_below(arr.view(), 99.), Some(12.));
        assert_eq!(max_below(arr.view(), -5.), None);
        assert_eq!(min_max(arr.view()), Some((-1., 99.)));
    }
}
