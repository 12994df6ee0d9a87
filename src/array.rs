//! Functions and utilities for working with [ndarray] objects and coordinate axes.

use crate::error::CubeflowError;

use ndarray::prelude::*;
use ndarray::Zip;
use rayon::prelude::*;

/// Trait for array elements.
pub trait Element:
    Clone
    + Copy
    + PartialOrd
    + num_traits::FromPrimitive
    + num_traits::ToPrimitive
    + num_traits::Zero
    + std::fmt::Debug
    + Send
    + Sync
    + serde::Serialize
    + serde::de::DeserializeOwned
    + 'static
{
}

/// Blanket implementation of Element.
impl<T> Element for T where
    T: Clone
        + Copy
        + PartialOrd
        + num_traits::FromPrimitive
        + num_traits::ToPrimitive
        + num_traits::Zero
        + std::fmt::Debug
        + Send
        + Sync
        + serde::Serialize
        + serde::de::DeserializeOwned
        + 'static
{
}

/// Whether a value is a valid observation, i.e. neither NaN nor the no-data value.
pub fn is_valid<T: Element>(value: T, no_data: f64) -> bool {
    match value.to_f64() {
        Some(value) => !value.is_nan() && value != no_data,
        None => false,
    }
}

/// Count the valid observations in an array.
pub fn count_valid<T: Element>(array: &ArrayView3<T>, no_data: f64) -> u64 {
    array.iter().filter(|value| is_valid(**value, no_data)).count() as u64
}

/// Returns `base` with every valid element of `top` written over it.
pub fn overlay<T: Element>(
    base: &ArrayView3<T>,
    top: &ArrayView3<T>,
    no_data: f64,
) -> Result<Array3<T>, CubeflowError> {
    if base.dim() != top.dim() {
        return Err(CubeflowError::shape_mismatch(format!(
            "cannot overlay array of shape {:?} on {:?}",
            top.dim(),
            base.dim()
        )));
    }
    let mut result = base.to_owned();
    Zip::from(&mut result).and(top).for_each(|out, &value| {
        if is_valid(value, no_data) {
            *out = value;
        }
    });
    Ok(result)
}

/// Returns `count` integer indices evenly spaced over `0..len`, truncated towards zero.
///
/// The first index is always 0 and the last `len - 1`.
pub fn linspace_indices(len: usize, count: usize) -> Vec<usize> {
    match (len, count) {
        (0, _) | (_, 0) => vec![],
        (_, 1) => vec![0],
        _ => {
            let last = (len - 1) as f64;
            let step = last / (count - 1) as f64;
            (0..count)
                .map(|i| ((step * i as f64) as usize).min(len - 1))
                .collect()
        }
    }
}

/// Returns, for each target coordinate, the index of the nearest source coordinate.
///
/// Ties resolve to the lower index.
pub fn nearest_indices(source: &[f64], targets: &[f64]) -> Result<Vec<usize>, CubeflowError> {
    if source.is_empty() {
        return Err(CubeflowError::invalid_argument(
            "source",
            "cannot look up coordinates in an empty axis".to_string(),
        ));
    }
    Ok(targets
        .par_iter()
        .map(|target| {
            source
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| (*a - target).abs().total_cmp(&(*b - target).abs()))
                .map(|(index, _)| index)
                .unwrap_or(0)
        })
        .collect())
}

/// Returns the mean of the coordinates falling into each bin.
///
/// Bins are half open except the last, which includes its upper bound.
/// An empty bin yields its midpoint.
pub fn bin_means(values: &[f64], bins: &[(f64, f64)]) -> Vec<f64> {
    let last = bins.len().saturating_sub(1);
    bins.iter()
        .enumerate()
        .map(|(i, &(low, high))| {
            let members = values
                .iter()
                .filter(|&&value| value >= low && (value < high || (i == last && value == high)))
                .collect::<Vec<_>>();
            if members.is_empty() {
                (low + high) / 2.0
            } else {
                members.iter().copied().sum::<f64>() / members.len() as f64
            }
        })
        .collect()
}

/// Returns `(a - b) / (a + b)` element wise, NaN where either input is not valid.
pub fn normalized_difference(
    a: &ArrayView2<f64>,
    b: &ArrayView2<f64>,
    no_data: f64,
) -> Result<Array2<f64>, CubeflowError> {
    if a.dim() != b.dim() {
        return Err(CubeflowError::shape_mismatch(format!(
            "cannot difference arrays of shape {:?} and {:?}",
            a.dim(),
            b.dim()
        )));
    }
    Ok(Zip::from(a).and(b).map_collect(|&a, &b| {
        if is_valid(a, no_data) && is_valid(b, no_data) {
            (a - b) / (a + b)
        } else {
            f64::NAN
        }
    }))
}

/// Median of the finite values, or NaN if there are none.
pub fn nan_median(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut values = values
        .into_iter()
        .filter(|value| value.is_finite())
        .collect::<Vec<_>>();
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(f64::total_cmp);
    let middle = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[middle - 1] + values[middle]) / 2.0
    } else {
        values[middle]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_difference_values() {
        let nir = array![[300.0, -9999.0], [100.0, 0.0]];
        let red = array![[100.0, 50.0], [300.0, 0.0]];
        let ndvi = normalized_difference(&nir.view(), &red.view(), -9999.0).unwrap();
        assert_eq!(0.5, ndvi[[0, 0]]);
        assert!(ndvi[[0, 1]].is_nan());
        assert_eq!(-0.5, ndvi[[1, 0]]);
        // Zero over zero.
        assert!(ndvi[[1, 1]].is_nan());
    }

    #[test]
    fn normalized_difference_shape_mismatch() {
        let a = Array2::<f64>::zeros((2, 2));
        let b = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            normalized_difference(&a.view(), &b.view(), -9999.0).unwrap_err(),
            CubeflowError::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn nan_median_values() {
        assert_eq!(2.0, nan_median([3.0, 1.0, 2.0]));
        assert_eq!(2.5, nan_median([4.0, f64::NAN, 1.0, 2.0, 3.0]));
        assert_eq!(-1.0, nan_median([f64::INFINITY, -1.0]));
        assert!(nan_median([f64::NAN]).is_nan());
        assert!(nan_median(std::iter::empty()).is_nan());
    }

    #[test]
    fn is_valid_values() {
        assert!(is_valid(1_i32, -9999.0));
        assert!(!is_valid(-9999_i32, -9999.0));
        assert!(!is_valid(f32::NAN, -9999.0));
        assert!(is_valid(0_u32, -9999.0));
    }

    #[test]
    fn count_valid_ok() {
        let array = array![[[1, -9999], [3, 4]]];
        assert_eq!(3, count_valid(&array.view(), -9999.0));
    }

    #[test]
    fn overlay_ok() {
        let base = array![[[1.0, 2.0], [3.0, 4.0]]];
        let top = array![[[-9999.0, 20.0], [f64::NAN, 40.0]]];
        let result = overlay(&base.view(), &top.view(), -9999.0).unwrap();
        assert_eq!(array![[[1.0, 20.0], [3.0, 40.0]]], result);
    }

    #[test]
    fn overlay_shape_mismatch() {
        let base = Array3::<i64>::zeros((1, 2, 2));
        let top = Array3::<i64>::zeros((1, 3, 2));
        match overlay(&base.view(), &top.view(), -1.0).unwrap_err() {
            CubeflowError::ShapeMismatch { reason } => {
                assert_eq!("cannot overlay array of shape (1, 3, 2) on (1, 2, 2)", reason)
            }
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[test]
    fn linspace_indices_ok() {
        assert_eq!(vec![0, 2, 4], linspace_indices(5, 3));
        assert_eq!(vec![0, 3, 6, 9], linspace_indices(10, 4));
        assert_eq!(vec![0], linspace_indices(10, 1));
        assert!(linspace_indices(0, 3).is_empty());
        assert!(linspace_indices(3, 0).is_empty());
    }

    #[test]
    fn linspace_indices_upsample() {
        assert_eq!(vec![0, 0, 1, 1, 2], linspace_indices(3, 5));
    }

    #[test]
    fn nearest_indices_ok() {
        let source = [0.0, 1.0, 2.0, 3.0];
        let indices = nearest_indices(&source, &[-1.0, 0.4, 0.5, 2.6, 10.0]).unwrap();
        assert_eq!(vec![0, 0, 0, 3, 3], indices);
    }

    #[test]
    fn nearest_indices_empty_source() {
        assert!(nearest_indices(&[], &[1.0]).is_err());
    }

    #[test]
    fn bin_means_ok() {
        let values = [0.0, 1.0, 2.0, 3.0, 4.0];
        let bins = [(0.0, 2.0), (2.0, 4.0)];
        assert_eq!(vec![0.5, 3.0], bin_means(&values, &bins));
    }

    #[test]
    fn bin_means_empty_bin() {
        let values = [0.0, 4.0];
        let bins = [(0.0, 2.0), (2.0, 3.0), (3.0, 4.0)];
        assert_eq!(vec![0.0, 2.5, 4.0], bin_means(&values, &bins));
    }
}
