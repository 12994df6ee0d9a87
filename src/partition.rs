//! Splitting of numeric ranges and ordered sequences into bounded pieces.

use crate::error::CubeflowError;
use crate::models::CoordinateRange;

/// Relative tolerance used when counting sub-ranges, so that exact multiples of
/// the step are not inflated by floating point error.
const COUNT_TOLERANCE: f64 = 1e-9;

/// Number of pieces of size `step` needed to cover `extent`, at least 1.
pub(crate) fn step_count(extent: f64, step: f64) -> usize {
    let ratio = extent / step;
    let count = (ratio - ratio * COUNT_TOLERANCE).ceil();
    (count as usize).max(1)
}

/// Returns the sub-range bounds between `min` and `max` for `count` steps of `step`.
///
/// The final upper bound is exactly `max`.
fn build(min: f64, max: f64, step: f64, count: usize) -> Result<Vec<CoordinateRange>, CubeflowError> {
    let bounds = (0..=count)
        .map(|i| if i == count { max } else { min + step * i as f64 })
        .collect::<Vec<_>>();
    bounds
        .windows(2)
        .map(|pair| CoordinateRange::new(pair[0], pair[1]))
        .collect()
}

/// Partition a range into consecutive sub-ranges of width `step`.
///
/// The final sub-range is clipped to the upper bound of `range`.
///
/// # Arguments
///
/// * `range`: The range to partition
/// * `step`: Width of each sub-range, must be positive
pub fn partition_range(
    range: &CoordinateRange,
    step: f64,
) -> Result<Vec<CoordinateRange>, CubeflowError> {
    if !(step > 0.0) || !step.is_finite() {
        return Err(CubeflowError::invalid_argument(
            "step",
            format!("{} must be a positive number", step),
        ));
    }
    let count = step_count(range.extent(), step);
    build(range.min(), range.max(), step, count)
}

/// Partition a range into exactly `count` equal sub-ranges.
pub fn partition_count(
    range: &CoordinateRange,
    count: usize,
) -> Result<Vec<CoordinateRange>, CubeflowError> {
    if count == 0 {
        return Err(CubeflowError::invalid_argument(
            "count",
            "must be at least 1".to_string(),
        ));
    }
    let step = range.extent() / count as f64;
    build(range.min(), range.max(), step, count)
}

/// Split a sequence into consecutive groups of `group_size` elements.
///
/// The input is sorted ascending, or descending when `reversed` is set, before
/// grouping. The last group may be smaller than `group_size`.
pub fn group_contiguous<T: Clone + Ord>(
    values: &[T],
    group_size: usize,
    reversed: bool,
) -> Result<Vec<Vec<T>>, CubeflowError> {
    if group_size == 0 {
        return Err(CubeflowError::invalid_argument(
            "group_size",
            "must be at least 1".to_string(),
        ));
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    if reversed {
        sorted.reverse();
    }
    Ok(sorted
        .chunks(group_size)
        .map(|group| group.to_vec())
        .collect())
}

/// Returns `num_bins` equal width intervals spanning the first and last value.
///
/// # Arguments
///
/// * `values`: Sorted coordinate values
/// * `num_bins`: Number of bins
pub fn bin_intervals(values: &[f64], num_bins: usize) -> Result<Vec<(f64, f64)>, CubeflowError> {
    if num_bins == 0 {
        return Err(CubeflowError::invalid_argument(
            "num_bins",
            "must be at least 1".to_string(),
        ));
    }
    let (Some(first), Some(last)) = (values.first(), values.last()) else {
        return Err(CubeflowError::invalid_argument(
            "values",
            "must not be empty".to_string(),
        ));
    };
    let width = (last - first) / num_bins as f64;
    let transitions = (0..=num_bins)
        .map(|i| {
            if i == num_bins {
                *last
            } else {
                first + width * i as f64
            }
        })
        .collect::<Vec<_>>();
    Ok(transitions
        .windows(2)
        .map(|pair| (pair[0], pair[1]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: f64, max: f64) -> CoordinateRange {
        CoordinateRange::new(min, max).unwrap()
    }

    fn assert_close(expected: f64, actual: f64) {
        assert!(
            (expected - actual).abs() < 1e-9,
            "expected {} got {}",
            expected,
            actual
        );
    }

    fn assert_tiles(original: &CoordinateRange, parts: &[CoordinateRange]) {
        assert_eq!(original.min(), parts[0].min());
        assert_eq!(original.max(), parts[parts.len() - 1].max());
        for pair in parts.windows(2) {
            assert_eq!(pair[0].max(), pair[1].min());
        }
    }

    #[test]
    fn partition_range_tenths() {
        let original = range(-1.0, 1.0);
        let parts = partition_range(&original, 0.1).unwrap();
        assert_eq!(20, parts.len());
        assert_close(-1.0, parts[0].min());
        assert_close(-0.9, parts[0].max());
        assert_close(0.9, parts[19].min());
        assert_close(1.0, parts[19].max());
        assert_tiles(&original, &parts);
    }

    #[test]
    fn partition_range_clips_last() {
        let original = range(0.0, 1.0);
        let parts = partition_range(&original, 0.3).unwrap();
        assert_eq!(4, parts.len());
        assert_close(0.9, parts[3].min());
        assert_eq!(1.0, parts[3].max());
        assert_tiles(&original, &parts);
    }

    #[test]
    fn partition_range_larger_step() {
        let original = range(0.0, 1.0);
        let parts = partition_range(&original, 5.0).unwrap();
        assert_eq!(vec![original], parts);
    }

    #[test]
    fn partition_range_bad_step() {
        let original = range(0.0, 1.0);
        for step in [0.0, -0.5, f64::NAN, f64::INFINITY] {
            match partition_range(&original, step).unwrap_err() {
                CubeflowError::InvalidArgument { name, .. } => assert_eq!("step", name),
                err => panic!("unexpected error {:?}", err),
            }
        }
    }

    #[test]
    fn partition_count_equal() {
        let original = range(-1.0, 1.0);
        let parts = partition_count(&original, 40).unwrap();
        assert_eq!(40, parts.len());
        assert_close(0.05, parts[0].extent());
        assert_tiles(&original, &parts);
    }

    #[test]
    fn partition_count_zero() {
        assert!(partition_count(&range(0.0, 1.0), 0).is_err());
    }

    #[test]
    fn group_contiguous_sorted() {
        let values = [5, 3, 1, 4, 2, 6, 7];
        let groups = group_contiguous(&values, 3, false).unwrap();
        assert_eq!(vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]], groups);
        assert_eq!(
            vec![1, 2, 3, 4, 5, 6, 7],
            groups.concat(),
        );
    }

    #[test]
    fn group_contiguous_reversed() {
        let values = [5, 3, 1, 4, 2];
        let groups = group_contiguous(&values, 2, true).unwrap();
        assert_eq!(vec![vec![5, 4], vec![3, 2], vec![1]], groups);
    }

    #[test]
    fn group_contiguous_empty() {
        let groups = group_contiguous::<i64>(&[], 2, false).unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn group_contiguous_zero_size() {
        match group_contiguous(&[1, 2], 0, false).unwrap_err() {
            CubeflowError::InvalidArgument { name, .. } => assert_eq!("group_size", name),
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[test]
    fn bin_intervals_ok() {
        let bins = bin_intervals(&[0.0, 1.0, 2.5, 4.0], 4).unwrap();
        assert_eq!(vec![(0.0, 1.0), (1.0, 2.0), (2.0, 3.0), (3.0, 4.0)], bins);
    }

    #[test]
    fn bin_intervals_errors() {
        assert!(bin_intervals(&[0.0, 1.0], 0).is_err());
        assert!(bin_intervals(&[], 2).is_err());
    }
}
