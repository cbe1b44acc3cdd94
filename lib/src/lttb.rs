use crate::observation::Valued;

/// Largest Triangle Three Buckets (LTTB) downsampling algorithm.
///
/// Reduces an ordered slice of records to exactly `threshold` records while
/// preserving the visual shape of the `value_key` series. The x coordinate is
/// the record's index, so the input is expected to be sorted by time already.
///
/// Returns the original data unchanged if `threshold >= data.len()` or
/// `threshold < 3`. Selected records are clones of the input elements, so an
/// `Arc` input yields pointers into the original allocation.
///
/// Missing, non-numeric or non-finite values count as zero in the triangle
/// areas, are left out of bucket averages, and can still be selected.
pub fn sample<T: Valued + Clone>(data: &[T], threshold: usize, value_key: &str) -> Vec<T> {
    select_indices(data.len(), threshold, |i| data[i].value(value_key))
        .into_iter()
        .map(|i| data[i].clone())
        .collect()
}

/// Runs LTTB over `len` points read through `value_at` and returns the
/// indices to keep, in ascending order.
pub fn select_indices<F>(len: usize, threshold: usize, value_at: F) -> Vec<usize>
where
    F: Fn(usize) -> Option<f64>,
{
    if threshold >= len || threshold < 3 {
        return (0..len).collect();
    }

    let y = |i: usize| value_at(i).unwrap_or(0.0);

    let mut sampled = Vec::with_capacity(threshold);
    sampled.push(0);

    let every = (len - 2) as f64 / (threshold - 2) as f64;
    let bound = |k: usize| (k as f64 * every).floor() as usize + 1;

    let mut a_idx = 0usize;

    for i in 0..(threshold - 2) {
        // Average of the next bucket, skipping values that are not numbers.
        let avg_start = bound(i + 1);
        let avg_end = bound(i + 2).min(len);
        let mut avg_x = 0.0f64;
        let mut avg_y = 0.0f64;
        let mut valid = 0usize;
        for j in avg_start..avg_end {
            if let Some(v) = value_at(j) {
                avg_x += j as f64;
                avg_y += v;
                valid += 1;
            }
        }
        if valid > 0 {
            avg_x /= valid as f64;
            avg_y /= valid as f64;
        } else {
            avg_x = (avg_start + avg_end) as f64 / 2.0;
        }

        let ax = a_idx as f64;
        let ay = y(a_idx);
        let mut max_area = -1.0f64;
        let mut max_idx = bound(i);

        for j in bound(i)..bound(i + 1) {
            let area = 0.5 * ((ax - avg_x) * (y(j) - ay) - (ax - j as f64) * (avg_y - ay)).abs();
            if area > max_area {
                max_area = area;
                max_idx = j;
            }
        }

        sampled.push(max_idx);
        a_idx = max_idx;
    }

    sampled.push(len - 1);
    sampled
}
