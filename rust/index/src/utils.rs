/// Keeps the `k` smallest-distance pairs, sorted ascending, and drops the
/// rest. The tail beyond `k` is never fully sorted.
pub fn partial_sort_by_distance(scores: &mut Vec<(u32, f32)>, k: usize) {
    let k = k.min(scores.len());
    if k == 0 {
        scores.clear();
        return;
    }
    if k < scores.len() {
        scores.select_nth_unstable_by(k - 1, |a, b| a.1.total_cmp(&b.1));
        scores.truncate(k);
    }
    scores.sort_unstable_by(|a, b| a.1.total_cmp(&b.1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_k_smallest_sorted() {
        let mut scores = vec![(0, 5.0), (1, 1.0), (2, 3.0), (3, 0.5), (4, 4.0)];
        partial_sort_by_distance(&mut scores, 3);
        assert_eq!(scores, vec![(3, 0.5), (1, 1.0), (2, 3.0)]);
    }

    #[test]
    fn test_k_larger_than_len_sorts_all() {
        let mut scores = vec![(0, 2.0), (1, 1.0)];
        partial_sort_by_distance(&mut scores, 10);
        assert_eq!(scores, vec![(1, 1.0), (0, 2.0)]);
    }

    #[test]
    fn test_k_zero_clears() {
        let mut scores = vec![(0, 2.0)];
        partial_sort_by_distance(&mut scores, 0);
        assert!(scores.is_empty());
    }
}
