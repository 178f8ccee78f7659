use std::cmp::Reverse;

use waggle_types::{Assignment, BalanceMode, ClusterId, HistoryScore};

/// Result of one balance round.
///
/// `books[i]` lists the clusters node `i` must materialize. A cluster pinned
/// to the global cache stays in its node's book: the node-side rebalance is
/// destructive, so the cluster must remain served somewhere if the cache
/// later evicts it. Only `querybook` reflects the pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancePlan {
    pub querybook: Vec<Assignment>,
    pub books: Vec<Vec<ClusterId>>,
    pub global_book: Vec<ClusterId>,
}

/// Computes the cluster-to-node assignment for one round.
///
/// Normal mode deals clusters round-robin. The BestFit modes sort clusters
/// by descending weight (posting-list size, popularity, or their product)
/// and greedily hand each to the node with the lowest accumulated weight.
/// All orderings break ties toward the smaller cluster or node index so a
/// rerun with identical inputs yields an identical plan.
pub fn plan_assignment(
    mode: BalanceMode,
    num_nodes: usize,
    sizes: &[u64],
    popularity: &[HistoryScore],
    global_caches: usize,
) -> BalancePlan {
    let kc = sizes.len();
    debug_assert_eq!(popularity.len(), kc);
    debug_assert!(num_nodes > 0);

    let mut querybook = vec![Assignment::Unassigned; kc];
    let mut books = vec![Vec::new(); num_nodes];

    match mode {
        BalanceMode::Normal => {
            for c in 0..kc {
                let node = c % num_nodes;
                querybook[c] = Assignment::Node(node as u8);
                books[node].push(c as ClusterId);
            }
        }
        BalanceMode::BestFitSize | BalanceMode::BestFitPop | BalanceMode::BestFitHybrid => {
            let weight = |c: usize| -> u64 {
                match mode {
                    BalanceMode::BestFitSize => sizes[c],
                    BalanceMode::BestFitPop => popularity[c],
                    BalanceMode::BestFitHybrid => popularity[c].saturating_mul(sizes[c]),
                    BalanceMode::Normal => unreachable!(),
                }
            };

            let mut sorted: Vec<usize> = (0..kc).collect();
            sorted.sort_by_key(|&c| (Reverse(weight(c)), c));

            let mut scores = vec![0u64; num_nodes];
            for c in sorted {
                let node = scores
                    .iter()
                    .enumerate()
                    .min_by_key(|&(i, &score)| (score, i))
                    .map(|(i, _)| i)
                    .expect("at least one node");
                querybook[c] = Assignment::Node(node as u8);
                scores[node] = scores[node].saturating_add(weight(c));
                books[node].push(c as ClusterId);
            }
        }
    }

    let mut by_popularity: Vec<usize> = (0..kc).collect();
    by_popularity.sort_by_key(|&c| (Reverse(popularity[c]), c));
    let mut global_book = Vec::with_capacity(global_caches.min(kc));
    for &c in by_popularity.iter().take(global_caches.min(kc)) {
        querybook[c] = Assignment::GlobalCache;
        global_book.push(c as ClusterId);
    }

    BalancePlan {
        querybook,
        books,
        global_book,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_round_robins() {
        let plan = plan_assignment(BalanceMode::Normal, 2, &[1; 5], &[0; 5], 0);
        assert_eq!(
            plan.querybook,
            vec![
                Assignment::Node(0),
                Assignment::Node(1),
                Assignment::Node(0),
                Assignment::Node(1),
                Assignment::Node(0),
            ]
        );
        assert_eq!(plan.books[0], vec![0, 2, 4]);
        assert_eq!(plan.books[1], vec![1, 3]);
        assert!(plan.global_book.is_empty());
    }

    #[test]
    fn test_best_fit_size_balances_weights() {
        // Descending weights 9, 7, 3, 2, 1 land on the emptier node each
        // step: n0 gets 9 then 2, n1 gets 7, 3, then 1.
        let sizes = [2, 9, 1, 7, 3];
        let plan = plan_assignment(BalanceMode::BestFitSize, 2, &sizes, &[0; 5], 0);
        let totals: Vec<u64> = plan
            .books
            .iter()
            .map(|book| book.iter().map(|&c| sizes[c as usize]).sum())
            .collect();
        assert_eq!(totals, vec![11, 11]);
        assert_eq!(plan.books[0], vec![1, 0]);
        assert_eq!(plan.books[1], vec![3, 4, 2]);
    }

    #[test]
    fn test_best_fit_pop_with_cache_pin() {
        let sizes = [5, 5, 5, 5];
        let popularity = [0, 10, 0, 0];
        let plan = plan_assignment(BalanceMode::BestFitPop, 2, &sizes, &popularity, 1);

        // Cluster 1 carries all the popularity: node 0 takes it, every
        // zero-weight cluster then lands on node 1, and the cache pin
        // shadows cluster 1's node assignment without touching the book.
        assert_eq!(plan.global_book, vec![1]);
        assert_eq!(plan.books[0], vec![1]);
        assert_eq!(plan.books[1], vec![0, 2, 3]);
        assert_eq!(
            plan.querybook,
            vec![
                Assignment::Node(1),
                Assignment::GlobalCache,
                Assignment::Node(1),
                Assignment::Node(1),
            ]
        );
    }

    #[test]
    fn test_hybrid_weight_is_product() {
        let sizes = [100, 1, 10];
        let popularity = [1, 1000, 5];
        // Weights: 100, 1000, 50 -> cluster 1 first.
        let plan = plan_assignment(BalanceMode::BestFitHybrid, 2, &sizes, &popularity, 0);
        assert_eq!(plan.books[0], vec![1]);
        assert_eq!(plan.books[1], vec![0, 2]);
    }

    #[test]
    fn test_cache_covers_everything_when_large() {
        let plan = plan_assignment(BalanceMode::Normal, 2, &[1; 4], &[0; 4], 10);
        assert!(plan
            .querybook
            .iter()
            .all(|a| *a == Assignment::GlobalCache));
        assert_eq!(plan.global_book.len(), 4);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let sizes = [3, 3, 7, 7, 2];
        let popularity = [4, 4, 1, 1, 9];
        let first = plan_assignment(BalanceMode::BestFitHybrid, 3, &sizes, &popularity, 2);
        let second = plan_assignment(BalanceMode::BestFitHybrid, 3, &sizes, &popularity, 2);
        assert_eq!(first, second);
    }
}
