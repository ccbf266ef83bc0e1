use std::{collections::VecDeque, hash::Hash};

/// Interleave items round-robin across the groups produced by `key`,
/// preserving relative order within each group. With tenant ids as keys this
/// keeps one tenant's backlog from starving everyone else's fresh items.
pub(crate) fn interleave_by<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let total = items.len();
    let mut groups: Vec<VecDeque<T>> = Vec::new();
    let mut index = ahash::HashMap::default();

    for item in items {
        match index.get(&key(&item)) {
            Some(&i) => {
                let group: &mut VecDeque<T> = &mut groups[i];
                group.push_back(item);
            }
            None => {
                index.insert(key(&item), groups.len());
                groups.push(VecDeque::from([item]));
            }
        }
    }

    let mut interleaved = Vec::with_capacity(total);
    while interleaved.len() < total {
        for group in groups.iter_mut() {
            if let Some(item) = group.pop_front() {
                interleaved.push(item);
            }
        }
    }

    interleaved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaves_across_groups() {
        let items = vec![
            ("a", 1),
            ("a", 2),
            ("a", 3),
            ("b", 1),
            ("b", 2),
            ("c", 1),
        ];

        let shuffled = interleave_by(items, |i| i.0);
        assert_eq!(
            shuffled,
            vec![
                ("a", 1),
                ("b", 1),
                ("c", 1),
                ("a", 2),
                ("b", 2),
                ("a", 3),
            ]
        );
    }

    #[test]
    fn late_arrival_beats_deep_backlog() {
        // A tenant with a hundred queued items should not push another
        // tenant's single item to the end of the batch.
        let mut items: Vec<(&str, usize)> = (0..100).map(|i| ("busy", i)).collect();
        items.push(("quiet", 0));

        let shuffled = interleave_by(items, |i| i.0);
        assert_eq!(shuffled[1], ("quiet", 0));
    }

    #[test]
    fn single_group_keeps_order() {
        let items = vec![("a", 1), ("a", 2), ("a", 3)];
        assert_eq!(interleave_by(items.clone(), |i| i.0), items);
    }

    #[test]
    fn empty_input() {
        let items: Vec<(&str, usize)> = Vec::new();
        assert!(interleave_by(items, |i| i.0).is_empty());
    }
}
