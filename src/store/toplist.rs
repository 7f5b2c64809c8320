use std::sync::RwLock;

/// Shared, ordered snapshot of the current front-page story ids.
///
/// The poller replaces the whole list after each successful top-stories
/// fetch; request handlers read pages concurrently. Writers never mutate in
/// place, so a reader sees either the previous ordering or the new one.
/// The list is not persisted; it is empty after a restart until the first
/// poll completes.
#[derive(Debug, Default)]
pub struct TopList {
    ids: RwLock<Vec<i64>>,
}

impl TopList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire ordering.
    pub fn set(&self, ids: Vec<i64>) {
        *self.ids.write().expect("toplist lock poisoned") = ids;
    }

    /// One page of ids (1-indexed) plus the total length.
    #[must_use]
    pub fn page(&self, page: usize, page_size: usize) -> (Vec<i64>, usize) {
        let ids = self.ids.read().expect("toplist lock poisoned");
        let total = ids.len();
        if total == 0 {
            return (Vec::new(), 0);
        }

        let offset = page.saturating_sub(1) * page_size;
        if offset >= total {
            return (Vec::new(), total);
        }

        let end = (offset + page_size).min(total);
        (ids[offset..end].to_vec(), total)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.read().expect("toplist lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_pages_to_nothing() {
        let list = TopList::new();
        assert_eq!(list.page(1, 30), (Vec::new(), 0));
    }

    #[test]
    fn pages_are_cut_from_the_snapshot() {
        let list = TopList::new();
        list.set((1..=70).collect());

        let (first, total) = list.page(1, 30);
        assert_eq!(total, 70);
        assert_eq!(first, (1..=30).collect::<Vec<i64>>());

        let (third, _) = list.page(3, 30);
        assert_eq!(third, (61..=70).collect::<Vec<i64>>());

        let (past_end, total) = list.page(4, 30);
        assert!(past_end.is_empty());
        assert_eq!(total, 70);
    }

    #[test]
    fn set_replaces_wholesale() {
        let list = TopList::new();
        list.set(vec![1, 2, 3]);
        list.set(vec![9]);
        assert_eq!(list.page(1, 30), (vec![9], 1));
    }
}
