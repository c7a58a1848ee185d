/// Minimum number of pages mapped for a new page group when nothing else is
/// configured.
pub const DEFAULT_MIN_GROUP_PAGES: usize = 8;

/// Tunables of the allocator.
///
/// There is only one: the smallest group of pages the allocator asks the
/// operating system for. If you know that you'll be working with large
/// contiguous blocks of memory it's best to tune this higher: fewer calls to
/// the [`crate::PageSource`], at the cost of more unused tail space in each
/// group. A lower value gives a tighter fit but more mappings under churn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Lower bound for the page count of every new page group.
    pub min_group_pages: usize,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            min_group_pages: DEFAULT_MIN_GROUP_PAGES,
        }
    }

    /// Sets the minimum page group size. A value of zero is treated as one.
    pub const fn with_min_group_pages(mut self, pages: usize) -> Self {
        self.min_group_pages = if pages == 0 { 1 } else { pages };
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
