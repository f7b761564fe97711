//! Sequential read-ahead heuristic.
//!
//! Each file tracks its recent access pattern. Consecutive block accesses
//! grow a run counter; the prefetcher pulls in up to the configured number
//! of blocks ahead of the run, scaled by how convincingly sequential the
//! reader has been. Random access keeps the run at zero and disables
//! read-ahead.

/// Per-file prefetch bookkeeping.
#[derive(Debug, Default)]
pub struct PrefetchState {
    last_block: Option<u64>,
    run: u32,
}

impl PrefetchState {
    /// Fresh state with no history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Length of the current sequential run.
    #[must_use]
    pub const fn run(&self) -> u32 {
        self.run
    }

    /// Records an access ending at `block` and proposes blocks to fetch
    /// ahead. `max_ahead` of zero disables prefetching entirely.
    pub fn advise(&mut self, block: u64, max_ahead: u32, n_blocks: u64) -> Vec<u64> {
        let sequential = match self.last_block {
            Some(last) => block == last || block == last + 1,
            None => false,
        };
        if sequential {
            if block != self.last_block.unwrap_or(0) {
                self.run = self.run.saturating_add(1);
            }
        } else {
            self.run = 0;
        }
        self.last_block = Some(block);

        if max_ahead == 0 || self.run == 0 {
            return Vec::new();
        }

        let depth = u64::from(self.run.min(max_ahead));
        (block + 1..)
            .take(depth as usize)
            .filter(|candidate| *candidate < n_blocks)
            .collect()
    }
}
