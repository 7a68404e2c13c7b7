//! Classification of physical offsets into backed and sparse runs.

use crate::info::MemoryRange;

/// A maximal contiguous region that is either fully backed by one memory
/// range or fully unbacked.
///
/// A run of size zero marks the end of the address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Run {
    pub address: u64,
    pub size: u64,
    pub sparse: bool,
}

impl Run {
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.address <= offset && offset < self.end()
    }

    pub fn is_eof(&self) -> bool {
        self.size == 0
    }
}

/// Resolves offsets against the driver's range list, remembering the last
/// answer so sequential readers hit the cache.
///
/// The range list must be ascending and non-overlapping.
#[derive(Clone, Debug)]
pub struct RunResolver {
    ranges: Vec<MemoryRange>,
    last_run: Option<Run>,
}

impl RunResolver {
    pub fn new(ranges: Vec<MemoryRange>) -> Self {
        Self {
            ranges,
            last_run: None,
        }
    }

    pub fn ranges(&self) -> &[MemoryRange] {
        &self.ranges
    }

    /// Returns the run containing `offset`.
    pub fn resolve(&mut self, offset: u64) -> Run {
        if let Some(run) = self.last_run.filter(|run| run.contains(offset)) {
            return run;
        }

        let run = self.scan(offset);
        self.last_run = Some(run);
        run
    }

    fn scan(&self, offset: u64) -> Run {
        for range in &self.ranges {
            if offset < range.base_address {
                return Run {
                    address: offset,
                    size: range.base_address - offset,
                    sparse: true,
                };
            }

            if range.contains(offset) {
                return Run {
                    address: range.base_address,
                    size: range.length_bytes,
                    sparse: false,
                };
            }
        }

        Run {
            address: offset,
            size: 0,
            sparse: true,
        }
    }
}
