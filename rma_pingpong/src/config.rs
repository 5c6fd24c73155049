//! Benchmark constants and sweep configuration.

use crate::error::{Error, Result};

/// Measured iterations per payload size.
pub const ITERATIONS: usize = 100;
/// Unmeasured warmup puts per payload size.
pub const WARMUP: usize = 10;
/// Smallest payload of the sweep.
pub const MIN_SIZE: usize = 8;
/// Largest payload of the sweep.
pub const MAX_SIZE: usize = 8 * 1024 * 1024;
/// Bytes of the registered region; one slot per iteration at the largest size.
pub const HUGEPAGE: usize = ITERATIONS * MAX_SIZE;
/// The protocol pairs rank 0 with rank 1.
pub const REQUIRED_PEERS: usize = 2;

/// Parameters of one size sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    pub iters: usize,
    pub warmup: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Length of both the registered region and the send scratch.
    pub region_len: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            iters: ITERATIONS,
            warmup: WARMUP,
            min_size: MIN_SIZE,
            max_size: MAX_SIZE,
            region_len: HUGEPAGE,
        }
    }
}

impl SweepConfig {
    /// Payload sizes of the sweep: `min_size` doubling up to `max_size`.
    pub fn sizes(&self) -> impl Iterator<Item = usize> {
        let max = self.max_size;
        std::iter::successors(Some(self.min_size), |&s| s.checked_mul(2))
            .take_while(move |&s| s <= max)
    }

    /// Bytes of the region one `bench` call at `size` touches.
    pub fn footprint(&self, size: usize) -> usize {
        self.iters.max(self.warmup) * size
    }

    /// Bytes of region the whole sweep needs: the footprint of its largest size.
    pub fn required_region(&self) -> Result<usize> {
        let largest = self.sizes().last().unwrap_or(self.min_size);
        self.iters
            .max(self.warmup)
            .checked_mul(largest)
            .ok_or_else(|| Error::Config("region footprint overflows".into()))
    }

    /// The same sweep with `region_len` cut down to what it needs. The
    /// default sweep keeps the full `HUGEPAGE` region.
    pub fn sized_to_fit(self) -> Result<Self> {
        if self == Self::default() {
            return Ok(self);
        }
        let region_len = self.required_region()?;
        Ok(Self { region_len, ..self })
    }

    pub fn validate(&self) -> Result<()> {
        if self.iters == 0 {
            return Err(Error::Config("iters must be positive".into()));
        }
        if self.min_size == 0 || !self.min_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "min size {} is not a power of two",
                self.min_size
            )));
        }
        if self.min_size > self.max_size {
            return Err(Error::Config(format!(
                "min size {} exceeds max size {}",
                self.min_size, self.max_size
            )));
        }
        let required = self.required_region()?;
        if self.region_len < required {
            return Err(Error::Config(format!(
                "region of {} bytes is smaller than the {} bytes the sweep needs",
                self.region_len, required
            )));
        }
        Ok(())
    }
}
