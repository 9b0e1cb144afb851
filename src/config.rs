//! Environment knobs (spec §6). Most are plain `const`s; a handful of
//! LSM-tree thresholds are also exposed via [`LsmConfig`] so tests can shrink
//! them without touching process-wide state.

pub const PAGE_SIZE: usize = 4096;
pub const BUFFER_POOL_SIZE: usize = 64;

pub const LSM_BLOCK_SIZE: usize = 4096;
pub const LSM_PER_MEM_SIZE_LIMIT: usize = 1 << 20;
pub const LSM_TOL_MEM_SIZE_LIMIT: usize = 4 << 20;
pub const LSM_SST_LEVEL_RATIO: usize = 4;

pub const BLOOM_BITS_PER_KEY: usize = 10;
pub const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

pub const SKIPLIST_MAX_HEIGHT: usize = 12;

pub const IX_MAX_COL_LEN: usize = 512;

/// Tunable subset of the above, for constructing an [`crate::lsm::tree::LsmTree`]
/// in tests with small thresholds so flush/compaction triggers quickly.
#[derive(Debug, Clone, Copy)]
pub struct LsmConfig {
    pub block_size: usize,
    pub per_mem_size_limit: usize,
    pub tol_mem_size_limit: usize,
    pub sst_level_ratio: usize,
    pub bloom_bits_per_key: usize,
}

impl Default for LsmConfig {
    fn default() -> Self {
        LsmConfig {
            block_size: LSM_BLOCK_SIZE,
            per_mem_size_limit: LSM_PER_MEM_SIZE_LIMIT,
            tol_mem_size_limit: LSM_TOL_MEM_SIZE_LIMIT,
            sst_level_ratio: LSM_SST_LEVEL_RATIO,
            bloom_bits_per_key: BLOOM_BITS_PER_KEY,
        }
    }
}
