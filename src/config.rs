//! Top-level pipeline configuration, aggregating the per-module gate
//! structs into the knobs `gassembler.c`'s globals exposed on the command
//! line (`min_coverage`, `min_p`, `coverage`, `n_threads`, ...).

use crate::assembly::AssemblyGates;
use crate::grouping::GroupGates;

/// How a call's expected coverage (`KMER_COVERAGE` in `calc_p`) is derived.
///
/// Mirrors the signed `coverage` global in `gassembler.c`: negative meant
/// "use this block's own observed maximum", zero meant "use the run's
/// median coverage", positive meant a fixed value. Recorded as an explicit
/// enum here instead of a signed float sentinel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoverageMode {
    /// Use the call block's own maximum observed coverage.
    Dynamic,
    /// Use the median coverage across the whole run (supplied externally
    /// once enough blocks have completed).
    Median,
    /// Use a fixed, user-specified expected coverage.
    Fixed(u32),
}

impl Default for CoverageMode {
    fn default() -> Self {
        Self::Dynamic
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub assembly: AssemblyGates,
    pub grouping: GroupGates,
    pub coverage: CoverageMode,
    pub min_coverage: u32,
    pub min_p: f64,
    pub min_confirming: u32,
    pub n_threads: usize,
    pub word_len: usize,
    /// Seed k-mers accepted from a single region-file line beyond this are
    /// dropped (`gassembler.c`'s `MAX_KMERS` array bound).
    pub max_kmers: usize,
    pub max_reads_per_kmer: usize,
    pub max_reads: usize,
    pub min_reads: usize,
    /// Stop parsing the region file after this many lines (`gassembler.c`'s
    /// `--max_regions`, a debugging aid for running a prefix of a large
    /// region file).
    pub max_regions: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assembly: AssemblyGates::default(),
            grouping: GroupGates::default(),
            coverage: CoverageMode::default(),
            min_coverage: 6,
            min_p: 0.5,
            min_confirming: 2,
            n_threads: num_cpus::get(),
            word_len: 25,
            max_kmers: 1024,
            max_reads_per_kmer: 100,
            max_reads: 4096,
            min_reads: 10,
            max_regions: 1_000_000_000,
        }
    }
}
