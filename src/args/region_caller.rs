// Description:      Parallel region dispatch and ordered call emission.

use clap::{Args, ValueEnum};
use std::path::PathBuf;

use crate::assembly::AssemblyGates;
use crate::config::{Config, CoverageMode};
use crate::grouping::GroupGates;

/// Clap-facing mirror of [`crate::config::CoverageMode`], since a signed
/// literal and "dynamic"/"median" keywords don't share a clap value type.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum CoverageModeArg {
    #[default]
    /// Use each call block's own observed maximum coverage.
    Dynamic,
    /// Sample across the region file once and use the median.
    Median,
}

#[derive(Args, Debug)]
pub struct RegionCallerArgs {
    /// Region file: `CHR\tSTART\tEND\tREFSEQ\tKMER1 KMER2 ...` per line.
    region_file: PathBuf,

    /// FASTA file of candidate reads to recruit from.
    reads_file: PathBuf,

    /// Known-SNV table (tab-separated `CHR:POS\tGT\tID\tREF/ALT`).
    #[arg(short = 'S', long)]
    snv_table: Option<PathBuf>,

    /// False-positive table (tab-separated `CHR:POS`).
    #[arg(short = 'F', long)]
    fp_table: Option<PathBuf>,

    #[arg(short = 'c', long, value_enum, default_value_t)]
    /// How the expected coverage `K` in the confidence score is derived,
    /// unless `--fixed-coverage` overrides it with a literal value.
    coverage_mode: CoverageModeArg,

    /// A literal expected coverage, overriding `--coverage-mode`.
    #[arg(long, conflicts_with = "coverage_mode")]
    fixed_coverage: Option<u32>,

    #[arg(long, default_value_t = 6)]
    /// Minimum coverage for a column to be eligible for a non-`NC` call.
    min_coverage: u32,

    #[arg(long, default_value_t = 0.5)]
    /// Confidence threshold below which a non-polymorphic call is still
    /// printed (used downstream to display the `NC` rationale).
    min_p: f64,

    #[arg(long, default_value_t = 2)]
    /// Minimum read count a genotype candidate must reach to be considered.
    min_confirming: u32,

    #[arg(short = 't', long)]
    /// Worker thread count (defaults to the available parallelism).
    threads: Option<usize>,

    #[arg(long, default_value_t = 25)]
    /// Seed k-mer length used to build the in-memory read index.
    word_len: usize,

    #[arg(long)]
    /// Seeds the random sampling used by `--coverage-mode median`.
    rng_seed: Option<u64>,

    #[arg(long, default_value_t = 1024)]
    /// Maximum seed k-mers accepted from a single region file line; extras
    /// are ignored.
    max_kmers: usize,

    #[arg(long, default_value_t = 1_000_000_000)]
    /// Stop after this many region file lines (debugging aid for running a
    /// prefix of a large region file).
    max_regions: u64,

    #[arg(long)]
    /// Append per-base (`A C G T N GAP`) counts to every printed row.
    print_counts: bool,

    #[command(flatten)]
    assembly: AssemblyArgs,

    #[command(flatten)]
    grouping: GroupingArgs,
}

#[derive(Args, Debug)]
pub struct AssemblyArgs {
    #[arg(long, default_value_t = 4)]
    /// Maximum divergent columns a read may carry and still be accepted.
    max_divergent: u32,

    #[arg(long, default_value_t = 25)]
    /// Minimum aligned length for a read to be accepted.
    min_align_len: u32,

    #[arg(long, default_value_t = 1)]
    /// Maximum combined end-gap length a read may carry.
    max_endgap: u32,

    #[arg(long, default_value_t = 10)]
    /// Maximum total gap length a read may carry.
    max_gaps: u32,
}

#[derive(Args, Debug)]
pub struct GroupingArgs {
    #[arg(long, default_value_t = 10)]
    /// Columns within this distance of either edge must be covered for a
    /// group to count as spanning the region.
    max_uncovered: usize,

    #[arg(long, default_value_t = 1)]
    min_group_coverage: u32,

    #[arg(long, default_value_t = 2)]
    min_group_size: u32,

    #[arg(long, default_value_t = 3)]
    max_group_divergence: u32,

    #[arg(long, default_value_t = 3)]
    max_group_rdivergence: u32,

    #[arg(long, default_value_t = 0.05, value_parser = validate_unit_fraction)]
    /// Minimum size of a group relative to the largest included group,
    /// expressed as a fraction in `[0.0, 1.0]`.
    min_group_rsize: f32,
}

fn validate_unit_fraction(value: &str) -> Result<f32, String> {
    let parsed = value.parse::<f32>().map_err(|_| format!("`{value}` is not a valid fraction."))?;
    if (0.0..=1.0).contains(&parsed) {
        Ok(parsed)
    } else {
        Err(format!("must be between 0.0 and 1.0, but {parsed} was provided."))
    }
}

impl RegionCallerArgs {
    pub fn region_file(&self) -> &PathBuf {
        &self.region_file
    }

    pub fn reads_file(&self) -> &PathBuf {
        &self.reads_file
    }

    pub fn snv_table(&self) -> Option<&PathBuf> {
        self.snv_table.as_ref()
    }

    pub fn fp_table(&self) -> Option<&PathBuf> {
        self.fp_table.as_ref()
    }

    pub fn word_len(&self) -> usize {
        self.word_len
    }

    pub fn print_counts(&self) -> bool {
        self.print_counts
    }

    pub fn rng_seed(&self) -> u64 {
        self.rng_seed.unwrap_or(0)
    }

    /// Builds the pipeline [`Config`] from the flat CLI surface.
    pub fn to_config(&self) -> Config {
        let coverage = match self.fixed_coverage {
            Some(v) => CoverageMode::Fixed(v),
            None => match self.coverage_mode {
                CoverageModeArg::Dynamic => CoverageMode::Dynamic,
                CoverageModeArg::Median => CoverageMode::Median,
            },
        };

        Config {
            assembly: AssemblyGates {
                max_divergent: self.assembly.max_divergent,
                min_align_len: self.assembly.min_align_len,
                max_endgap: self.assembly.max_endgap,
                max_gaps: self.assembly.max_gaps,
            },
            grouping: GroupGates {
                max_uncovered: self.grouping.max_uncovered,
                min_group_coverage: self.grouping.min_group_coverage,
                min_group_size: self.grouping.min_group_size,
                max_group_divergence: self.grouping.max_group_divergence,
                max_group_rdivergence: self.grouping.max_group_rdivergence,
                min_group_rsize: self.grouping.min_group_rsize,
            },
            coverage,
            min_coverage: self.min_coverage,
            min_p: self.min_p,
            min_confirming: self.min_confirming,
            n_threads: self.threads.unwrap_or_else(num_cpus::get),
            word_len: self.word_len,
            max_kmers: self.max_kmers,
            max_regions: self.max_regions,
            ..Config::default()
        }
    }
}
