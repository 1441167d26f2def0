//! Parallel region dispatch and ordered call emission (`spec.md` §4.7/§5),
//! following `gassembler.c`'s `GASMQueue`/`process`/`print_calls`.
//!
//! Unlike [`crate::bisect`], a region that yields zero included groups here
//! emits an `NC`-only block instead of recursing: bisecting after a
//! `CallBlock` has already been queued for emission would allocate a second
//! block for the same genomic span and break the ordering invariant below.

use std::io::Write;
use std::sync::{Condvar, Mutex};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256StarStar;

use crate::assembly::GappedAssembler;
use crate::calling::{Call, CallBlock, Caller, ResolvedCoverage};
use crate::chrom::{self, chr_from_text};
use crate::config::{Config, CoverageMode};
use crate::grouping::GroupBuilder;
use crate::nucleotide::{NSeq, NucCode, MAX_REFERENCE_LENGTH};
use crate::recruit::{KmerIndex, ReadRecruiter, SeqStore};
use crate::snv::SnvTable;
use crate::tagging::ReadTagger;

/// How many regions `CoverageMode::Median` samples before workers start.
const MEDIAN_SAMPLE_SIZE: usize = 64;

/// One parsed region-file record (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct RegionSpec {
    pub chr: u8,
    pub start: u32,
    pub end: u32,
    pub ref_seq: Vec<u8>,
    pub kmers: Vec<String>,
}

/// Parses one region-file line: `CHR \t START \t END \t REFSEQ \t KMER1 KMER2
/// ... KMERn`. Whitespace-delimited, strict (`spec.md` §6): returns `None` on
/// a malformed line, which the caller logs and skips.
pub fn parse_region_line(line: &str) -> Option<RegionSpec> {
    let mut fields = line.split_whitespace();
    let chr = chr_from_text(fields.next()?)?;
    let start: u32 = fields.next()?.parse().ok()?;
    let end: u32 = fields.next()?.parse().ok()?;
    if end <= start {
        return None;
    }
    let ref_seq = fields.next()?.as_bytes().to_vec();
    let kmers: Vec<String> = fields.map(str::to_string).collect();
    if kmers.is_empty() {
        return None;
    }
    Some(RegionSpec { chr, start, end, ref_seq, kmers })
}

struct ProcessingEntry {
    id: u64,
    chr: u8,
    start: u32,
}

struct Shared<W> {
    regions: Vec<RegionSpec>,
    cursor: usize,
    nrunning: usize,
    next_id: u64,
    processing: Vec<ProcessingEntry>,
    finished: Vec<CallBlock>,
    last_chr: Option<u8>,
    last_pos: Option<u32>,
    writer: W,
}

/// Releases, in strict `(chr, pos)` order, any finished block whose `end` is
/// at or before the smallest `start` still in flight (no in-flight region can
/// generate an earlier call). `spec.md` §4.7.
fn emit_completed<W: Write>(state: &mut Shared<W>, print_counts: bool, min_p: f64) {
    loop {
        let min_processing_start = state.processing.iter().map(|p| (p.chr, p.start)).min();

        let Some(idx) = state
            .finished
            .iter()
            .enumerate()
            .filter(|(_, b)| match min_processing_start {
                Some((chr, start)) => b.chr < chr || (b.chr == chr && b.end <= start),
                None => true,
            })
            .min_by_key(|(_, b)| (b.chr, b.start))
            .map(|(i, _)| i)
        else {
            return;
        };

        let chr = state.finished[idx].chr;
        let (start, end) = (state.finished[idx].start, state.finished[idx].end);

        for pos in start..end {
            if state.last_chr == Some(chr) && state.last_pos.is_some_and(|lp| pos <= lp) {
                continue;
            }

            // Select exactly one winning block for this position (scanning
            // every sub-column together, not per-sub), matching
            // `print_calls`: a single block's own calls are never spliced
            // with another block's at the same position, even when
            // insertion sub-columns are involved.
            let mut best_cov = 0u32;
            let mut best_p = -1.0f64;
            let mut winning_block: Option<usize> = None;

            for (bi, block) in state.finished.iter().enumerate() {
                if block.chr != chr || block.start > pos {
                    continue;
                }
                for call in block.calls.iter().filter(|c| c.pos == pos) {
                    if call.p < best_p || (call.p == best_p && call.cov < best_cov) {
                        continue;
                    }
                    best_p = call.p;
                    best_cov = call.cov;
                    winning_block = Some(bi);
                }
            }

            if let Some(bi) = winning_block {
                let any_poly = state.finished[bi].calls.iter().any(|c| c.pos == pos && c.poly);
                if any_poly || best_p < min_p {
                    let mut subs: Vec<Call> = state.finished[bi].calls.iter().filter(|c| c.pos == pos).cloned().collect();
                    subs.sort_by_key(|c| c.sub);
                    for call in &subs {
                        write_call(&mut state.writer, chr, call, print_counts);
                    }
                }
            }

            state.last_chr = Some(chr);
            state.last_pos = Some(pos);
        }

        state.finished.remove(idx);
    }
}

fn write_call<W: Write>(writer: &mut W, chr: u8, call: &Call, print_counts: bool) {
    let call_text = match (call.nucl[0], call.nucl[1]) {
        (Some(n0), Some(n1)) => {
            let (lo, hi) = if n0.as_u8() <= n1.as_u8() { (n0, n1) } else { (n1, n0) };
            format!("{}{}", lo.to_base() as char, hi.to_base() as char)
        }
        _ => "NC".to_string(),
    };
    let class_char = call.class().map(|c| c.as_char()).unwrap_or('0');
    let _ = write!(
        writer,
        "{}\t{}\t{}\t{}\t{}\t{}\t{:.4}\t{}",
        chrom::chr_name(chr),
        call.pos + 1,
        call.ref_code.to_base() as char,
        call.cov,
        call_text,
        class_char,
        call.p,
        call.prev_ref,
    );
    if print_counts {
        let _ = write!(
            writer,
            "\t{}\t{}\t{}\t{}\t{}\t{}",
            call.counts[NucCode::A.as_u8() as usize],
            call.counts[NucCode::C.as_u8() as usize],
            call.counts[NucCode::G.as_u8() as usize],
            call.counts[NucCode::T.as_u8() as usize],
            call.counts[NucCode::N.as_u8() as usize],
            call.counts[NucCode::Gap.as_u8() as usize],
        );
    }
    let _ = writeln!(writer);
}

/// Parses, dispatches, and emits calls for a whole region file.
pub struct RegionQueue<'a, K, S> {
    index: &'a K,
    store: &'a S,
    config: Config,
    snvs: Option<&'a SnvTable>,
    fps: Option<&'a SnvTable>,
}

impl<'a, K, S> RegionQueue<'a, K, S>
where
    K: KmerIndex + Sync,
    S: SeqStore + Sync,
{
    pub fn new(index: &'a K, store: &'a S, config: Config, snvs: Option<&'a SnvTable>, fps: Option<&'a SnvTable>) -> Self {
        Self { index, store, config, snvs, fps }
    }

    /// Runs every region in `regions` through `config.n_threads` worker
    /// threads, writing emitted call rows to `out`. Returns the number of
    /// regions processed. `rng_seed` only matters for `CoverageMode::Median`.
    pub fn run<W: Write + Send>(&self, regions: Vec<RegionSpec>, out: W, print_counts: bool, rng_seed: u64) -> usize {
        let n_regions = regions.len();
        let coverage = match self.config.coverage {
            CoverageMode::Fixed(v) => ResolvedCoverage::Fixed(v),
            CoverageMode::Dynamic => ResolvedCoverage::Dynamic,
            CoverageMode::Median => ResolvedCoverage::Fixed(self.estimate_median_coverage(&regions, rng_seed)),
        };

        let n_threads = self.config.n_threads.max(1);
        let shared = Mutex::new(Shared {
            regions,
            cursor: 0,
            nrunning: n_threads,
            next_id: 0,
            processing: Vec::new(),
            finished: Vec::new(),
            last_chr: None,
            last_pos: None,
            writer: out,
        });
        let cv = Condvar::new();

        std::thread::scope(|scope| {
            for _ in 0..n_threads {
                scope.spawn(|| self.worker(&shared, &cv, coverage, print_counts));
            }
        });

        let mut state = shared.into_inner().expect("no poisoned worker panicked under the lock");
        emit_completed(&mut state, print_counts, self.config.min_p);
        n_regions
    }

    fn worker<W: Write + Send>(&self, shared: &Mutex<Shared<W>>, cv: &Condvar, coverage: ResolvedCoverage, print_counts: bool) {
        loop {
            let (region, my_id) = {
                let mut guard = shared.lock().unwrap();
                loop {
                    if guard.cursor < guard.regions.len() {
                        let region = guard.regions[guard.cursor].clone();
                        guard.cursor += 1;
                        let id = guard.next_id;
                        guard.next_id += 1;
                        guard.processing.push(ProcessingEntry { id, chr: region.chr, start: region.start });
                        emit_completed(&mut guard, print_counts, self.config.min_p);
                        break (region, id);
                    }
                    if guard.nrunning <= 1 {
                        guard.nrunning -= 1;
                        cv.notify_all();
                        return;
                    }
                    guard = cv.wait(guard).unwrap();
                }
            };

            let block = self.run_region(&region, coverage);

            let mut guard = shared.lock().unwrap();
            guard.processing.retain(|p| p.id != my_id);
            guard.finished.push(block);
            emit_completed(&mut guard, print_counts, self.config.min_p);
            cv.notify_all();
        }
    }

    /// The region pipeline (`spec.md` §4.2-§4.6), non-recursive: any rejection
    /// along the way yields an `NC`-only block instead of bisecting.
    fn run_region(&self, region: &RegionSpec, coverage: ResolvedCoverage) -> CallBlock {
        if region.end.saturating_sub(region.start) > MAX_REFERENCE_LENGTH as u32 {
            return CallBlock::nc_only(region.chr, region.start, region.end, &region.ref_seq);
        }

        let recruiter = ReadRecruiter::new(self.index, self.store);
        let Ok(reads) = recruiter.recruit(&region.kmers) else {
            return CallBlock::nc_only(region.chr, region.start, region.end, &region.ref_seq);
        };

        let ref_nseq = NSeq::from_bytes(&region.ref_seq, MAX_REFERENCE_LENGTH);
        let assembler = GappedAssembler::new(self.config.assembly);
        let (alignment, _accepted) = assembler.assemble(&ref_nseq, region.start, &reads);

        let tagger = ReadTagger::new(self.snvs);
        let (tags, _n_divergent) = tagger.tag(&alignment, region.chr);
        let read_tags: Vec<(u64, u64)> = tags.iter().map(|&(t, m, _)| (t, m)).collect();

        let grouper = GroupBuilder::new(self.config.grouping, self.snvs);
        let group_result = grouper.build(&alignment, &read_tags, region.chr, region.start);

        let caller = Caller::new(self.config.min_confirming, self.config.min_coverage, self.fps);
        caller.call(&alignment, &group_result, region.chr, &region.ref_seq, region.start, region.end, coverage)
    }

    /// `CoverageMode::Median`: samples up to [`MEDIAN_SAMPLE_SIZE`] regions,
    /// runs each region's own maximum observed coverage through the usual
    /// pipeline, and takes the median. Run once, before workers start
    /// (`spec.md` §9 "Coverage 'mode'").
    fn estimate_median_coverage(&self, regions: &[RegionSpec], seed: u64) -> u32 {
        let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..regions.len()).collect();
        order.shuffle(&mut rng);
        order.truncate(MEDIAN_SAMPLE_SIZE.min(regions.len()));

        let mut observed: Vec<u32> = order
            .into_iter()
            .filter_map(|i| {
                let block = self.run_region(&regions[i], ResolvedCoverage::Dynamic);
                block.calls.iter().map(|c| c.cov).max().filter(|&cov| cov > 0)
            })
            .collect();

        if observed.is_empty() {
            return 0;
        }
        observed.sort_unstable();
        observed[observed.len() / 2]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::assembly::AssemblyGates;
    use crate::chrom::CHR_X;
    use crate::recruit::test_doubles::{InMemoryKmerIndex, InMemorySeqStore};
    use crate::recruit::{ReadLocation, Strand};

    fn homogeneous_region(chr: u8, start: u32, seq: &[u8], n_reads: usize, kmer: &str) -> (InMemoryKmerIndex, InMemorySeqStore, RegionSpec) {
        let mut index = InMemoryKmerIndex::new();
        let mut store = InMemorySeqStore::new();
        let locations: Vec<ReadLocation> = (0..n_reads)
            .map(|i| ReadLocation {
                file_idx: chr as u32,
                name_offset: i as u64,
                strand: Strand::Forward,
            })
            .collect();
        index.insert(kmer, Strand::Forward, 1, locations.clone());
        for loc in &locations {
            store.insert(loc.file_idx, loc.name_offset, "r", seq);
        }
        let region = RegionSpec {
            chr,
            start,
            end: start + seq.len() as u32,
            ref_seq: seq.to_vec(),
            kmers: vec![kmer.to_string()],
        };
        (index, store, region)
    }

    /// Region built from reads that need not share one sequence (indels,
    /// heterozygous columns), all recruited through a single opaque kmer.
    fn region_with_reads(chr: u8, start: u32, ref_seq: &[u8], reads: &[&[u8]], kmer: &str) -> (InMemoryKmerIndex, InMemorySeqStore, RegionSpec) {
        let mut index = InMemoryKmerIndex::new();
        let mut store = InMemorySeqStore::new();
        let locations: Vec<ReadLocation> = (0..reads.len())
            .map(|i| ReadLocation {
                file_idx: chr as u32,
                name_offset: i as u64,
                strand: Strand::Forward,
            })
            .collect();
        index.insert(kmer, Strand::Forward, 1, locations.clone());
        for (loc, seq) in locations.iter().zip(reads.iter()) {
            store.insert(loc.file_idx, loc.name_offset, "r", seq);
        }
        let region = RegionSpec {
            chr,
            start,
            end: start + ref_seq.len() as u32,
            ref_seq: ref_seq.to_vec(),
            kmers: vec![kmer.to_string()],
        };
        (index, store, region)
    }

    /// A [`Config`] with `min_align_len` scaled down to fit the handful of
    /// reference bases these toy regions use; the documented default (25)
    /// assumes windows much longer than these illustrative examples.
    fn small_window_config(n_threads: usize) -> Config {
        Config {
            n_threads,
            assembly: AssemblyGates {
                min_align_len: 5,
                ..AssemblyGates::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn parses_well_formed_line() {
        let line = "1\t100\t110\tACGTACGTAC\tAAAAA CCCCC";
        let region = parse_region_line(line).unwrap();
        assert_eq!(region.chr, 1);
        assert_eq!(region.start, 100);
        assert_eq!(region.end, 110);
        assert_eq!(region.kmers, vec!["AAAAA".to_string(), "CCCCC".to_string()]);
    }

    #[test]
    fn rejects_lines_missing_kmers_or_with_bad_chromosome() {
        assert!(parse_region_line("1\t100\t110\tACGT").is_none());
        assert!(parse_region_line("MT\t100\t110\tACGT\tAAAAA").is_none());
        assert!(parse_region_line("1\t110\t100\tACGT\tAAAAA").is_none());
    }

    #[test]
    fn single_homozygous_region_emits_one_row_per_column() {
        // spec.md §8 scenario 1: 20 identical reads over a 10bp window, no
        // divergence anywhere, so every column is a confident silent call.
        let seq = b"ACGTACGTAC";
        let (index, store, region) = homogeneous_region(1, 100, seq, 20, "AAAAA");
        let queue = RegionQueue::new(&index, &store, small_window_config(1), None, None);
        let mut out = Vec::new();
        let n = queue.run(vec![region], &mut out, false, 1);
        assert_eq!(n, 1);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), seq.len());
        for (i, line) in text.lines().enumerate() {
            let cols: Vec<&str> = line.split('\t').collect();
            assert_eq!(cols[2], (seq[i] as char).to_string(), "REF column");
            assert_eq!(cols[3], "20", "COVERAGE column");
            assert_eq!(cols[4], format!("{0}{0}", seq[i] as char), "CALL column matches the reference homozygously");
            assert_eq!(cols[5], "0", "CLASS column is silent");
        }
    }

    #[test]
    fn heterozygous_snv_is_called_with_both_alleles() {
        // spec.md §8 scenario 2: half the reads carry a single-base
        // substitution, giving one divergent column with both alleles
        // confirmed and every other column silent.
        let ref_seq = b"ACGTACGTAC";
        let mut alt = ref_seq.to_vec();
        alt[4] = b'G';
        let reads_ref: Vec<&[u8]> = std::iter::repeat(&ref_seq[..]).take(10).collect();
        let reads_alt: Vec<&[u8]> = std::iter::repeat(alt.as_slice()).take(10).collect();
        let reads: Vec<&[u8]> = reads_ref.into_iter().chain(reads_alt).collect();

        let (index, store, region) = region_with_reads(1, 100, ref_seq, &reads, "AAAAA");
        let queue = RegionQueue::new(&index, &store, small_window_config(1), None, None);
        let mut out = Vec::new();
        queue.run(vec![region], &mut out, false, 1);
        let text = String::from_utf8(out).unwrap();
        let rows: Vec<Vec<&str>> = text.lines().map(|l| l.split('\t').collect()).collect();

        // A divergent call is always printed regardless of its confidence
        // score, so the SNV row (pos 105, ref offset 4) is present even if
        // some of the unanimous columns around it are suppressed as
        // unremarkable (`spec.md` §4.7's `any_poly` gate).
        let snv_row = rows.iter().find(|r| r[1] == "105").expect("the SNV column should be printed");
        assert_eq!(snv_row[2], "A", "REF column");
        assert_eq!(snv_row[4], "AG", "both alleles confirmed, sorted by code");
        assert_eq!(snv_row[5], "S", "substitution, not silent");
        let p: f64 = snv_row[6].parse().unwrap();
        assert!(p > 0.5, "a balanced, fully-confirmed heterozygous call should be confident, got p={p}");

        assert!(
            rows.iter().all(|r| r[1] == "105" || r[5] != "S"),
            "no column besides the SNV itself should be reported as a substitution"
        );
    }

    #[test]
    fn single_base_insertion_emits_an_extra_column() {
        // spec.md §8 scenario 3: every read carries the same extra base
        // relative to the reference, producing one insertion column shared
        // with the preceding reference position.
        let ref_seq = b"ACGTACGTAC";
        let read = b"ACGTAGCGTAC";
        let reads: Vec<&[u8]> = std::iter::repeat(&read[..]).take(15).collect();

        let (index, store, region) = region_with_reads(1, 100, ref_seq, &reads, "AAAAA");
        let queue = RegionQueue::new(&index, &store, small_window_config(1), None, None);
        let mut out = Vec::new();
        queue.run(vec![region], &mut out, false, 1);
        let text = String::from_utf8(out).unwrap();
        let rows: Vec<Vec<&str>> = text.lines().map(|l| l.split('\t').collect()).collect();

        let inserted = rows.iter().find(|r| r[2] == "-").expect("an insertion column with REF='-' should be emitted");
        assert_eq!(inserted[4], "GG");
        assert_eq!(inserted[5], "I");
    }

    #[test]
    fn single_base_deletion_calls_a_gap_pair() {
        // spec.md §8 scenario 4: every read is missing one reference base,
        // so that column's confirmed genotype is a homozygous gap.
        let ref_seq = b"ACGTACGTAC";
        let read = b"ACGTCGTAC";
        let reads: Vec<&[u8]> = std::iter::repeat(&read[..]).take(15).collect();

        let (index, store, region) = region_with_reads(1, 100, ref_seq, &reads, "AAAAA");
        let queue = RegionQueue::new(&index, &store, small_window_config(1), None, None);
        let mut out = Vec::new();
        queue.run(vec![region], &mut out, false, 1);
        let text = String::from_utf8(out).unwrap();
        let rows: Vec<Vec<&str>> = text.lines().map(|l| l.split('\t').collect()).collect();

        // A homozygous gap is still `poly` (it differs from the reference
        // base), so it is printed unconditionally like the SNV above.
        let deleted = rows.iter().find(|r| r[1] == "105").expect("the deletion column should be printed");
        assert_eq!(deleted[2], "A");
        assert_eq!(deleted[4], "--");
        assert_eq!(deleted[5], "D");
    }

    #[test]
    fn insufficient_reads_yield_nc_only_block() {
        // spec.md §8 scenario 5: fewer reads than MIN_READS recruits nothing,
        // so the whole window falls back to one NC row per column.
        let seq = b"ACGTACGTAC";
        let (index, store, region) = homogeneous_region(1, 100, seq, 5, "AAAAA");
        let queue = RegionQueue::new(&index, &store, small_window_config(1), None, None);
        let mut out = Vec::new();
        queue.run(vec![region], &mut out, false, 1);
        let text = String::from_utf8(out).unwrap();
        let rows: Vec<Vec<&str>> = text.lines().map(|l| l.split('\t').collect()).collect();
        assert_eq!(rows.len(), seq.len());
        for row in &rows {
            assert_eq!(row[4], "NC");
            assert_eq!(row[3], "0");
            assert_eq!(row[6], "0.0000");
        }
    }

    #[test]
    fn two_regions_on_different_chromosomes_emit_in_chr_start_order() {
        let seq = b"ACGTACGTAC";
        let region_x = RegionSpec {
            chr: CHR_X,
            start: 200,
            end: 200 + seq.len() as u32,
            ref_seq: seq.to_vec(),
            kmers: vec!["AAAAA".to_string()],
        };
        let region_1 = RegionSpec {
            chr: 1,
            start: 50,
            end: 50 + seq.len() as u32,
            ref_seq: seq.to_vec(),
            kmers: vec!["CCCCC".to_string()],
        };

        // One combined index/store serves both regions.
        let mut index = InMemoryKmerIndex::new();
        let mut store = InMemorySeqStore::new();
        let locations_x: Vec<ReadLocation> = (0..20)
            .map(|i| ReadLocation {
                file_idx: 24,
                name_offset: i,
                strand: Strand::Forward,
            })
            .collect();
        let locations_1: Vec<ReadLocation> = (0..20)
            .map(|i| ReadLocation {
                file_idx: 1,
                name_offset: i,
                strand: Strand::Forward,
            })
            .collect();
        index.insert("AAAAA", Strand::Forward, 1, locations_x.clone());
        index.insert("CCCCC", Strand::Forward, 2, locations_1.clone());
        for loc in &locations_x {
            store.insert(loc.file_idx, loc.name_offset, "r", seq);
        }
        for loc in &locations_1 {
            store.insert(loc.file_idx, loc.name_offset, "r", seq);
        }

        let queue = RegionQueue::new(&index, &store, small_window_config(4), None, None);
        let mut out = Vec::new();
        queue.run(vec![region_x, region_1], &mut out, false, 7);

        let text = String::from_utf8(out).unwrap();
        let chrs: Vec<&str> = text.lines().map(|l| l.split('\t').next().unwrap()).collect();
        let first_x = chrs.iter().position(|&c| c == "X").unwrap();
        let first_1 = chrs.iter().position(|&c| c == "1").unwrap();
        assert!(first_1 < first_x, "chr1 calls must emit before chrX calls regardless of completion order");
    }

    #[test]
    fn oversized_reference_window_emits_nc_only_without_recruiting() {
        let index = InMemoryKmerIndex::new();
        let store = InMemorySeqStore::new();
        let config = Config {
            n_threads: 1,
            ..Config::default()
        };
        let queue = RegionQueue::new(&index, &store, config, None, None);
        let ref_seq = vec![b'A'; MAX_REFERENCE_LENGTH + 1];
        let region = RegionSpec {
            chr: 1,
            start: 0,
            end: MAX_REFERENCE_LENGTH as u32 + 1,
            ref_seq,
            kmers: vec!["AAAAA".to_string()],
        };
        let mut out = Vec::new();
        queue.run(vec![region], &mut out, false, 1);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), MAX_REFERENCE_LENGTH + 1);
        assert!(text.lines().all(|l| l.split('\t').nth(4) == Some("NC")));
    }
}
