//! Single-region bisection fallback (`spec.md` §9 Design Notes,
//! `gassembler.c:assemble_recursive`).
//!
//! Used only by the single-region / library entry point, never by
//! [`crate::queue::RegionQueue`]: the work queue always emits an `NC`-only
//! block on zero included groups instead, since recursing would allocate a
//! second `CallBlock` for the same genomic span and break ordered emission
//! (`spec.md` §9).

use crate::align::SwAligner;
use crate::assembly::{AssemblyGates, GappedAssembler};
use crate::calling::{Call, CallBlock, Caller, ResolvedCoverage};
use crate::grouping::{GroupBuilder, GroupGates};
use crate::nucleotide::{MAX_REFERENCE_LENGTH, NSeq};
use crate::recruit::{KmerIndex, ReadRecruiter, SeqStore};
use crate::snv::SnvTable;
use crate::tagging::ReadTagger;

/// Tunables threaded through a single-region assembly, mirroring
/// [`crate::config::Config`] but scoped to what this module needs.
#[derive(Debug, Clone, Copy)]
pub struct BisectConfig {
    pub assembly: AssemblyGates,
    pub grouping: GroupGates,
    pub min_confirming: u32,
    pub min_coverage: u32,
    pub coverage: ResolvedCoverage,
}

/// Assembles and calls one reference window, recursively bisecting at the
/// midpoint whenever grouping yields zero included groups (`spec.md` §9).
/// Returns one `CallBlock` per leaf of the bisection (sorted by `start`,
/// since bisection always recurses left-then-right).
pub fn assemble_recursive<K: KmerIndex, S: SeqStore>(
    index: &K, store: &S, cfg: &BisectConfig, snvs: Option<&SnvTable>, fps: Option<&SnvTable>, chr: u8, start: u32, end: u32, ref_seq: &[u8],
    kmers: &[String],
) -> Vec<CallBlock> {
    if end.saturating_sub(start) > MAX_REFERENCE_LENGTH as u32 {
        if end - start < 2 {
            return vec![empty_block(chr, start, end)];
        }
        let mid = start + (end - start) / 2;
        let split = (mid - start) as usize;
        let (left_ref, right_ref) = ref_seq.split_at(split.min(ref_seq.len()));
        let mut left = assemble_recursive(index, store, cfg, snvs, fps, chr, start, mid, left_ref, kmers);
        let right = assemble_recursive(index, store, cfg, snvs, fps, chr, mid, end, right_ref, kmers);
        left.extend(right);
        return left;
    }

    let recruiter = ReadRecruiter::new(index, store);
    let Ok(reads) = recruiter.recruit(kmers) else {
        // Terminal rejection: too few reads recruited. Does not bisect
        // (`result == -1` in `assemble_recursive` is not `result == 0`).
        return vec![empty_block(chr, start, end)];
    };

    let ref_nseq = NSeq::from_bytes(ref_seq, MAX_REFERENCE_LENGTH);
    let assembler = GappedAssembler::new(cfg.assembly);
    let (alignment, _accepted) = assembler.assemble(&ref_nseq, start, &reads);

    let tagger = ReadTagger::new(snvs);
    let (tags, _n_divergent) = tagger.tag(&alignment, chr);
    let read_tags: Vec<(u64, u64)> = tags.iter().map(|&(t, m, _)| (t, m)).collect();

    let grouper = GroupBuilder::new(cfg.grouping, snvs);
    let group_result = grouper.build(&alignment, &read_tags, chr, start);

    if group_result.good_groups.is_empty() {
        if end - start < 2 {
            return vec![empty_block(chr, start, end)];
        }
        let mid = start + (end - start) / 2;
        let split = (mid - start) as usize;
        let (left_ref, right_ref) = ref_seq.split_at(split.min(ref_seq.len()));
        let mut left = assemble_recursive(index, store, cfg, snvs, fps, chr, start, mid, left_ref, kmers);
        let right = assemble_recursive(index, store, cfg, snvs, fps, chr, mid, end, right_ref, kmers);
        left.extend(right);
        return left;
    }

    let caller = Caller::new(cfg.min_confirming, cfg.min_coverage, fps);
    vec![caller.call(&alignment, &group_result, chr, ref_seq, start, end, cfg.coverage)]
}

fn empty_block(chr: u8, start: u32, end: u32) -> CallBlock {
    CallBlock {
        chr,
        start,
        end,
        calls: Vec::new(),
    }
}

/// Whether a block contains no confident calls at all (used by tests and by
/// callers that want to treat a bisection leaf as "no call" for the whole
/// span it covers).
pub fn is_nc_only(block: &CallBlock) -> bool {
    block.calls.iter().all(|c: &Call| c.nucl[0].is_none())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::recruit::test_doubles::{InMemoryKmerIndex, InMemorySeqStore};
    use crate::recruit::{ReadLocation, Strand};

    fn default_cfg() -> BisectConfig {
        BisectConfig {
            assembly: AssemblyGates::default(),
            grouping: GroupGates::default(),
            min_confirming: 2,
            min_coverage: 1,
            coverage: ResolvedCoverage::Dynamic,
        }
    }

    fn build_homogeneous_region(n_reads: usize, seq: &[u8]) -> (InMemoryKmerIndex, InMemorySeqStore) {
        let mut index = InMemoryKmerIndex::new();
        let mut store = InMemorySeqStore::new();
        let locations: Vec<ReadLocation> = (0..n_reads)
            .map(|i| ReadLocation {
                file_idx: 0,
                name_offset: i as u64,
                strand: Strand::Forward,
            })
            .collect();
        index.insert("AAAAA", Strand::Forward, 1, locations.clone());
        for loc in &locations {
            store.insert(loc.file_idx, loc.name_offset, "r", seq);
        }
        (index, store)
    }

    #[test]
    fn too_few_reads_is_terminal_not_bisected() {
        let (index, store) = build_homogeneous_region(5, b"ACGTACGTACGTACGTACGTACGTACGT");
        let cfg = default_cfg();
        let blocks = assemble_recursive(
            &index,
            &store,
            &cfg,
            None,
            None,
            1,
            1000,
            1010,
            b"ACGTACGTAC",
            &["AAAAA".to_string()],
        );
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].calls.is_empty());
    }

    #[test]
    fn oversized_reference_bisects_until_within_bounds() {
        let (index, store) = build_homogeneous_region(20, b"ACGTACGTACGTACGTACGTACGTACGT");
        let cfg = default_cfg();
        let ref_seq = vec![b'A'; (MAX_REFERENCE_LENGTH + 10) as usize];
        let blocks = assemble_recursive(&index, &store, &cfg, None, None, 1, 0, MAX_REFERENCE_LENGTH as u32 + 10, &ref_seq, &["AAAAA".to_string()]);
        assert!(blocks.len() >= 2);
        for w in blocks.windows(2) {
            assert!(w[0].start < w[1].start);
        }
    }

    #[test]
    fn sufficient_homogeneous_reads_yield_one_block_with_calls() {
        let seq = b"ACGTACGTACGTACGTACGTACGTACGT";
        let (index, store) = build_homogeneous_region(20, seq);
        let cfg = default_cfg();
        let blocks = assemble_recursive(&index, &store, &cfg, None, None, 1, 1000, 1000 + seq.len() as u32, seq, &["AAAAA".to_string()]);
        assert_eq!(blocks.len(), 1);
        assert!(!blocks[0].calls.is_empty());
        assert!(blocks[0].calls.iter().any(|c| c.nucl[0].is_some()));
    }
}
