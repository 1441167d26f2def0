//! Builds a rectangular, column-oriented multiple alignment out of
//! independent pairwise alignments against the reference (`spec.md` §4.3).

#[cfg(not(feature = "dev_no_rayon"))]
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::align::{SwAlignment, SwAligner};
use crate::nucleotide::{NSeq, NucCode};
use crate::recruit::Read;

pub const MAX_ALIGNED_READS: usize = 1024;

/// Per-read acceptance gates, `spec.md` §4.3.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyGates {
    pub max_divergent: u32,
    pub min_align_len: u32,
    pub max_endgap: u32,
    pub max_gaps: u32,
}

impl Default for AssemblyGates {
    fn default() -> Self {
        Self {
            max_divergent: 4,
            min_align_len: 25,
            max_endgap: 1,
            max_gaps: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum AssemblyError {
    #[error("too divergent: {0} columns")]
    TooDivergent(u32),
    #[error("alignment too short: {0}")]
    AlignmentTooShort(u32),
    #[error("endgap too long: start {0} end {1}")]
    EndgapTooLong(u32, u32),
    #[error("total gap length too long: {0}")]
    GapsTooLong(u32),
}

/// One reference-relative column of the gapped alignment: the reference's
/// own code (or `Gap` when this column was opened purely by read insertions)
/// and its absolute genomic position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefColumn {
    pub pos: u32,
    pub code: NucCode,
}

/// A rectangular multiple alignment: one reference row and one row per
/// accepted read, all the same length (`p_len` in `spec.md` §4.3).
#[derive(Debug, Clone)]
pub struct GappedAlignment {
    pub ref_cols: Vec<RefColumn>,
    /// `rows[r][c]` is the nucleotide code read `r` contributes at column
    /// `c`, or `None` if the read does not cover that column (collapsing the
    /// three distinct "uncovered" cases the per-read map distinguishes
    /// transiently; see `DESIGN.md`).
    pub rows: Vec<Vec<Option<NucCode>>>,
}

impl GappedAlignment {
    pub fn n_cols(&self) -> usize {
        self.ref_cols.len()
    }

    pub fn n_reads(&self) -> usize {
        self.rows.len()
    }
}

/// Counts divergence between a reference and read sequence from an SW
/// alignment's matched-pair list, following `count_divergent_from_alignment`
/// exactly: only the two alignment endpoints are treated as gaps, interior
/// indels are not counted here (see `SPEC_FULL.md` §11).
fn count_divergence(
    ref_seq: &NSeq, read_seq: &NSeq, a_pos: &[usize], b_pos: &[usize],
) -> (u32, u32, u32, u32) {
    let align_len = a_pos.len();
    let mut n_gaps = 0u32;
    let mut gaps_total = 0u32;
    let mut s_gap = 0u32;
    let mut e_gap = 0u32;

    if a_pos[0] > 0 && b_pos[0] > 0 {
        let min = a_pos[0].min(b_pos[0]) as u32;
        n_gaps += 1;
        s_gap = min;
        gaps_total += min;
    }
    let (last_a, last_b) = (a_pos[align_len - 1], b_pos[align_len - 1]);
    if last_a < ref_seq.len() - 1 && last_b < read_seq.len() - 1 {
        let min = (ref_seq.len() - 1 - last_a).min(read_seq.len() - 1 - last_b) as u32;
        n_gaps += 1;
        e_gap = min;
        gaps_total += min;
    }

    let mut n_divergent = n_gaps;
    for i in 0..align_len {
        if ref_seq.get(a_pos[i]) != read_seq.get(b_pos[i]) {
            n_divergent += 1;
        }
    }
    (n_divergent, s_gap, e_gap, gaps_total)
}

/// Builds one read's per-reference-column map (`a[na][...]` in
/// `align_reads_to_reference`). `Some(p)` is a read offset; repeated values
/// across consecutive columns signal an interior deletion in the read and
/// are resolved to `GAP` during the merge. `None` covers every case where
/// the column lies outside what the local alignment resolved for this read
/// (before its start, after its end, or an unaligned overhang at either
/// end), matching `BEFORE`/`AFTER`/`UNKNOWN` being indistinguishable by the
/// time `create_gapped_alignment` reads them.
fn build_ref_map(ref_len: usize, a_pos: &[usize], b_pos: &[usize]) -> Vec<Option<usize>> {
    let align_len = a_pos.len();
    let mut map = vec![None; ref_len];

    // Columns before the first aligned pair: whether this is BEFORE (read
    // too short to reach here) or UNKNOWN (read has bases but alignment did
    // not resolve them) makes no difference once merged (see module docs),
    // so both collapse to `None` directly.
    let first_ref = a_pos[0];
    map[..first_ref].fill(None);
    map[first_ref] = Some(b_pos[0]);
    let mut last = first_ref;
    for j in 1..align_len {
        let rp = a_pos[j];
        for k in (last + 1)..rp {
            map[k] = map[last];
        }
        map[rp] = Some(b_pos[j]);
        last = rp;
    }
    let last_ref = a_pos[align_len - 1];
    map[(last_ref + 1)..ref_len].fill(None);
    map
}

/// Merges accepted reads' per-column maps into a single gapped alignment,
/// following `create_gapped_alignment` exactly: at each reference position,
/// the widest read-side insertion run any accepted read opens determines how
/// many extra columns are emitted before the reference advances.
fn merge_gapped_alignment(ref_seq: &NSeq, ref_start: u32, read_seqs: &[&NSeq], maps: &[Vec<Option<usize>>]) -> GappedAlignment {
    let ref_len = ref_seq.len();
    let na = maps.len();
    let mut ref_p = 0usize;
    let mut last_ref_p: Option<usize> = None;
    let mut read_p: Vec<i64> = maps.iter().map(|m| m[0].map_or(-1, |p| p as i64)).collect();
    let mut last_read_p: Vec<i64> = vec![-1; na];

    let mut ref_cols = Vec::new();
    let mut rows: Vec<Vec<Option<NucCode>>> = vec![Vec::new(); na];

    while ref_p < ref_len {
        let is_primary = last_ref_p.is_none_or(|lrp| ref_p > lrp);
        let code = if is_primary {
            last_ref_p = Some(ref_p);
            ref_seq.get(ref_p).expect("ref_p within bounds")
        } else {
            NucCode::Gap
        };
        ref_cols.push(RefColumn {
            pos: ref_start + ref_p as u32,
            code,
        });

        for i in 0..na {
            let cell = if read_p[i] >= 0 && (last_read_p[i] < 0 || read_p[i] > last_read_p[i]) {
                last_read_p[i] = read_p[i];
                Some(read_seqs[i].get(read_p[i] as usize).expect("read_p within bounds"))
            } else if read_p[i] >= 0 {
                Some(NucCode::Gap)
            } else {
                None
            };
            rows[i].push(cell);
        }

        let mut rgap = 1i64;
        if ref_p < ref_len - 1 {
            let next_ref_p = ref_p + 1;
            for i in 0..na {
                let next_read_p = maps[i][next_ref_p].map_or(-1, |p| p as i64);
                if read_p[i] >= 0 && next_read_p >= 0 {
                    let gap = next_read_p - read_p[i];
                    if gap > rgap {
                        rgap = gap;
                    }
                }
            }
        }
        if ref_p < ref_len - 1 {
            let next_ref_p = ref_p + 1;
            for i in 0..na {
                let next_read_p = maps[i][next_ref_p].map_or(-1, |p| p as i64);
                if next_read_p >= 0 {
                    if read_p[i] < 0 {
                        if rgap == 1 {
                            read_p[i] = next_read_p;
                        }
                    } else if read_p[i] < next_read_p {
                        let delta = next_read_p - read_p[i];
                        if delta == rgap {
                            read_p[i] += 1;
                        }
                    }
                } else {
                    read_p[i] = -1;
                }
            }
        }
        if rgap == 1 {
            ref_p += 1;
        }
    }

    GappedAlignment { ref_cols, rows }
}

/// Aligns each recruited read against the reference and merges the accepted
/// ones into a single gapped alignment, applying the acceptance gates of
/// `spec.md` §4.3. Returns the alignment and the indices (into `reads`) of
/// the accepted reads, in the order they appear as alignment rows.
pub struct GappedAssembler {
    aligner: SwAligner,
    gates: AssemblyGates,
}

impl GappedAssembler {
    pub fn new(gates: AssemblyGates) -> Self {
        Self {
            aligner: SwAligner::new(),
            gates,
        }
    }

    /// Runs the per-read Smith-Waterman pass (`spec.md` §4.3's independent
    /// pairwise step), in parallel across reads via rayon when the
    /// `dev_no_rayon` feature is not set, matching the teacher's
    /// `align_all`/`par_bridge` pattern in its standalone aligner. Each
    /// read's alignment is independent of every other read's, so this step
    /// has no ordering requirement of its own; ordering is restored
    /// afterward when the acceptance gates are applied sequentially.
    fn align_reads(&self, ref_seq: &NSeq, reads: &[Read]) -> Vec<SwAlignment> {
        #[cfg(not(feature = "dev_no_rayon"))]
        {
            reads.par_iter().map(|read| self.aligner.align(ref_seq, &read.encoded)).collect()
        }
        #[cfg(feature = "dev_no_rayon")]
        {
            reads.iter().map(|read| self.aligner.align(ref_seq, &read.encoded)).collect()
        }
    }

    pub fn assemble(&self, ref_seq: &NSeq, ref_start: u32, reads: &[Read]) -> (GappedAlignment, Vec<usize>) {
        let mut accepted_idx = Vec::new();
        let mut accepted_maps = Vec::new();
        let mut accepted_seqs: Vec<&NSeq> = Vec::new();

        let alignments = self.align_reads(ref_seq, reads);

        for (i, (read, alignment)) in reads.iter().zip(alignments.iter()).enumerate() {
            if alignment.is_empty() {
                continue;
            }
            let (n_divergent, s_gap, e_gap, gaps_total) =
                count_divergence(ref_seq, &read.encoded, &alignment.a_pos, &alignment.b_pos);

            if n_divergent > self.gates.max_divergent {
                continue;
            }
            if (alignment.len() as u32) < self.gates.min_align_len {
                continue;
            }
            if s_gap > self.gates.max_endgap || e_gap > self.gates.max_endgap {
                continue;
            }
            if gaps_total > self.gates.max_gaps {
                continue;
            }

            let map = build_ref_map(ref_seq.len(), &alignment.a_pos, &alignment.b_pos);
            accepted_idx.push(i);
            accepted_maps.push(map);
            accepted_seqs.push(&read.encoded);

            if accepted_idx.len() >= MAX_ALIGNED_READS {
                eprintln!("gasm-core: maximum number of aligned reads ({MAX_ALIGNED_READS}) reached, remaining reads ignored");
                break;
            }
        }

        let alignment = merge_gapped_alignment(ref_seq, ref_start, &accepted_seqs, &accepted_maps);
        assert!(alignment.n_cols() <= 2 * ref_seq.len());
        (alignment, accepted_idx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn seq(s: &[u8]) -> NSeq {
        NSeq::from_bytes(s, 256)
    }

    fn read(name: &str, s: &[u8]) -> Read {
        let mut r = crate::recruit::Read {
            name: name.to_string(),
            raw_seq: s.to_vec(),
            encoded: NSeq::from_bytes(s, 128),
            group_id: None,
            tag: 0,
            mask: 0,
            unknown: 0,
        };
        r.encoded = NSeq::from_bytes(s, 128);
        r
    }

    #[test]
    fn identical_reads_fill_every_column_with_no_gaps() {
        let reference = seq(b"ACGTACGTACGTACGTACGTACGTACGT");
        let reads = vec![read("r1", b"ACGTACGTACGTACGTACGTACGTACGT")];
        let gates = AssemblyGates::default();
        let assembler = GappedAssembler::new(gates);
        let (alignment, accepted) = assembler.assemble(&reference, 1000, &reads);
        assert_eq!(accepted, vec![0]);
        assert_eq!(alignment.n_cols(), reference.len());
        for (col, cell) in alignment.ref_cols.iter().zip(&alignment.rows[0]) {
            assert_eq!(Some(col.code), *cell);
        }
    }

    #[test]
    fn p_len_never_exceeds_twice_ref_len() {
        let reference = seq(b"ACGTACGTACGTACGTACGTACGTACGT");
        let reads = vec![read("r1", b"ACGTACGTACGTACGTACGTACGTACGT")];
        let assembler = GappedAssembler::new(AssemblyGates::default());
        let (alignment, _) = assembler.assemble(&reference, 0, &reads);
        assert!(alignment.n_cols() <= 2 * reference.len());
    }

    #[test]
    fn read_insertion_opens_extra_columns() {
        let reference = seq(b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
        // Insert 3 extra 'C' bases in the middle, otherwise identical.
        let reads = vec![read("ins", b"AAAAAAAAAAAAAACCCAAAAAAAAAAAAAAAA")];
        let assembler = GappedAssembler::new(AssemblyGates::default());
        let (alignment, accepted) = assembler.assemble(&reference, 0, &reads);
        if !accepted.is_empty() {
            assert!(alignment.n_cols() > reference.len());
        }
    }

    #[test]
    fn divergent_read_is_rejected() {
        let reference = seq(b"ACGTACGTACGTACGTACGTACGTACGT");
        // Every other base flipped: far more than max_divergent mismatches.
        let mutated: Vec<u8> = reference
            .as_slice()
            .iter()
            .enumerate()
            .map(|(i, c)| if i % 2 == 0 { b'T' } else { c.to_base() })
            .collect();
        let reads = vec![read("bad", &mutated)];
        let assembler = GappedAssembler::new(AssemblyGates::default());
        let (_, accepted) = assembler.assemble(&reference, 0, &reads);
        assert!(accepted.is_empty());
    }
}
