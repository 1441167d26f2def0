//! Per-column divergence detection and 3-bit read fingerprinting
//! (`spec.md` §4.4).

use crate::assembly::GappedAlignment;
use crate::nucleotide::NucCode;
use crate::snv::SnvTable;

/// At most 21 divergent columns are packed into a read's `tag`/`mask`/
/// `unknown` fields (63 of 64 bits used, 3 per column).
pub const MAX_DIVERGENT_COLUMNS: u32 = 21;

/// Counts, for every column, how many included rows carry each of the six
/// nucleotide codes. `rows` is whatever subset of alignment rows is
/// currently in play (all rows during tagging; only a group's member rows
/// during consensus computation in `grouping.rs`).
pub fn column_counts(alignment: &GappedAlignment, rows: &[usize]) -> Vec<[u32; NucCode::COUNT]> {
    let mut counts = vec![[0u32; NucCode::COUNT]; alignment.n_cols()];
    for &r in rows {
        for (c, cell) in alignment.rows[r].iter().enumerate() {
            if let Some(code) = cell {
                counts[c][code.as_u8() as usize] += 1;
            }
        }
    }
    counts
}

/// Whether column `c` is divergent: some non-reference, non-`N` code is
/// carried by at least two rows.
fn is_divergent(ref_code: NucCode, counts: &[u32; NucCode::COUNT]) -> bool {
    (0..NucCode::COUNT).any(|code| {
        let code = code as u8;
        code != ref_code.as_u8() && code != NucCode::N.as_u8() && counts[code as usize] >= 2
    })
}

/// Tags every read in the alignment with its 3-bit fingerprint at each
/// divergent column, following `gassembler.c`'s `align` tagging loop.
/// `tag`, `mask`, and `unknown` are each built MSB-first (earliest divergent
/// column in the highest surviving 3-bit group) by repeated
/// shift-then-insert, matching the original's bit order exactly.
pub struct ReadTagger<'a> {
    snvs: Option<&'a SnvTable>,
}

impl<'a> ReadTagger<'a> {
    pub fn new(snvs: Option<&'a SnvTable>) -> Self {
        Self { snvs }
    }

    /// Returns `(tag, mask, unknown)` per row, in `alignment.rows` order, and
    /// the number of divergent columns actually tagged (`<= 21`).
    pub fn tag(&self, alignment: &GappedAlignment, chr: u8) -> (Vec<(u64, u64, u64)>, u32) {
        let n = alignment.n_reads();
        let all_rows: Vec<usize> = (0..n).collect();
        let counts = column_counts(alignment, &all_rows);

        let mut tag = vec![0u64; n];
        let mut mask = vec![0u64; n];
        let mut unknown = vec![0u64; n];
        let mut n_divergent = 0u32;

        for (c, col) in alignment.ref_cols.iter().enumerate() {
            if !is_divergent(col.code, &counts[c]) {
                continue;
            }
            if n_divergent >= MAX_DIVERGENT_COLUMNS {
                eprintln!("gasm-core: too many divergent positions (max {MAX_DIVERGENT_COLUMNS}), ignoring the rest");
                break;
            }

            let known_snv = self.snvs.and_then(|t| t.lookup(chr, col.pos));

            for r in 0..n {
                let ref_code = col.code;
                let mut nucl = alignment.rows[r][c];
                let mut mask_bits = 0u8;
                if let Some(code) = nucl {
                    if counts[c][code.as_u8() as usize] >= 2 {
                        mask_bits = 7;
                    }
                }
                if nucl == Some(NucCode::N) {
                    nucl = Some(ref_code);
                }
                if nucl.is_none() {
                    nucl = Some(ref_code);
                    mask_bits = 0;
                }
                let called = nucl.expect("defaulted to ref_code above");

                unknown[r] <<= 3;
                let explained_by_snv = known_snv
                    .map(|snv| called == snv.ref_allele || called == snv.alt_allele)
                    .unwrap_or(false);
                if known_snv.is_none() || !explained_by_snv {
                    unknown[r] |= 7;
                }

                let xor_code = called.as_u8() ^ ref_code.as_u8();
                tag[r] = (tag[r] << 3) | u64::from(xor_code);
                mask[r] = (mask[r] << 3) | u64::from(mask_bits);
            }
            n_divergent += 1;
        }

        (
            (0..n).map(|r| (tag[r], mask[r], unknown[r])).collect(),
            n_divergent,
        )
    }
}
