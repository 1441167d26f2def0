//! Agglomerative grouping of tagged reads into haplotype-supporting groups
//! (`spec.md` §4.5), following `gassembler.c`'s `group` function.

use crate::assembly::GappedAlignment;
use crate::nucleotide::NucCode;
use crate::snv::SnvTable;
use crate::tagging::column_counts;

#[derive(Debug, Clone, Copy)]
pub struct GroupGates {
    /// Columns within this distance of either edge must be covered for a
    /// group to be considered complete (`has_start`/`has_end`).
    pub max_uncovered: usize,
    pub min_group_coverage: u32,
    pub min_group_size: u32,
    pub max_group_divergence: u32,
    pub max_group_rdivergence: u32,
    pub min_group_rsize: f32,
}

impl Default for GroupGates {
    fn default() -> Self {
        Self {
            max_uncovered: 10,
            min_group_coverage: 1,
            min_group_size: 2,
            max_group_divergence: 3,
            max_group_rdivergence: 3,
            min_group_rsize: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub tag: u64,
    pub mask: u64,
    pub size: u32,
    pub min_cov: u32,
    pub max_cov: u32,
    pub has_start: bool,
    pub has_end: bool,
    pub divergent: u32,
    pub compat: u32,
    pub included: bool,
    pub consensus: Vec<NucCode>,
}

#[derive(Debug, Clone)]
pub struct GroupResult {
    pub groups: Vec<Group>,
    /// Current group index per accepted read, parallel to the reads passed
    /// to `GroupBuilder::build`.
    pub read_group: Vec<usize>,
    /// Indices into `groups`, best-first, at most two entries.
    pub good_groups: Vec<usize>,
    /// Reads compatible with both of the two included groups (`0` if fewer
    /// than two groups were included).
    pub compat_both: u32,
}

#[derive(Clone, Copy)]
struct GroupAgg {
    tag: u64,
    mask: u64,
    size: u32,
}

fn n_common(common: u64) -> u32 {
    let mut common = common;
    let mut n = 0;
    while common != 0 {
        if common & 7 != 0 {
            n += 1;
        }
        common >>= 3;
    }
    n
}

pub struct GroupBuilder<'a> {
    gates: GroupGates,
    snvs: Option<&'a SnvTable>,
}

impl<'a> GroupBuilder<'a> {
    pub fn new(gates: GroupGates, snvs: Option<&'a SnvTable>) -> Self {
        Self { gates, snvs }
    }

    pub fn build(&self, alignment: &GappedAlignment, read_tags: &[(u64, u64)], chr: u8, ref_start: u32) -> GroupResult {
        let na = read_tags.len();
        let mut agg: Vec<GroupAgg> = read_tags
            .iter()
            .map(|&(tag, mask)| GroupAgg { tag: tag & mask, mask, size: 1 })
            .collect();
        let mut read_group: Vec<usize> = (0..na).collect();
        let mut n_groups = na;

        while n_groups > 1 {
            let mut best: Option<(usize, usize, u32)> = None;
            for i in 0..n_groups {
                for j in (i + 1)..n_groups {
                    let common = agg[i].mask & agg[j].mask;
                    if (agg[i].tag & common) != (agg[j].tag & common) {
                        continue;
                    }
                    let nc = n_common(common);
                    let better = match best {
                        None => true,
                        Some((bi, bj, bnc)) => {
                            nc > bnc || (nc == bnc && agg[i].size + agg[j].size > agg[bi].size + agg[bj].size)
                        }
                    };
                    if better {
                        best = Some((i, j, nc));
                    }
                }
            }
            let Some((mi, mj, _)) = best else { break };

            agg[mi].tag = (agg[mi].tag & agg[mi].mask) | (agg[mj].tag & agg[mj].mask);
            agg[mi].mask |= agg[mj].mask;
            agg[mi].size += agg[mj].size;
            for g in read_group.iter_mut() {
                if *g == mj {
                    *g = mi;
                }
            }
            n_groups -= 1;
            agg[mj] = agg[n_groups];
            for g in read_group.iter_mut() {
                if *g == n_groups {
                    *g = mj;
                }
            }
        }
        agg.truncate(n_groups);

        let p_len = alignment.n_cols();
        let all_rows: Vec<usize> = (0..na).collect();
        let global_counts = column_counts(alignment, &all_rows);

        let mut groups: Vec<Group> = agg
            .iter()
            .enumerate()
            .map(|(gi, a)| {
                let member_rows: Vec<usize> = (0..na).filter(|&r| read_group[r] == gi).collect();
                let (min_cov, max_cov, has_start, has_end) = coverage_stats(alignment, &member_rows, self.gates.max_uncovered);
                let compat = read_tags
                    .iter()
                    .filter(|&&(rtag, rmask)| {
                        let common = a.mask & rmask;
                        (a.tag & common) == (rtag & common)
                    })
                    .count() as u32;
                Group {
                    tag: a.tag,
                    mask: a.mask,
                    size: a.size,
                    min_cov,
                    max_cov,
                    has_start,
                    has_end,
                    divergent: 0,
                    compat,
                    included: false,
                    consensus: Vec::with_capacity(p_len),
                }
            })
            .collect();

        // Consensus + divergence. `last_aligned_ref`/`last_consensus` persist
        // across group boundaries, matching `gassembler.c:group` exactly
        // (they are declared once, outside the per-group loop).
        let mut last_aligned_ref = NucCode::N;
        let mut last_consensus = NucCode::N;
        for group_idx in 0..groups.len() {
            let member_rows: Vec<usize> = (0..na).filter(|&r| read_group[r] == group_idx).collect();
            let local_counts = column_counts(alignment, &member_rows);
            for (col_idx, col) in alignment.ref_cols.iter().enumerate() {
                let mut best = col.code;
                for k in 0..NucCode::COUNT {
                    if k == NucCode::N.as_u8() as usize {
                        continue;
                    }
                    if global_counts[col_idx][k] > 1 && local_counts[col_idx][k] > local_counts[col_idx][best.as_u8() as usize] {
                        best = NucCode::from_u8(k as u8).expect("valid code");
                    }
                }
                groups[group_idx].consensus.push(best);

                if best != col.code {
                    let known = self.snvs.and_then(|t| t.lookup(chr, ref_start + col_idx as u32));
                    if known.is_none() {
                        let run_ref_gap = last_aligned_ref == NucCode::Gap && col.code == NucCode::Gap;
                        let run_cons_gap = last_consensus == NucCode::Gap && best == NucCode::Gap;
                        if !(run_ref_gap || run_cons_gap) {
                            groups[group_idx].divergent += 1;
                        }
                    }
                }
                last_aligned_ref = col.code;
                last_consensus = best;
            }
        }

        // Sort by (divergent asc, size desc); remap read_group accordingly.
        let mut order: Vec<usize> = (0..groups.len()).collect();
        order.sort_by(|&a, &b| groups[a].divergent.cmp(&groups[b].divergent).then(groups[b].size.cmp(&groups[a].size)));
        let mut new_index = vec![0usize; groups.len()];
        for (new_i, &old_i) in order.iter().enumerate() {
            new_index[old_i] = new_i;
        }
        let groups: Vec<Group> = order.iter().map(|&i| groups[i].clone()).collect();
        for g in read_group.iter_mut() {
            *g = new_index[*g];
        }

        let min_div = groups.iter().map(|g| g.divergent).min().unwrap_or(0);
        let base_size = groups.first().map(|g| g.size).unwrap_or(0);

        let mut n_included = 0u32;
        let mut good_groups = Vec::new();
        let mut groups = groups;
        for i in 0..groups.len() {
            let mut included = n_included < 2;
            if !groups[i].has_start {
                included = false;
                eprintln!("gasm-core: discarded group {i} (size {}): start position not covered", groups[i].size);
            }
            if !groups[i].has_end {
                included = false;
                eprintln!("gasm-core: discarded group {i} (size {}): end position not covered", groups[i].size);
            }
            if groups[i].min_cov < self.gates.min_group_coverage {
                included = false;
            }
            if groups[i].size < self.gates.min_group_size {
                included = false;
            }
            if groups[i].divergent > self.gates.max_group_divergence {
                included = false;
            }
            if groups[i].divergent > min_div + self.gates.max_group_rdivergence {
                included = false;
            }
            if (groups[i].size as f32) < (base_size as f32 * self.gates.min_group_rsize) {
                included = false;
            }
            groups[i].included = included;
            if included {
                good_groups.push(i);
                n_included += 1;
            }
        }

        let mut compat_both = 0u32;
        if good_groups.len() > 1 {
            let (g0, g1) = (&groups[good_groups[0]], &groups[good_groups[1]]);
            for &(rtag, rmask) in read_tags {
                let common0 = g0.mask & rmask;
                if (g0.tag & common0) != (rtag & common0) {
                    continue;
                }
                let common1 = g1.mask & rmask;
                if (g1.tag & common1) != (rtag & common1) {
                    continue;
                }
                compat_both += 1;
            }
        }

        GroupResult {
            groups,
            read_group,
            good_groups,
            compat_both,
        }
    }
}

/// `(min_cov, max_cov, has_start, has_end)` across a group's member rows.
fn coverage_stats(alignment: &GappedAlignment, member_rows: &[usize], max_uncovered: usize) -> (u32, u32, bool, bool) {
    let p_len = alignment.n_cols();
    let mut min_cov = member_rows.len() as u32; // matches `groups[i].min_cov = adata->na` upper bound
    let mut max_cov = 0u32;
    let mut has_start = false;
    let mut has_end = false;
    for col in 0..p_len {
        let cov = member_rows.iter().filter(|&&r| alignment.rows[r][col].is_some()).count() as u32;
        min_cov = min_cov.min(cov);
        max_cov = max_cov.max(cov);
        if cov > 0 {
            if col <= max_uncovered {
                has_start = true;
            }
            if col + 1 + max_uncovered >= p_len {
                has_end = true;
            }
        }
    }
    (min_cov, max_cov, has_start, has_end)
}
