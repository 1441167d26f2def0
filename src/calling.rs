//! Per-column genotype calling with a closed-form logistic confidence score
//! (`spec.md` §4.6), following `gassembler.c`'s recalculate-totals / call /
//! `calc_p` sequence exactly, including float evaluation order (`SPEC_FULL.md`
//! §11: the idempotence property depends on it).

use statrs::distribution::{Binomial, Discrete, Poisson};

use crate::assembly::GappedAlignment;
use crate::grouping::GroupResult;
use crate::nucleotide::NucCode;
use crate::snv::SnvTable;

/// A model error used to catch `gt_count`/`total_count` relationships the
/// Poisson/binomial error model never has to handle in practice.
const ERROR_PROB: f64 = 0.01;

/// How `calc_p`'s normalizer `KMER_COVERAGE` is resolved for one region.
/// `CoverageMode::Median` (`config.rs`) is resolved to a concrete value
/// upstream of calling, so only two cases remain here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedCoverage {
    /// Use this region's own observed maximum per-column coverage.
    Dynamic,
    /// Use a fixed expected coverage (a literal, or a pre-resolved median).
    Fixed(u32),
}

/// Diagnostic and scoring inputs threaded into `calc_p`, named after
/// `CallExtra` in `gassembler.c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallExtra {
    pub n_groups_total: u32,
    pub n_groups: u32,
    pub div_0: u32,
    pub div_1: u32,
    pub max_cov_0: u32,
    pub max_cov_1: u32,
    pub compat_0: u32,
    pub compat_1: u32,
    pub compat_both: u32,
    pub end_dist: u32,
    pub prob: f64,
    pub rprob: f64,
    pub hzprob: f64,
}

/// Call class, `spec.md` §4.6/GLOSSARY: insertion, deletion, substitution,
/// or silent (reference-matching).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    Insertion,
    Deletion,
    Substitution,
    Silent,
}

impl CallClass {
    pub fn as_char(self) -> char {
        match self {
            Self::Insertion => 'I',
            Self::Deletion => 'D',
            Self::Substitution => 'S',
            Self::Silent => '0',
        }
    }
}

/// One column's genotype call (`spec.md` §3 `Call`).
#[derive(Debug, Clone)]
pub struct Call {
    pub pos: u32,
    /// Disambiguates insertion columns that share `pos` with the preceding
    /// reference base.
    pub sub: u32,
    pub ref_code: NucCode,
    pub cov: u32,
    /// Indexed by `NucCode::as_u8()`.
    pub counts: [u32; NucCode::COUNT],
    /// `None` in both slots means "no call" (`NC`).
    pub nucl: [Option<NucCode>; 2],
    pub poly: bool,
    pub prev_ref: char,
    pub p: f64,
    pub extra: CallExtra,
}

impl Call {
    /// `Some(class)` when a call was made, `None` for `NC`.
    pub fn class(&self) -> Option<CallClass> {
        let (n0, n1) = (self.nucl[0]?, self.nucl[1]?);
        Some(if self.ref_code == NucCode::Gap {
            CallClass::Insertion
        } else if n1 == NucCode::Gap {
            CallClass::Deletion
        } else if n0 != self.ref_code || n1 != self.ref_code {
            CallClass::Substitution
        } else {
            CallClass::Silent
        })
    }
}

/// A region's accumulated calls, one per gapped-alignment column
/// (`spec.md` §3 `CallBlock`).
#[derive(Debug, Clone)]
pub struct CallBlock {
    pub chr: u8,
    pub start: u32,
    pub end: u32,
    pub calls: Vec<Call>,
}

impl CallBlock {
    /// An all-`NC` block spanning `[start, end)`, used whenever a region
    /// never reaches genotype calling: oversized reference window, too few
    /// recruited reads (`spec.md` §7 region-rejection).
    pub fn nc_only(chr: u8, start: u32, end: u32, ref_seq: &[u8]) -> Self {
        let calls = (start..end)
            .map(|pos| {
                let offset = (pos - start) as usize;
                let prev_ref = if pos > start {
                    ref_seq.get(offset - 1).map(|&b| b as char).unwrap_or('N')
                } else {
                    '!'
                };
                Call {
                    pos,
                    sub: 0,
                    ref_code: ref_seq.get(offset).map(|&b| NucCode::from_base(b)).unwrap_or(NucCode::N),
                    cov: 0,
                    counts: [0; NucCode::COUNT],
                    nucl: [None, None],
                    poly: false,
                    prev_ref,
                    p: 0.0,
                    extra: CallExtra::default(),
                }
            })
            .collect();
        Self { chr, start, end, calls }
    }
}

fn poisson_pmf(k: u32, lambda: f64) -> f64 {
    if lambda <= 0.0 {
        return if k == 0 { 1.0 } else { 0.0 };
    }
    Poisson::new(lambda).map(|d| d.pmf(k as u64)).unwrap_or(0.0)
}

fn dbinom(k: u32, n: u32, p: f64) -> f64 {
    if n == 0 {
        return if k == 0 { 1.0 } else { 0.0 };
    }
    Binomial::new(p, n as u64).map(|d| d.pmf(k as u64)).unwrap_or(0.0)
}

/// Homozygote genotype probability, `spec.md` §4.6.
fn gt1_prob(gt_count: u32, total_count: u32) -> f64 {
    let err_count = total_count.saturating_sub(gt_count);
    poisson_pmf(err_count, ERROR_PROB) * poisson_pmf(gt_count, total_count as f64)
}

/// Heterozygote genotype probability, `spec.md` §4.6.
fn gt2_prob(gt1_count: u32, gt2_count: u32, total_count: u32) -> f64 {
    let err_count = total_count.saturating_sub(gt1_count).saturating_sub(gt2_count);
    poisson_pmf(err_count, ERROR_PROB) * poisson_pmf(gt1_count, total_count as f64 / 2.0) * poisson_pmf(gt2_count, total_count as f64 / 2.0)
}

fn pmin(a: f64, b: f64) -> f64 {
    a.min(b)
}

/// The logistic confidence score, `spec.md` §4.6. Term order and the
/// `n_groups_total < 2` sign are preserved bit-for-bit from `calc_p` in
/// `gassembler.c` (`SPEC_FULL.md` §11).
fn calc_p(call: &Call, extra: &CallExtra, kmer_coverage: u32) -> f64 {
    let n0 = call.nucl[0];
    let n1 = call.nucl[1];
    let homo_mut = n0.is_some() && n0 == n1 && n0 != Some(call.ref_code);
    let homo_mut_f = if homo_mut { 1.0 } else { 0.0 };

    let icept = -1.447;
    let term0 = 0.6845 * homo_mut_f;
    let term1 = 0.05935 * extra.compat_0 as f64 + 0.1621 * extra.compat_both as f64;
    let term2 = -0.8501 * (call.ref_code == NucCode::Gap) as u8 as f64
        + 0.4295 * ((n1 != Some(NucCode::Gap)) && call.poly) as u8 as f64;
    let k = kmer_coverage as f64;
    let cov = call.cov as f64;
    let term3 = 1.568 * ((cov >= 4.0) && (cov < 0.75 * k)) as u8 as f64;
    let term4 = 1.778 * ((cov >= 0.75 * k) && (cov < 1.25 * k)) as u8 as f64;
    let term5 = 2.340 * ((cov >= 1.25 * k) && (cov < 1.9 * k)) as u8 as f64;
    let term6 = 0.1781 * (cov >= 1.9 * k) as u8 as f64;

    let kokku = (call.counts[NucCode::A.as_u8() as usize]
        + call.counts[NucCode::C.as_u8() as usize]
        + call.counts[NucCode::G.as_u8() as usize]
        + call.counts[NucCode::T.as_u8() as usize]
        + call.counts[NucCode::Gap.as_u8() as usize]) as f64;
    let p1 = poisson_pmf(kokku as u32, k);
    let pvalue_cov = pmin(p1, 1.0 - p1).powi(2);
    let g1koht = n1.map(|c| call.counts[c.as_u8() as usize]).unwrap_or(0);
    let p2 = dbinom(g1koht, kokku as u32, 0.5);
    let mut pvalue2 = pmin(p2, 1.0 - p2).powi(2);
    if extra.n_groups_total < 2 {
        pvalue2 = 1.0;
    }
    let term7 = 5.989 * pvalue2 - 4.546 * pvalue2 * pvalue2 - 3.002 * pvalue2 * pvalue2 * pvalue2;
    let term8 = 0.06952 * extra.compat_1 as f64 + 1.040 * (extra.compat_1 as f64 > 0.75 * extra.compat_0 as f64) as u8 as f64;
    let term9 = -0.1063 * (kokku - k).abs() + 0.6887 * pvalue_cov - 1.619 * pvalue_cov * pvalue_cov;
    let edist = extra.end_dist as f64;
    let term10 = 0.1251 * edist - 0.001694 * edist * edist;
    let term11 = 0.06204 * extra.compat_0 as f64 * homo_mut_f;
    let term12 = -0.02578 * homo_mut_f * extra.compat_both as f64;
    let term13 = -0.002912 * extra.compat_0 as f64 * extra.compat_1 as f64;
    let term14 = 0.06077 * homo_mut_f * (kokku - k).abs();
    let term15 = 2.158 * homo_mut_f * pvalue_cov;
    let term16 = -0.001164 * edist * (kokku - k).abs();

    let linpred =
        icept + term0 + term1 + term2 + term3 + term4 + term5 + term6 + term7 + term8 + term9 + term10 + term11 + term12 + term13 + term14 + term15 + term16;
    linpred.exp() / (1.0 + linpred.exp())
}

/// Produces per-column `Call` records for one region (`spec.md` §4.6).
pub struct Caller<'a> {
    min_confirming: u32,
    /// Minimum column coverage for a non-`NC` call, matching `print_call`'s
    /// `call->cov >= min_coverage` gate in `gassembler.c`.
    min_coverage: u32,
    fps: Option<&'a SnvTable>,
}

impl<'a> Caller<'a> {
    pub fn new(min_confirming: u32, min_coverage: u32, fps: Option<&'a SnvTable>) -> Self {
        Self { min_confirming, min_coverage, fps }
    }

    pub fn call(
        &self, alignment: &GappedAlignment, groups: &GroupResult, chr: u8, ref_seq_bytes: &[u8], region_start: u32, region_end: u32,
        coverage_mode: ResolvedCoverage,
    ) -> CallBlock {
        let p_len = alignment.n_cols();
        let na = groups.read_group.len();

        let mut coverage = vec![0u32; p_len];
        let mut nucl_counts = vec![[0u32; NucCode::COUNT]; p_len];
        let mut max_coverage = 0u32;
        for (c, col) in alignment.ref_cols.iter().enumerate() {
            let _ = col;
            for r in 0..na {
                let grp = groups.read_group[r];
                if !groups.groups[grp].included {
                    continue;
                }
                if let Some(code) = alignment.rows[r][c] {
                    if code != groups.groups[grp].consensus[c] {
                        continue;
                    }
                    nucl_counts[c][code.as_u8() as usize] += 1;
                    coverage[c] += 1;
                }
            }
            max_coverage = max_coverage.max(coverage[c]);
        }

        let kmer_coverage = match coverage_mode {
            ResolvedCoverage::Fixed(k) => k,
            ResolvedCoverage::Dynamic => max_coverage,
        };

        let (g0, g1) = (groups.good_groups.first().copied(), groups.good_groups.get(1).copied());
        let n_groups_total = groups.groups.len() as u32;
        let n_groups = groups.good_groups.len() as u32;
        let (div_0, max_cov_0, compat_0) = g0
            .map(|i| (groups.groups[i].divergent, groups.groups[i].max_cov, groups.groups[i].compat))
            .unwrap_or((0, 0, 0));
        let (div_1, max_cov_1, compat_1) = g1
            .map(|i| (groups.groups[i].divergent, groups.groups[i].max_cov, groups.groups[i].compat))
            .unwrap_or((0, 0, 0));

        let mut calls = Vec::with_capacity(p_len);
        let mut last_call_pos: Option<u32> = None;
        let mut sub = 0u32;

        for (c, col) in alignment.ref_cols.iter().enumerate() {
            let pos = col.pos;
            sub = if last_call_pos == Some(pos) { sub + 1 } else { 0 };
            last_call_pos = Some(pos);

            let prev_ref = if col.code == NucCode::Gap {
                ref_seq_bytes.get((pos - region_start) as usize).copied().unwrap_or(b'N') as char
            } else if pos > region_start {
                ref_seq_bytes.get((pos - region_start - 1) as usize).copied().unwrap_or(b'N') as char
            } else {
                '!'
            };

            let mut call = Call {
                pos,
                sub,
                ref_code: col.code,
                cov: coverage[c],
                counts: nucl_counts[c],
                nucl: [None, None],
                poly: false,
                prev_ref,
                p: 0.0,
                extra: CallExtra {
                    n_groups_total,
                    n_groups,
                    div_0,
                    div_1,
                    max_cov_0,
                    max_cov_1,
                    compat_0,
                    compat_1,
                    compat_both: groups.compat_both,
                    end_dist: (c as u32).min(p_len as u32 - 1 - c as u32),
                    ..Default::default()
                },
            };

            if self.fps.is_some_and(|t| t.contains(chr, region_start + c as u32)) {
                calls.push(call);
                continue;
            }

            if call.cov < self.min_coverage {
                calls.push(call);
                continue;
            }

            let best = nucl_counts[c].iter().copied().max().unwrap_or(0);
            if best < self.min_confirming {
                calls.push(call);
                continue;
            }

            let confirmed_cov = coverage[c].saturating_sub(nucl_counts[c][NucCode::N.as_u8() as usize]);
            let mut best_n1 = NucCode::A;
            let mut best_n2 = NucCode::A;
            let mut best_prob = 0.0f64;
            let mut sum_probs = 0.0f64;
            for n1_u in 0..NucCode::COUNT {
                if n1_u == NucCode::N.as_u8() as usize {
                    continue;
                }
                let c1 = nucl_counts[c][n1_u];
                if c1 < 2 {
                    continue;
                }
                for n2_u in n1_u..NucCode::COUNT {
                    if n2_u == NucCode::N.as_u8() as usize {
                        continue;
                    }
                    let c2 = nucl_counts[c][n2_u];
                    if c2 < 2 {
                        continue;
                    }
                    let prob = if n2_u == n1_u {
                        gt1_prob(c1, confirmed_cov)
                    } else {
                        gt2_prob(c1, c2, confirmed_cov)
                    };
                    if prob > best_prob {
                        best_n1 = NucCode::from_u8(n1_u as u8).expect("valid code");
                        best_n2 = NucCode::from_u8(n2_u as u8).expect("valid code");
                        best_prob = prob;
                    }
                    sum_probs += prob;
                }
            }

            let hzprob = if best_n1 != best_n2 {
                dbinom(nucl_counts[c][best_n2.as_u8() as usize], nucl_counts[c][best_n1.as_u8() as usize] + nucl_counts[c][best_n2.as_u8() as usize], 0.5)
            } else {
                1.0
            };
            if sum_probs == 0.0 {
                best_prob = 0.0;
                sum_probs = 1.0;
            }

            call.nucl = [Some(best_n1), Some(best_n2)];
            call.poly = best_n1 != col.code || best_n2 != col.code;
            call.extra.prob = best_prob;
            call.extra.rprob = best_prob / sum_probs;
            call.extra.hzprob = hzprob;
            call.p = calc_p(&call, &call.extra, kmer_coverage);

            calls.push(call);
        }

        CallBlock {
            chr,
            start: region_start,
            end: region_end,
            calls,
        }
    }
}
