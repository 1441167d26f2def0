//! Known-SNV and false-positive auxiliary tables (`spec.md` §6).
//!
//! Both tables share one on-disk format: tab-separated, `#`-prefixed
//! comments skipped, first column `CHR:POS` (one-based), looked up by exact
//! `(chr, pos)` after decrementing to zero-based storage, matching
//! `read_snvs`/`read_fps`/`lookup_snv` in `gassembler.c`.

use std::path::Path;

use crate::chrom::chr_from_text;
use crate::nucleotide::NucCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnvEntry {
    pub chr: u8,
    pub pos: u32,
    pub ref_allele: NucCode,
    pub alt_allele: NucCode,
    pub heterozygous: bool,
}

/// A pre-sorted, binary-searchable table of SNV or false-positive records.
#[derive(Debug, Clone, Default)]
pub struct SnvTable {
    entries: Vec<SnvEntry>,
}

impl SnvTable {
    pub fn from_entries(mut entries: Vec<SnvEntry>) -> Self {
        entries.sort_by_key(|e| (e.chr, e.pos));
        Self { entries }
    }

    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_entries(parse_rows(&text)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact `(chr, pos)` lookup, `pos` zero-based.
    pub fn lookup(&self, chr: u8, pos: u32) -> Option<&SnvEntry> {
        self.entries
            .binary_search_by_key(&(chr, pos), |e| (e.chr, e.pos))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn contains(&self, chr: u8, pos: u32) -> bool {
        self.lookup(chr, pos).is_some()
    }
}

fn parse_rows(text: &str) -> Vec<SnvEntry> {
    let mut entries = Vec::new();
    let mut warned_bad_chr = false;

    for line in text.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 2 {
            eprintln!("gasm-core: too few tokens in SNV/FP table line: {line}");
            continue;
        }

        let mut locus = cols[0].splitn(2, ':');
        let (Some(chr_str), Some(pos_str)) = (locus.next(), locus.next()) else {
            eprintln!("gasm-core: malformed locus column: {}", cols[0]);
            continue;
        };
        let Some(chr) = chr_from_text(chr_str) else {
            if !warned_bad_chr {
                eprintln!("gasm-core: invalid chromosome name {chr_str}");
                warned_bad_chr = true;
            }
            continue;
        };
        let Ok(pos_one_based) = pos_str.parse::<u32>() else {
            eprintln!("gasm-core: invalid position in locus column: {}", cols[0]);
            continue;
        };

        let genotype = cols.get(1).copied().unwrap_or("AA");
        let heterozygous = genotype.as_bytes().first().copied() != Some(b'A') || genotype.as_bytes().get(1).copied() != Some(b'A');

        let (ref_allele, alt_allele) = match cols.get(3).map(|s| s.as_bytes()) {
            Some(alleles) if alleles.len() >= 3 => (NucCode::from_base(alleles[0]), NucCode::from_base(alleles[2])),
            _ => (NucCode::N, NucCode::N),
        };

        entries.push(SnvEntry {
            chr,
            pos: pos_one_based - 1,
            ref_allele,
            alt_allele,
            heterozygous,
        });
    }
    entries
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_and_decrements_to_zero_based() {
        let text = "#comment\n1:1001\tAA\t*\tA/C\n";
        let table = SnvTable::from_entries(parse_rows(text));
        assert_eq!(table.len(), 1);
        let e = table.lookup(1, 1000).unwrap();
        assert_eq!(e.ref_allele, NucCode::A);
        assert_eq!(e.alt_allele, NucCode::C);
        assert!(!e.heterozygous);
    }

    #[test]
    fn heterozygous_genotype_is_detected() {
        let text = "X:500\tAC\t*\tG/T\n";
        let table = SnvTable::from_entries(parse_rows(text));
        let e = table.lookup(table.entries[0].chr, 499).unwrap();
        assert!(e.heterozygous);
    }

    #[test]
    fn invalid_chromosome_is_skipped_not_fatal() {
        let text = "ZZZ:100\tAA\t*\tA/C\n1:100\tAA\t*\tA/C\n";
        let table = SnvTable::from_entries(parse_rows(text));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn lookup_misses_return_none() {
        let table = SnvTable::from_entries(vec![SnvEntry {
            chr: 1,
            pos: 100,
            ref_allele: NucCode::A,
            alt_allele: NucCode::C,
            heterozygous: false,
        }]);
        assert!(table.lookup(1, 101).is_none());
        assert!(table.lookup(2, 100).is_none());
    }
}
