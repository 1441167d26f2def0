//! Seed k-mer based read recruitment (`spec.md` §4.2).

use foldhash::fast::RandomState;
use std::collections::HashSet;

use crate::nucleotide::NSeq;

pub const MAX_READS_PER_KMER: usize = 100;
pub const MAX_READS: usize = 4096;
pub const MIN_READS: usize = 10;

/// Strand a read (or k-mer occurrence) was observed on, relative to however
/// the underlying store stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    Forward,
    Reverse,
}

/// A single read occurrence returned for one posting-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLocation {
    pub file_idx: u32,
    pub name_offset: u64,
    pub strand: Strand,
}

/// The external k-mer index collaborator (`spec.md` §6).
///
/// Implementations canonicalize `word` however their backing store requires;
/// this crate only consumes the already-canonical API described here.
pub trait KmerIndex {
    /// Looks up a canonical word, returning the strand it was indexed under
    /// and an opaque node index, or `None` if the word is absent.
    fn lookup(&self, canonical_word: &str) -> Option<(Strand, u64)>;

    /// Returns the posting-list reads for a node, or `None` if the node has
    /// more than `MAX_READS_PER_KMER` reads (too non-specific to enumerate).
    fn reads_for(&self, node_idx: u64) -> Option<Vec<ReadLocation>>;
}

/// The external sequence store collaborator (`spec.md` §6).
pub trait SeqStore {
    /// Returns `(name, raw_sequence)` for a read at `(file_idx, name_offset)`.
    fn fetch(&self, file_idx: u32, name_offset: u64) -> Option<(String, Vec<u8>)>;
}

/// A recruited read, reference-strand oriented.
#[derive(Debug, Clone)]
pub struct Read {
    pub name: String,
    pub raw_seq: Vec<u8>,
    pub encoded: NSeq,
    pub group_id: Option<u32>,
    pub tag: u64,
    pub mask: u64,
    pub unknown: u64,
}

impl Read {
    fn new(name: String, raw_seq: Vec<u8>) -> Self {
        let encoded = NSeq::from_bytes(&raw_seq, crate::nucleotide::MAX_READ_LENGTH);
        Self {
            name,
            raw_seq,
            encoded,
            group_id: None,
            tag: 0,
            mask: 0,
            unknown: 0,
        }
    }
}

/// Reason a region failed to reach `MIN_READS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecruitError {
    #[error("no such k-mer in index")]
    UnknownKmer,
    #[error("fewer than MIN_READS ({MIN_READS}) reads recruited")]
    TooFewReads,
}

/// Canonicalizes `kmer` to the lexicographically smaller of itself and its
/// reverse complement, matching `gassembler.c`'s integer-word comparison
/// generalized to strings (lexicographic order on the packed 2-bit encoding
/// and on the ASCII string agree for same-length words).
pub fn canonical_kmer(kmer: &str) -> String {
    let upper = kmer.to_ascii_uppercase();
    let rc: String = upper
        .bytes()
        .rev()
        .map(|b| match b {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            other => other,
        } as char)
        .collect();
    if rc < upper { rc } else { upper }
}

/// Recruits, deduplicates, and reference-strand-orients reads for one
/// region's seed k-mers.
pub struct ReadRecruiter<'a, K, S> {
    index: &'a K,
    store: &'a S,
}

impl<'a, K: KmerIndex, S: SeqStore> ReadRecruiter<'a, K, S> {
    pub fn new(index: &'a K, store: &'a S) -> Self {
        Self { index, store }
    }

    pub fn recruit(&self, seed_kmers: &[String]) -> Result<Vec<Read>, RecruitError> {
        let mut seen: HashSet<(u32, u64), RandomState> = HashSet::with_hasher(RandomState::default());
        let mut locations: Vec<(ReadLocation, Strand)> = Vec::new();

        for kmer in seed_kmers {
            let canonical = canonical_kmer(kmer);
            let Some((kmer_strand, node_idx)) = self.index.lookup(&canonical) else {
                continue;
            };
            let Some(reads) = self.index.reads_for(node_idx) else {
                // Posting list too large; too non-specific to use.
                continue;
            };
            for loc in reads {
                if !seen.insert((loc.file_idx, loc.name_offset)) {
                    continue;
                }
                locations.push((loc, kmer_strand));
                if locations.len() >= MAX_READS {
                    break;
                }
            }
            if locations.len() >= MAX_READS {
                break;
            }
        }

        let mut reads = Vec::with_capacity(locations.len());
        for (loc, kmer_strand) in locations {
            let Some((name, mut raw_seq)) = self.store.fetch(loc.file_idx, loc.name_offset) else {
                continue;
            };
            // A read's listed strand disagreeing with the k-mer's indexed
            // strand means the raw sequence needs reverse-complementing to
            // land on the reference strand.
            if loc.strand != kmer_strand {
                raw_seq = reverse_complement_bytes(&raw_seq);
            }
            reads.push(Read::new(name, raw_seq));
        }

        if reads.len() < MIN_READS {
            return Err(RecruitError::TooFewReads);
        }
        Ok(reads)
    }
}

fn reverse_complement_bytes(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&b| match b.to_ascii_uppercase() {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            other => other,
        })
        .collect()
}


#[cfg(test)]
mod test {
    use super::test_doubles::*;
    use super::*;

    #[test]
    fn canonicalization_picks_lexicographically_smaller() {
        // "AAAA" revcomp is "TTTT"; "AAAA" < "TTTT".
        assert_eq!(canonical_kmer("AAAA"), "AAAA");
        // "TTTT" revcomp is "AAAA"; canonical form is "AAAA".
        assert_eq!(canonical_kmer("TTTT"), "AAAA");
    }

    fn build_region(n_reads: usize) -> (InMemoryKmerIndex, InMemorySeqStore) {
        let mut index = InMemoryKmerIndex::new();
        let mut store = InMemorySeqStore::new();
        let locations: Vec<ReadLocation> = (0..n_reads)
            .map(|i| ReadLocation {
                file_idx: 0,
                name_offset: i as u64 * 100,
                strand: Strand::Forward,
            })
            .collect();
        index.insert("AAAAA", Strand::Forward, 1, locations.clone());
        for loc in &locations {
            store.insert(loc.file_idx, loc.name_offset, "r", b"ACGTACGTACGTACGTACGTACGTACGT");
        }
        (index, store)
    }

    #[test]
    fn fewer_than_min_reads_is_unassemblable() {
        let (index, store) = build_region(MIN_READS - 1);
        let recruiter = ReadRecruiter::new(&index, &store);
        let err = recruiter.recruit(&["AAAAA".to_string()]).unwrap_err();
        assert_eq!(err, RecruitError::TooFewReads);
    }

    #[test]
    fn at_min_reads_recruitment_succeeds() {
        let (index, store) = build_region(MIN_READS);
        let recruiter = ReadRecruiter::new(&index, &store);
        let reads = recruiter.recruit(&["AAAAA".to_string()]).unwrap();
        assert_eq!(reads.len(), MIN_READS);
    }

    #[test]
    fn duplicate_offsets_across_seeds_are_deduplicated() {
        let (mut index, store) = build_region(MIN_READS);
        let locations: Vec<ReadLocation> = (0..MIN_READS)
            .map(|i| ReadLocation {
                file_idx: 0,
                name_offset: i as u64 * 100,
                strand: Strand::Forward,
            })
            .collect();
        index.insert("CCCCC", Strand::Forward, 2, locations);
        let recruiter = ReadRecruiter::new(&index, &store);
        let reads = recruiter
            .recruit(&["AAAAA".to_string(), "CCCCC".to_string()])
            .unwrap();
        assert_eq!(reads.len(), MIN_READS);
    }

    #[test]
    fn posting_list_above_max_reads_per_kmer_is_skipped() {
        let (mut index, store) = build_region(MIN_READS);
        let too_many: Vec<ReadLocation> = (0..(MAX_READS_PER_KMER + 1))
            .map(|i| ReadLocation {
                file_idx: 1,
                name_offset: i as u64,
                strand: Strand::Forward,
            })
            .collect();
        index.insert("GGGGG", Strand::Forward, 3, too_many);
        let recruiter = ReadRecruiter::new(&index, &store);
        // Only the usable seed contributes reads; the over-large posting
        // list is silently ignored, not an error by itself.
        let reads = recruiter
            .recruit(&["AAAAA".to_string(), "GGGGG".to_string()])
            .unwrap();
        assert_eq!(reads.len(), MIN_READS);
    }
}
