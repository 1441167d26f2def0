//! In-memory [`KmerIndex`]/[`SeqStore`] backed by a single FASTA file of
//! reads, the CLI-facing glue that satisfies `spec.md` §6's external
//! collaborator contracts with whatever a user hands the binary on the
//! command line (`SPEC_FULL.md` §10).
//!
//! Production deployments name-check a memory-mapped k-mer index and a
//! memory-mapped sequence store; this backend trades that scale for
//! simplicity, scanning every window of every read once at startup. It is
//! adequate for the region counts a single invocation of this binary is
//! expected to serve.

use std::path::Path;

use foldhash::fast::RandomState;
use std::collections::HashMap;
use zoe::data::err::OrFail;
use zoe::data::fasta::FastaReader;

use crate::recruit::{canonical_kmer, KmerIndex, ReadLocation, SeqStore, Strand, MAX_READS_PER_KMER};

/// All reads from one FASTA file, addressable by their index in file order
/// (`file_idx` is always `0`; `name_offset` is the read's position).
pub struct SimpleSeqStore {
    records: Vec<(String, Vec<u8>)>,
}

impl SimpleSeqStore {
    /// Reads every record of `path` into memory. Fatal on an unreadable file
    /// (`spec.md` §7 setup failure): callers are expected to run this before
    /// any worker starts.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let records: Vec<(String, Vec<u8>)> = FastaReader::from_filename(path)
            .unwrap_or_die(&format!("cannot open reference/read file '{}'", path.display()))
            .filter_map(|rec| rec.ok())
            .map(|rec| (rec.name, rec.sequence.into_vec()))
            .collect();
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl SeqStore for SimpleSeqStore {
    fn fetch(&self, _file_idx: u32, name_offset: u64) -> Option<(String, Vec<u8>)> {
        self.records.get(name_offset as usize).cloned()
    }
}

/// A k-mer index built by scanning every `word_len`-mer of every read in a
/// [`SimpleSeqStore`], canonicalizing each the same way [`ReadRecruiter`]
/// expects (`crate::recruit::canonical_kmer`).
///
/// [`ReadRecruiter`]: crate::recruit::ReadRecruiter
pub struct SimpleKmerIndex {
    words: HashMap<String, (Strand, u64), RandomState>,
    nodes: HashMap<u64, Vec<ReadLocation>, RandomState>,
}

impl SimpleKmerIndex {
    pub fn build(store: &SimpleSeqStore, word_len: usize) -> Self {
        let mut per_word: HashMap<String, Vec<ReadLocation>, RandomState> = HashMap::with_hasher(RandomState::default());

        for (read_idx, (_name, seq)) in store.records.iter().enumerate() {
            if seq.len() < word_len {
                continue;
            }
            for start in 0..=(seq.len() - word_len) {
                let window = &seq[start..start + word_len];
                if !window.iter().all(|b| matches!(b.to_ascii_uppercase(), b'A' | b'C' | b'G' | b'T')) {
                    continue;
                }
                let word = String::from_utf8_lossy(window).to_ascii_uppercase();
                let canonical = canonical_kmer(&word);
                let strand = if canonical == word { Strand::Forward } else { Strand::Reverse };
                per_word.entry(canonical).or_default().push(ReadLocation {
                    file_idx: 0,
                    name_offset: read_idx as u64,
                    strand,
                });
            }
        }

        let mut words = HashMap::with_hasher(RandomState::default());
        let mut nodes = HashMap::with_hasher(RandomState::default());
        for (node_idx, (word, locations)) in per_word.into_iter().enumerate() {
            let node_idx = node_idx as u64;
            // The node's own indexed strand is always `Forward`: `word` is
            // already canonical, so a node is conceptually "indexed" on its
            // own canonical orientation. Individual `ReadLocation::strand`
            // values record whether that particular read needs
            // reverse-complementing to match it.
            words.insert(word, (Strand::Forward, node_idx));
            nodes.insert(node_idx, locations);
        }

        Self { words, nodes }
    }
}

impl KmerIndex for SimpleKmerIndex {
    fn lookup(&self, canonical_word: &str) -> Option<(Strand, u64)> {
        self.words.get(canonical_word).copied()
    }

    fn reads_for(&self, node_idx: u64) -> Option<Vec<ReadLocation>> {
        self.nodes.get(&node_idx).cloned().filter(|r| r.len() <= MAX_READS_PER_KMER)
    }
}
