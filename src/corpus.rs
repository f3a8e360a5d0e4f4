//! Labeled Sample Corpus
//!
//! In-memory, append-only store of labeled request lines with balanced and
//! random batch sampling. Samples are immutable once inserted; a per-label
//! index keeps balanced draws O(1) regardless of class imbalance. Insertion
//! order is preserved so deterministic chunking is reproducible.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::Array2;
use rand::Rng;

use crate::codec::{self, TokenId};

/// Classification label for a request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Benign,
    Malicious,
}

/// Number of labels.
pub const LABEL_COUNT: usize = 2;

impl Label {
    /// Class index used by the model output layer.
    pub fn index(self) -> usize {
        match self {
            Label::Benign => 0,
            Label::Malicious => 1,
        }
    }

    /// Inverse of [`Label::index`].
    pub fn from_index(index: usize) -> Option<Label> {
        match index {
            0 => Some(Label::Benign),
            1 => Some(Label::Malicious),
            _ => None,
        }
    }

    /// The other label.
    pub fn opposite(self) -> Label {
        match self {
            Label::Benign => Label::Malicious,
            Label::Malicious => Label::Benign,
        }
    }
}

/// One labeled, encoded request line.
#[derive(Debug, Clone)]
pub struct Sample {
    pub label: Label,
    /// Padded token sequence (length is a multiple of the codec block size).
    pub tokens: Vec<TokenId>,
    /// Length after block padding, before any batch padding.
    pub length: usize,
}

/// Append-only collection of labeled samples.
#[derive(Debug, Default)]
pub struct Corpus {
    records: Vec<Sample>,
    /// label index -> positions into `records`, in insertion order.
    by_label: [Vec<usize>; LABEL_COUNT],
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a corpus from a directory of `<seq>-<label>.txt` files.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut corpus = Corpus::new();
        let mut entries: Vec<_> = fs::read_dir(dir)
            .with_context(|| format!("reading corpus directory {}", dir.display()))?
            .collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.path());

        for entry in entries {
            let path = entry.path();
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s,
                None => continue,
            };
            let label = match stem.rsplit('-').next().and_then(|s| s.parse::<usize>().ok()) {
                Some(0) => Label::Benign,
                Some(1) => Label::Malicious,
                _ => bail!("corpus file {} has no label suffix", path.display()),
            };
            let line = fs::read_to_string(&path)
                .with_context(|| format!("reading corpus file {}", path.display()))?;
            corpus.insert(label, &line)?;
        }
        Ok(corpus)
    }

    /// Append a sample; amortized O(1).
    pub fn insert(&mut self, label: Label, line: &str) -> Result<(), codec::CodecError> {
        let encoded = codec::encode(line)?;
        let length = encoded.tokens.len();
        self.records.push(Sample {
            label,
            tokens: encoded.tokens,
            length,
        });
        self.by_label[label.index()].push(self.records.len() - 1);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of samples carrying `label`.
    pub fn label_count(&self, label: Label) -> usize {
        self.by_label[label.index()].len()
    }

    /// Draw samples uniformly at random (with replacement) so every label
    /// with at least one sample contributes an equal share of `n`. With one
    /// label absent the other supplies all `n` draws; an empty corpus yields
    /// an empty batch.
    pub fn balanced_batch<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<Sample> {
        let present = self.by_label.iter().filter(|p| !p.is_empty()).count();
        if present == 0 {
            return Vec::new();
        }
        let per_label = n / present;
        let mut out = Vec::with_capacity(n);
        for positions in &self.by_label {
            if positions.is_empty() {
                continue;
            }
            for _ in 0..per_label {
                let pos = positions[rng.gen_range(0..positions.len())];
                out.push(self.records[pos].clone());
            }
        }
        out
    }

    /// Draw `n` samples uniformly at random from the whole corpus. An empty
    /// corpus yields an empty batch.
    pub fn random_batch<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<Sample> {
        if self.records.is_empty() {
            return Vec::new();
        }
        (0..n)
            .map(|_| self.records[rng.gen_range(0..self.records.len())].clone())
            .collect()
    }

    /// Deterministically partition the corpus into contiguous chunks of size
    /// at most `n`, preserving insertion order.
    pub fn chunked(&self, n: usize) -> Vec<Vec<Sample>> {
        self.records.chunks(n).map(|c| c.to_vec()).collect()
    }

    /// Most recent samples for drift evaluation: up to `max_malicious`
    /// newest malicious samples, then newest benign samples up to `total`.
    pub fn recent_window(&self, max_malicious: usize, total: usize) -> Vec<Sample> {
        let mut out = Vec::with_capacity(total);
        let malicious = &self.by_label[Label::Malicious.index()];
        for &pos in malicious.iter().rev().take(max_malicious) {
            out.push(self.records[pos].clone());
        }
        let benign = &self.by_label[Label::Benign.index()];
        let remaining = total.saturating_sub(out.len());
        for &pos in benign.iter().rev().take(remaining) {
            out.push(self.records[pos].clone());
        }
        out
    }
}

/// A collated batch ready for the model: sorted by descending true length,
/// every sequence padded with the sentinel to the widest in the batch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub labels: Vec<Label>,
    /// Token ids, shape (batch, width).
    pub tokens: Array2<TokenId>,
    /// True lengths before batch padding, aligned with rows.
    pub lengths: Vec<usize>,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.labels.len()
    }

    pub fn width(&self) -> usize {
        self.tokens.ncols()
    }
}

/// Collate samples into a uniform batch. `min_width` is the smallest
/// acceptable sequence width (the convolution needs at least one full
/// kernel window). Columns beyond a sample's block-padded length take
/// token id 0, the character `'0'`; the sentinel stays confined to the
/// per-sample block padding.
pub fn collate(samples: &[Sample], min_width: usize) -> Batch {
    let mut samples = samples.to_vec();
    samples.sort_by(|a, b| b.length.cmp(&a.length));

    let width = samples
        .iter()
        .map(|s| s.length)
        .max()
        .unwrap_or(0)
        .max(min_width);

    let mut tokens = Array2::from_elem((samples.len(), width), 0);
    let mut labels = Vec::with_capacity(samples.len());
    let mut lengths = Vec::with_capacity(samples.len());
    for (row, sample) in samples.iter().enumerate() {
        for (col, &t) in sample.tokens.iter().enumerate() {
            tokens[[row, col]] = t;
        }
        labels.push(sample.label);
        lengths.push(sample.length);
    }

    Batch {
        labels,
        tokens,
        lengths,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn seeded_corpus() -> Corpus {
        let mut corpus = Corpus::new();
        for i in 0..10 {
            corpus
                .insert(Label::Benign, &format!("GET /page/{} HTTP/1.1", i))
                .unwrap();
        }
        for _ in 0..3 {
            corpus
                .insert(Label::Malicious, &"x".repeat(1500))
                .unwrap();
        }
        corpus
    }

    #[test]
    fn balanced_batch_has_equal_label_counts() {
        let corpus = seeded_corpus();
        let mut rng = StdRng::seed_from_u64(7);

        let batch = corpus.balanced_batch(16, &mut rng);
        assert_eq!(batch.len(), 16);
        let malicious = batch.iter().filter(|s| s.label == Label::Malicious).count();
        assert_eq!(malicious, 8);
    }

    #[test]
    fn balanced_batch_fills_from_the_present_label() {
        let mut corpus = Corpus::new();
        corpus.insert(Label::Benign, "GET / HTTP/1.1").unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        // With one class absent, the other supplies the whole batch.
        let batch = corpus.balanced_batch(8, &mut rng);
        assert_eq!(batch.len(), 8);
        assert!(batch.iter().all(|s| s.label == Label::Benign));
    }

    #[test]
    fn empty_corpus_yields_empty_batches() {
        let corpus = Corpus::new();
        let mut rng = StdRng::seed_from_u64(7);

        assert!(corpus.balanced_batch(8, &mut rng).is_empty());
        assert!(corpus.random_batch(8, &mut rng).is_empty());
    }

    #[test]
    fn random_batch_draws_the_requested_count() {
        let corpus = seeded_corpus();
        let mut rng = StdRng::seed_from_u64(7);

        let batch = corpus.random_batch(5, &mut rng);
        assert_eq!(batch.len(), 5);
    }

    #[test]
    fn chunked_partitions_in_order() {
        let corpus = seeded_corpus();
        let chunks = corpus.chunked(4);

        assert_eq!(chunks.len(), corpus.len().div_ceil(4));
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, corpus.len());
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk.len(), 4);
        }
        // Insertion order preserved across chunk boundaries.
        assert_eq!(chunks[0][0].label, Label::Benign);
        assert_eq!(chunks.last().unwrap().last().unwrap().label, Label::Malicious);
    }

    #[test]
    fn collate_sorts_and_pads() {
        let corpus = seeded_corpus();
        let samples: Vec<Sample> = corpus.chunked(corpus.len()).remove(0);
        let batch = collate(&samples, 64);

        assert_eq!(batch.size(), corpus.len());
        // Descending true length.
        for pair in batch.lengths.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        assert_eq!(batch.width(), batch.lengths[0]);
        // Padding beyond the true length is token zero.
        let last = batch.size() - 1;
        assert_eq!(batch.tokens[[last, batch.lengths[last]]], 0);
    }

    #[test]
    fn collate_pads_batch_columns_with_token_zero() {
        let mut corpus = Corpus::new();
        corpus.insert(Label::Benign, "GET / HTTP/1.1").unwrap();
        corpus.insert(Label::Malicious, &"x".repeat(100)).unwrap();
        let batch = collate(&corpus.chunked(2).remove(0), 64);

        // Batch padding is the token for '0', not the block-pad sentinel.
        assert_eq!(codec::token_of('0'), Some(0));
        let last = batch.size() - 1;
        for col in batch.lengths[last]..batch.width() {
            assert_eq!(batch.tokens[[last, col]], 0);
        }
        // The sample's own block padding keeps the sentinel.
        let short_len = "GET / HTTP/1.1".len();
        assert_eq!(batch.tokens[[last, batch.lengths[last] - 1]], codec::PAD_TOKEN);
        assert!(short_len < batch.lengths[last]);
    }

    #[test]
    fn collate_enforces_min_width() {
        let mut corpus = Corpus::new();
        corpus.insert(Label::Benign, "tiny").unwrap();
        let batch = collate(&corpus.chunked(1).remove(0), 64);
        assert_eq!(batch.width(), 64);
    }

    #[test]
    fn recent_window_prefers_new_malicious() {
        let corpus = seeded_corpus();
        let window = corpus.recent_window(8, 16);
        let malicious = window.iter().filter(|s| s.label == Label::Malicious).count();
        assert_eq!(malicious, 3);
        assert_eq!(window.len(), 13);
    }
}
