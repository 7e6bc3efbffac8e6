//! Word-pair commitments for flip authors
//!
//! An author commits to their word pairs with a deterministic signature
//! over the global words seed. Anyone holding the proof re-derives the
//! same pairs; a proof that does not verify against the author's public
//! key marks all of that author's flips as wrong-words.

use crate::crypto::{self, Keypair};
use crate::types::Seed;
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WordsError {
    #[error("word proof does not verify")]
    InvalidProof,
    #[error("pair id {0} out of range")]
    PairOutOfRange(usize),
}

/// Deterministic commitment to the epoch's word pairs
pub fn generate_proof(keypair: &Keypair, words_seed: &Seed) -> Vec<u8> {
    keypair.sign(words_seed.as_bytes())
}

pub fn check_proof(proof: &[u8], pub_key: &[u8], words_seed: &Seed) -> bool {
    crypto::verify(pub_key, words_seed.as_bytes(), proof).is_ok()
}

/// Derive `pairs_count` distinct word pairs from a verified proof
pub fn generate_pairs(proof: &[u8], dictionary_size: usize, pairs_count: usize) -> Vec<(u32, u32)> {
    let digest = crypto::sha3(proof);
    let mut rng = ChaCha20Rng::from_seed(digest.0);
    let mut pairs = Vec::with_capacity(pairs_count);
    while pairs.len() < pairs_count {
        let a = rng.gen_range(0..dictionary_size as u32);
        let b = rng.gen_range(0..dictionary_size as u32);
        if a == b {
            continue;
        }
        if pairs.iter().any(|&(x, y)| (x, y) == (a, b) || (y, x) == (a, b)) {
            // tiny dictionaries may not hold pairs_count distinct pairs
            if pairs_count > dictionary_size * (dictionary_size - 1) / 2 {
                pairs.push((a, b));
            }
            continue;
        }
        pairs.push((a, b));
    }
    pairs
}

/// Resolve the words for one of an author's flips
pub fn get_words(
    proof: &[u8],
    pub_key: &[u8],
    words_seed: &Seed,
    dictionary_size: usize,
    pairs_count: usize,
    pair_id: usize,
) -> Result<(u32, u32), WordsError> {
    if !check_proof(proof, pub_key, words_seed) {
        return Err(WordsError::InvalidProof);
    }
    generate_pairs(proof, dictionary_size, pairs_count)
        .get(pair_id)
        .copied()
        .ok_or(WordsError::PairOutOfRange(pair_id))
}
