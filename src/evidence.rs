//! Short-session liveness evidence
//!
//! During the short session every candidate observes which peers
//! broadcast their flip key and submitted an answer hash in time. The
//! observations are committed as a bitmap over the candidate list in
//! lottery order; a candidate is approved when a strict majority of the
//! submitted bitmaps set their bit.

use crate::types::Address;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Upper bound on bitmap words accepted from the wire (2^18 candidates)
const MAX_BITMAP_WORDS: usize = 4096;

/// Dense bit set over candidate indices in lottery order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateBitmap {
    words: Vec<u64>,
}

impl CandidateBitmap {
    pub fn new() -> Self {
        CandidateBitmap::default()
    }

    pub fn set(&mut self, index: usize) {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % 64);
    }

    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1 << (index % 64)) != 0)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut words = self.words.clone();
        while words.last() == Some(&0) {
            words.pop();
        }
        postcard::to_allocvec(&words).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let words: Vec<u64> = postcard::from_bytes(data).ok()?;
        if words.len() > MAX_BITMAP_WORDS {
            return None;
        }
        Some(CandidateBitmap { words })
    }
}

#[derive(Debug, Default)]
pub struct EvidenceMap {
    answers: HashSet<Address>,
    keys: HashSet<Address>,
    /// Unix seconds the short session opens; 0 until armed
    short_session_start: u64,
    short_session_duration: Duration,
    grace: Duration,
}

impl EvidenceMap {
    pub fn new() -> Self {
        EvidenceMap::default()
    }

    pub fn set_short_session_time(&mut self, begin: u64, duration: Duration, grace: Duration) {
        self.short_session_start = begin;
        self.short_session_duration = duration;
        self.grace = grace;
    }

    pub fn short_session_beginning(&self) -> u64 {
        self.short_session_start
    }

    pub fn short_session_end(&self) -> u64 {
        self.short_session_start + self.short_session_duration.as_secs()
    }

    /// Evidence accumulation is over once the grace window has passed
    pub fn is_completed(&self, now: u64) -> bool {
        self.short_session_start != 0 && now > self.short_session_end() + self.grace.as_secs()
    }

    pub fn new_flip_key(&mut self, sender: Address) {
        self.keys.insert(sender);
    }

    pub fn new_answer_hash(&mut self, sender: Address) {
        self.answers.insert(sender);
    }

    pub fn contains_answer(&self, addr: Address) -> bool {
        self.answers.contains(&addr)
    }

    pub fn contains_key(&self, addr: Address) -> bool {
        self.keys.contains(&addr)
    }

    /// Our view of who was present and responsive.
    ///
    /// Bit `i` is set iff the candidate owes no flips, or answered in
    /// time and either broadcast their key or is confirmed out of band.
    pub fn calculate_bitmap(
        &self,
        candidates: &[Address],
        additional_confirmed: &[Address],
        required_flips: impl Fn(Address) -> u8,
    ) -> CandidateBitmap {
        let additional: HashSet<Address> = additional_confirmed.iter().copied().collect();
        let mut bitmap = CandidateBitmap::new();
        for (i, candidate) in candidates.iter().enumerate() {
            if required_flips(*candidate) == 0
                || self.contains_answer(*candidate)
                    && (self.contains_key(*candidate) || additional.contains(candidate))
            {
                bitmap.set(i);
            }
        }
        bitmap
    }

    /// Candidates whose bit is set in strictly more than half of the
    /// submitted bitmaps
    pub fn calculate_approved_candidates(
        candidates: &[Address],
        bitmaps: &[Vec<u8>],
    ) -> Vec<Address> {
        let parsed: Vec<CandidateBitmap> = bitmaps
            .iter()
            .filter_map(|b| CandidateBitmap::from_bytes(b))
            .collect();
        let submitters = parsed.len();
        let mut votes: HashMap<usize, usize> = HashMap::new();
        for bitmap in &parsed {
            for i in 0..candidates.len() {
                if bitmap.contains(i) {
                    *votes.entry(i).or_insert(0) += 1;
                }
            }
        }
        candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| votes.get(i).copied().unwrap_or(0) * 2 > submitters)
            .map(|(_, addr)| *addr)
            .collect()
    }

    pub fn clear(&mut self) {
        self.answers.clear();
        self.keys.clear();
        self.short_session_start = 0;
    }
}
