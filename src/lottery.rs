//! Deterministic flip-to-candidate assignment
//!
//! Every node derives the same candidate and flip slices from the
//! identity traversal, then walks a ChaCha20 stream seeded by the lottery
//! seed. The stream is consumed in candidate order, so the full
//! assignment is a pure function of `(state, seed)`.

use crate::crypto;
use crate::state::AppState;
use crate::types::{Address, CeremonyCandidate, Hash};
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::collections::{HashMap, HashSet};

/// Slices derived from the identity traversal at lottery time
#[derive(Debug, Default)]
pub struct CeremonyPool {
    pub candidates: Vec<CeremonyCandidate>,
    pub non_candidates: Vec<Address>,
    pub flips: Vec<Vec<u8>>,
    /// Flip cids per candidate index (authors only)
    pub flips_per_author: HashMap<usize, Vec<Vec<u8>>>,
    /// sha3(cid) -> author address
    pub flip_author_map: HashMap<Hash, Address>,
}

/// Walk the identity table in key order and split it into ceremony
/// candidates (with their flips) and everyone else
pub fn collect_candidates_and_flips(state: &AppState) -> CeremonyPool {
    let mut pool = CeremonyPool::default();
    state.iterate_identities(|addr, identity| {
        if identity.state.is_in_ceremony() {
            let author_index = pool.candidates.len();
            for flip in &identity.flips {
                pool.flips.push(flip.cid.clone());
                pool.flips_per_author
                    .entry(author_index)
                    .or_default()
                    .push(flip.cid.clone());
                pool.flip_author_map.insert(crypto::sha3(&flip.cid), addr);
            }
            pool.candidates.push(CeremonyCandidate {
                address: addr,
                generation: identity.generation,
                code: identity.code.clone(),
            });
        } else {
            pool.non_candidates.push(addr);
        }
    });
    pool
}

/// Assign `per_candidate` flip indices to every candidate.
///
/// The long-session pass runs with the byte-reversed seed and prefers
/// flips nobody drew in the short session. When the eligible pool runs
/// dry the earlier picks repeat, offset by `|flips|` per extra round, so
/// the modulo wrap downstream resolves to identical duplicates on every
/// node.
pub fn assign_flips(
    flips_per_author: &HashMap<usize, Vec<Vec<u8>>>,
    candidate_count: usize,
    flips: &[Vec<u8>],
    per_candidate: usize,
    seed: Hash,
    long_session: bool,
    chosen: &HashSet<usize>,
) -> Vec<Vec<usize>> {
    let mut rng = ChaCha20Rng::from_seed(seed.0);
    let flip_index: HashMap<&[u8], usize> = flips
        .iter()
        .enumerate()
        .map(|(i, cid)| (cid.as_slice(), i))
        .collect();

    let mut result = Vec::with_capacity(candidate_count);
    for candidate in 0..candidate_count {
        let mut own = vec![false; flips.len()];
        if let Some(cids) = flips_per_author.get(&candidate) {
            for cid in cids {
                if let Some(&idx) = flip_index.get(cid.as_slice()) {
                    own[idx] = true;
                }
            }
        }
        result.push(select_for_candidate(
            &mut rng,
            flips.len(),
            per_candidate,
            &own,
            long_session,
            chosen,
        ));
    }
    result
}

fn select_for_candidate(
    rng: &mut ChaCha20Rng,
    flip_count: usize,
    per_candidate: usize,
    own: &[bool],
    long_session: bool,
    chosen: &HashSet<usize>,
) -> Vec<usize> {
    let mut picked = Vec::with_capacity(per_candidate);
    if flip_count == 0 {
        return picked;
    }
    let mut used = vec![false; flip_count];

    // phase 0 (long session): unused flips nobody drew in the short session
    // phase 1: unused flips of other authors
    // phase 2: any unused flip
    type Eligible = fn(usize, &[bool], &[bool], &HashSet<usize>) -> bool;
    let long_phases: [Eligible; 3] = [
        |i, used, own, chosen| !used[i] && !own[i] && !chosen.contains(&i),
        |i, used, own, _| !used[i] && !own[i],
        |i, used, _, _| !used[i],
    ];
    let short_phases: [Eligible; 2] =
        [|i, used, own, _| !used[i] && !own[i], |i, used, _, _| !used[i]];
    let phases: &[Eligible] = if long_session {
        &long_phases
    } else {
        &short_phases
    };

    'outer: for eligible in phases {
        while picked.len() < per_candidate {
            match walk(rng, flip_count, |i| eligible(i, &used, own, chosen)) {
                Some(idx) => {
                    used[idx] = true;
                    picked.push(idx);
                }
                None => continue 'outer,
            }
        }
        break;
    }

    // dry pool: repeat earlier picks, shifted out of range so the wrap
    // stays visible to flips_to_solve
    let available = picked.clone();
    let mut j = 0;
    while picked.len() < per_candidate && !available.is_empty() {
        let round = 1 + j / available.len();
        picked.push(available[j % available.len()] + flip_count * round);
        j += 1;
    }
    picked
}

/// One seeded draw plus a forward probe to the next eligible index
fn walk(
    rng: &mut ChaCha20Rng,
    len: usize,
    eligible: impl Fn(usize) -> bool,
) -> Option<usize> {
    let start = rng.gen_range(0..len);
    (0..len).map(|step| (start + step) % len).find(|&i| eligible(i))
}

/// The flips the local node must download and solve
pub fn flips_to_solve(
    own_address: Address,
    candidates: &[CeremonyCandidate],
    flips_per_candidate: &[Vec<usize>],
    flips: &[Vec<u8>],
) -> Vec<Vec<u8>> {
    let mut result = Vec::new();
    for (i, candidate) in candidates.iter().enumerate() {
        if candidate.address == own_address {
            for &idx in &flips_per_candidate[i] {
                result.push(flips[idx % flips.len()].clone());
            }
            break;
        }
    }
    result
}
