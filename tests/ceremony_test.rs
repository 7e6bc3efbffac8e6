//! Ceremony core vectors: flip assignment, identity transitions, author
//! classification and invitation credit

use personhood::types::{
    Answer, CeremonyCandidate, FlipQualification, FlipStatus, Identity, IdentityState, TxAddr,
};
use personhood::{
    analyze_authors, collect_not_approved_flips, crypto, determine_identity_birthday,
    determine_new_identity_state, flips_to_solve, inc_successful_invites, long_session_flips_count,
    Address, Hash, ValidationAuthors, ValidationResult, MIN_LONG_SCORE, MIN_SHORT_SCORE,
    MIN_TOTAL_SCORE,
};
use std::collections::{HashMap, HashSet};

fn participants(my_key: Address, my_index: usize, len: usize) -> Vec<CeremonyCandidate> {
    (0..len)
        .map(|i| CeremonyCandidate {
            address: if i == my_index {
                my_key
            } else {
                Address::from_slice(&[i as u8])
            },
            generation: 0,
            code: Vec::new(),
        })
        .collect()
}

#[test]
fn get_flips_to_solve() {
    let my_key = Address::from_slice(&[0x1, 0x2, 0x3]);
    let flip_cids: Vec<Vec<u8>> = vec![vec![0x1], vec![0x2], vec![0x3], vec![0x4], vec![0x5]];
    let flips_per_candidate = vec![
        vec![0, 1, 2],
        vec![4, 2, 1],
        vec![1, 2, 3],
        vec![1, 2, 4],
        vec![0, 1, 3],
    ];

    let result = flips_to_solve(
        my_key,
        &participants(my_key, 0, 5),
        &flips_per_candidate,
        &flip_cids,
    );
    assert_eq!(result, vec![vec![0x1], vec![0x2], vec![0x3]]);

    let result = flips_to_solve(
        my_key,
        &participants(my_key, 3, 5),
        &flips_per_candidate,
        &flip_cids,
    );
    assert_eq!(result, vec![vec![0x2], vec![0x3], vec![0x5]]);

    let result = flips_to_solve(
        my_key,
        &participants(my_key, 4, 5),
        &flips_per_candidate,
        &flip_cids,
    );
    assert_eq!(result, vec![vec![0x1], vec![0x2], vec![0x4]]);
}

#[test]
fn get_flips_to_solve_few_flips() {
    let my_key = Address::from_slice(&[0x1, 0x2, 0x3]);
    let flip_cids: Vec<Vec<u8>> = vec![vec![0x1], vec![0x2], vec![0x3], vec![0x4], vec![0x5]];
    let flips_per_candidate = vec![
        vec![0, 1, 6],
        vec![4, 2, 8],
        vec![1, 2, 4],
        vec![1, 2, 3],
        vec![6, 7, 8],
    ];

    let result = flips_to_solve(
        my_key,
        &participants(my_key, 0, 5),
        &flips_per_candidate,
        &flip_cids,
    );
    assert_eq!(result, vec![vec![0x1], vec![0x2], vec![0x2]]);

    let result = flips_to_solve(
        my_key,
        &participants(my_key, 4, 5),
        &flips_per_candidate,
        &flip_cids,
    );
    assert_eq!(result, vec![vec![0x2], vec![0x3], vec![0x4]]);
}

#[test]
fn long_session_size() {
    assert_eq!(long_session_flips_count(0, 0), 1);
    assert_eq!(long_session_flips_count(3, 100), 1);
    assert_eq!(long_session_flips_count(12, 8), 15);
    assert_eq!(long_session_flips_count(100, 50), 20);
}

#[test]
fn identity_transition_table() {
    struct Case {
        prev: IdentityState,
        short_score: f32,
        long_score: f32,
        total_score: f32,
        total_qualified_flips: u32,
        missed: bool,
        expected: IdentityState,
        no_qual_short: bool,
        no_qual_long: bool,
    }

    fn case(
        prev: IdentityState,
        scores: (f32, f32, f32),
        q: u32,
        missed: bool,
        expected: IdentityState,
        no_qual_short: bool,
        no_qual_long: bool,
    ) -> Case {
        Case {
            prev,
            short_score: scores.0,
            long_score: scores.1,
            total_score: scores.2,
            total_qualified_flips: q,
            missed,
            expected,
            no_qual_short,
            no_qual_long,
        }
    }

    use IdentityState::*;
    let min = (MIN_SHORT_SCORE, MIN_LONG_SCORE, MIN_TOTAL_SCORE);
    let cases = vec![
        case(Killed, (0.0, 0.0, 0.0), 0, true, Killed, false, false),
        case(Invite, (1.0, 1.0, 1.0), 110, false, Killed, false, false),
        case(Candidate, min, 11, false, Newbie, false, false),
        case(Candidate, min, 11, true, Killed, false, false),
        case(Newbie, min, 11, false, Verified, false, false),
        case(Newbie, min, 10, false, Newbie, false, false),
        case(Newbie, min, 11, true, Killed, false, false),
        case(Newbie, (0.4, 0.8, 1.0), 11, false, Killed, false, false),
        case(Newbie, min, 8, false, Newbie, false, false),
        case(Verified, min, 10, false, Killed, false, false),
        case(Verified, (0.0, 0.0, 0.0), 0, true, Suspended, false, false),
        case(Verified, (0.0, 0.0, 0.0), 0, false, Killed, false, false),
        case(Suspended, min, 10, false, Verified, false, false),
        case(Suspended, (1.0, 0.8, 0.0), 10, true, Zombie, false, false),
        case(Zombie, (MIN_SHORT_SCORE, 0.0, MIN_TOTAL_SCORE), 10, false, Verified, false, false),
        case(Zombie, (1.0, 0.0, 0.0), 10, true, Killed, false, false),
        case(Candidate, (MIN_SHORT_SCORE, 0.0, 0.0), 5, false, Candidate, true, false),
        case(Candidate, (MIN_SHORT_SCORE - 0.1, 0.0, 0.0), 5, false, Killed, false, true),
        case(Newbie, (MIN_SHORT_SCORE, 0.0, 0.1), 5, false, Newbie, true, false),
        case(Newbie, (MIN_SHORT_SCORE, 0.0, 0.1), 5, false, Newbie, false, true),
        case(Newbie, (MIN_SHORT_SCORE, 0.0, 0.1), 11, false, Killed, false, true),
        case(Newbie, (MIN_SHORT_SCORE - 0.1, 0.0, 0.1), 9, false, Killed, false, true),
        case(Verified, (MIN_SHORT_SCORE - 0.1, 0.0, 0.1), 10, false, Verified, true, false),
        case(Verified, (MIN_SHORT_SCORE - 0.1, 0.0, 1.1), 10, false, Killed, false, true),
        case(Suspended, (MIN_SHORT_SCORE - 0.1, 0.0, 0.1), 10, false, Suspended, true, false),
        case(Suspended, (MIN_SHORT_SCORE - 0.1, 0.0, 1.1), 10, false, Killed, false, true),
        case(Zombie, (MIN_SHORT_SCORE - 0.1, 0.0, 0.1), 10, false, Zombie, true, false),
        case(Zombie, (MIN_SHORT_SCORE, 0.0, 0.1), 10, false, Killed, false, true),
    ];

    for (i, c) in cases.iter().enumerate() {
        let identity = Identity {
            state: c.prev,
            ..Identity::default()
        };
        let next = determine_new_identity_state(
            &identity,
            c.short_score,
            c.long_score,
            c.total_score,
            c.total_qualified_flips,
            c.missed,
            c.no_qual_short,
            c.no_qual_long,
        );
        assert_eq!(next, c.expected, "case {i}: {:?} -> {:?}", c.prev, c.expected);
    }
}

#[test]
fn required_flips_guard() {
    let unfinished = Identity {
        state: IdentityState::Newbie,
        required_flips: 3,
        ..Identity::default()
    };
    assert_eq!(
        determine_new_identity_state(&unfinished, 1.0, 1.0, 1.0, 20, false, false, false),
        IdentityState::Killed
    );

    let verified = Identity {
        state: IdentityState::Verified,
        required_flips: 3,
        ..Identity::default()
    };
    assert_eq!(
        determine_new_identity_state(&verified, 1.0, 1.0, 1.0, 20, false, false, false),
        IdentityState::Suspended
    );
}

#[test]
fn not_approved_flips() {
    let candidates: Vec<CeremonyCandidate> = (0..3)
        .map(|i| CeremonyCandidate {
            address: Address::from_slice(&[10 + i as u8]),
            generation: 0,
            code: Vec::new(),
        })
        .collect();
    let flips: Vec<Vec<u8>> = (0..5).map(|i| vec![i as u8]).collect();
    let mut flips_per_author: HashMap<usize, Vec<Vec<u8>>> = HashMap::new();
    flips_per_author.insert(0, vec![flips[0].clone(), flips[1].clone(), flips[2].clone()]);
    flips_per_author.insert(1, vec![flips[3].clone()]);
    flips_per_author.insert(2, vec![flips[4].clone()]);

    let mut required: HashMap<Address, u8> = HashMap::new();
    required.insert(candidates[0].address, 3);
    required.insert(candidates[1].address, 3);

    let approved: HashSet<Address> = [candidates[1].address].into_iter().collect();

    let result = collect_not_approved_flips(&approved, &candidates, &flips_per_author, &flips, |a| {
        required.get(&a).copied().unwrap_or(0)
    });

    assert_eq!(result.len(), 3);
    assert!(result.contains(&0));
    assert!(result.contains(&1));
    assert!(result.contains(&2));
}

#[test]
fn author_classification() {
    let authors: Vec<Address> = (1..=5).map(|i| Address::from_slice(&[i])).collect();
    let flips: Vec<Vec<u8>> = (0..10).map(|i| vec![i as u8]).collect();

    let mut author_map: HashMap<Hash, Address> = HashMap::new();
    let ownership = [0, 0, 0, 1, 1, 2, 2, 3, 3, 4];
    for (flip_idx, author_idx) in ownership.iter().enumerate() {
        author_map.insert(crypto::sha3(&flips[flip_idx]), authors[*author_idx]);
    }

    fn q(status: FlipStatus) -> FlipQualification {
        FlipQualification {
            status,
            answer: Answer::None,
            wrong_words: false,
        }
    }
    use FlipStatus::*;
    let qualifications = vec![
        q(Qualified),
        q(WeaklyQualified),
        q(NotQualified),
        FlipQualification {
            status: Qualified,
            answer: Answer::Inappropriate,
            wrong_words: false,
        },
        q(Qualified),
        FlipQualification {
            status: WeaklyQualified,
            answer: Answer::None,
            wrong_words: true,
        },
        q(Qualified),
        q(NotQualified),
        q(NotQualified),
        q(QualifiedByNone),
    ];

    let (bad, good) = analyze_authors(&qualifications, &flips, &author_map);

    assert!(bad.contains(&authors[1]));
    assert!(bad.contains(&authors[2]));
    assert!(bad.contains(&authors[3]));
    assert!(bad.contains(&authors[4]));
    assert!(!bad.contains(&authors[0]));

    let first = good.get(&authors[0]).expect("author 1 must be good");
    assert_eq!(first.strong_flips, 1);
    assert_eq!(first.weak_flips, 1);
    assert_eq!(good.len(), 1);
}

#[test]
fn successful_invites() {
    let god = Address::from_slice(&[0x1]);
    let auth1 = Address::from_slice(&[0x2]);
    let bad_auth = Address::from_slice(&[0x3]);

    let mut authors = ValidationAuthors::default();
    authors.bad_authors.insert(bad_auth);
    authors.good_authors.insert(
        auth1,
        ValidationResult {
            strong_flips: 1,
            weak_flips: 1,
            successful_invites: 0,
        },
    );

    let invited_by = |state: IdentityState, inviter: Address| Identity {
        state,
        inviter: Some(TxAddr {
            address: inviter,
            tx_hash: Hash::default(),
        }),
        ..Identity::default()
    };

    // Verified -> Newbie: no credit
    inc_successful_invites(
        &mut authors,
        god,
        &invited_by(IdentityState::Verified, god),
        IdentityState::Newbie,
    );
    inc_successful_invites(
        &mut authors,
        god,
        &invited_by(IdentityState::Candidate, auth1),
        IdentityState::Newbie,
    );
    inc_successful_invites(
        &mut authors,
        god,
        &invited_by(IdentityState::Candidate, bad_auth),
        IdentityState::Newbie,
    );
    inc_successful_invites(
        &mut authors,
        god,
        &invited_by(IdentityState::Candidate, god),
        IdentityState::Newbie,
    );

    assert_eq!(authors.good_authors[&auth1].successful_invites, 1);
    assert_eq!(authors.good_authors[&god].successful_invites, 1);
    assert!(!authors.good_authors.contains_key(&bad_auth));
}

#[test]
fn identity_birthday() {
    let newbie = Identity {
        birthday: 1,
        state: IdentityState::Newbie,
        ..Identity::default()
    };
    assert_eq!(
        determine_identity_birthday(2, &newbie, IdentityState::Newbie),
        1
    );

    let candidate = Identity {
        state: IdentityState::Candidate,
        ..Identity::default()
    };
    assert_eq!(
        determine_identity_birthday(7, &candidate, IdentityState::Newbie),
        7
    );
    assert_eq!(
        determine_identity_birthday(7, &candidate, IdentityState::Killed),
        0
    );
}
