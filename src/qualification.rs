//! Answer aggregation and scoring
//!
//! Long-session answers decide every flip's fate; each candidate is then
//! scored against those verdicts for both sessions.

use crate::db::EpochDb;
use crate::types::{
    Address, Answer, Answers, CeremonyCandidate, FlipAnswerStats, FlipQualification, FlipStatus,
    ShortAnswerAttachment,
};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Share of valid answers needed for a strong qualification
const QUALIFIED_SHARE: f32 = 0.75;
/// Share of valid answers needed for a weak qualification
const WEAKLY_QUALIFIED_SHARE: f32 = 0.66;

/// Outcome of scoring one candidate for one session
#[derive(Debug, Default)]
pub struct CandidateQualification {
    pub point: f32,
    pub qualified_count: u32,
    pub flip_answers: HashMap<usize, FlipAnswerStats>,
    /// The candidate submitted nothing at all for this session
    pub no_answers: bool,
}

#[derive(Default)]
pub struct Qualification {
    /// Short entries hold the raw attachment payload, long entries the
    /// packed answer bits
    short_answers: Vec<(Address, Vec<u8>)>,
    long_answers: Vec<(Address, Vec<u8>)>,
    proofs: HashMap<Address, Vec<u8>>,
    flip_keys: HashMap<Address, Vec<u8>>,
}

impl Qualification {
    pub fn new() -> Self {
        Qualification::default()
    }

    /// Record a candidate's session payload; repeated senders are ignored
    pub fn add_answers(&mut self, is_short: bool, sender: Address, payload: &[u8]) {
        let store = if is_short {
            &mut self.short_answers
        } else {
            &mut self.long_answers
        };
        if store.iter().any(|(addr, _)| *addr == sender) {
            return;
        }
        if is_short {
            let Some(attachment) = ShortAnswerAttachment::from_bytes(payload) else {
                warn!(%sender, "short answer attachment is invalid");
                return;
            };
            self.proofs.insert(sender, attachment.proof);
            self.flip_keys.insert(sender, attachment.key);
        }
        store.push((sender, payload.to_vec()));
    }

    /// The word-pair proof revealed in the sender's short answers
    pub fn proof(&self, author: Address) -> Option<&[u8]> {
        self.proofs.get(&author).map(|p| p.as_slice())
    }

    pub fn flip_key(&self, author: Address) -> Option<&[u8]> {
        self.flip_keys.get(&author).map(|k| k.as_slice())
    }

    pub fn persist(&self, db: &EpochDb) {
        db.write_answers(true, &self.short_answers);
        db.write_answers(false, &self.long_answers);
    }

    pub fn restore(&mut self, db: &EpochDb) {
        for (sender, payload) in db.read_answers(true) {
            self.add_answers(true, sender, &payload);
        }
        for (sender, payload) in db.read_answers(false) {
            self.add_answers(false, sender, &payload);
        }
    }

    fn answers_of(&self, is_short: bool, addr: Address) -> Option<Answers> {
        let store = if is_short {
            &self.short_answers
        } else {
            &self.long_answers
        };
        let (_, payload) = store.iter().find(|(a, _)| *a == addr)?;
        let bits = if is_short {
            ShortAnswerAttachment::from_bytes(payload)?.answers
        } else {
            payload.clone()
        };
        Answers::from_bytes(&bits)
    }

    /// Aggregate long-session votes into one verdict per flip.
    ///
    /// `wrong_words` reports whether the flip author's word-pair proof
    /// fails verification for that flip.
    pub fn qualify_flips(
        &self,
        total_flips: usize,
        candidates: &[CeremonyCandidate],
        long_flips_per_candidate: &[Vec<usize>],
        wrong_words: impl Fn(usize) -> bool,
    ) -> Vec<FlipQualification> {
        let mut left = vec![0u32; total_flips];
        let mut right = vec![0u32; total_flips];
        let mut inappropriate = vec![0u32; total_flips];

        for (candidate_idx, assigned) in long_flips_per_candidate.iter().enumerate() {
            let Some(candidate) = candidates.get(candidate_idx) else {
                continue;
            };
            let Some(answers) = self.answers_of(false, candidate.address) else {
                continue;
            };
            for (j, &raw_idx) in assigned.iter().enumerate() {
                if j >= answers.len() || total_flips == 0 {
                    break;
                }
                let flip_idx = raw_idx % total_flips;
                match answers.answer(j).0 {
                    Answer::Left => left[flip_idx] += 1,
                    Answer::Right => right[flip_idx] += 1,
                    Answer::Inappropriate => inappropriate[flip_idx] += 1,
                    Answer::None => {}
                }
            }
        }

        (0..total_flips)
            .map(|i| {
                let mut q = qualify_one_flip(left[i], right[i], inappropriate[i]);
                q.wrong_words = wrong_words(i);
                q
            })
            .collect()
    }

    /// Score one candidate's session against the flip verdicts
    pub fn qualify_candidate(
        &self,
        addr: Address,
        qualifications: &[FlipQualification],
        flip_indices: &[usize],
        is_short: bool,
        not_approved: &HashSet<usize>,
    ) -> CandidateQualification {
        let Some(answers) = self.answers_of(is_short, addr) else {
            return CandidateQualification {
                no_answers: true,
                ..CandidateQualification::default()
            };
        };

        let mut result = CandidateQualification::default();
        for (j, &raw_idx) in flip_indices.iter().enumerate() {
            if qualifications.is_empty() {
                break;
            }
            let flip_idx = raw_idx % qualifications.len();
            if not_approved.contains(&flip_idx) {
                continue;
            }
            let (answer, easy) = if j < answers.len() {
                answers.answer(j)
            } else {
                (Answer::None, false)
            };
            let verdict = qualifications[flip_idx];
            let mut earned = 0.0;
            match verdict.status {
                FlipStatus::NotQualified | FlipStatus::QualifiedByNone => {}
                FlipStatus::Qualified | FlipStatus::WeaklyQualified => {
                    result.qualified_count += 1;
                    if answer == verdict.answer {
                        earned = if verdict.status == FlipStatus::WeaklyQualified {
                            0.5
                        } else {
                            1.0
                        };
                        result.point += earned;
                    }
                }
            }
            result.flip_answers.insert(
                flip_idx,
                FlipAnswerStats {
                    respondent: addr,
                    answer,
                    easy,
                    point: earned,
                },
            );
        }
        result
    }
}

fn qualify_one_flip(left: u32, right: u32, inappropriate: u32) -> FlipQualification {
    let valid = left + right;
    if valid == 0 && inappropriate == 0 {
        return FlipQualification {
            status: FlipStatus::QualifiedByNone,
            answer: Answer::None,
            wrong_words: false,
        };
    }
    if inappropriate > left.max(right) {
        return FlipQualification {
            status: FlipStatus::Qualified,
            answer: Answer::Inappropriate,
            wrong_words: false,
        };
    }
    let (winner, answer) = if left >= right {
        (left, Answer::Left)
    } else {
        (right, Answer::Right)
    };
    let share = winner as f32 / valid as f32;
    let status = if share >= QUALIFIED_SHARE {
        FlipStatus::Qualified
    } else if share >= WEAKLY_QUALIFIED_SHARE {
        FlipStatus::WeaklyQualified
    } else {
        FlipStatus::NotQualified
    };
    FlipQualification {
        status,
        answer,
        wrong_words: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flip_verdict_thresholds() {
        let q = qualify_one_flip(3, 1, 0);
        assert_eq!(q.status, FlipStatus::Qualified);
        assert_eq!(q.answer, Answer::Left);

        let q = qualify_one_flip(1, 2, 0);
        assert_eq!(q.status, FlipStatus::WeaklyQualified);
        assert_eq!(q.answer, Answer::Right);

        let q = qualify_one_flip(2, 2, 1);
        assert_eq!(q.status, FlipStatus::NotQualified);

        let q = qualify_one_flip(1, 1, 2);
        assert_eq!(q.status, FlipStatus::Qualified);
        assert_eq!(q.answer, Answer::Inappropriate);

        let q = qualify_one_flip(0, 0, 0);
        assert_eq!(q.status, FlipStatus::QualifiedByNone);
    }

    fn candidate(b: u8) -> CeremonyCandidate {
        CeremonyCandidate {
            address: Address::from_slice(&[b]),
            generation: 0,
            code: Vec::new(),
        }
    }

    fn long_payload(answers: &Answers) -> Vec<u8> {
        answers.to_bytes()
    }

    #[test]
    fn votes_aggregate_per_flip() {
        let mut qualification = Qualification::new();
        let candidates = vec![candidate(1), candidate(2), candidate(3), candidate(4)];
        let assigned = vec![vec![0, 1], vec![0, 1], vec![0, 1], vec![0, 1]];

        // flip 0: three left, one right -> Qualified(Left)
        // flip 1: two right, two left -> NotQualified
        for (i, (first, second)) in [
            (Answer::Left, Answer::Right),
            (Answer::Left, Answer::Right),
            (Answer::Left, Answer::Left),
            (Answer::Right, Answer::Left),
        ]
        .iter()
        .enumerate()
        {
            let mut answers = Answers::new(2);
            set(&mut answers, 0, *first);
            set(&mut answers, 1, *second);
            qualification.add_answers(false, candidates[i].address, &long_payload(&answers));
        }

        let verdicts = qualification.qualify_flips(2, &candidates, &assigned, |_| false);
        assert_eq!(verdicts[0].status, FlipStatus::Qualified);
        assert_eq!(verdicts[0].answer, Answer::Left);
        assert_eq!(verdicts[1].status, FlipStatus::NotQualified);
    }

    fn set(answers: &mut Answers, i: usize, a: Answer) {
        match a {
            Answer::Left => answers.left(i),
            Answer::Right => answers.right(i),
            Answer::Inappropriate => answers.inappropriate(i),
            Answer::None => {}
        }
    }

    #[test]
    fn candidate_scoring() {
        let mut qualification = Qualification::new();
        let addr = Address::from_slice(&[1]);
        let mut answers = Answers::new(4);
        answers.left(0); // Qualified(Left): full point
        answers.left(1); // WeaklyQualified(Left): half point
        answers.right(2); // Qualified(Left), wrong answer: no point
        answers.left(3); // NotQualified: no count
        qualification.add_answers(false, addr, &answers.to_bytes());

        let verdicts = vec![
            FlipQualification {
                status: FlipStatus::Qualified,
                answer: Answer::Left,
                wrong_words: false,
            },
            FlipQualification {
                status: FlipStatus::WeaklyQualified,
                answer: Answer::Left,
                wrong_words: false,
            },
            FlipQualification {
                status: FlipStatus::Qualified,
                answer: Answer::Left,
                wrong_words: false,
            },
            FlipQualification {
                status: FlipStatus::NotQualified,
                answer: Answer::Left,
                wrong_words: false,
            },
        ];

        let result = qualification.qualify_candidate(
            addr,
            &verdicts,
            &[0, 1, 2, 3],
            false,
            &HashSet::new(),
        );
        assert!(!result.no_answers);
        assert_eq!(result.qualified_count, 3);
        assert_eq!(result.point, 1.5);
    }

    #[test]
    fn disapproved_flips_are_skipped() {
        let mut qualification = Qualification::new();
        let addr = Address::from_slice(&[1]);
        let mut answers = Answers::new(2);
        answers.left(0);
        answers.left(1);
        qualification.add_answers(false, addr, &answers.to_bytes());

        let verdicts = vec![
            FlipQualification {
                status: FlipStatus::Qualified,
                answer: Answer::Left,
                wrong_words: false,
            };
            2
        ];
        let not_approved: HashSet<usize> = [0].into_iter().collect();
        let result =
            qualification.qualify_candidate(addr, &verdicts, &[0, 1], false, &not_approved);
        assert_eq!(result.qualified_count, 1);
        assert_eq!(result.point, 1.0);
    }

    #[test]
    fn missing_submission_is_no_answers() {
        let qualification = Qualification::new();
        let result = qualification.qualify_candidate(
            Address::from_slice(&[9]),
            &[],
            &[],
            true,
            &HashSet::new(),
        );
        assert!(result.no_answers);
        assert_eq!(result.qualified_count, 0);
        assert_eq!(result.point, 0.0);
    }
}
