//! RPC-surface operations; the JSON-RPC transport lives in the node

use crate::ceremony::{CeremonyError, ValidationCeremony};
use crate::crypto::Keypair;
use crate::flip::{FlipError, Flipper};
use crate::mempool::{MempoolError, TxPool};
use crate::state::AppState;
use crate::types::{Answer, Answers, Hash, Transaction, TxKind};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Largest accepted flip image payload
pub const MAX_FLIP_SIZE: usize = 1024 * 600;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("flip is empty")]
    FlipEmpty,
    #[error("flip is too big, max expected size {max}, actual {actual}")]
    FlipTooBig { max: usize, actual: usize },
    #[error("ceremony is not started")]
    NotStarted,
    #[error("some answers are missing, expected {expected}, actual {actual}")]
    AnswersMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Flip(#[from] FlipError),
    #[error(transparent)]
    Ceremony(#[from] CeremonyError),
    #[error(transparent)]
    Mempool(#[from] MempoolError),
}

#[derive(Debug, Clone)]
pub struct FlipSubmitResponse {
    pub tx_hash: Hash,
    pub flip_hash: String,
}

#[derive(Debug, Clone)]
pub struct FlipResponse {
    pub hex: String,
    pub epoch: u16,
    pub mined: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FlipAnswer {
    pub answer: Answer,
    pub easy: bool,
}

#[derive(Debug, Clone)]
pub struct SubmitAnswersArgs {
    pub answers: Vec<FlipAnswer>,
    pub nonce: u32,
    pub epoch: u16,
}

pub struct FlipApi {
    ceremony: Arc<ValidationCeremony>,
    flipper: Arc<Flipper>,
    app_state: Arc<RwLock<AppState>>,
    mempool: Arc<dyn TxPool>,
    keypair: Arc<Keypair>,
}

impl FlipApi {
    pub fn new(
        ceremony: Arc<ValidationCeremony>,
        flipper: Arc<Flipper>,
        app_state: Arc<RwLock<AppState>>,
        mempool: Arc<dyn TxPool>,
        keypair: Arc<Keypair>,
    ) -> Self {
        FlipApi {
            ceremony,
            flipper,
            app_state,
            mempool,
            keypair,
        }
    }

    /// Encrypt, publish and announce a new flip
    pub fn submit_flip(&self, raw: &[u8]) -> Result<FlipSubmitResponse, ApiError> {
        if raw.is_empty() {
            return Err(ApiError::FlipEmpty);
        }
        if raw.len() > MAX_FLIP_SIZE {
            return Err(ApiError::FlipTooBig {
                max: MAX_FLIP_SIZE,
                actual: raw.len(),
            });
        }

        let epoch = self
            .app_state
            .read()
            .expect("app state lock poisoned")
            .global
            .epoch;
        let (cid, encrypted) = self.flipper.prepare_flip(epoch, raw)?;
        self.flipper.publish_flip(&encrypted)?;

        let mut tx = Transaction {
            kind: TxKind::SubmitFlip,
            sender: self.keypair.address(),
            epoch,
            payload: cid.clone(),
            signature: Vec::new(),
        };
        tx.signature = self.keypair.sign(&tx.signing_bytes());
        let tx_hash = tx.hash();
        self.mempool.add(tx)?;

        Ok(FlipSubmitResponse {
            tx_hash,
            flip_hash: hex::encode(cid),
        })
    }

    pub fn flip_short_hashes(&self) -> Result<Vec<String>, ApiError> {
        let flips = self
            .ceremony
            .short_flips_to_solve()
            .ok_or(ApiError::NotStarted)?;
        Ok(flips.iter().map(hex::encode).collect())
    }

    pub fn flip_long_hashes(&self) -> Result<Vec<String>, ApiError> {
        let flips = self
            .ceremony
            .long_flips_to_solve()
            .ok_or(ApiError::NotStarted)?;
        Ok(flips.iter().map(hex::encode).collect())
    }

    pub fn flip(&self, hash: &str) -> Result<FlipResponse, ApiError> {
        let cid = hex::decode(hash).map_err(|_| ApiError::Flip(FlipError::NotFound))?;
        let (data, epoch) = self.flipper.get_flip(&cid)?;

        let mut mined = false;
        self.app_state
            .read()
            .expect("app state lock poisoned")
            .iterate_identities(|_, identity| {
                if identity.flips.iter().any(|f| f.cid == cid) {
                    mined = true;
                }
            });

        Ok(FlipResponse {
            hex: hex::encode(data),
            epoch,
            mined,
        })
    }

    pub fn submit_short_answers(&self, args: &SubmitAnswersArgs) -> Result<Hash, ApiError> {
        let flips = self
            .ceremony
            .short_flips_to_solve()
            .ok_or(ApiError::NotStarted)?;
        if flips.len() != args.answers.len() {
            return Err(ApiError::AnswersMismatch {
                expected: flips.len(),
                actual: args.answers.len(),
            });
        }
        Ok(self
            .ceremony
            .submit_short_answers(&parse_answers(&args.answers))?)
    }

    pub fn submit_long_answers(&self, args: &SubmitAnswersArgs) -> Result<Hash, ApiError> {
        let flips = self
            .ceremony
            .long_flips_to_solve()
            .ok_or(ApiError::NotStarted)?;
        if flips.len() != args.answers.len() {
            return Err(ApiError::AnswersMismatch {
                expected: flips.len(),
                actual: args.answers.len(),
            });
        }
        Ok(self
            .ceremony
            .submit_long_answers(&parse_answers(&args.answers))?)
    }
}

fn parse_answers(answers: &[FlipAnswer]) -> Answers {
    let mut result = Answers::new(answers.len());
    for (i, item) in answers.iter().enumerate() {
        match item.answer {
            Answer::None => {}
            Answer::Left => result.left(i),
            Answer::Right => result.right(i),
            Answer::Inappropriate => result.inappropriate(i),
        }
        if item.easy {
            result.easy(i);
        }
    }
    result
}
