//! Personhood — proof-of-person validation ceremony core
//!
//! The deterministic subsystem behind a periodic network-wide validation
//! ceremony: a seeded lottery assigns flips to candidates, a qualifier
//! aggregates majority votes over their answers, an evidence map tracks
//! short-session liveness, and the engine drives it all through block
//! flags to a single deterministic epoch transition.
//!
//! Consensus, networking, the content store and the RPC transport are
//! external; the crate exposes seams (`BlockSource`, `FlipStore`,
//! `TxPool`, `KeysPool`) they plug into.

pub mod api;
pub mod ceremony;
pub mod config;
pub mod crypto;
pub mod db;
pub mod evidence;
pub mod flip;
pub mod lottery;
pub mod mempool;
pub mod qualification;
pub mod state;
pub mod types;
pub mod words;

pub use api::{ApiError, FlipApi, FlipSubmitResponse, MAX_FLIP_SIZE};
pub use ceremony::{
    analyze_authors, collect_not_approved_flips, determine_identity_birthday,
    determine_new_identity_state, inc_successful_invites, long_session_flips_count,
    short_answers_salt, BlockSource, CeremonyError, CeremonyEvent, ValidationCeremony,
};
pub use config::{
    ValidationConfig, LOTTERY_SEED_LAG, MIN_LONG_SCORE, MIN_SHORT_SCORE, MIN_TOTAL_SCORE,
    SHORT_SESSION_FLIPS_COUNT,
};
pub use crypto::Keypair;
pub use db::EpochDb;
pub use evidence::{CandidateBitmap, EvidenceMap};
pub use flip::{FlipStore, Flipper, InMemoryFlipStore};
pub use lottery::{assign_flips, collect_candidates_and_flips, flips_to_solve};
pub use mempool::{BufferKeysPool, BufferTxPool, KeysPool, TxPool};
pub use qualification::Qualification;
pub use state::{AppState, GlobalState};
pub use types::*;
