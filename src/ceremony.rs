//! Validation ceremony engine
//!
//! A multi-phase state machine advanced exclusively by block header
//! flags. Per phase it broadcasts at most one transaction of each kind,
//! accumulates ceremony transactions into the epoch store, and at
//! `ValidationFinished` commits every identity transition through
//! `apply_new_epoch` — the deterministic core that must produce
//! bit-identical results on every node.

use crate::config::{
    ValidationConfig, LOTTERY_SEED_LAG, MIN_LONG_SCORE, MIN_SHORT_SCORE, MIN_TOTAL_SCORE,
    SHORT_SESSION_FLIPS_COUNT, TOTAL_QUALIFIED_FLIPS_THRESHOLD, WORD_DICTIONARY_SIZE,
};
use crate::crypto::{self, Keypair};
use crate::db::{EpochDb, StoreError};
use crate::evidence::EvidenceMap;
use crate::flip::Flipper;
use crate::lottery;
use crate::mempool::{KeysPool, MempoolError, TxPool};
use crate::qualification::Qualification;
use crate::state::AppState;
use crate::types::{
    Address, Answer, Answers, Block, BlockFlag, CeremonyCandidate, FlipAnswerStats, FlipKey,
    FlipQualification, FlipStats, FlipStatus, Hash, Header, Identity, IdentityState, IdentityStats,
    ShortAnswerAttachment, Transaction, TxKind, ValidationAuthors, ValidationPeriod,
    ValidationResult, ValidationStats,
};
use crate::words::{self, WordsError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum CeremonyError {
    #[error("ceremony is not started")]
    NotStarted,
    #[error("flip author not found")]
    AuthorNotFound,
    #[error("word proof is not ready")]
    ProofNotReady,
    #[error(transparent)]
    Words(#[from] WordsError),
    #[error("mempool rejected transaction: {0}")]
    Mempool(#[from] MempoolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Events feeding the engine from the node
#[derive(Debug)]
pub enum CeremonyEvent {
    BlockAdded(Block),
    FastSyncCompleted,
}

/// Read-only view of the appended chain
pub trait BlockSource: Send + Sync {
    fn header(&self, height: u64) -> Option<Header>;
    fn head(&self) -> Header;
}

#[derive(Debug, Clone, Copy)]
struct CacheValue {
    state: IdentityState,
    short_qualified: u32,
    short_points: f32,
    birthday: u16,
}

struct EpochCache {
    values: BTreeMap<Address, CacheValue>,
    authors: ValidationAuthors,
    failed: bool,
}

/// Per-epoch engine state behind the coarse lock
#[derive(Default)]
struct EpochState {
    candidates: Vec<CeremonyCandidate>,
    non_candidates: Vec<Address>,
    flips: Vec<Vec<u8>>,
    flips_per_author: HashMap<usize, Vec<Vec<u8>>>,
    short_flips_per_candidate: Vec<Vec<usize>>,
    long_flips_per_candidate: Vec<Vec<usize>>,
    short_flips_to_solve: Option<Vec<Vec<u8>>>,
    long_flips_to_solve: Option<Vec<Vec<u8>>>,
    candidates_ready: bool,
    key_sent: bool,
    short_answers_sent: bool,
    evidence_sent: bool,
    short_session_started: bool,
    qualification: Qualification,
    word_proof: Vec<u8>,
    word_pairs: Vec<(u32, u32)>,
}

pub struct ValidationCeremony {
    app_state: Arc<RwLock<AppState>>,
    keypair: Arc<Keypair>,
    flipper: Arc<Flipper>,
    mempool: Arc<dyn TxPool>,
    keys_pool: Arc<dyn KeysPool>,
    chain: Arc<dyn BlockSource>,
    config: ValidationConfig,
    db: sled::Db,
    epoch_db: Mutex<EpochDb>,
    inner: Mutex<EpochState>,
    flip_author_map: RwLock<HashMap<Hash, Address>>,
    evidence: Mutex<EvidenceMap>,
    apply_cache: Mutex<HashMap<u64, EpochCache>>,
    stats: Mutex<Option<ValidationStats>>,
    /// Serializes transaction construction and submission
    tx_mutex: Mutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
    syncing: AtomicBool,
}

impl ValidationCeremony {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app_state: Arc<RwLock<AppState>>,
        keypair: Arc<Keypair>,
        flipper: Arc<Flipper>,
        mempool: Arc<dyn TxPool>,
        keys_pool: Arc<dyn KeysPool>,
        chain: Arc<dyn BlockSource>,
        db: sled::Db,
        config: ValidationConfig,
    ) -> Result<Arc<Self>, StoreError> {
        let epoch = app_state.read().expect("app state lock poisoned").global.epoch;
        let epoch_db = EpochDb::open(&db, epoch)?;
        Ok(Arc::new(ValidationCeremony {
            app_state,
            keypair,
            flipper,
            mempool,
            keys_pool,
            chain,
            config,
            db,
            epoch_db: Mutex::new(epoch_db),
            inner: Mutex::new(EpochState::default()),
            flip_author_map: RwLock::new(HashMap::new()),
            evidence: Mutex::new(EvidenceMap::new()),
            apply_cache: Mutex::new(HashMap::new()),
            stats: Mutex::new(None),
            tx_mutex: Mutex::new(()),
            timer: Mutex::new(None),
            syncing: AtomicBool::new(false),
        }))
    }

    pub fn initialize(self: &Arc<Self>, current_block: &Block) {
        self.restore_state();
        self.add_block(current_block);
    }

    /// Drain node events; blocks are handled in arrival order
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<CeremonyEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                CeremonyEvent::BlockAdded(block) => self.add_block(&block),
                CeremonyEvent::FastSyncCompleted => {
                    self.complete_epoch();
                    self.restore_state();
                }
            }
        }
    }

    pub fn address(&self) -> Address {
        self.keypair.address()
    }

    pub fn epoch(&self) -> u16 {
        self.epoch_db.lock().expect("epoch db lock poisoned").epoch()
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.syncing.store(syncing, Ordering::Relaxed);
    }

    pub fn add_block(self: &Arc<Self>, block: &Block) {
        self.update_period(block);
        self.handle_block(block);
        {
            let inner = self.inner.lock().expect("ceremony lock poisoned");
            let epoch_db = self.epoch_db.lock().expect("epoch db lock poisoned");
            inner.qualification.persist(&epoch_db);
        }

        if block.flags().has(BlockFlag::ValidationFinished) {
            let height = block.height();
            {
                let mut state = self.app_state.write().expect("app state lock poisoned");
                let (identities, _, failed) = self.apply_new_epoch(height, &mut state);
                info!(height, identities, failed, "validation finished");
                state.global.epoch += 1;
                state.global.validation_period = ValidationPeriod::None;
                state.global.epoch_block = height;
                state.global.next_validation_time +=
                    self.config.validation_interval.as_secs();
            }
            self.complete_epoch();
            self.start_short_session_timer();
            self.generate_word_pairs();
        }
    }

    fn update_period(&self, block: &Block) {
        let flags = block.flags();
        let mut state = self.app_state.write().expect("app state lock poisoned");
        if flags.has(BlockFlag::FlipLotteryStarted) {
            state.global.validation_period = ValidationPeriod::FlipLottery;
        }
        if flags.has(BlockFlag::ShortSessionStarted) {
            state.global.validation_period = ValidationPeriod::ShortSession;
        }
        if flags.has(BlockFlag::LongSessionStarted) {
            state.global.validation_period = ValidationPeriod::LongSession;
        }
    }

    fn handle_block(self: &Arc<Self>, block: &Block) {
        let period = self
            .app_state
            .read()
            .expect("app state lock poisoned")
            .global
            .validation_period;
        match period {
            ValidationPeriod::None => {}
            ValidationPeriod::FlipLottery => self.handle_flip_lottery(block),
            ValidationPeriod::ShortSession => self.handle_short_session(block),
            ValidationPeriod::LongSession => self.handle_long_session(block),
            ValidationPeriod::AfterLongSession => self.process_ceremony_txs(block),
        }
    }

    fn handle_flip_lottery(&self, block: &Block) {
        if !block.flags().has(BlockFlag::FlipLotteryStarted) {
            return;
        }
        let seed_height = if block.height() + 2 > LOTTERY_SEED_LAG {
            block.height() + 2 - LOTTERY_SEED_LAG
        } else {
            2
        };
        let Some(seed_header) = self.chain.header(seed_height) else {
            error!(seed_height, "lottery seed block is missing");
            return;
        };
        self.epoch_db
            .lock()
            .expect("epoch db lock poisoned")
            .write_lottery_seed(seed_header.seed);
        self.calculate_ceremony_candidates();
        info!("flip lottery started");
    }

    fn handle_short_session(self: &Arc<Self>, block: &Block) {
        if block.flags().has(BlockFlag::ShortSessionStarted) {
            self.start_short_session();
        }
        self.broadcast_flip_key();
        self.process_ceremony_txs(block);
    }

    fn handle_long_session(self: &Arc<Self>, block: &Block) {
        if block.flags().has(BlockFlag::LongSessionStarted) {
            info!("long session started");
        }
        self.broadcast_short_answers_tx();
        self.broadcast_flip_key();
        self.process_ceremony_txs(block);
        self.broadcast_evidence_map();
    }

    /// Arm the short session locally. A node that missed the
    /// `ShortSessionStarted` block still submits its flip key once the
    /// validation time has passed.
    pub fn start_short_session(&self) {
        // app state is read before the engine lock, everywhere
        let period = self
            .app_state
            .read()
            .expect("app state lock poisoned")
            .global
            .validation_period;
        {
            let mut inner = self.inner.lock().expect("ceremony lock poisoned");
            if inner.short_session_started || period < ValidationPeriod::FlipLottery {
                return;
            }
            inner.short_session_started = true;
        }
        if self.should_interact() {
            info!("short session started");
        }
        self.broadcast_flip_key();
    }

    fn start_short_session_timer(self: &Arc<Self>) {
        let mut guard = self.timer.lock().expect("timer lock poisoned");
        if guard.is_some() {
            return;
        }
        let validation_time = self
            .app_state
            .read()
            .expect("app state lock poisoned")
            .global
            .next_validation_time;
        if now() >= validation_time {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime, short session timer not armed");
            return;
        };
        let engine = Arc::clone(self);
        info!(validation_time, "short session timer armed");
        *guard = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if now() >= validation_time {
                    engine.start_short_session();
                    info!("short session timer triggered");
                    return;
                }
            }
        }));
    }

    fn restore_state(self: &Arc<Self>) {
        self.generate_word_pairs();
        {
            let state = self.app_state.read().expect("app state lock poisoned");
            self.evidence.lock().expect("evidence lock poisoned").set_short_session_time(
                state.global.next_validation_time,
                self.config.short_session_duration,
                self.config.evidence_grace,
            );
        }
        {
            let mut inner = self.inner.lock().expect("ceremony lock poisoned");
            let epoch_db = self.epoch_db.lock().expect("epoch db lock poisoned");
            let mut qualification = Qualification::new();
            qualification.restore(&epoch_db);
            inner.qualification = qualification;
        }
        self.calculate_ceremony_candidates();
        self.start_short_session_timer();
    }

    fn complete_epoch(&self) {
        let state_epoch = self
            .app_state
            .read()
            .expect("app state lock poisoned")
            .global
            .epoch;
        {
            let mut guard = self.epoch_db.lock().expect("epoch db lock poisoned");
            if guard.epoch() != state_epoch {
                match EpochDb::open(&self.db, state_epoch) {
                    Ok(fresh) => {
                        let old = std::mem::replace(&mut *guard, fresh);
                        self.drop_old_epoch(old);
                    }
                    Err(e) => error!(epoch = state_epoch, "cannot open epoch store: {e}"),
                }
            }
        }

        *self.inner.lock().expect("ceremony lock poisoned") = EpochState::default();
        self.flip_author_map
            .write()
            .expect("flip author map lock poisoned")
            .clear();
        self.flipper.reset();
        {
            let state = self.app_state.read().expect("app state lock poisoned");
            let mut evidence = self.evidence.lock().expect("evidence lock poisoned");
            evidence.clear();
            evidence.set_short_session_time(
                state.global.next_validation_time,
                self.config.short_session_duration,
                self.config.evidence_grace,
            );
        }
        if let Some(timer) = self.timer.lock().expect("timer lock poisoned").take() {
            timer.abort();
        }
        self.apply_cache
            .lock()
            .expect("apply cache lock poisoned")
            .clear();
        *self.stats.lock().expect("stats lock poisoned") = None;
    }

    /// Unpin the previous epoch's flips and clear its records, off the
    /// block-processing path
    fn drop_old_epoch(&self, old: EpochDb) {
        let flipper = Arc::clone(&self.flipper);
        let cleanup = move || {
            for cid in old.flip_cids() {
                flipper.unpin_flip(&cid);
            }
            old.clear();
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { cleanup() });
            }
            Err(_) => cleanup(),
        }
    }

    fn generate_word_pairs(&self) {
        let (seed, identity) = {
            let state = self.app_state.read().expect("app state lock poisoned");
            (state.global.words_seed, state.identity(self.address()))
        };
        let proof = words::generate_proof(&self.keypair, &seed);
        let pairs = words::generate_pairs(&proof, WORD_DICTIONARY_SIZE, identity.total_word_pairs());
        let mut inner = self.inner.lock().expect("ceremony lock poisoned");
        inner.word_proof = proof;
        inner.word_pairs = pairs;
    }

    pub fn flip_key_word_pairs(&self) -> Vec<(u32, u32)> {
        self.inner
            .lock()
            .expect("ceremony lock poisoned")
            .word_pairs
            .clone()
    }

    fn calculate_ceremony_candidates(&self) {
        if self
            .inner
            .lock()
            .expect("ceremony lock poisoned")
            .candidates_ready
        {
            return;
        }
        let Some(seed) = self
            .epoch_db
            .lock()
            .expect("epoch db lock poisoned")
            .read_lottery_seed()
        else {
            return;
        };

        let pool = {
            let state = self.app_state.read().expect("app state lock poisoned");
            lottery::collect_candidates_and_flips(&state)
        };

        let short_flips_per_candidate = lottery::assign_flips(
            &pool.flips_per_author,
            pool.candidates.len(),
            &pool.flips,
            SHORT_SESSION_FLIPS_COUNT,
            seed,
            false,
            &HashSet::new(),
        );
        let chosen: HashSet<usize> = short_flips_per_candidate
            .iter()
            .flatten()
            .copied()
            .collect();
        let long_flips_per_candidate = lottery::assign_flips(
            &pool.flips_per_author,
            pool.candidates.len(),
            &pool.flips,
            long_session_flips_count(pool.flips.len(), pool.candidates.len()),
            seed.reversed(),
            true,
            &chosen,
        );

        let me = self.address();
        let short_to_solve =
            lottery::flips_to_solve(me, &pool.candidates, &short_flips_per_candidate, &pool.flips);
        let long_to_solve =
            lottery::flips_to_solve(me, &pool.candidates, &long_flips_per_candidate, &pool.flips);

        info!(
            candidates = pool.candidates.len(),
            flips = pool.flips.len(),
            short = short_to_solve.len(),
            long = long_to_solve.len(),
            "ceremony candidates calculated"
        );

        {
            let db = self.epoch_db.lock().expect("epoch db lock poisoned");
            for cid in short_to_solve.iter().chain(long_to_solve.iter()) {
                db.write_flip_cid(cid);
            }
        }

        *self
            .flip_author_map
            .write()
            .expect("flip author map lock poisoned") = pool.flip_author_map;

        {
            let mut inner = self.inner.lock().expect("ceremony lock poisoned");
            if inner.candidates_ready {
                return;
            }
            inner.candidates = pool.candidates;
            inner.non_candidates = pool.non_candidates;
            inner.flips = pool.flips;
            inner.flips_per_author = pool.flips_per_author;
            inner.short_flips_per_candidate = short_flips_per_candidate;
            inner.long_flips_per_candidate = long_flips_per_candidate;
            inner.short_flips_to_solve = Some(short_to_solve.clone());
            inner.long_flips_to_solve = Some(long_to_solve.clone());
            inner.candidates_ready = true;
        }

        if self.should_interact() {
            self.flipper.load(short_to_solve);
            self.flipper.load(long_to_solve);
        }
    }

    /// A node far behind the head keeps replaying old ceremonies during
    /// sync; those must not produce broadcasts
    fn should_interact(&self) -> bool {
        if !self.syncing.load(Ordering::Relaxed) {
            return true;
        }
        let head_time = self.chain.head().time;
        now().saturating_sub(head_time) < self.config.ceremony_duration().as_secs()
    }

    fn is_candidate(&self) -> bool {
        self.app_state
            .read()
            .expect("app state lock poisoned")
            .identity(self.address())
            .state
            .is_in_ceremony()
    }

    fn broadcast_flip_key(&self) {
        if !self.should_interact() {
            return;
        }
        let has_flips = !self
            .app_state
            .read()
            .expect("app state lock poisoned")
            .identity(self.address())
            .flips
            .is_empty();
        if !has_flips {
            return;
        }
        {
            let mut inner = self.inner.lock().expect("ceremony lock poisoned");
            if inner.key_sent {
                return;
            }
            inner.key_sent = true;
        }

        let epoch = self.epoch();
        let mut key = FlipKey {
            key: self.flipper.flip_encryption_key().to_vec(),
            epoch,
            sender: self.address(),
            signature: Vec::new(),
        };
        key.signature = self.keypair.sign(&flip_key_signing_bytes(&key));
        self.keys_pool.add(key);
        self.evidence
            .lock()
            .expect("evidence lock poisoned")
            .new_flip_key(self.address());
        info!(epoch, "flip key broadcast");
    }

    /// Inbound flip key from the key pool
    pub fn add_flip_key(&self, key: FlipKey) {
        if key.epoch != self.epoch() {
            return;
        }
        let pub_key = self
            .app_state
            .read()
            .expect("app state lock poisoned")
            .identity(key.sender)
            .pub_key;
        if pub_key.is_empty()
            || crypto::verify(&pub_key, &flip_key_signing_bytes(&key), &key.signature).is_err()
        {
            warn!(sender = %key.sender, "flip key signature rejected");
            return;
        }
        self.evidence
            .lock()
            .expect("evidence lock poisoned")
            .new_flip_key(key.sender);
        self.keys_pool.add(key);
    }

    fn process_ceremony_txs(&self, block: &Block) {
        for tx in &block.transactions {
            let sender = tx.sender;
            match tx.kind {
                TxKind::SubmitAnswersHash => {
                    let epoch_db = self.epoch_db.lock().expect("epoch db lock poisoned");
                    if !epoch_db.has_answer_hash(sender) {
                        epoch_db.write_answer_hash(sender, Hash::from_slice(&tx.payload), now());
                        drop(epoch_db);
                        self.evidence
                            .lock()
                            .expect("evidence lock poisoned")
                            .new_answer_hash(sender);
                    }
                }
                TxKind::SubmitShortAnswers => {
                    self.inner
                        .lock()
                        .expect("ceremony lock poisoned")
                        .qualification
                        .add_answers(true, sender, &tx.payload);
                }
                TxKind::SubmitLongAnswers => {
                    self.inner
                        .lock()
                        .expect("ceremony lock poisoned")
                        .qualification
                        .add_answers(false, sender, &tx.payload);
                }
                TxKind::Evidence => {
                    let epoch_db = self.epoch_db.lock().expect("epoch db lock poisoned");
                    if !epoch_db.has_evidence_map(sender) {
                        epoch_db.write_evidence_map(sender, &tx.payload);
                    }
                }
                TxKind::SubmitFlip => {}
            }
        }
    }

    fn broadcast_short_answers_tx(&self) {
        {
            let inner = self.inner.lock().expect("ceremony lock poisoned");
            if inner.short_answers_sent {
                return;
            }
        }
        if !self.should_interact() || !self.is_candidate() {
            return;
        }
        let Some(answers) = self
            .epoch_db
            .lock()
            .expect("epoch db lock poisoned")
            .read_own_short_answers()
        else {
            error!("short session answers are missing");
            return;
        };

        let attachment = ShortAnswerAttachment {
            answers,
            proof: self
                .inner
                .lock()
                .expect("ceremony lock poisoned")
                .word_proof
                .clone(),
            key: self.flipper.flip_encryption_key().to_vec(),
            salt: short_answers_salt(self.epoch(), &self.keypair).0,
        };
        let Ok(payload) = attachment.to_bytes() else {
            error!("cannot encode short answer attachment");
            return;
        };
        if self.send_tx(TxKind::SubmitShortAnswers, payload).is_ok() {
            self.inner
                .lock()
                .expect("ceremony lock poisoned")
                .short_answers_sent = true;
        }
    }

    fn broadcast_evidence_map(&self) {
        {
            let inner = self.inner.lock().expect("ceremony lock poisoned");
            if inner.evidence_sent || !inner.short_answers_sent {
                return;
            }
        }
        if !self.should_interact() || !self.is_candidate() {
            return;
        }
        let (start, end) = {
            let evidence = self.evidence.lock().expect("evidence lock poisoned");
            if !evidence.is_completed(now()) {
                return;
            }
            (
                evidence.short_session_beginning(),
                evidence.short_session_end(),
            )
        };

        let additional = self
            .epoch_db
            .lock()
            .expect("epoch db lock poisoned")
            .confirmed_respondents(start, end);
        let candidates: Vec<Address> = self
            .inner
            .lock()
            .expect("ceremony lock poisoned")
            .candidates
            .iter()
            .map(|c| c.address)
            .collect();

        let bitmap = {
            let state = self.app_state.read().expect("app state lock poisoned");
            self.evidence
                .lock()
                .expect("evidence lock poisoned")
                .calculate_bitmap(&candidates, &additional, |a| state.required_flips(a))
        };

        if self.send_tx(TxKind::Evidence, bitmap.to_bytes()).is_ok() {
            self.inner
                .lock()
                .expect("ceremony lock poisoned")
                .evidence_sent = true;
        }
    }

    /// Build, persist and submit one ceremony transaction. Reading back
    /// the stored transaction makes resubmission after a restart produce
    /// the identical bytes; a rejected transaction with no admission
    /// record clears the stored copy so the next block retries.
    pub fn send_tx(&self, kind: TxKind, payload: Vec<u8>) -> Result<Hash, CeremonyError> {
        let _serialized = self.tx_mutex.lock().expect("tx lock poisoned");
        let epoch_db = self.epoch_db.lock().expect("epoch db lock poisoned");

        let tx = match epoch_db
            .read_own_tx(kind)
            .and_then(|bytes| postcard::from_bytes::<Transaction>(&bytes).ok())
        {
            Some(stored) => stored,
            None => {
                let mut tx = Transaction {
                    kind,
                    sender: self.address(),
                    epoch: epoch_db.epoch(),
                    payload,
                    signature: Vec::new(),
                };
                tx.signature = self.keypair.sign(&tx.signing_bytes());
                match postcard::to_allocvec(&tx) {
                    Ok(bytes) => epoch_db.write_own_tx(kind, &bytes),
                    Err(e) => error!(kind = kind.name(), "cannot encode own tx: {e}"),
                }
                tx
            }
        };

        let hash = tx.hash();
        match self.mempool.add(tx) {
            Ok(()) => epoch_db.write_successful_own_tx(hash),
            Err(e) => {
                if !epoch_db.has_successful_own_tx(hash) {
                    warn!(kind = kind.name(), "ceremony tx rejected: {e}");
                    epoch_db.remove_own_tx(kind);
                    return Err(CeremonyError::Mempool(e));
                }
            }
        }
        info!(kind = kind.name(), %hash, "ceremony tx broadcast");
        Ok(hash)
    }

    pub fn submit_short_answers(&self, answers: &Answers) -> Result<Hash, CeremonyError> {
        let hash = {
            let epoch_db = self.epoch_db.lock().expect("epoch db lock poisoned");
            let salt = short_answers_salt(epoch_db.epoch(), &self.keypair);
            let bits = match epoch_db.read_own_short_answers() {
                None => {
                    epoch_db.write_own_short_answers(answers);
                    answers.to_bytes()
                }
                Some(previous) => {
                    warn!("repeated short answers submission");
                    previous
                }
            };
            crypto::sha3_concat(&bits, salt.as_bytes())
        };
        self.send_tx(TxKind::SubmitAnswersHash, hash.as_bytes().to_vec())
    }

    pub fn submit_long_answers(&self, answers: &Answers) -> Result<Hash, CeremonyError> {
        self.send_tx(TxKind::SubmitLongAnswers, answers.to_bytes())
    }

    pub fn short_flips_to_solve(&self) -> Option<Vec<Vec<u8>>> {
        self.inner
            .lock()
            .expect("ceremony lock poisoned")
            .short_flips_to_solve
            .clone()
    }

    pub fn long_flips_to_solve(&self) -> Option<Vec<Vec<u8>>> {
        self.inner
            .lock()
            .expect("ceremony lock poisoned")
            .long_flips_to_solve
            .clone()
    }

    pub fn short_session_started(&self) -> bool {
        self.inner
            .lock()
            .expect("ceremony lock poisoned")
            .short_session_started
    }

    pub fn short_session_begin_time(&self) -> u64 {
        self.evidence
            .lock()
            .expect("evidence lock poisoned")
            .short_session_beginning()
    }

    pub fn validation_stats(&self) -> Option<ValidationStats> {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Words for a flip, resolved through the author's revealed proof
    pub fn get_flip_words(&self, cid: &[u8]) -> Result<(u32, u32), CeremonyError> {
        let author = self
            .flip_author_map
            .read()
            .expect("flip author map lock poisoned")
            .get(&crypto::sha3(cid))
            .copied()
            .ok_or(CeremonyError::AuthorNotFound)?;

        let (identity, words_seed) = {
            let state = self.app_state.read().expect("app state lock poisoned");
            (state.identity(author), state.global.words_seed)
        };
        let pair_id = identity
            .flips
            .iter()
            .find(|f| f.cid == cid)
            .map(|f| f.pair as usize)
            .unwrap_or(0);

        let inner = self.inner.lock().expect("ceremony lock poisoned");
        let proof = inner
            .qualification
            .proof(author)
            .ok_or(CeremonyError::ProofNotReady)?;
        Ok(words::get_words(
            proof,
            &identity.pub_key,
            &words_seed,
            WORD_DICTIONARY_SIZE,
            identity.total_word_pairs(),
            pair_id,
        )?)
    }

    /// The deterministic epoch transition. Memoized by height; the failed
    /// path mutates nothing and reports the unchanged network size.
    pub fn apply_new_epoch(
        &self,
        height: u64,
        state: &mut AppState,
    ) -> (usize, ValidationAuthors, bool) {
        let mut cache_guard = self.apply_cache.lock().expect("apply cache lock poisoned");
        if let Some(cached) = cache_guard.get(&height) {
            if cached.failed {
                return (state.network_size(), cached.authors.clone(), true);
            }
            let mut identities_count = 0;
            for (addr, value) in &cached.values {
                apply_on_state(state, *addr, value, &mut identities_count);
            }
            return (identities_count, cached.authors.clone(), false);
        }

        let inner = self.inner.lock().expect("ceremony lock poisoned");
        let epoch_db = self.epoch_db.lock().expect("epoch db lock poisoned");
        let epoch = epoch_db.epoch();

        let candidate_addrs: Vec<Address> = inner.candidates.iter().map(|c| c.address).collect();
        let approved: HashSet<Address> = EvidenceMap::calculate_approved_candidates(
            &candidate_addrs,
            &epoch_db.read_evidence_maps(),
        )
        .into_iter()
        .collect();
        info!(approved = approved.len(), "approved candidates");

        let total_flips = inner.flips.len();
        let author_map = self
            .flip_author_map
            .read()
            .expect("flip author map lock poisoned");
        let words_seed = state.global.words_seed;
        let wrong_words = |i: usize| -> bool {
            let Some(author) = author_map.get(&crypto::sha3(&inner.flips[i])) else {
                return false;
            };
            let Some(proof) = inner.qualification.proof(*author) else {
                return false;
            };
            let pub_key = state.identity(*author).pub_key;
            !pub_key.is_empty() && !words::check_proof(proof, &pub_key, &words_seed)
        };
        let flip_qualification = inner.qualification.qualify_flips(
            total_flips,
            &inner.candidates,
            &inner.long_flips_per_candidate,
            wrong_words,
        );

        let mut authors = ValidationAuthors::default();
        let (bad, good) = analyze_authors(&flip_qualification, &inner.flips, &author_map);
        authors.bad_authors = bad;
        authors.good_authors = good;

        let not_approved = collect_not_approved_flips(
            &approved,
            &inner.candidates,
            &inner.flips_per_author,
            &inner.flips,
            |addr| state.required_flips(addr),
        );

        let god = state.global.god_address;
        let mut stats = ValidationStats {
            flip_cids: inner.flips.clone(),
            ..ValidationStats::default()
        };
        for (i, q) in flip_qualification.iter().enumerate() {
            stats.flips.insert(
                i,
                FlipStats {
                    status: q.status,
                    answer: q.answer,
                    ..FlipStats::default()
                },
            );
        }

        let mut values: BTreeMap<Address, CacheValue> = BTreeMap::new();
        let mut intermediate_count = 0usize;
        for (idx, candidate) in inner.candidates.iter().enumerate() {
            let addr = candidate.address;
            let short = inner.qualification.qualify_candidate(
                addr,
                &flip_qualification,
                &inner.short_flips_per_candidate[idx],
                true,
                &not_approved,
            );
            add_flip_answers_to_stats(&short.flip_answers, true, &mut stats);
            let long = inner.qualification.qualify_candidate(
                addr,
                &flip_qualification,
                &inner.long_flips_per_candidate[idx],
                false,
                &not_approved,
            );
            add_flip_answers_to_stats(&long.flip_answers, false, &mut stats);

            let total_points = state.short_flip_points(addr);
            let total_qualified = state.qualified_flips(addr);
            let is_approved = approved.contains(&addr);
            let mut missed = !is_approved;
            let full_qual = !short.no_answers && !long.no_answers;

            let mut short_score = 0.0f32;
            if short.qualified_count > 0 {
                short_score = short.point / short.qualified_count as f32;
            } else if full_qual {
                missed = true;
            }
            let mut long_score = 0.0f32;
            if long.qualified_count > 0 {
                long_score = long.point / long.qualified_count as f32;
            } else if full_qual {
                missed = true;
            }
            let new_total_qualified = short.qualified_count + total_qualified;
            let mut total_score = 0.0f32;
            if new_total_qualified > 0 {
                total_score = (short.point + total_points) / new_total_qualified as f32;
            }

            let identity = state.identity(addr);
            let new_state = determine_new_identity_state(
                &identity,
                short_score,
                long_score,
                total_score,
                new_total_qualified,
                missed,
                short.no_answers,
                long.no_answers,
            );
            let birthday = determine_identity_birthday(epoch, &identity, new_state);
            inc_successful_invites(&mut authors, god, &identity, new_state);

            values.insert(
                addr,
                CacheValue {
                    state: new_state,
                    short_qualified: short.qualified_count,
                    short_points: short.point,
                    birthday,
                },
            );
            stats.identities.insert(
                addr,
                IdentityStats {
                    short_point: short.point,
                    short_flips: short.qualified_count,
                    long_point: long.point,
                    long_flips: long.qualified_count,
                    approved: is_approved,
                    missed,
                },
            );
            if matches!(new_state, IdentityState::Verified | IdentityState::Newbie) {
                intermediate_count += 1;
            }
        }

        if intermediate_count == 0 {
            warn!("validation failed, nobody is validated, identities remain unchanged");
            stats.failed = true;
            *self.stats.lock().expect("stats lock poisoned") = Some(stats);
            cache_guard.insert(
                height,
                EpochCache {
                    values,
                    authors: authors.clone(),
                    failed: true,
                },
            );
            return (state.network_size(), authors, true);
        }

        let mut identities_count = 0usize;
        for (addr, value) in &values {
            apply_on_state(state, *addr, value, &mut identities_count);
        }

        for addr in &inner.non_candidates {
            let identity = state.identity(*addr);
            let new_state =
                determine_new_identity_state(&identity, 0.0, 0.0, 0.0, 0, true, false, false);
            let birthday = determine_identity_birthday(epoch, &identity, new_state);
            let value = CacheValue {
                state: new_state,
                short_qualified: 0,
                short_points: 0.0,
                birthday,
            };
            apply_on_state(state, *addr, &value, &mut identities_count);
            values.insert(*addr, value);
        }

        *self.stats.lock().expect("stats lock poisoned") = Some(stats);
        cache_guard.insert(
            height,
            EpochCache {
                values,
                authors: authors.clone(),
                failed: false,
            },
        );
        (identities_count, authors, false)
    }
}

fn apply_on_state(
    state: &mut AppState,
    addr: Address,
    value: &CacheValue,
    identities_count: &mut usize,
) {
    state.set_state(addr, value.state);
    state.add_qualified_flips(addr, value.short_qualified);
    state.add_short_flip_points(addr, value.short_points);
    state.set_birthday(addr, value.birthday);
    if matches!(value.state, IdentityState::Verified | IdentityState::Newbie) {
        *identities_count += 1;
    }
}

/// Flip authors classified from the qualification vector: an author is
/// bad on any wrong-words, inappropriate or nobody-qualified flip, or
/// when every flip failed to qualify
pub fn analyze_authors(
    qualifications: &[FlipQualification],
    flips: &[Vec<u8>],
    author_map: &HashMap<Hash, Address>,
) -> (HashSet<Address>, HashMap<Address, ValidationResult>) {
    let mut bad_authors = HashSet::new();
    let mut good_authors: HashMap<Address, ValidationResult> = HashMap::new();
    let mut made_flips: HashMap<Address, usize> = HashMap::new();
    let mut non_qualified_flips: HashMap<Address, usize> = HashMap::new();

    for (i, item) in qualifications.iter().enumerate() {
        let Some(author) = flips.get(i).and_then(|cid| author_map.get(&crypto::sha3(cid))) else {
            continue;
        };
        if item.wrong_words
            || item.status == FlipStatus::QualifiedByNone
            || item.answer == Answer::Inappropriate
        {
            bad_authors.insert(*author);
        }
        if item.status == FlipStatus::NotQualified {
            *non_qualified_flips.entry(*author).or_insert(0) += 1;
        }
        *made_flips.entry(*author).or_insert(0) += 1;

        if matches!(
            item.status,
            FlipStatus::Qualified | FlipStatus::WeaklyQualified
        ) {
            let result = good_authors.entry(*author).or_default();
            if item.status == FlipStatus::Qualified {
                result.strong_flips += 1;
            } else {
                result.weak_flips += 1;
            }
        }
    }

    for (author, non_qualified) in &non_qualified_flips {
        if made_flips.get(author) == Some(non_qualified) {
            bad_authors.insert(*author);
        }
    }
    for author in &bad_authors {
        good_authors.remove(author);
    }
    (bad_authors, good_authors)
}

/// Flip indices whose authors were not approved by the evidence
/// committee while still owing flips
pub fn collect_not_approved_flips(
    approved: &HashSet<Address>,
    candidates: &[CeremonyCandidate],
    flips_per_author: &HashMap<usize, Vec<Vec<u8>>>,
    flips: &[Vec<u8>],
    required_flips: impl Fn(Address) -> u8,
) -> HashSet<usize> {
    let mut result = HashSet::new();
    for (i, candidate) in candidates.iter().enumerate() {
        if approved.contains(&candidate.address) || required_flips(candidate.address) == 0 {
            continue;
        }
        if let Some(cids) = flips_per_author.get(&i) {
            for cid in cids {
                if let Some(idx) = flip_pos(flips, cid) {
                    result.insert(idx);
                }
            }
        }
    }
    result
}

fn flip_pos(flips: &[Vec<u8>], cid: &[u8]) -> Option<usize> {
    flips.iter().position(|f| f == cid)
}

fn add_flip_answers_to_stats(
    answers: &HashMap<usize, FlipAnswerStats>,
    is_short: bool,
    stats: &mut ValidationStats,
) {
    for (flip_idx, answer) in answers {
        let flip_stats = stats.flips.entry(*flip_idx).or_default();
        if is_short {
            flip_stats.short_answers.push(*answer);
        } else {
            flip_stats.long_answers.push(*answer);
        }
    }
}

/// Credit the inviter of every fresh Newbie; the god address earns
/// credit even without flips of its own
pub fn inc_successful_invites(
    authors: &mut ValidationAuthors,
    god: Address,
    invitee: &Identity,
    new_state: IdentityState,
) {
    if invitee.state != IdentityState::Candidate || new_state != IdentityState::Newbie {
        return;
    }
    let Some(inviter) = &invitee.inviter else {
        return;
    };
    if let Some(result) = authors.good_authors.get_mut(&inviter.address) {
        result.successful_invites += 1;
    } else if inviter.address == god {
        authors.good_authors.insert(
            god,
            ValidationResult {
                successful_invites: 1,
                ..ValidationResult::default()
            },
        );
    }
}

pub fn determine_identity_birthday(
    current_epoch: u16,
    identity: &Identity,
    new_state: IdentityState,
) -> u16 {
    match identity.state {
        IdentityState::Candidate => {
            if new_state == IdentityState::Newbie {
                current_epoch
            } else {
                0
            }
        }
        IdentityState::Newbie
        | IdentityState::Verified
        | IdentityState::Suspended
        | IdentityState::Zombie => identity.birthday,
        _ => 0,
    }
}

/// The identity transition table. `&&` binds tighter than `||`, exactly
/// as in the score predicates below.
#[allow(clippy::too_many_arguments)]
pub fn determine_new_identity_state(
    identity: &Identity,
    short_score: f32,
    long_score: f32,
    total_score: f32,
    total_qualified_flips: u32,
    missed: bool,
    no_qual_short: bool,
    no_qual_long: bool,
) -> IdentityState {
    if !identity.has_done_all_required_flips() {
        return match identity.state {
            IdentityState::Verified => IdentityState::Suspended,
            _ => IdentityState::Killed,
        };
    }

    let q = total_qualified_flips;
    match identity.state {
        IdentityState::Undefined => IdentityState::Undefined,
        IdentityState::Invite => IdentityState::Killed,
        IdentityState::Candidate => {
            if no_qual_short || no_qual_long && short_score >= MIN_SHORT_SCORE {
                IdentityState::Candidate
            } else if missed || short_score < MIN_SHORT_SCORE || long_score < MIN_LONG_SCORE {
                IdentityState::Killed
            } else {
                IdentityState::Newbie
            }
        }
        IdentityState::Newbie => {
            if no_qual_short
                || no_qual_long
                    && q > TOTAL_QUALIFIED_FLIPS_THRESHOLD
                    && total_score >= MIN_TOTAL_SCORE
                    && short_score >= MIN_SHORT_SCORE
                || no_qual_long
                    && q <= TOTAL_QUALIFIED_FLIPS_THRESHOLD
                    && short_score >= MIN_SHORT_SCORE
            {
                IdentityState::Newbie
            } else if missed {
                IdentityState::Killed
            } else if q > TOTAL_QUALIFIED_FLIPS_THRESHOLD
                && total_score >= MIN_TOTAL_SCORE
                && short_score >= MIN_SHORT_SCORE
                && long_score >= MIN_LONG_SCORE
            {
                IdentityState::Verified
            } else if q <= TOTAL_QUALIFIED_FLIPS_THRESHOLD
                && short_score >= MIN_SHORT_SCORE
                && long_score >= MIN_LONG_SCORE
            {
                IdentityState::Newbie
            } else {
                IdentityState::Killed
            }
        }
        IdentityState::Verified => {
            if no_qual_short
                || no_qual_long && total_score >= MIN_TOTAL_SCORE && short_score >= MIN_SHORT_SCORE
            {
                IdentityState::Verified
            } else if missed {
                IdentityState::Suspended
            } else if q > TOTAL_QUALIFIED_FLIPS_THRESHOLD
                && total_score >= MIN_TOTAL_SCORE
                && short_score >= MIN_SHORT_SCORE
                && long_score >= MIN_LONG_SCORE
            {
                IdentityState::Verified
            } else {
                IdentityState::Killed
            }
        }
        IdentityState::Suspended => {
            if no_qual_short
                || no_qual_long && total_score >= MIN_TOTAL_SCORE && short_score >= MIN_SHORT_SCORE
            {
                IdentityState::Suspended
            } else if missed {
                IdentityState::Zombie
            } else if total_score >= MIN_TOTAL_SCORE
                && short_score >= MIN_SHORT_SCORE
                && long_score >= MIN_LONG_SCORE
            {
                IdentityState::Verified
            } else {
                IdentityState::Killed
            }
        }
        IdentityState::Zombie => {
            if no_qual_short
                || no_qual_long && total_score >= MIN_TOTAL_SCORE && short_score >= MIN_SHORT_SCORE
            {
                IdentityState::Zombie
            } else if missed {
                IdentityState::Killed
            } else if total_score >= MIN_TOTAL_SCORE && short_score >= MIN_SHORT_SCORE {
                IdentityState::Verified
            } else {
                IdentityState::Killed
            }
        }
        IdentityState::Killed => IdentityState::Killed,
    }
}

pub fn long_session_flips_count(flips: usize, candidates: usize) -> usize {
    if candidates == 0 {
        return 1;
    }
    (flips * crate::config::LONG_SESSION_TESTERS / candidates).max(1)
}

/// `salt = sha3(sign(sha3("short-answers-salt-<epoch>")))`
pub fn short_answers_salt(epoch: u16, keypair: &Keypair) -> Hash {
    let seed = crypto::sha3(format!("short-answers-salt-{epoch}").as_bytes());
    crypto::sha3(&keypair.sign(seed.as_bytes()))
}

fn flip_key_signing_bytes(key: &FlipKey) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.key.len() + 2);
    buf.extend_from_slice(&key.key);
    buf.extend_from_slice(&key.epoch.to_le_bytes());
    buf
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
