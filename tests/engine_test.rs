//! Engine integration: phase machine, broadcast idempotence and the
//! deterministic epoch transition

use personhood::ceremony::{BlockSource, ValidationCeremony};
use personhood::types::*;
use personhood::words;
use personhood::{
    AppState, BufferKeysPool, BufferTxPool, Flipper, GlobalState, InMemoryFlipStore, Keypair,
    ValidationConfig, SHORT_SESSION_FLIPS_COUNT,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const LOTTERY_SEED: Hash = Hash([42u8; 32]);
const EPOCH: u16 = 5;
const AUTHOR_COUNT: usize = 6;
const LONG_COUNT: usize = 15; // 12 flips * 10 testers / 8 candidates

struct StaticChain {
    headers: HashMap<u64, Header>,
}

impl StaticChain {
    fn new() -> Self {
        let mut headers = HashMap::new();
        headers.insert(
            2,
            Header {
                height: 2,
                time: 0,
                flags: BlockFlags::default(),
                seed: LOTTERY_SEED,
            },
        );
        StaticChain { headers }
    }
}

impl BlockSource for StaticChain {
    fn header(&self, height: u64) -> Option<Header> {
        self.headers.get(&height).cloned()
    }

    fn head(&self) -> Header {
        Header::default()
    }
}

struct Fixture {
    ceremony: Arc<ValidationCeremony>,
    app_state: Arc<RwLock<AppState>>,
    mempool: Arc<BufferTxPool>,
    keys_pool: Arc<BufferKeysPool>,
    author_keys: Vec<Keypair>,
    invitee_keys: Vec<Keypair>,
    god: Address,
}

fn fixture(node_seed: [u8; 32]) -> Fixture {
    let author_keys: Vec<Keypair> = (1..=AUTHOR_COUNT as u8)
        .map(|i| Keypair::from_seed([i; 32]))
        .collect();
    let invitee_keys = vec![Keypair::from_seed([30; 32]), Keypair::from_seed([31; 32])];
    let god = Address::from_slice(&[0xEE]);

    let mut state = AppState::new(GlobalState {
        epoch: EPOCH,
        god_address: god,
        validation_period: ValidationPeriod::None,
        next_validation_time: u64::MAX / 2,
        words_seed: Hash([8u8; 32]),
        epoch_block: 90,
    });

    for (i, keypair) in author_keys.iter().enumerate() {
        state.set_identity(
            keypair.address(),
            Identity {
                state: IdentityState::Newbie,
                birthday: 1,
                required_flips: 2,
                flips: vec![
                    IdentityFlip {
                        cid: vec![i as u8, 1],
                        pair: 0,
                    },
                    IdentityFlip {
                        cid: vec![i as u8, 2],
                        pair: 1,
                    },
                ],
                generation: 1,
                code: vec![i as u8; 12],
                short_flip_points: 15.0,
                qualified_flips: 20,
                inviter: None,
                invites: 0,
                pub_key: keypair.public_key(),
            },
        );
    }
    for (j, keypair) in invitee_keys.iter().enumerate() {
        let inviter = if j == 0 { author_keys[0].address() } else { god };
        state.set_identity(
            keypair.address(),
            Identity {
                state: IdentityState::Candidate,
                pub_key: keypair.public_key(),
                inviter: Some(TxAddr {
                    address: inviter,
                    tx_hash: Hash::default(),
                }),
                ..Identity::default()
            },
        );
    }

    let app_state = Arc::new(RwLock::new(state));
    let mempool = Arc::new(BufferTxPool::new());
    let keys_pool = Arc::new(BufferKeysPool::new());
    let flipper = Arc::new(Flipper::new(Arc::new(InMemoryFlipStore::new())));
    let db = sled::Config::new().temporary(true).open().unwrap();
    let ceremony = ValidationCeremony::new(
        app_state.clone(),
        Arc::new(Keypair::from_seed(node_seed)),
        flipper,
        mempool.clone(),
        keys_pool.clone(),
        Arc::new(StaticChain::new()),
        db,
        ValidationConfig::default(),
    )
    .unwrap();

    Fixture {
        ceremony,
        app_state,
        mempool,
        keys_pool,
        author_keys,
        invitee_keys,
        god,
    }
}

fn block(height: u64, flag: Option<BlockFlag>, transactions: Vec<Transaction>) -> Block {
    let flags = flag.map(BlockFlags::with).unwrap_or_default();
    Block {
        header: Header {
            height,
            time: 0,
            flags,
            seed: Hash::default(),
        },
        transactions,
    }
}

fn tx(kind: TxKind, sender: Address, payload: Vec<u8>) -> Transaction {
    Transaction {
        kind,
        sender,
        epoch: EPOCH,
        payload,
        signature: Vec::new(),
    }
}

fn all_left(flips: usize) -> Answers {
    let mut answers = Answers::new(flips);
    for i in 0..flips {
        answers.left(i);
    }
    answers
}

fn candidate_keys(fixture: &Fixture) -> Vec<&Keypair> {
    fixture
        .author_keys
        .iter()
        .chain(fixture.invitee_keys.iter())
        .collect()
}

fn answer_txs(fixture: &Fixture) -> Vec<Transaction> {
    let words_seed = Hash([8u8; 32]);
    let mut txs = Vec::new();
    for keypair in candidate_keys(fixture) {
        let attachment = ShortAnswerAttachment {
            answers: all_left(SHORT_SESSION_FLIPS_COUNT).to_bytes(),
            proof: words::generate_proof(keypair, &words_seed),
            key: vec![0u8; 32],
            salt: [0u8; 32],
        };
        txs.push(tx(
            TxKind::SubmitShortAnswers,
            keypair.address(),
            attachment.to_bytes().unwrap(),
        ));
        txs.push(tx(
            TxKind::SubmitLongAnswers,
            keypair.address(),
            all_left(LONG_COUNT).to_bytes(),
        ));
    }
    txs
}

fn evidence_txs(fixture: &Fixture) -> Vec<Transaction> {
    let candidates = candidate_keys(fixture);
    let mut bitmap = personhood::CandidateBitmap::new();
    for i in 0..candidates.len() {
        bitmap.set(i);
    }
    candidates
        .iter()
        .map(|keypair| tx(TxKind::Evidence, keypair.address(), bitmap.to_bytes()))
        .collect()
}

fn ceremony_txs(fixture: &Fixture) -> Vec<Transaction> {
    let mut txs = answer_txs(fixture);
    txs.extend(evidence_txs(fixture));
    txs
}

fn run_sessions(fixture: &Fixture) {
    fixture
        .ceremony
        .add_block(&block(100, Some(BlockFlag::FlipLotteryStarted), vec![]));
    fixture
        .ceremony
        .add_block(&block(101, Some(BlockFlag::ShortSessionStarted), vec![]));
    fixture.ceremony.add_block(&block(
        102,
        Some(BlockFlag::LongSessionStarted),
        ceremony_txs(fixture),
    ));
}

fn identity_snapshot(state: &AppState) -> Vec<(Address, Identity)> {
    let mut result = Vec::new();
    state.iterate_identities(|addr, identity| result.push((addr, identity.clone())));
    result
}

#[test]
fn phases_advance_on_flags_only() {
    let fixture = fixture([99; 32]);
    let period = |f: &Fixture| f.app_state.read().unwrap().global.validation_period;

    assert_eq!(period(&fixture), ValidationPeriod::None);
    fixture.ceremony.add_block(&block(99, None, vec![]));
    assert_eq!(period(&fixture), ValidationPeriod::None);

    fixture
        .ceremony
        .add_block(&block(100, Some(BlockFlag::FlipLotteryStarted), vec![]));
    assert_eq!(period(&fixture), ValidationPeriod::FlipLottery);

    fixture
        .ceremony
        .add_block(&block(101, Some(BlockFlag::ShortSessionStarted), vec![]));
    assert_eq!(period(&fixture), ValidationPeriod::ShortSession);

    fixture.ceremony.add_block(&block(101, None, vec![]));
    assert_eq!(period(&fixture), ValidationPeriod::ShortSession);

    fixture
        .ceremony
        .add_block(&block(102, Some(BlockFlag::LongSessionStarted), vec![]));
    assert_eq!(period(&fixture), ValidationPeriod::LongSession);
}

#[test]
fn lottery_assigns_fixed_session_sizes() {
    // the node is the first author, so it has flips of its own to avoid
    let fixture = fixture([1; 32]);
    fixture
        .ceremony
        .add_block(&block(100, Some(BlockFlag::FlipLotteryStarted), vec![]));

    let short = fixture.ceremony.short_flips_to_solve().unwrap();
    let long = fixture.ceremony.long_flips_to_solve().unwrap();
    assert_eq!(short.len(), SHORT_SESSION_FLIPS_COUNT);
    assert_eq!(long.len(), LONG_COUNT);

    // own flips never show up in the short session
    let own: Vec<Vec<u8>> = vec![vec![0, 1], vec![0, 2]];
    for cid in &short {
        assert!(!own.contains(cid));
    }
}

#[test]
fn full_epoch_applies_transitions() {
    let fixture = fixture([99; 32]);
    run_sessions(&fixture);
    fixture
        .ceremony
        .add_block(&block(104, Some(BlockFlag::ValidationFinished), vec![]));

    let state = fixture.app_state.read().unwrap();
    for keypair in &fixture.author_keys {
        let identity = state.identity(keypair.address());
        assert_eq!(identity.state, IdentityState::Verified);
        assert_eq!(identity.qualified_flips, 25);
        assert_eq!(identity.short_flip_points, 20.0);
        assert_eq!(identity.birthday, 1);
    }
    for keypair in &fixture.invitee_keys {
        let identity = state.identity(keypair.address());
        assert_eq!(identity.state, IdentityState::Newbie);
        assert_eq!(identity.birthday, EPOCH);
    }
    assert_eq!(state.global.epoch, EPOCH + 1);
    assert_eq!(state.global.validation_period, ValidationPeriod::None);
}

#[test]
fn apply_new_epoch_is_memoized() {
    let fixture = fixture([99; 32]);
    run_sessions(&fixture);

    let mut first_state = fixture.app_state.read().unwrap().clone();
    let (count, authors, failed) = fixture.ceremony.apply_new_epoch(104, &mut first_state);
    assert!(!failed);
    assert_eq!(count, AUTHOR_COUNT + 2);
    assert!(authors.bad_authors.is_empty());

    let first_author = fixture.author_keys[0].address();
    assert_eq!(authors.good_authors[&first_author].strong_flips, 2);
    assert_eq!(authors.good_authors[&first_author].successful_invites, 1);
    assert_eq!(authors.good_authors[&fixture.god].successful_invites, 1);

    let stats = fixture.ceremony.validation_stats().unwrap();
    assert!(!stats.failed);
    assert!(stats
        .flips
        .values()
        .all(|f| f.status == FlipStatus::Qualified && f.answer == Answer::Left));

    // the second call hits the cache and is observationally equivalent
    let mut second_state = fixture.app_state.read().unwrap().clone();
    let (count2, authors2, failed2) = fixture.ceremony.apply_new_epoch(104, &mut second_state);
    assert_eq!(count, count2);
    assert!(!failed2);
    assert_eq!(authors.good_authors, authors2.good_authors);
    assert_eq!(authors.bad_authors, authors2.bad_authors);
    assert_eq!(
        identity_snapshot(&first_state),
        identity_snapshot(&second_state)
    );
}

#[test]
fn apply_new_epoch_is_deterministic_across_nodes() {
    let first = fixture([99; 32]);
    let second = fixture([77; 32]);
    run_sessions(&first);
    run_sessions(&second);

    let mut state_a = first.app_state.read().unwrap().clone();
    let mut state_b = second.app_state.read().unwrap().clone();
    let (count_a, authors_a, failed_a) = first.ceremony.apply_new_epoch(104, &mut state_a);
    let (count_b, authors_b, failed_b) = second.ceremony.apply_new_epoch(104, &mut state_b);

    assert_eq!(count_a, count_b);
    assert_eq!(failed_a, failed_b);
    assert_eq!(authors_a.good_authors, authors_b.good_authors);
    assert_eq!(authors_a.bad_authors, authors_b.bad_authors);
    assert_eq!(identity_snapshot(&state_a), identity_snapshot(&state_b));
}

#[test]
fn failed_epoch_mutates_nothing() {
    let fixture = fixture([99; 32]);
    // everyone answers, but no evidence bitmaps arrive: nobody is
    // approved, so every candidate misses and nobody validates
    fixture
        .ceremony
        .add_block(&block(100, Some(BlockFlag::FlipLotteryStarted), vec![]));
    fixture
        .ceremony
        .add_block(&block(101, Some(BlockFlag::ShortSessionStarted), vec![]));
    fixture.ceremony.add_block(&block(
        102,
        Some(BlockFlag::LongSessionStarted),
        answer_txs(&fixture),
    ));

    let before = identity_snapshot(&fixture.app_state.read().unwrap());
    let mut state = fixture.app_state.read().unwrap().clone();
    let (network_size, _, failed) = fixture.ceremony.apply_new_epoch(104, &mut state);
    assert!(failed);
    assert_eq!(network_size, AUTHOR_COUNT); // Newbie authors before transition
    assert_eq!(identity_snapshot(&state), before);
}

#[test]
fn absent_candidates_survive_via_no_qual_guards() {
    let fixture = fixture([99; 32]);
    // nobody answers at all: every flip is qualified by none and the
    // no-qual guards keep Newbies and Candidates in place
    fixture
        .ceremony
        .add_block(&block(100, Some(BlockFlag::FlipLotteryStarted), vec![]));
    fixture
        .ceremony
        .add_block(&block(102, Some(BlockFlag::LongSessionStarted), vec![]));

    let mut state = fixture.app_state.read().unwrap().clone();
    let (count, authors, failed) = fixture.ceremony.apply_new_epoch(104, &mut state);
    assert!(!failed);
    assert_eq!(count, AUTHOR_COUNT); // Newbies stay, Candidates stay unvalidated

    // silent authors' flips are qualified by none: all of them are bad
    assert_eq!(authors.bad_authors.len(), AUTHOR_COUNT);
    assert!(authors.good_authors.is_empty());
    for keypair in &fixture.author_keys {
        assert_eq!(
            state.identity(keypair.address()).state,
            IdentityState::Newbie
        );
    }
    for keypair in &fixture.invitee_keys {
        assert_eq!(
            state.identity(keypair.address()).state,
            IdentityState::Candidate
        );
    }
}

#[test]
fn tx_submission_is_idempotent() {
    let fixture = fixture([1; 32]);
    run_sessions(&fixture);

    let first = fixture
        .ceremony
        .submit_long_answers(&all_left(LONG_COUNT))
        .unwrap();
    let second = fixture
        .ceremony
        .submit_long_answers(&all_left(LONG_COUNT))
        .unwrap();

    assert_eq!(first, second);
    let submitted: Vec<Transaction> = fixture
        .mempool
        .transactions()
        .into_iter()
        .filter(|t| t.kind == TxKind::SubmitLongAnswers)
        .collect();
    assert_eq!(submitted.len(), 1);
}

#[test]
fn repeated_short_answers_keep_first_submission() {
    let fixture = fixture([1; 32]);
    run_sessions(&fixture);

    let mut different = Answers::new(SHORT_SESSION_FLIPS_COUNT);
    different.right(0);

    let first = fixture
        .ceremony
        .submit_short_answers(&all_left(SHORT_SESSION_FLIPS_COUNT))
        .unwrap();
    let second = fixture.ceremony.submit_short_answers(&different).unwrap();

    assert_eq!(first, second);
    let submitted: Vec<Transaction> = fixture
        .mempool
        .transactions()
        .into_iter()
        .filter(|t| t.kind == TxKind::SubmitAnswersHash)
        .collect();
    assert_eq!(submitted.len(), 1);
}

#[test]
fn flip_key_is_broadcast_once() {
    let fixture = fixture([1; 32]);
    fixture
        .ceremony
        .add_block(&block(100, Some(BlockFlag::FlipLotteryStarted), vec![]));

    fixture.ceremony.start_short_session();
    fixture.ceremony.start_short_session();

    assert!(fixture.ceremony.short_session_started());
    let keys = fixture.keys_pool.keys();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].sender, fixture.author_keys[0].address());
    assert_eq!(keys[0].epoch, EPOCH);
}
