//! Ceremony data model: blocks, transactions, answers, identities

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

pub const ADDRESS_SIZE: usize = 20;
pub const HASH_SIZE: usize = 32;

/// Upper bound on answers per session, enforced at deserialization
pub const MAX_SESSION_ANSWERS: usize = 1024;

/// 20-byte account address (tail of the sha3 of the public key)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut a = [0u8; ADDRESS_SIZE];
        let n = bytes.len().min(ADDRESS_SIZE);
        a[ADDRESS_SIZE - n..].copy_from_slice(&bytes[bytes.len() - n..]);
        Address(a)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// 32-byte SHA3-256 digest
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut h = [0u8; HASH_SIZE];
        let n = bytes.len().min(HASH_SIZE);
        h[..n].copy_from_slice(&bytes[..n]);
        Hash(h)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Byte-reversed copy (the long-session lottery seed)
    pub fn reversed(&self) -> Hash {
        let mut h = self.0;
        h.reverse();
        Hash(h)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Block seed snapshot used to drive the lottery PRNG
pub type Seed = Hash;

/// Header flag bits the ceremony reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockFlag {
    FlipLotteryStarted = 1 << 0,
    ShortSessionStarted = 1 << 1,
    LongSessionStarted = 1 << 2,
    ValidationFinished = 1 << 3,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFlags(pub u32);

impl BlockFlags {
    pub fn has(&self, flag: BlockFlag) -> bool {
        self.0 & flag as u32 != 0
    }

    pub fn set(&mut self, flag: BlockFlag) {
        self.0 |= flag as u32;
    }

    pub fn with(flag: BlockFlag) -> Self {
        BlockFlags(flag as u32)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Header {
    pub height: u64,
    /// Unix timestamp (seconds)
    pub time: u64,
    pub flags: BlockFlags,
    pub seed: Seed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn flags(&self) -> BlockFlags {
        self.header.flags
    }
}

/// Ceremony transaction kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum TxKind {
    SubmitFlip = 4,
    SubmitAnswersHash = 5,
    SubmitShortAnswers = 6,
    SubmitLongAnswers = 7,
    Evidence = 8,
}

impl TxKind {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            TxKind::SubmitFlip => "submitFlip",
            TxKind::SubmitAnswersHash => "submitAnswersHash",
            TxKind::SubmitShortAnswers => "submitShortAnswers",
            TxKind::SubmitLongAnswers => "submitLongAnswers",
            TxKind::Evidence => "evidence",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TxKind,
    pub sender: Address,
    pub epoch: u16,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Bytes covered by the sender's signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + ADDRESS_SIZE + 2 + self.payload.len());
        buf.extend_from_slice(&self.kind.code().to_le_bytes());
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn hash(&self) -> Hash {
        crate::crypto::sha3(&self.signing_bytes())
    }
}

/// Signed flip decryption key broadcast through the key pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlipKey {
    pub key: Vec<u8>,
    pub epoch: u16,
    pub sender: Address,
    pub signature: Vec<u8>,
}

/// A candidate's verdict on one flip
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Answer {
    #[default]
    None = 0,
    Left = 1,
    Right = 2,
    Inappropriate = 3,
}

impl Answer {
    fn from_bits(bits: u8) -> Answer {
        match bits & 0b11 {
            1 => Answer::Left,
            2 => Answer::Right,
            3 => Answer::Inappropriate,
            _ => Answer::None,
        }
    }
}

/// Session answers: 2 answer bits and 1 easy bit per assigned flip.
///
/// Wire format: varint flip count, then the answer bits packed LSB-first,
/// then the easy bits packed LSB-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answers {
    answers: Vec<Answer>,
    easy: Vec<bool>,
}

impl Answers {
    pub fn new(flips: usize) -> Self {
        Answers {
            answers: vec![Answer::None; flips],
            easy: vec![false; flips],
        }
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    pub fn left(&mut self, i: usize) {
        self.answers[i] = Answer::Left;
    }

    pub fn right(&mut self, i: usize) {
        self.answers[i] = Answer::Right;
    }

    pub fn inappropriate(&mut self, i: usize) {
        self.answers[i] = Answer::Inappropriate;
    }

    pub fn easy(&mut self, i: usize) {
        self.easy[i] = true;
    }

    pub fn answer(&self, i: usize) -> (Answer, bool) {
        (self.answers[i], self.easy[i])
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let n = self.answers.len();
        let mut buf = Vec::with_capacity(5 + n / 2);
        write_varint(n as u32, &mut buf);

        let mut bits = vec![0u8; (n * 2 + 7) / 8];
        for (i, a) in self.answers.iter().enumerate() {
            bits[i / 4] |= (*a as u8) << ((i % 4) * 2);
        }
        buf.extend_from_slice(&bits);

        let mut easy = vec![0u8; (n + 7) / 8];
        for (i, e) in self.easy.iter().enumerate() {
            if *e {
                easy[i / 8] |= 1 << (i % 8);
            }
        }
        buf.extend_from_slice(&easy);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Answers> {
        let (n, offset) = read_varint(data)?;
        let n = n as usize;
        if n > MAX_SESSION_ANSWERS {
            return None;
        }
        let answer_len = (n * 2 + 7) / 8;
        let easy_len = (n + 7) / 8;
        let rest = data.get(offset..offset + answer_len + easy_len)?;
        let (answer_bytes, easy_bytes) = rest.split_at(answer_len);

        let mut result = Answers::new(n);
        for i in 0..n {
            let bits = answer_bytes[i / 4] >> ((i % 4) * 2);
            result.answers[i] = Answer::from_bits(bits);
            result.easy[i] = easy_bytes[i / 8] & (1 << (i % 8)) != 0;
        }
        Some(result)
    }
}

fn write_varint(mut value: u32, buf: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn read_varint(data: &[u8]) -> Option<(u32, usize)> {
    let mut value = 0u32;
    for (i, byte) in data.iter().enumerate().take(5) {
        value |= u32::from(byte & 0x7f) << (i * 7);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Payload of `SubmitShortAnswersTx`: the short-session reveal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortAnswerAttachment {
    pub answers: Vec<u8>,
    pub proof: Vec<u8>,
    pub key: Vec<u8>,
    pub salt: [u8; HASH_SIZE],
}

impl ShortAnswerAttachment {
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        postcard::from_bytes(data).ok()
    }
}

/// Identity state lattice; `Killed` is terminal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IdentityState {
    #[default]
    Undefined = 0,
    Invite = 1,
    Candidate = 2,
    Newbie = 3,
    Verified = 4,
    Suspended = 5,
    Zombie = 6,
    Killed = 7,
}

impl IdentityState {
    /// States that take part in the validation ceremony
    pub fn is_in_ceremony(self) -> bool {
        matches!(
            self,
            IdentityState::Candidate
                | IdentityState::Newbie
                | IdentityState::Verified
                | IdentityState::Suspended
                | IdentityState::Zombie
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityFlip {
    pub cid: Vec<u8>,
    pub pair: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAddr {
    pub address: Address,
    pub tx_hash: Hash,
}

/// The identity subset the ceremony reads and writes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub state: IdentityState,
    pub birthday: u16,
    pub required_flips: u8,
    pub flips: Vec<IdentityFlip>,
    pub generation: u32,
    pub code: Vec<u8>,
    pub short_flip_points: f32,
    pub qualified_flips: u32,
    pub inviter: Option<TxAddr>,
    pub invites: u8,
    pub pub_key: Vec<u8>,
}

impl Identity {
    pub fn made_flips(&self) -> usize {
        self.flips.len()
    }

    pub fn has_done_all_required_flips(&self) -> bool {
        self.flips.len() >= self.required_flips as usize
    }

    /// Word pairs an author commits to: a base of 3 plus one per made flip
    pub fn total_word_pairs(&self) -> usize {
        3 + self.made_flips()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CeremonyCandidate {
    pub address: Address,
    pub generation: u32,
    pub code: Vec<u8>,
}

/// Aggregated long-session verdict on a flip
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FlipStatus {
    #[default]
    NotQualified = 0,
    Qualified = 1,
    WeaklyQualified = 2,
    QualifiedByNone = 3,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FlipQualification {
    pub status: FlipStatus,
    pub answer: Answer,
    pub wrong_words: bool,
}

/// Per-author outcome of the qualification analysis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub strong_flips: u32,
    pub weak_flips: u32,
    pub successful_invites: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationAuthors {
    pub bad_authors: HashSet<Address>,
    pub good_authors: HashMap<Address, ValidationResult>,
}

/// One candidate's recorded answer on one flip
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlipAnswerStats {
    pub respondent: Address,
    pub answer: Answer,
    pub easy: bool,
    pub point: f32,
}

#[derive(Debug, Clone, Default)]
pub struct FlipStats {
    pub status: FlipStatus,
    pub answer: Answer,
    pub short_answers: Vec<FlipAnswerStats>,
    pub long_answers: Vec<FlipAnswerStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IdentityStats {
    pub short_point: f32,
    pub short_flips: u32,
    pub long_point: f32,
    pub long_flips: u32,
    pub approved: bool,
    pub missed: bool,
}

/// Result record of `apply_new_epoch`, kept per height
#[derive(Debug, Clone, Default)]
pub struct ValidationStats {
    pub flip_cids: Vec<Vec<u8>>,
    pub flips: HashMap<usize, FlipStats>,
    pub identities: HashMap<Address, IdentityStats>,
    pub failed: bool,
}

/// Validation phase, advanced by block flags only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValidationPeriod {
    #[default]
    None = 0,
    FlipLottery = 1,
    ShortSession = 2,
    LongSession = 3,
    AfterLongSession = 4,
}
