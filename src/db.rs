//! Per-epoch durable scratchpad
//!
//! Every record lives in a sled tree named `epoch-<n>`; dropping the tree
//! clears the epoch. Writes are fire-and-forget (failures are logged, the
//! ceremony keeps going) and reads signal absence with `None`.

use crate::types::{Address, Answers, Hash, TxKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

const KEY_SEED: &[u8] = b"seed";
const KEY_OWN_SHORT_ANSWERS: &[u8] = b"ownShortAnswers";
const PREFIX_ANSWER_HASH: &[u8] = b"answerHash/";
const PREFIX_EVIDENCE: &[u8] = b"evidence/";
const PREFIX_OWN_TX: &[u8] = b"ownTx/";
const PREFIX_SUCCESS_TX: &[u8] = b"successTx/";
const PREFIX_FLIP_CID: &[u8] = b"flipCid/";
const KEY_SHORT_ANSWERS: &[u8] = b"shortAnswers";
const KEY_LONG_ANSWERS: &[u8] = b"longAnswers";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnswerHashRecord {
    pub hash: Hash,
    /// Unix timestamp (seconds) at which the hash arrived
    pub timestamp: u64,
}

pub struct EpochDb {
    tree: sled::Tree,
    epoch: u16,
}

impl EpochDb {
    pub fn open(db: &sled::Db, epoch: u16) -> Result<Self, StoreError> {
        let tree = db.open_tree(tree_name(epoch))?;
        Ok(EpochDb { tree, epoch })
    }

    pub fn epoch(&self) -> u16 {
        self.epoch
    }

    /// Remove every record of this epoch
    pub fn clear(&self) {
        for item in self.tree.iter() {
            match item {
                Ok((key, _)) => {
                    if let Err(e) = self.tree.remove(key) {
                        error!(epoch = self.epoch, "failed to clear epoch store: {e}");
                        return;
                    }
                }
                Err(e) => {
                    error!(epoch = self.epoch, "failed to clear epoch store: {e}");
                    return;
                }
            }
        }
    }

    pub fn write_lottery_seed(&self, seed: Hash) {
        self.put(KEY_SEED.to_vec(), seed.as_bytes());
    }

    pub fn read_lottery_seed(&self) -> Option<Hash> {
        self.get_raw(KEY_SEED).map(|v| Hash::from_slice(&v))
    }

    pub fn write_answer_hash(&self, sender: Address, hash: Hash, timestamp: u64) {
        let record = AnswerHashRecord { hash, timestamp };
        match bincode::serialize(&record) {
            Ok(bytes) => self.put(keyed(PREFIX_ANSWER_HASH, sender.as_bytes()), &bytes),
            Err(e) => error!(%sender, "failed to encode answer hash: {e}"),
        }
    }

    pub fn has_answer_hash(&self, sender: Address) -> bool {
        self.contains(&keyed(PREFIX_ANSWER_HASH, sender.as_bytes()))
    }

    pub fn read_answer_hash(&self, sender: Address) -> Option<AnswerHashRecord> {
        let bytes = self.get_raw(&keyed(PREFIX_ANSWER_HASH, sender.as_bytes()))?;
        self.decode(&bytes)
    }

    /// Senders whose answer hash arrived inside the window
    pub fn confirmed_respondents(&self, start: u64, end: u64) -> Vec<Address> {
        let mut result = Vec::new();
        for item in self.tree.scan_prefix(PREFIX_ANSWER_HASH) {
            let (key, value) = match item {
                Ok(kv) => kv,
                Err(e) => {
                    error!(epoch = self.epoch, "answer hash scan failed: {e}");
                    break;
                }
            };
            let Some(record) = self.decode::<AnswerHashRecord>(&value) else {
                continue;
            };
            if record.timestamp >= start && record.timestamp <= end {
                result.push(Address::from_slice(&key[PREFIX_ANSWER_HASH.len()..]));
            }
        }
        result
    }

    pub fn write_evidence_map(&self, sender: Address, bitmap: &[u8]) {
        self.put(keyed(PREFIX_EVIDENCE, sender.as_bytes()), bitmap);
    }

    pub fn has_evidence_map(&self, sender: Address) -> bool {
        self.contains(&keyed(PREFIX_EVIDENCE, sender.as_bytes()))
    }

    pub fn read_evidence_maps(&self) -> Vec<Vec<u8>> {
        self.tree
            .scan_prefix(PREFIX_EVIDENCE)
            .filter_map(|item| item.ok())
            .map(|(_, v)| v.to_vec())
            .collect()
    }

    pub fn write_own_tx(&self, kind: TxKind, bytes: &[u8]) {
        self.put(keyed(PREFIX_OWN_TX, &kind.code().to_le_bytes()), bytes);
    }

    pub fn read_own_tx(&self, kind: TxKind) -> Option<Vec<u8>> {
        self.get_raw(&keyed(PREFIX_OWN_TX, &kind.code().to_le_bytes()))
    }

    pub fn remove_own_tx(&self, kind: TxKind) {
        let key = keyed(PREFIX_OWN_TX, &kind.code().to_le_bytes());
        if let Err(e) = self.tree.remove(key) {
            error!(epoch = self.epoch, kind = kind.name(), "failed to remove own tx: {e}");
        }
    }

    pub fn write_successful_own_tx(&self, hash: Hash) {
        self.put(keyed(PREFIX_SUCCESS_TX, hash.as_bytes()), &[]);
    }

    pub fn has_successful_own_tx(&self, hash: Hash) -> bool {
        self.contains(&keyed(PREFIX_SUCCESS_TX, hash.as_bytes()))
    }

    pub fn write_own_short_answers(&self, answers: &Answers) {
        self.put(KEY_OWN_SHORT_ANSWERS.to_vec(), &answers.to_bytes());
    }

    /// Packed bytes of our short answers, if submitted
    pub fn read_own_short_answers(&self) -> Option<Vec<u8>> {
        self.get_raw(KEY_OWN_SHORT_ANSWERS)
    }

    pub fn write_flip_cid(&self, cid: &[u8]) {
        self.put(keyed(PREFIX_FLIP_CID, cid), &[]);
    }

    pub fn flip_cids(&self) -> Vec<Vec<u8>> {
        self.tree
            .scan_prefix(PREFIX_FLIP_CID)
            .filter_map(|item| item.ok())
            .map(|(k, _)| k[PREFIX_FLIP_CID.len()..].to_vec())
            .collect()
    }

    /// Qualifier persistence: the append-only per-session answer arrays
    pub fn write_answers(&self, short: bool, entries: &[(Address, Vec<u8>)]) {
        let key = if short { KEY_SHORT_ANSWERS } else { KEY_LONG_ANSWERS };
        match bincode::serialize(entries) {
            Ok(bytes) => self.put(key.to_vec(), &bytes),
            Err(e) => error!(epoch = self.epoch, "failed to encode answers: {e}"),
        }
    }

    pub fn read_answers(&self, short: bool) -> Vec<(Address, Vec<u8>)> {
        let key = if short { KEY_SHORT_ANSWERS } else { KEY_LONG_ANSWERS };
        self.get_raw(key)
            .and_then(|bytes| self.decode(&bytes))
            .unwrap_or_default()
    }

    fn put(&self, key: Vec<u8>, value: &[u8]) {
        if let Err(e) = self.tree.insert(key, value) {
            error!(epoch = self.epoch, "epoch store write failed: {e}");
        }
    }

    fn get_raw(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.tree.get(key) {
            Ok(value) => value.map(|v| v.to_vec()),
            Err(e) => {
                error!(epoch = self.epoch, "epoch store read failed: {e}");
                None
            }
        }
    }

    fn contains(&self, key: &[u8]) -> bool {
        match self.tree.contains_key(key) {
            Ok(found) => found,
            Err(e) => {
                error!(epoch = self.epoch, "epoch store read failed: {e}");
                false
            }
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> Option<T> {
        match bincode::deserialize(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(epoch = self.epoch, "epoch store record corrupted: {e}");
                None
            }
        }
    }
}

fn tree_name(epoch: u16) -> String {
    format!("epoch-{epoch}")
}

fn keyed(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}
