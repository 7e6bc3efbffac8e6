//! Transaction and flip-key pools
//!
//! Real pools live in the node; the engine only needs the `add` seam.
//! The buffering implementations back the integration tests.

use crate::types::{Address, FlipKey, Hash, Transaction};
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MempoolError {
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("transaction is already in mempool")]
    Duplicate,
}

pub trait TxPool: Send + Sync {
    fn add(&self, tx: Transaction) -> Result<(), MempoolError>;
}

pub trait KeysPool: Send + Sync {
    fn add(&self, key: FlipKey);
}

/// In-memory tx pool that records submissions and rejects duplicates
#[derive(Default)]
pub struct BufferTxPool {
    txs: Mutex<Vec<Transaction>>,
    seen: Mutex<HashSet<Hash>>,
    reject_all: Mutex<bool>,
}

impl BufferTxPool {
    pub fn new() -> Self {
        BufferTxPool::default()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.txs.lock().expect("tx pool lock poisoned").clone()
    }

    /// Force `add` failures, for exercising the resend path
    pub fn set_reject(&self, reject: bool) {
        *self.reject_all.lock().expect("tx pool lock poisoned") = reject;
    }
}

impl TxPool for BufferTxPool {
    fn add(&self, tx: Transaction) -> Result<(), MempoolError> {
        if *self.reject_all.lock().expect("tx pool lock poisoned") {
            return Err(MempoolError::Rejected("pool is closed".into()));
        }
        if !self.seen.lock().expect("tx pool lock poisoned").insert(tx.hash()) {
            return Err(MempoolError::Duplicate);
        }
        self.txs.lock().expect("tx pool lock poisoned").push(tx);
        Ok(())
    }
}

/// In-memory key pool; one key per sender and epoch
#[derive(Default)]
pub struct BufferKeysPool {
    keys: Mutex<Vec<FlipKey>>,
}

impl BufferKeysPool {
    pub fn new() -> Self {
        BufferKeysPool::default()
    }

    pub fn keys(&self) -> Vec<FlipKey> {
        self.keys.lock().expect("keys pool lock poisoned").clone()
    }

    pub fn key_of(&self, sender: Address, epoch: u16) -> Option<Vec<u8>> {
        self.keys
            .lock()
            .expect("keys pool lock poisoned")
            .iter()
            .find(|k| k.sender == sender && k.epoch == epoch)
            .map(|k| k.key.clone())
    }
}

impl KeysPool for BufferKeysPool {
    fn add(&self, key: FlipKey) {
        let mut keys = self.keys.lock().expect("keys pool lock poisoned");
        if keys
            .iter()
            .any(|k| k.sender == key.sender && k.epoch == key.epoch)
        {
            return;
        }
        keys.push(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxKind;

    fn tx(payload: &[u8]) -> Transaction {
        Transaction {
            kind: TxKind::Evidence,
            sender: Address::from_slice(&[1]),
            epoch: 0,
            payload: payload.to_vec(),
            signature: Vec::new(),
        }
    }

    #[test]
    fn duplicate_txs_are_rejected() {
        let pool = BufferTxPool::new();
        assert!(pool.add(tx(b"a")).is_ok());
        assert!(matches!(pool.add(tx(b"a")), Err(MempoolError::Duplicate)));
        assert!(pool.add(tx(b"b")).is_ok());
        assert_eq!(pool.transactions().len(), 2);
    }

    #[test]
    fn one_key_per_sender_and_epoch() {
        let pool = BufferKeysPool::new();
        let sender = Address::from_slice(&[5]);
        pool.add(FlipKey {
            key: vec![1],
            epoch: 2,
            sender,
            signature: Vec::new(),
        });
        pool.add(FlipKey {
            key: vec![9],
            epoch: 2,
            sender,
            signature: Vec::new(),
        });
        assert_eq!(pool.keys().len(), 1);
        assert_eq!(pool.key_of(sender, 2), Some(vec![1]));
    }
}
