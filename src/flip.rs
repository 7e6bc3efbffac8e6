//! Flip content handling
//!
//! The content service itself (an IPFS-like store) is an external
//! collaborator; `FlipStore` is its seam, with an in-memory
//! implementation for tests. `Flipper` owns the node's per-epoch flip
//! encryption key, prepares outgoing flips and fetches assigned flips in
//! the background.

use crate::crypto;
use aes_siv::aead::{Aead, KeyInit};
use aes_siv::Aes128SivAead;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Flip encryption key size (AES-128-SIV takes a double-length key)
pub const FLIP_KEY_SIZE: usize = 32;

/// Bound on a single content fetch
pub const FLIP_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum FlipError {
    #[error("flip is missing")]
    NotFound,
    #[error("flip fetch timed out")]
    Timeout,
    #[error("flip cannot be encrypted or decrypted")]
    Cipher,
    #[error("content store failure: {0}")]
    Store(String),
}

/// Content-addressed flip storage seam
pub trait FlipStore: Send + Sync {
    fn add(&self, data: &[u8]) -> Result<Vec<u8>, FlipError>;
    fn get(&self, cid: &[u8]) -> Result<Vec<u8>, FlipError>;
    fn pin(&self, cid: &[u8]) -> Result<(), FlipError>;
    fn unpin(&self, cid: &[u8]) -> Result<(), FlipError>;
    fn cid(&self, data: &[u8]) -> Vec<u8>;
}

/// Test double for the external content service
#[derive(Default)]
pub struct InMemoryFlipStore {
    values: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryFlipStore {
    pub fn new() -> Self {
        InMemoryFlipStore::default()
    }
}

impl FlipStore for InMemoryFlipStore {
    fn add(&self, data: &[u8]) -> Result<Vec<u8>, FlipError> {
        let cid = self.cid(data);
        self.values
            .write()
            .expect("flip store lock poisoned")
            .insert(cid.clone(), data.to_vec());
        Ok(cid)
    }

    fn get(&self, cid: &[u8]) -> Result<Vec<u8>, FlipError> {
        self.values
            .read()
            .expect("flip store lock poisoned")
            .get(cid)
            .cloned()
            .ok_or(FlipError::NotFound)
    }

    fn pin(&self, _cid: &[u8]) -> Result<(), FlipError> {
        Ok(())
    }

    fn unpin(&self, cid: &[u8]) -> Result<(), FlipError> {
        self.values
            .write()
            .expect("flip store lock poisoned")
            .remove(cid);
        Ok(())
    }

    fn cid(&self, data: &[u8]) -> Vec<u8> {
        crypto::sha3(data).as_bytes().to_vec()
    }
}

struct OwnFlip {
    epoch: u16,
    encrypted: Vec<u8>,
}

pub struct Flipper {
    store: Arc<dyn FlipStore>,
    /// Per-epoch flip encryption key, generated on first use
    key: Mutex<Option<[u8; FLIP_KEY_SIZE]>>,
    /// Fetched ciphertexts of the flips we must solve
    loaded: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    own_flips: Mutex<HashMap<Vec<u8>, OwnFlip>>,
    fetch_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Flipper {
    pub fn new(store: Arc<dyn FlipStore>) -> Self {
        Flipper {
            store,
            key: Mutex::new(None),
            loaded: Mutex::new(HashMap::new()),
            own_flips: Mutex::new(HashMap::new()),
            fetch_tasks: Mutex::new(Vec::new()),
        }
    }

    /// The flip decryption key broadcast during the short session
    pub fn flip_encryption_key(&self) -> [u8; FLIP_KEY_SIZE] {
        let mut guard = self.key.lock().expect("flipper lock poisoned");
        *guard.get_or_insert_with(|| {
            let mut key = [0u8; FLIP_KEY_SIZE];
            rand::rngs::OsRng.fill_bytes(&mut key);
            key
        })
    }

    /// Encrypt a raw flip and derive its content id
    pub fn prepare_flip(&self, epoch: u16, raw: &[u8]) -> Result<(Vec<u8>, Vec<u8>), FlipError> {
        let key = self.flip_encryption_key();
        let encrypted = encrypt(&key, raw)?;
        let cid = self.store.cid(&encrypted);
        self.own_flips.lock().expect("flipper lock poisoned").insert(
            cid.clone(),
            OwnFlip {
                epoch,
                encrypted: encrypted.clone(),
            },
        );
        Ok((cid, encrypted))
    }

    /// Publish a prepared flip to the content service
    pub fn publish_flip(&self, encrypted: &[u8]) -> Result<Vec<u8>, FlipError> {
        let cid = self.store.add(encrypted)?;
        self.store.pin(&cid)?;
        Ok(cid)
    }

    /// Fetch assigned flips in the background. Fetches are cancelled on
    /// `reset` at the epoch boundary.
    pub fn load(self: &Arc<Self>, cids: Vec<Vec<u8>>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime, {} flips not fetched", cids.len());
            return;
        };
        let flipper = Arc::clone(self);
        let handle = runtime.spawn(async move {
            for cid in cids {
                if flipper.loaded.lock().expect("flipper lock poisoned").contains_key(&cid) {
                    continue;
                }
                let store = Arc::clone(&flipper.store);
                let fetch_cid = cid.clone();
                let fetched = tokio::time::timeout(
                    FLIP_FETCH_TIMEOUT,
                    tokio::task::spawn_blocking(move || store.get(&fetch_cid)),
                )
                .await;
                match fetched {
                    Ok(Ok(Ok(data))) => {
                        flipper
                            .loaded
                            .lock()
                            .expect("flipper lock poisoned")
                            .insert(cid, data);
                    }
                    Ok(Ok(Err(e))) => {
                        warn!(cid = %hex::encode(&cid), "flip fetch failed: {e}")
                    }
                    Ok(Err(e)) => warn!("flip fetch task failed: {e}"),
                    Err(_) => warn!(cid = %hex::encode(&cid), "flip fetch timed out"),
                }
            }
        });
        self.fetch_tasks
            .lock()
            .expect("flipper lock poisoned")
            .push(handle);
    }

    /// Flip content for the RPC surface: own flips decrypt with the local
    /// key, fetched flips are returned as stored
    pub fn get_flip(&self, cid: &[u8]) -> Result<(Vec<u8>, u16), FlipError> {
        if let Some(own) = self.own_flips.lock().expect("flipper lock poisoned").get(cid) {
            let key = self.flip_encryption_key();
            return Ok((decrypt(&key, &own.encrypted)?, own.epoch));
        }
        if let Some(data) = self.loaded.lock().expect("flipper lock poisoned").get(cid) {
            return Ok((data.clone(), 0));
        }
        let data = self.store.get(cid)?;
        Ok((data, 0))
    }

    pub fn has_flip(&self, cid: &[u8]) -> bool {
        self.loaded.lock().expect("flipper lock poisoned").contains_key(cid)
            || self.own_flips.lock().expect("flipper lock poisoned").contains_key(cid)
    }

    pub fn unpin_flip(&self, cid: &[u8]) {
        if let Err(e) = self.store.unpin(cid) {
            debug!(cid = %hex::encode(cid), "flip unpin failed: {e}");
        }
    }

    /// Epoch boundary: cancel outstanding fetches and drop per-epoch state
    pub fn reset(&self) {
        for handle in self.fetch_tasks.lock().expect("flipper lock poisoned").drain(..) {
            handle.abort();
        }
        self.loaded.lock().expect("flipper lock poisoned").clear();
        *self.key.lock().expect("flipper lock poisoned") = None;
    }
}

// SIV tolerates nonce reuse; content addressing needs equal plaintexts
// to encrypt identically under the epoch key
const FLIP_NONCE: [u8; 16] = [0u8; 16];

fn encrypt(key: &[u8; FLIP_KEY_SIZE], data: &[u8]) -> Result<Vec<u8>, FlipError> {
    let cipher = Aes128SivAead::new_from_slice(key).map_err(|_| FlipError::Cipher)?;
    cipher
        .encrypt((&FLIP_NONCE).into(), data)
        .map_err(|_| FlipError::Cipher)
}

/// Decrypt a fetched flip with a published key
pub fn decrypt(key: &[u8; FLIP_KEY_SIZE], data: &[u8]) -> Result<Vec<u8>, FlipError> {
    let cipher = Aes128SivAead::new_from_slice(key).map_err(|_| FlipError::Cipher)?;
    cipher
        .decrypt((&FLIP_NONCE).into(), data)
        .map_err(|_| FlipError::Cipher)
}
