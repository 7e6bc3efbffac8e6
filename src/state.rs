//! Appended chain state consumed and mutated by the ceremony
//!
//! The full node keeps identities in a versioned merkle tree; the
//! ceremony only needs deterministic key-order traversal and a handful of
//! per-identity fields, which a `BTreeMap` provides directly.

use crate::types::{Address, Identity, IdentityState, Seed, TxAddr, ValidationPeriod};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalState {
    pub epoch: u16,
    pub god_address: Address,
    pub validation_period: ValidationPeriod,
    /// Unix timestamp (seconds) the next short session opens
    pub next_validation_time: u64,
    pub words_seed: Seed,
    pub epoch_block: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppState {
    identities: BTreeMap<Address, Identity>,
    pub global: GlobalState,
}

impl AppState {
    pub fn new(global: GlobalState) -> Self {
        AppState {
            identities: BTreeMap::new(),
            global,
        }
    }

    pub fn identity(&self, addr: Address) -> Identity {
        self.identities.get(&addr).cloned().unwrap_or_default()
    }

    pub fn has_identity(&self, addr: Address) -> bool {
        self.identities.contains_key(&addr)
    }

    pub fn set_identity(&mut self, addr: Address, identity: Identity) {
        self.identities.insert(addr, identity);
    }

    fn entry(&mut self, addr: Address) -> &mut Identity {
        self.identities.entry(addr).or_default()
    }

    pub fn set_state(&mut self, addr: Address, state: IdentityState) {
        self.entry(addr).state = state;
    }

    pub fn set_birthday(&mut self, addr: Address, birthday: u16) {
        self.entry(addr).birthday = birthday;
    }

    pub fn add_qualified_flips(&mut self, addr: Address, count: u32) {
        let identity = self.entry(addr);
        identity.qualified_flips += count;
    }

    pub fn add_short_flip_points(&mut self, addr: Address, points: f32) {
        let identity = self.entry(addr);
        identity.short_flip_points += points;
    }

    pub fn set_inviter(&mut self, addr: Address, inviter: TxAddr) {
        self.entry(addr).inviter = Some(inviter);
    }

    pub fn add_flip(&mut self, addr: Address, cid: Vec<u8>, pair: u8) {
        self.entry(addr)
            .flips
            .push(crate::types::IdentityFlip { cid, pair });
    }

    pub fn set_required_flips(&mut self, addr: Address, count: u8) {
        self.entry(addr).required_flips = count;
    }

    pub fn required_flips(&self, addr: Address) -> u8 {
        self.identities
            .get(&addr)
            .map(|i| i.required_flips)
            .unwrap_or(0)
    }

    pub fn short_flip_points(&self, addr: Address) -> f32 {
        self.identities
            .get(&addr)
            .map(|i| i.short_flip_points)
            .unwrap_or(0.0)
    }

    pub fn qualified_flips(&self, addr: Address) -> u32 {
        self.identities
            .get(&addr)
            .map(|i| i.qualified_flips)
            .unwrap_or(0)
    }

    /// Deterministic key-order traversal
    pub fn iterate_identities(&self, mut f: impl FnMut(Address, &Identity)) {
        for (addr, identity) in &self.identities {
            f(*addr, identity);
        }
    }

    /// Validated identities before the current transition
    pub fn network_size(&self) -> usize {
        self.identities
            .values()
            .filter(|i| matches!(i.state, IdentityState::Newbie | IdentityState::Verified))
            .count()
    }
}
