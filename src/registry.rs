// LNP/BP Core Library implementing LNPBP specifications & standards
// Written in 2019-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Stored channel registry: per-server persisted channel records,
//! resumption lookup, and the pre-expiry auto-close scheduler.
//!
//! The scheduler is driven by an externally supplied clock rather than an
//! internal OS timer — the core has no async runtime, and the caller
//! already owns the connect/handshake timer, so [`PreExpiryScheduler::poll`]
//! is simply called alongside it.

use std::collections::BTreeMap;

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Transaction;
use parking_lot::RwLock;

use crate::error::ChannelError;
use crate::keys::ServerId;
use crate::wallet::Wallet;

/// Status of a stored channel record, tracked alongside its persisted
/// data so the pre-expiry scheduler does not re-broadcast a refund for a
/// channel the server has already settled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, StrictEncode, StrictDecode)]
pub enum ChannelRecordStatus {
    /// Usable for new payments (subject to [`StoredChannelRegistry::get_usable`]).
    #[display("ACTIVE")]
    Active,

    /// Settled by the server; retained only until the settlement or
    /// refund transaction confirms.
    #[display("AWAITING_CONFIRMATION")]
    AwaitingConfirmation,
}

/// Persisted state for a single stored channel.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct StoredClientChannel {
    pub server_id: ServerId,

    /// The on-chain funding transaction, spendable only through the
    /// multisig output.
    pub contract_tx: Transaction,

    /// V1: the fully client+server signed refund transaction. V2: the
    /// refund transaction the client can derive and sign unilaterally
    /// (stored pre-built so a crash need not reconstruct it).
    pub refund_tx: Transaction,

    /// The latest client-signed payment signature and its cumulative
    /// value, if any payment has been made yet.
    pub best_payment_sig: Option<Signature>,
    pub best_payment_value: u64,

    /// Absolute refund lock time.
    pub expire_time: u64,

    /// The counterparty's multisig public key: the client's, from a
    /// server-held record, or the server's, from a client-held one.
    /// Needed to rebuild the contract's witness script on resumption,
    /// since a P2WSH `script_pubkey` alone does not reveal either key.
    pub counterparty_key: PublicKey,

    /// The client's per-channel key, encrypted under the wallet's own
    /// key-encryption scheme if the wallet is encrypted (opaque to this
    /// crate either way).
    pub client_key_encrypted: Vec<u8>,

    /// Protocol major version this record was opened under (1 or 2).
    pub version: u8,

    pub status: ChannelRecordStatus,
}

/// Maps `server_id → StoredClientChannel`.
#[derive(Default)]
pub struct StoredChannelRegistry {
    records: RwLock<BTreeMap<ServerId, StoredClientChannel>>,
}

impl StoredChannelRegistry {
    pub fn new() -> Self {
        StoredChannelRegistry {
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Idempotent insert/update.
    pub fn put(&self, channel: StoredClientChannel) {
        log::debug!(
            "registry: storing channel for server {}",
            channel.server_id
        );
        self.records.write().insert(channel.server_id, channel);
    }

    /// Returns the channel for `server_id` if present and its refund
    /// lock has not yet expired minus the safety margin `S`.
    pub fn get_usable(
        &self,
        server_id: ServerId,
        now: u64,
        safety_margin_secs: u64,
    ) -> Option<StoredClientChannel> {
        let records = self.records.read();
        let record = records.get(&server_id)?;
        if record.status != ChannelRecordStatus::Active {
            return None;
        }
        if now + safety_margin_secs >= record.expire_time {
            return None;
        }
        Some(record.clone())
    }

    /// Looks up a record regardless of its expiry, e.g. to validate a
    /// resumption shortcut during handshake.
    pub fn get(&self, server_id: ServerId) -> Option<StoredClientChannel> {
        self.records.read().get(&server_id).cloned()
    }

    /// Removes the record, e.g. once its refund or settlement has
    /// confirmed on-chain.
    pub fn purge(&self, server_id: ServerId) {
        log::debug!("registry: purging channel for server {}", server_id);
        self.records.write().remove(&server_id);
    }

    /// Marks a record as awaiting confirmation (settled or force-closed)
    /// without removing it yet.
    pub fn mark_awaiting_confirmation(&self, server_id: ServerId) {
        if let Some(record) = self.records.write().get_mut(&server_id) {
            record.status = ChannelRecordStatus::AwaitingConfirmation;
        }
    }

    /// The earliest `expire_time - S` among active stored channels, i.e.
    /// when the pre-expiry scheduler should next fire.
    fn next_deadline(&self, safety_margin_secs: u64) -> Option<(ServerId, u64)> {
        self.records
            .read()
            .values()
            .filter(|record| record.status == ChannelRecordStatus::Active)
            .map(|record| {
                (record.server_id, record.expire_time.saturating_sub(safety_margin_secs))
            })
            .min_by_key(|(_, deadline)| *deadline)
    }
}

/// The pre-expiry close scheduler. Adding, updating, or removing a
/// record effectively reschedules it, since [`PreExpiryScheduler::poll`]
/// always recomputes the earliest deadline from the registry's current
/// contents rather than caching it.
pub struct PreExpiryScheduler {
    safety_margin_secs: u64,
}

impl PreExpiryScheduler {
    pub fn new(safety_margin_secs: u64) -> Self {
        PreExpiryScheduler { safety_margin_secs }
    }

    /// The next deadline the scheduler would fire at, for callers that
    /// want to arm their own timer rather than poll blindly.
    pub fn next_deadline(&self, registry: &StoredChannelRegistry) -> Option<u64> {
        registry
            .next_deadline(self.safety_margin_secs)
            .map(|(_, deadline)| deadline)
    }

    /// Force-closes (broadcasts the refund of) every stored channel whose
    /// deadline has passed as of `now`, unless it has already been
    /// settled. Returns the server ids force-closed. Intended to be
    /// called whenever the caller's own clock advances, e.g. alongside
    /// the connect/handshake timer.
    pub fn poll(
        &self,
        registry: &StoredChannelRegistry,
        wallet: &dyn Wallet,
        now: u64,
    ) -> Vec<ServerId> {
        let due: Vec<StoredClientChannel> = {
            let records = registry.records.read();
            records
                .values()
                .filter(|record| record.status == ChannelRecordStatus::Active)
                .filter(|record| {
                    now + self.safety_margin_secs >= record.expire_time
                })
                .cloned()
                .collect()
        };

        let mut closed = Vec::with_capacity(due.len());
        for record in due {
            log::warn!(
                "pre-expiry scheduler: force-closing channel for server {}",
                record.server_id
            );
            if wallet.broadcast(&record.refund_tx).is_ok() {
                registry.mark_awaiting_confirmation(record.server_id);
                closed.push(record.server_id);
            }
        }
        closed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::{OutPoint, PackedLockTime, Transaction};

    struct NullWallet;
    impl Wallet for NullWallet {
        fn store_channel(&self, _: ServerId, _: StoredClientChannel) {}
        fn get_usable_channel(&self, _: ServerId) -> Option<StoredClientChannel> {
            None
        }
        fn build_funding_transaction(
            &self,
            _: u64,
            _: bitcoin::Script,
        ) -> Result<Transaction, ChannelError> {
            unimplemented!()
        }
        fn sign(
            &self,
            _: &Transaction,
            _: &crate::keys::LocalKey,
            _: Option<&[u8]>,
        ) -> Result<Signature, ChannelError> {
            unimplemented!()
        }
        fn broadcast(&self, _: &Transaction) -> Result<(), ChannelError> {
            Ok(())
        }
        fn receive_pending(&self, _: Transaction) -> Result<(), ChannelError> {
            Ok(())
        }
        fn is_encrypted(&self) -> bool {
            false
        }
    }

    fn dumb_tx() -> Transaction {
        Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![],
            output: vec![],
        }
    }

    fn dumb_key() -> PublicKey {
        use bitcoin::secp256k1::{Secp256k1, SecretKey};
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[3u8; 32]).unwrap();
        PublicKey::from_secret_key(&secp, &sk)
    }

    fn sample_record(server_id: ServerId, expire_time: u64) -> StoredClientChannel {
        StoredClientChannel {
            server_id,
            contract_tx: dumb_tx(),
            refund_tx: dumb_tx(),
            best_payment_sig: None,
            best_payment_value: 0,
            expire_time,
            counterparty_key: dumb_key(),
            client_key_encrypted: vec![],
            version: 2,
            status: ChannelRecordStatus::Active,
        }
    }

    #[test]
    fn get_usable_respects_safety_margin() {
        let registry = StoredChannelRegistry::new();
        let id = ServerId::from_bytes([1u8; 32]);
        registry.put(sample_record(id, 1_000));
        assert!(registry.get_usable(id, 0, 100).is_some());
        assert!(registry.get_usable(id, 950, 100).is_none());
    }

    #[test]
    fn scheduler_force_closes_due_channel() {
        let registry = StoredChannelRegistry::new();
        let id = ServerId::from_bytes([2u8; 32]);
        registry.put(sample_record(id, 1_000));
        let scheduler = PreExpiryScheduler::new(100);
        let wallet = NullWallet;

        assert!(scheduler.poll(&registry, &wallet, 0).is_empty());
        let closed = scheduler.poll(&registry, &wallet, 950);
        assert_eq!(closed, vec![id]);
        assert!(registry.get_usable(id, 950, 100).is_none());
    }

    #[test]
    fn purge_removes_record() {
        let registry = StoredChannelRegistry::new();
        let id = ServerId::from_bytes([3u8; 32]);
        registry.put(sample_record(id, 1_000));
        registry.purge(id);
        assert!(registry.get(id).is_none());
    }

    // touch OutPoint so the import above doesn't trip unused_imports under
    // differing cfg(test) feature combinations
    #[allow(dead_code)]
    fn _unused(o: OutPoint) -> OutPoint {
        o
    }
}
