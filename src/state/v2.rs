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

//! V2 channel state: the contract script itself carries a CLTV branch, so
//! the refund is derivable client-side without any server round-trip
//! once `expire_time` passes. No separate pre-signed refund transaction
//! or server signature is ever exchanged.

use bitcoin::consensus::encode::serialize;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::{OutPoint, Script, Transaction};

use crate::error::ChannelError;
use crate::keys::ChannelKeys;
use crate::keys::ServerId;
use crate::policy::ChannelProperties;
use crate::registry::{ChannelRecordStatus, StoredClientChannel};
use crate::tx;
use crate::wallet::Wallet;
use wallet::scripts::WitnessScript;

use super::{split_payment_outputs, ChannelStateOps, IncrementedPayment};

pub struct V2ChannelState {
    keys: ChannelKeys,
    value_locked: u64,
    expire_time: u64,
    contract_tx: Option<Transaction>,
    paid: u64,
    best_payment_sig: Option<Signature>,
    best_payment_client_change: Option<u64>,
}

impl V2ChannelState {
    pub fn new(keys: ChannelKeys, value_locked: u64, expire_time: u64) -> Self {
        V2ChannelState {
            keys,
            value_locked,
            expire_time,
            contract_tx: None,
            paid: 0,
            best_payment_sig: None,
            best_payment_client_change: None,
        }
    }

    /// Rebuilds state from a resumed [`StoredClientChannel`] record rather
    /// than a fresh `initiate()`; the contract and any best payment are
    /// already on record, so the refund stays derivable and the channel
    /// is immediately usable for further payments.
    pub(super) fn from_stored(
        keys: ChannelKeys,
        value_locked: u64,
        expire_time: u64,
        contract_tx: Transaction,
        paid: u64,
        best_payment_sig: Option<Signature>,
        best_payment_client_change: Option<u64>,
    ) -> Self {
        V2ChannelState {
            keys,
            value_locked,
            expire_time,
            contract_tx: Some(contract_tx),
            paid,
            best_payment_sig,
            best_payment_client_change,
        }
    }

    fn witness_script(&self) -> WitnessScript {
        tx::contract_witness_script_v2(
            self.keys.multisig_pubkeys(),
            self.keys.client_key.public_key,
            self.expire_time as u32,
        )
    }

    fn contract_outpoint(&self) -> Result<OutPoint, ChannelError> {
        let contract_tx = self
            .contract_tx
            .as_ref()
            .ok_or(ChannelError::ChannelClosedOrUninitialized)?;
        let script_pubkey: Script = tx::contract_script_pubkey(&self.witness_script()).into();
        let vout = contract_tx
            .output
            .iter()
            .position(|out| out.script_pubkey == script_pubkey && out.value == self.value_locked)
            .ok_or(ChannelError::BadTransaction {
                reason: "contract transaction has no matching multisig output".to_string(),
            })?;
        Ok(OutPoint {
            txid: contract_tx.txid(),
            vout: vout as u32,
        })
    }

    /// Derives and signs the unilateral refund transaction. Valid only
    /// once `expire_time` has passed; the transaction's own `nLockTime`
    /// enforces this on-chain regardless of when it is broadcast.
    pub fn derive_refund_transaction(
        &self,
        wallet: &dyn Wallet,
        user_key: Option<&[u8]>,
    ) -> Result<Transaction, ChannelError> {
        let outpoint = self.contract_outpoint()?;
        let client_script: Script =
            tx::payout_script_for_pubkey(self.keys.client_key.public_key).into();
        let mut refund_tx = tx::build_refund_transaction(
            outpoint,
            client_script,
            self.value_locked,
            self.expire_time as u32,
        );
        let signature = wallet.sign(&refund_tx, &self.keys.client_key, user_key)?;
        let witness_script = Script::from(self.witness_script());
        refund_tx.input[0].witness =
            crate::tx::timelocked_branch_witness(&signature, &witness_script);
        Ok(refund_tx)
    }
}

impl ChannelStateOps for V2ChannelState {
    fn initiate(
        &mut self,
        wallet: &dyn Wallet,
        properties: &ChannelProperties,
        _user_key: Option<&[u8]>,
    ) -> Result<(), ChannelError> {
        let script_pubkey: Script = tx::contract_script_pubkey(&self.witness_script()).into();
        let mut contract_tx = wallet.build_funding_transaction(self.value_locked, script_pubkey)?;
        if let Some(hook) = &properties.modify_contract_send_request {
            hook(&mut contract_tx);
        }
        self.contract_tx = Some(contract_tx);
        log::debug!("v2 channel initiated, contract self-refundable after expiry");
        Ok(())
    }

    fn increment_payment_by(
        &mut self,
        wallet: &dyn Wallet,
        delta: u64,
        user_key: Option<&[u8]>,
    ) -> Result<IncrementedPayment, ChannelError> {
        let outpoint = self.contract_outpoint()?;
        let server_key = self
            .keys
            .server_key
            .ok_or(ChannelError::ChannelClosedOrUninitialized)?;

        let old_paid = self.paid;
        let requested_new_paid = old_paid.saturating_add(delta);
        if requested_new_paid > self.value_locked {
            return Err(ChannelError::ValueOutOfRange {
                reason: "increment would exceed locked channel value".to_string(),
            });
        }

        let (new_paid, client_change) =
            split_payment_outputs(self.value_locked, requested_new_paid, 0);

        let server_script: Script = tx::payout_script_for_pubkey(server_key).into();
        let client_script: Script =
            tx::payout_script_for_pubkey(self.keys.client_key.public_key).into();
        let payment_tx = tx::build_payment_transaction(
            outpoint,
            server_script,
            new_paid,
            client_script,
            client_change,
        );
        let signature = wallet.sign(&payment_tx, &self.keys.client_key, user_key)?;

        self.paid = new_paid;
        self.best_payment_sig = Some(signature);
        self.best_payment_client_change = Some(client_change);

        Ok(IncrementedPayment {
            signature,
            amount: new_paid - old_paid,
        })
    }

    fn get_contract(&self) -> Option<Vec<u8>> {
        self.contract_tx.as_ref().map(serialize)
    }

    fn is_settlement_transaction(&self, tx: &Transaction) -> bool {
        match self.contract_outpoint() {
            Ok(outpoint) => tx
                .input
                .iter()
                .any(|input| input.previous_output == outpoint),
            Err(_) => false,
        }
    }

    fn store_channel_in_wallet(
        &self,
        wallet: &dyn Wallet,
        server_id: ServerId,
    ) -> Result<(), ChannelError> {
        let contract_tx = self
            .contract_tx
            .clone()
            .ok_or(ChannelError::ChannelClosedOrUninitialized)?;
        let server_key = self.keys.server_key.ok_or(ChannelError::ChannelClosedOrUninitialized)?;
        // The refund is derivable client-side; store an unsigned skeleton
        // so a resumed wallet can re-derive and sign it without needing
        // this struct's full state.
        let client_script: Script =
            tx::payout_script_for_pubkey(self.keys.client_key.public_key).into();
        let outpoint = self.contract_outpoint()?;
        let refund_tx = tx::build_refund_transaction(
            outpoint,
            client_script,
            self.value_locked,
            self.expire_time as u32,
        );
        wallet.store_channel(
            server_id,
            StoredClientChannel {
                server_id,
                contract_tx,
                refund_tx,
                best_payment_sig: self.best_payment_sig,
                best_payment_value: self.paid,
                expire_time: self.expire_time,
                counterparty_key: server_key,
                client_key_encrypted: Vec::new(),
                version: 2,
                status: ChannelRecordStatus::Active,
            },
        );
        Ok(())
    }

    fn disconnect_from_channel(&mut self) {
        log::debug!("v2 channel disconnected from transport");
    }

    fn get_value_refunded(&self) -> u64 {
        self.value_locked
    }

    fn best_payment_client_change(&self) -> u64 {
        self.best_payment_client_change.unwrap_or(self.value_locked)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::keys::LocalKey;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::{PackedLockTime, TxOut};

    fn dumb_key(byte: u8) -> bitcoin::secp256k1::PublicKey {
        let secp = Secp256k1::new();
        let mut buf = [0u8; 32];
        buf[31] = byte;
        let sk = SecretKey::from_slice(&buf).unwrap();
        bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk)
    }

    struct StubWallet {
        contract_tx: Transaction,
    }

    impl Wallet for StubWallet {
        fn store_channel(&self, _: ServerId, _: StoredClientChannel) {}
        fn get_usable_channel(&self, _: ServerId) -> Option<StoredClientChannel> {
            None
        }
        fn build_funding_transaction(
            &self,
            _: u64,
            _: Script,
        ) -> Result<Transaction, ChannelError> {
            Ok(self.contract_tx.clone())
        }
        fn sign(
            &self,
            _: &Transaction,
            _: &LocalKey,
            _: Option<&[u8]>,
        ) -> Result<Signature, ChannelError> {
            let secp = Secp256k1::new();
            let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
            let msg = bitcoin::secp256k1::Message::from_slice(&[9u8; 32]).unwrap();
            Ok(secp.sign_ecdsa(&msg, &sk))
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

    fn setup() -> (V2ChannelState, StubWallet) {
        let client_pub = dumb_key(1);
        let server_pub = dumb_key(2);
        let keys = ChannelKeys::new(LocalKey::new(client_pub)).with_server_key(server_pub);
        let state = V2ChannelState::new(keys.clone(), 1_000_000, 1_700_086_340);
        let script_pubkey: Script = tx::contract_script_pubkey(&state.witness_script()).into();
        let contract_tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![],
            output: vec![TxOut {
                value: 1_000_000,
                script_pubkey,
            }],
        };
        (state, StubWallet { contract_tx })
    }

    #[test]
    fn initiate_builds_self_refundable_contract() {
        let (mut state, wallet) = setup();
        let properties = ChannelProperties::default();
        state.initiate(&wallet, &properties, None).unwrap();
        assert!(state.get_contract().is_some());
    }

    #[test]
    fn increment_payment_tracks_cumulative_paid() {
        let (mut state, wallet) = setup();
        let properties = ChannelProperties::default();
        state.initiate(&wallet, &properties, None).unwrap();
        let result = state.increment_payment_by(&wallet, 500, None).unwrap();
        assert_eq!(result.amount, 500);
        assert_eq!(state.paid, 500);
    }

    #[test]
    fn dust_rounding_matches_scenario_c() {
        let (mut state, wallet) = setup();
        let properties = ChannelProperties::default();
        state.initiate(&wallet, &properties, None).unwrap();
        state.increment_payment_by(&wallet, 500, None).unwrap();
        let delta = 1_000_000 - 500 - crate::tx::DUST_LIMIT_SATS + 1;
        let result = state.increment_payment_by(&wallet, delta, None).unwrap();
        assert_eq!(result.amount - delta, crate::tx::DUST_LIMIT_SATS - 1);
        assert_eq!(state.best_payment_client_change, Some(0));
    }
}
