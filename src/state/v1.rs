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

//! V1 channel state: the refund is a separate transaction pre-signed by
//! both parties before the contract leaves the client. Spending the
//! multisig output for anything other than this refund or the latest
//! payment requires cooperation.

use bitcoin::consensus::encode::serialize;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{OutPoint, Script, Transaction};

use crate::error::ChannelError;
use crate::keys::ChannelKeys;
use crate::keys::ServerId;
use crate::policy::ChannelProperties;
use crate::registry::{ChannelRecordStatus, StoredClientChannel};
use crate::tx;
use crate::wallet::Wallet;

use super::{split_payment_outputs, ChannelStateOps, IncrementedPayment};

pub struct V1ChannelState {
    keys: ChannelKeys,
    value_locked: u64,
    expire_time: u64,
    contract_tx: Option<Transaction>,
    refund_tx: Option<Transaction>,
    client_refund_signature: Option<Signature>,
    server_refund_signature: Option<Signature>,
    paid: u64,
    best_payment_sig: Option<Signature>,
    best_payment_client_change: Option<u64>,
}

impl V1ChannelState {
    pub fn new(keys: ChannelKeys, value_locked: u64, expire_time: u64) -> Self {
        V1ChannelState {
            keys,
            value_locked,
            expire_time,
            contract_tx: None,
            refund_tx: None,
            client_refund_signature: None,
            server_refund_signature: None,
            paid: 0,
            best_payment_sig: None,
            best_payment_client_change: None,
        }
    }

    /// Rebuilds state from a resumed [`StoredClientChannel`] record. The
    /// stored refund transaction is already the fully co-signed one (its
    /// witness was filled in by `completed_refund_transaction()` before
    /// the original `store_channel_in_wallet()` call), so the individual
    /// refund signatures are not needed back and stay `None`.
    pub(super) fn from_stored(
        keys: ChannelKeys,
        value_locked: u64,
        expire_time: u64,
        contract_tx: Transaction,
        refund_tx: Transaction,
        paid: u64,
        best_payment_sig: Option<Signature>,
        best_payment_client_change: Option<u64>,
    ) -> Self {
        V1ChannelState {
            keys,
            value_locked,
            expire_time,
            contract_tx: Some(contract_tx),
            refund_tx: Some(refund_tx),
            client_refund_signature: None,
            server_refund_signature: None,
            paid,
            best_payment_sig,
            best_payment_client_change,
        }
    }

    fn contract_outpoint(&self) -> Result<OutPoint, ChannelError> {
        let contract_tx = self
            .contract_tx
            .as_ref()
            .ok_or(ChannelError::ChannelClosedOrUninitialized)?;
        let witness_script = tx::contract_witness_script_v1(self.keys.multisig_pubkeys());
        let script_pubkey: Script = tx::contract_script_pubkey(&witness_script).into();
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

    /// Returns the unsigned refund transaction's wire bytes, sent to the
    /// server as `ProvideRefund.refund_tx_bytes`.
    pub fn get_incomplete_refund_transaction(&self) -> Option<Vec<u8>> {
        self.refund_tx.as_ref().map(serialize)
    }

    /// Applies and verifies the server's signature over the pending
    /// refund transaction.
    pub fn provide_refund_signature(
        &mut self,
        server_signature: Signature,
    ) -> Result<(), ChannelError> {
        let refund_tx = self
            .refund_tx
            .as_ref()
            .ok_or(ChannelError::ChannelClosedOrUninitialized)?;
        let server_key = self.keys.server_key.ok_or(ChannelError::ChannelClosedOrUninitialized)?;
        let witness_script = tx::contract_witness_script_v1(self.keys.multisig_pubkeys());
        let secp = Secp256k1::verification_only();
        tx::verify_segwit_signature(
            &secp,
            refund_tx,
            0,
            &Script::from(witness_script),
            self.value_locked,
            &server_key,
            &server_signature,
        )?;
        self.server_refund_signature = Some(server_signature);
        Ok(())
    }

    fn completed_refund_transaction(&self) -> Option<Transaction> {
        let mut refund_tx = self.refund_tx.clone()?;
        let client_sig = self.client_refund_signature?;
        let server_sig = self.server_refund_signature?;
        let witness_script = tx::contract_witness_script_v1(self.keys.multisig_pubkeys());
        let (first, second) = self.keys.multisig_pubkeys();
        let (first_sig, second_sig) = if first == self.keys.client_key.public_key {
            (client_sig, server_sig)
        } else {
            (server_sig, client_sig)
        };
        refund_tx.input[0].witness = tx::multisig_witness(
            &first_sig,
            &second_sig,
            &Script::from(witness_script),
        );
        Some(refund_tx)
    }
}

impl ChannelStateOps for V1ChannelState {
    fn initiate(
        &mut self,
        wallet: &dyn Wallet,
        properties: &ChannelProperties,
        user_key: Option<&[u8]>,
    ) -> Result<(), ChannelError> {
        let witness_script = tx::contract_witness_script_v1(self.keys.multisig_pubkeys());
        let script_pubkey: Script = tx::contract_script_pubkey(&witness_script).into();

        let mut contract_tx = wallet.build_funding_transaction(self.value_locked, script_pubkey)?;
        if let Some(hook) = &properties.modify_contract_send_request {
            hook(&mut contract_tx);
        }
        self.contract_tx = Some(contract_tx);

        let outpoint = self.contract_outpoint()?;
        let client_script: Script =
            tx::payout_script_for_pubkey(self.keys.client_key.public_key).into();
        let refund_tx = tx::build_refund_transaction(
            outpoint,
            client_script,
            self.value_locked,
            self.expire_time as u32,
        );
        let client_sig = wallet.sign(&refund_tx, &self.keys.client_key, user_key)?;
        self.refund_tx = Some(refund_tx);
        self.client_refund_signature = Some(client_sig);
        log::debug!("v1 channel initiated, refund pending server signature");
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
        let refund_tx = self
            .completed_refund_transaction()
            .or_else(|| self.refund_tx.clone())
            .ok_or(ChannelError::ChannelClosedOrUninitialized)?;
        let server_key = self.keys.server_key.ok_or(ChannelError::ChannelClosedOrUninitialized)?;
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
                version: 1,
                status: ChannelRecordStatus::Active,
            },
        );
        Ok(())
    }

    fn disconnect_from_channel(&mut self) {
        log::debug!("v1 channel disconnected from transport");
    }

    fn get_value_refunded(&self) -> u64 {
        self.value_locked
    }

    fn best_payment_client_change(&self) -> u64 {
        self.best_payment_client_change.unwrap_or(self.value_locked)
    }
}
