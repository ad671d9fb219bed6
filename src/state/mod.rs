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

//! Channel state: the two contract variants and the shared
//! capability set both expose, behind a single tagged-union facade.
//!
//! V1 (`pre-signed refund`) and V2 (`time-locked multisig`) differ only
//! in how the refund path is constructed and enforced; everything else —
//! incrementing payment, persisting, reporting value — is identical, so
//! they share one trait and the channel-holding structs never need to
//! match on version themselves.

mod v1;
mod v2;

pub use v1::V1ChannelState;
pub use v2::V2ChannelState;

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::Transaction;

use crate::error::ChannelError;
use crate::keys::{ChannelKeys, ServerId};
use crate::policy::ChannelProperties;
use crate::registry::StoredClientChannel;
use crate::wallet::Wallet;

/// Result of a successful [`ChannelStateOps::increment_payment_by`] call:
/// the newly signed payment transaction's signature and the actual
/// increment applied (may exceed the requested increment if dust
/// adjustment rounded the client's change down to zero).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IncrementedPayment {
    pub signature: Signature,
    pub amount: u64,
}

/// Operations shared by both contract variants. Methods that exist only
/// for V1 (the refund round-trip with the server) live directly on
/// [`V1ChannelState`] rather than here, since V2 has no counterpart.
pub trait ChannelStateOps {
    /// Negotiates and builds the on-chain contract transaction, locking
    /// `value_locked` sats into the 2-of-2 output, via the attached
    /// wallet. Must be called exactly once, before any payment increment.
    fn initiate(
        &mut self,
        wallet: &dyn Wallet,
        properties: &ChannelProperties,
        user_key: Option<&[u8]>,
    ) -> Result<(), ChannelError>;

    /// Builds, signs, and records a new payment transaction paying the
    /// server a cumulative `amount` sats (i.e. `amount - self.paid()`
    /// more than the previous best payment), applying dust-adjustment to
    /// the client's change output.
    fn increment_payment_by(
        &mut self,
        wallet: &dyn Wallet,
        amount: u64,
        user_key: Option<&[u8]>,
    ) -> Result<IncrementedPayment, ChannelError>;

    /// The serialized contract transaction, once known.
    fn get_contract(&self) -> Option<Vec<u8>>;

    /// Whether `tx` is a transaction that would settle this channel (the
    /// contract's funding output spent by either the refund or the
    /// latest payment transaction).
    fn is_settlement_transaction(&self, tx: &Transaction) -> bool;

    /// Persists this channel's current state to the wallet's stored
    /// channel registry.
    fn store_channel_in_wallet(
        &self,
        wallet: &dyn Wallet,
        server_id: ServerId,
    ) -> Result<(), ChannelError>;

    /// Releases any resources tied to the connection (but not the
    /// channel itself, which remains spendable via its refund path).
    fn disconnect_from_channel(&mut self);

    /// The value, in satoshis, the client would recover by broadcasting
    /// the refund transaction right now.
    fn get_value_refunded(&self) -> u64;

    /// The client change value of the latest signed payment transaction
    /// (or the full locked value if no payment has been signed yet),
    /// carried verbatim in the next `UpdatePayment.client_change_value`.
    fn best_payment_client_change(&self) -> u64;
}

/// The channel state behind a single client-facing type, dispatching to
/// whichever contract variant was negotiated.
pub enum ChannelState {
    V1(V1ChannelState),
    V2(V2ChannelState),
}

impl ChannelState {
    pub fn version(&self) -> u8 {
        match self {
            ChannelState::V1(_) => 1,
            ChannelState::V2(_) => 2,
        }
    }

    pub fn as_v1(&self) -> Option<&V1ChannelState> {
        match self {
            ChannelState::V1(state) => Some(state),
            ChannelState::V2(_) => None,
        }
    }

    pub fn as_v1_mut(&mut self) -> Option<&mut V1ChannelState> {
        match self {
            ChannelState::V1(state) => Some(state),
            ChannelState::V2(_) => None,
        }
    }

    pub fn as_v2(&self) -> Option<&V2ChannelState> {
        match self {
            ChannelState::V2(state) => Some(state),
            ChannelState::V1(_) => None,
        }
    }

    /// Rebuilds state from a resumed [`StoredClientChannel`] record,
    /// dispatching to whichever contract variant `record.version` names.
    /// `keys` must already carry the counterparty's multisig key (callers
    /// resume it from `record.counterparty_key` themselves, since they
    /// also need it to decide whether to trust the resumption at all).
    pub fn from_stored(record: &StoredClientChannel, keys: ChannelKeys, value_locked: u64) -> Self {
        let client_change = record
            .best_payment_sig
            .map(|_| value_locked.saturating_sub(record.best_payment_value));
        match record.version {
            1 => ChannelState::V1(V1ChannelState::from_stored(
                keys,
                value_locked,
                record.expire_time,
                record.contract_tx.clone(),
                record.refund_tx.clone(),
                record.best_payment_value,
                record.best_payment_sig,
                client_change,
            )),
            _ => ChannelState::V2(V2ChannelState::from_stored(
                keys,
                value_locked,
                record.expire_time,
                record.contract_tx.clone(),
                record.best_payment_value,
                record.best_payment_sig,
                client_change,
            )),
        }
    }
}

impl ChannelStateOps for ChannelState {
    fn initiate(
        &mut self,
        wallet: &dyn Wallet,
        properties: &ChannelProperties,
        user_key: Option<&[u8]>,
    ) -> Result<(), ChannelError> {
        match self {
            ChannelState::V1(state) => state.initiate(wallet, properties, user_key),
            ChannelState::V2(state) => state.initiate(wallet, properties, user_key),
        }
    }

    fn increment_payment_by(
        &mut self,
        wallet: &dyn Wallet,
        amount: u64,
        user_key: Option<&[u8]>,
    ) -> Result<IncrementedPayment, ChannelError> {
        match self {
            ChannelState::V1(state) => state.increment_payment_by(wallet, amount, user_key),
            ChannelState::V2(state) => state.increment_payment_by(wallet, amount, user_key),
        }
    }

    fn get_contract(&self) -> Option<Vec<u8>> {
        match self {
            ChannelState::V1(state) => state.get_contract(),
            ChannelState::V2(state) => state.get_contract(),
        }
    }

    fn is_settlement_transaction(&self, tx: &Transaction) -> bool {
        match self {
            ChannelState::V1(state) => state.is_settlement_transaction(tx),
            ChannelState::V2(state) => state.is_settlement_transaction(tx),
        }
    }

    fn store_channel_in_wallet(
        &self,
        wallet: &dyn Wallet,
        server_id: ServerId,
    ) -> Result<(), ChannelError> {
        match self {
            ChannelState::V1(state) => state.store_channel_in_wallet(wallet, server_id),
            ChannelState::V2(state) => state.store_channel_in_wallet(wallet, server_id),
        }
    }

    fn disconnect_from_channel(&mut self) {
        match self {
            ChannelState::V1(state) => state.disconnect_from_channel(),
            ChannelState::V2(state) => state.disconnect_from_channel(),
        }
    }

    fn get_value_refunded(&self) -> u64 {
        match self {
            ChannelState::V1(state) => state.get_value_refunded(),
            ChannelState::V2(state) => state.get_value_refunded(),
        }
    }

    fn best_payment_client_change(&self) -> u64 {
        match self {
            ChannelState::V1(state) => state.best_payment_client_change(),
            ChannelState::V2(state) => state.best_payment_client_change(),
        }
    }
}

/// Given the contract's locked value, the previously paid amount, the
/// newly requested increment, and an estimated fee, computes the
/// server/client output split for the next payment transaction, rounding
/// the client's change down to zero rather than leaving a dust output.
pub(crate) fn split_payment_outputs(
    value_locked: u64,
    new_paid: u64,
    estimated_fee: u64,
) -> (u64, u64) {
    let client_change = value_locked
        .saturating_sub(new_paid)
        .saturating_sub(estimated_fee);
    if client_change < crate::tx::DUST_LIMIT_SATS {
        (value_locked.saturating_sub(estimated_fee), 0)
    } else {
        (new_paid, client_change)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dust_change_rounds_up_to_server() {
        let (server_value, client_change) = split_payment_outputs(1_000_000, 999_600, 0);
        assert_eq!(client_change, 0);
        assert_eq!(server_value, 1_000_000);
    }

    #[test]
    fn scenario_c_dust_rounding_matches_spec_example() {
        // old_paid = 500, requested delta = V_locked - 500 - dust_limit + 1.
        let value_locked = 1_000_000u64;
        let old_paid = 500u64;
        let delta = value_locked - old_paid - crate::tx::DUST_LIMIT_SATS + 1;
        let requested_new_paid = old_paid + delta;
        let (server_value, client_change) =
            split_payment_outputs(value_locked, requested_new_paid, 0);
        assert_eq!(client_change, 0);
        let actual_increment = server_value - old_paid;
        assert_eq!(actual_increment - delta, crate::tx::DUST_LIMIT_SATS - 1);
    }

    #[test]
    fn above_dust_change_is_kept() {
        let (server_value, client_change) = split_payment_outputs(1_000_000, 500_000, 500);
        assert_eq!(server_value, 500_000);
        assert_eq!(client_change, 499_500);
    }
}
