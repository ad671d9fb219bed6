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

//! External collaborator interfaces: the transport `Connection` callback
//! and the `Wallet` the core is attached to. Both are consumed, never
//! implemented, by this crate — key management, broadcast, and network
//! transport live outside the core.

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::{Script, Transaction};

use crate::error::ChannelError;
use crate::keys::{LocalKey, ServerId};
use crate::message::Message;
use crate::registry::StoredClientChannel;

/// Transport callback the state machines drive. Implemented by whatever
/// owns the reliable, ordered, full-duplex byte stream to the peer.
pub trait Connection {
    /// Sends `message` to the server. Fire-and-forget; the transport must
    /// deliver messages in order.
    fn send_to_server(&self, message: Message);

    /// Sends `message` to the client.
    fn send_to_client(&self, message: Message);

    /// Tears down the transport. A subsequent `connection_closed()` call
    /// into the state machine is still expected once teardown completes.
    fn destroy_connection(&self, reason: ChannelError);

    /// Client-side notification that the channel is now usable for
    /// payments. `was_initiated` is `false` when this is a resumed
    /// channel rather than a freshly negotiated one.
    fn channel_open(&self, was_initiated: bool);

    /// Caller-supplied policy deciding whether a proposed refund lock
    /// time is acceptable.
    fn accept_expire_time(&self, expire_time: u64) -> bool;
}

/// The wallet the channel core is attached to. Owns key material, the
/// stored-channel registry, and chain broadcast.
pub trait Wallet {
    /// Persists (inserts or updates) a stored channel record.
    fn store_channel(&self, server_id: ServerId, record: StoredClientChannel);

    /// Returns the channel for `server_id` if one is stored and its
    /// refund lock has not yet expired (minus the safety margin).
    fn get_usable_channel(
        &self,
        server_id: ServerId,
    ) -> Option<StoredClientChannel>;

    /// Selects inputs and constructs an unsigned (for the multisig
    /// output) funding transaction locking `locked_value` sats into
    /// `script_pubkey`, with wallet-owned inputs already signed and any
    /// change returned to a wallet-owned address.
    fn build_funding_transaction(
        &self,
        locked_value: u64,
        script_pubkey: Script,
    ) -> Result<Transaction, ChannelError>;

    /// Signs `tx`'s designated multisig input with `key`. Requires
    /// `user_key` when [`Wallet::is_encrypted`] is `true`; returns
    /// [`ChannelError::KeyIsEncrypted`] synchronously if it is required
    /// but absent.
    fn sign(
        &self,
        tx: &Transaction,
        key: &LocalKey,
        user_key: Option<&[u8]>,
    ) -> Result<Signature, ChannelError>;

    /// Broadcasts `tx` to the network.
    fn broadcast(&self, tx: &Transaction) -> Result<(), ChannelError>;

    /// Hands a transaction the wallet did not originate (e.g. a server's
    /// settlement transaction) to the wallet as pending, so it is
    /// reflected in the wallet's balance once it confirms.
    fn receive_pending(&self, tx: Transaction) -> Result<(), ChannelError>;

    /// Whether signing operations require a caller-supplied key.
    fn is_encrypted(&self) -> bool;
}
