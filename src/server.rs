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

//! Server state machine: validates and countersigns the client's contract,
//! refund, and payment proposals, and decides settlement.

use std::cell::RefCell;

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::{OutPoint, PackedLockTime, Script, Transaction};
use parking_lot::ReentrantMutex;
use wallet::scripts::WitnessScript;

use crate::error::ChannelError;
use crate::keys::{LocalKey, ServerId};
use crate::lifecycle::ServerLifecycle;
use crate::message::{self, ChannelOpen, Close, Initiate, Message, PaymentAck, ReturnRefund, ServerVersion};
use crate::policy::ServerPolicy;
use crate::registry::{ChannelRecordStatus, StoredClientChannel};
use crate::tx;
use crate::wallet::{Connection, Wallet};

struct Inner {
    peer_id: ServerId,
    lifecycle: ServerLifecycle,
    policy: ServerPolicy,
    own_key: LocalKey,
    client_key: Option<PublicKey>,
    negotiated_major: u8,
    expire_time: u64,
    value_locked: u64,
    witness_script: Option<WitnessScript>,
    contract_tx: Option<Transaction>,
    refund_tx: Option<Transaction>,
    paid: u64,
    best_payment_sig: Option<Signature>,
    best_payment_client_change: Option<u64>,
}

/// Server side of a single channel with one client. Mirrors
/// [`crate::client::ClientChannel`]'s mutex discipline: every entry point
/// locks the same reentrant mutex for its duration.
pub struct ServerChannel {
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl ServerChannel {
    /// `peer_id` identifies the remote client the way `ServerId` identifies
    /// a remote server on the client side: an opaque, caller-assigned
    /// handle under which this channel's stored record is kept. The wire
    /// protocol carries no explicit peer identifier — the transport is
    /// expected to already know which client a connection belongs to.
    pub fn new(peer_id: ServerId, own_key: LocalKey, policy: ServerPolicy) -> Self {
        ServerChannel {
            inner: ReentrantMutex::new(RefCell::new(Inner {
                peer_id,
                lifecycle: ServerLifecycle::default(),
                policy,
                own_key,
                client_key: None,
                negotiated_major: 0,
                expire_time: 0,
                value_locked: 0,
                witness_script: None,
                contract_tx: None,
                refund_tx: None,
                paid: 0,
                best_payment_sig: None,
                best_payment_client_change: None,
            })),
        }
    }

    pub fn lifecycle(&self) -> ServerLifecycle {
        self.inner.lock().borrow().lifecycle
    }

    /// Enters `WaitClientVersion`. No message is emitted; the server only
    /// speaks once `ClientVersion` arrives.
    pub fn connection_open(&self) {
        let guard = self.inner.lock();
        guard.borrow_mut().lifecycle = ServerLifecycle::WaitClientVersion;
    }

    /// Dispatches an inbound message. `now` is the caller's wall-clock
    /// reading, used to compute `expire_time_secs` and to judge whether a
    /// resumption candidate's refund lock has not yet expired.
    pub fn receive(
        &self,
        message: Message,
        connection: &dyn Connection,
        wallet: &dyn Wallet,
        user_key: Option<&[u8]>,
        now: u64,
    ) -> Result<(), ChannelError> {
        let guard = self.inner.lock();
        let result = dispatch(&mut guard.borrow_mut(), message, connection, wallet, user_key, now);
        if let Err(ref err) = result {
            fail(&mut guard.borrow_mut(), connection, err.clone());
        }
        result
    }

    pub fn connection_closed(&self) {
        let guard = self.inner.lock();
        log::debug!("server {}: connection closed", guard.borrow().peer_id);
    }
}

fn fail(inner: &mut Inner, connection: &dyn Connection, err: ChannelError) {
    log::warn!("server {}: {}", inner.peer_id, err);
    connection.send_to_client(
        message::Error {
            code: err.to_error_code(),
            explanation: Some(err.to_string()),
            expected_value: None,
        }
        .into(),
    );
    connection.destroy_connection(err);
    inner.lifecycle = ServerLifecycle::ChannelClosed;
}

fn protocol_violation(inner: &Inner, message: &Message) -> ChannelError {
    ChannelError::ProtocolViolation {
        current: lifecycle_name(inner.lifecycle),
        received: message.kind(),
    }
}

fn lifecycle_name(lifecycle: ServerLifecycle) -> &'static str {
    match lifecycle {
        ServerLifecycle::WaitConnOpen => "WaitConnOpen",
        ServerLifecycle::WaitClientVersion => "WaitClientVersion",
        ServerLifecycle::WaitContract => "WaitContract",
        ServerLifecycle::ReadyForPayment => "ReadyForPayment",
        ServerLifecycle::ChannelOpen => "ChannelOpen",
        ServerLifecycle::ChannelClosed => "ChannelClosed",
    }
}

fn dispatch(
    inner: &mut Inner,
    message: Message,
    connection: &dyn Connection,
    wallet: &dyn Wallet,
    user_key: Option<&[u8]>,
    now: u64,
) -> Result<(), ChannelError> {
    match (inner.lifecycle, &message) {
        (ServerLifecycle::WaitClientVersion, Message::ClientVersion(payload)) => {
            on_client_version(inner, payload, connection, wallet, now)
        }

        (ServerLifecycle::WaitContract, Message::ProvideRefund(payload)) => {
            on_provide_refund(inner, payload, connection, wallet, user_key)
        }

        (ServerLifecycle::WaitContract, Message::ProvideContract(payload)) => {
            on_provide_contract(inner, payload, connection, wallet)
        }

        (ServerLifecycle::ChannelOpen, Message::UpdatePayment(payload)) => {
            on_update_payment(inner, payload, connection, wallet)
        }

        (ServerLifecycle::ChannelOpen, Message::Close(payload)) => {
            on_close(inner, payload, connection, wallet, user_key)
        }

        (_, Message::Error(_)) => {
            inner.lifecycle = ServerLifecycle::ChannelClosed;
            Ok(())
        }

        _ => Err(protocol_violation(inner, &message)),
    }
}

fn build_witness_script(inner: &Inner, client_key: PublicKey) -> WitnessScript {
    let pubkeys = tx::lex_order_pubkeys(inner.own_key.public_key, client_key);
    if inner.negotiated_major == 1 {
        tx::contract_witness_script_v1(pubkeys)
    } else {
        tx::contract_witness_script_v2(pubkeys, client_key, inner.expire_time as u32)
    }
}

fn contract_outpoint(
    contract_tx: &Transaction,
    witness_script: &WitnessScript,
    value_locked: u64,
) -> Result<OutPoint, ChannelError> {
    let script_pubkey: Script = tx::contract_script_pubkey(witness_script).into();
    let vout = contract_tx
        .output
        .iter()
        .position(|out| out.script_pubkey == script_pubkey && out.value == value_locked)
        .ok_or(ChannelError::BadTransaction {
            reason: "contract transaction has no matching multisig output".to_string(),
        })?;
    Ok(OutPoint { txid: contract_tx.txid(), vout: vout as u32 })
}

fn on_client_version(
    inner: &mut Inner,
    payload: &message::ClientVersion,
    connection: &dyn Connection,
    wallet: &dyn Wallet,
    now: u64,
) -> Result<(), ChannelError> {
    if !inner.policy.version_selector.accepts_major(payload.major) {
        return Err(ChannelError::NoAcceptableVersion);
    }
    inner.negotiated_major = payload.major;

    if payload.previous_channel_contract_hash.is_some() {
        if let Some(record) = wallet.get_usable_channel(inner.peer_id) {
            if now + inner.policy.safety_margin_secs < record.expire_time {
                inner.expire_time = record.expire_time;
                inner.value_locked = record.contract_tx.output.first().map(|o| o.value).unwrap_or(0);
                inner.negotiated_major = record.version;
                inner.paid = record.best_payment_value;
                inner.best_payment_sig = record.best_payment_sig;
                inner.best_payment_client_change =
                    record.best_payment_sig.map(|_| inner.value_locked.saturating_sub(inner.paid));
                inner.client_key = Some(record.counterparty_key);
                inner.witness_script = Some(build_witness_script(inner, record.counterparty_key));
                inner.contract_tx = Some(record.contract_tx);
                inner.refund_tx = Some(record.refund_tx);
                inner.lifecycle = ServerLifecycle::ReadyForPayment;
                connection.send_to_client(ServerVersion { major: inner.negotiated_major, minor: 0 }.into());
                inner.lifecycle = ServerLifecycle::ChannelOpen;
                connection.send_to_client(ChannelOpen.into());
                return Ok(());
            }
        }
    }

    connection.send_to_client(ServerVersion { major: inner.negotiated_major, minor: 0 }.into());
    inner.expire_time = now + payload.time_window_secs;
    inner.lifecycle = ServerLifecycle::WaitContract;
    connection.send_to_client(
        Initiate {
            multisig_key: inner.own_key.public_key,
            min_accepted_channel_size: inner.policy.min_accepted_channel_size,
            expire_time_secs: inner.expire_time,
            min_payment: inner.policy.min_payment,
        }
        .into(),
    );
    Ok(())
}

fn on_provide_refund(
    inner: &mut Inner,
    payload: &message::ProvideRefund,
    connection: &dyn Connection,
    wallet: &dyn Wallet,
    user_key: Option<&[u8]>,
) -> Result<(), ChannelError> {
    let refund_tx: Transaction =
        bitcoin::consensus::encode::deserialize(&payload.refund_tx_bytes).map_err(|_| {
            ChannelError::BadTransaction {
                reason: "refund transaction does not parse".to_string(),
            }
        })?;
    if refund_tx.output.len() != 1 {
        return Err(ChannelError::BadTransaction {
            reason: "refund transaction must have exactly one output".to_string(),
        });
    }
    if refund_tx.lock_time.0 < inner.expire_time as u32 {
        return Err(ChannelError::BadTransaction {
            reason: "refund transaction locktime precedes the agreed expiry".to_string(),
        });
    }
    let expected_client_script: Script = tx::payout_script_for_pubkey(payload.multisig_key).into();
    if expected_client_script != refund_tx.output[0].script_pubkey {
        return Err(ChannelError::BadTransaction {
            reason: "refund transaction does not pay the client's own key".to_string(),
        });
    }

    inner.client_key = Some(payload.multisig_key);
    let witness_script = build_witness_script(inner, payload.multisig_key);
    let refund_value = refund_tx.output[0].value;
    let signature = wallet.sign(&refund_tx, &inner.own_key, user_key)?;

    inner.witness_script = Some(witness_script);
    inner.refund_tx = Some(refund_tx);
    inner.value_locked = refund_value;

    connection.send_to_client(ReturnRefund { signature }.into());
    Ok(())
}

fn on_provide_contract(
    inner: &mut Inner,
    payload: &message::ProvideContract,
    connection: &dyn Connection,
    wallet: &dyn Wallet,
) -> Result<(), ChannelError> {
    if let Some(client_key) = payload.client_key {
        inner.client_key = Some(client_key);
    }
    let client_key = inner
        .client_key
        .ok_or(ChannelError::ChannelClosedOrUninitialized)?;

    let contract_tx: Transaction =
        bitcoin::consensus::encode::deserialize(&payload.contract_tx_bytes).map_err(|_| {
            ChannelError::BadTransaction {
                reason: "contract transaction does not parse".to_string(),
            }
        })?;

    let witness_script = build_witness_script(inner, client_key);
    let script_pubkey: Script = tx::contract_script_pubkey(&witness_script).into();
    let funded = contract_tx.output.iter().find(|out| out.script_pubkey == script_pubkey);
    let value_locked = match funded {
        Some(out) if out.value >= inner.policy.min_accepted_channel_size => out.value,
        Some(out) => {
            return Err(ChannelError::ChannelValueTooLarge {
                contract_value: out.value,
                min_accepted_channel_size: inner.policy.min_accepted_channel_size,
                missing: inner.policy.min_accepted_channel_size - out.value,
            })
        }
        None => {
            return Err(ChannelError::BadTransaction {
                reason: "contract transaction funds no matching multisig output".to_string(),
            })
        }
    };
    if value_locked > inner.policy.max_channel_size {
        return Err(ChannelError::ValueOutOfRange {
            reason: "contract value exceeds the maximum channel size this server accepts".to_string(),
        });
    }
    if payload.initial_payment > value_locked {
        return Err(ChannelError::ValueOutOfRange {
            reason: "initial payment exceeds locked value".to_string(),
        });
    }

    wallet.broadcast(&contract_tx)?;

    inner.witness_script = Some(witness_script);
    inner.value_locked = value_locked;
    inner.contract_tx = Some(contract_tx.clone());
    inner.paid = payload.initial_payment;
    inner.lifecycle = ServerLifecycle::ChannelOpen;

    wallet.store_channel(
        inner.peer_id,
        StoredClientChannel {
            server_id: inner.peer_id,
            contract_tx,
            refund_tx: inner.refund_tx.clone().unwrap_or_else(empty_placeholder_tx),
            best_payment_sig: None,
            best_payment_value: inner.paid,
            expire_time: inner.expire_time,
            counterparty_key: client_key,
            client_key_encrypted: Vec::new(),
            version: inner.negotiated_major,
            status: ChannelRecordStatus::Active,
        },
    );

    connection.send_to_client(ChannelOpen.into());
    Ok(())
}

fn empty_placeholder_tx() -> Transaction {
    Transaction { version: 2, lock_time: PackedLockTime(0), input: vec![], output: vec![] }
}

fn on_update_payment(
    inner: &mut Inner,
    payload: &message::UpdatePayment,
    connection: &dyn Connection,
    wallet: &dyn Wallet,
) -> Result<(), ChannelError> {
    let client_key = inner
        .client_key
        .ok_or(ChannelError::ChannelClosedOrUninitialized)?;
    let contract_tx = inner
        .contract_tx
        .clone()
        .ok_or(ChannelError::ChannelClosedOrUninitialized)?;
    let witness_script = inner
        .witness_script
        .clone()
        .ok_or(ChannelError::ChannelClosedOrUninitialized)?;
    let outpoint = contract_outpoint(&contract_tx, &witness_script, inner.value_locked)?;

    let new_paid = inner.value_locked.saturating_sub(payload.client_change_value);
    if new_paid < inner.paid {
        return Err(ChannelError::BadTransaction {
            reason: "payment amount decreased, violating monotonicity".to_string(),
        });
    }
    if new_paid < inner.paid + inner.policy.min_payment && payload.client_change_value != 0 {
        return Err(ChannelError::BadTransaction {
            reason: "payment increment is below the required minimum".to_string(),
        });
    }

    let server_script: Script = tx::payout_script_for_pubkey(inner.own_key.public_key).into();
    let client_script: Script = tx::payout_script_for_pubkey(client_key).into();
    let payment_tx = tx::build_payment_transaction(
        outpoint,
        server_script,
        new_paid,
        client_script,
        payload.client_change_value,
    );

    let witness_script_bare = Script::from(witness_script);
    let secp = Secp256k1::verification_only();
    tx::verify_segwit_signature(
        &secp,
        &payment_tx,
        0,
        &witness_script_bare,
        inner.value_locked,
        &client_key,
        &payload.signature,
    )
    .map_err(|_| ChannelError::BadTransaction {
        reason: "payment signature does not verify".to_string(),
    })?;

    inner.paid = new_paid;
    inner.best_payment_sig = Some(payload.signature);
    inner.best_payment_client_change = Some(payload.client_change_value);

    wallet.store_channel(
        inner.peer_id,
        StoredClientChannel {
            server_id: inner.peer_id,
            contract_tx,
            refund_tx: inner.refund_tx.clone().unwrap_or_else(empty_placeholder_tx),
            best_payment_sig: inner.best_payment_sig,
            best_payment_value: inner.paid,
            expire_time: inner.expire_time,
            counterparty_key: client_key,
            client_key_encrypted: Vec::new(),
            version: inner.negotiated_major,
            status: ChannelRecordStatus::Active,
        },
    );

    connection.send_to_client(PaymentAck { info: payload.info.clone() }.into());
    Ok(())
}

fn on_close(
    inner: &mut Inner,
    _payload: &Close,
    connection: &dyn Connection,
    wallet: &dyn Wallet,
    user_key: Option<&[u8]>,
) -> Result<(), ChannelError> {
    let settlement_tx_bytes = match (
        inner.best_payment_sig,
        inner.best_payment_client_change,
        inner.contract_tx.clone(),
        inner.client_key,
        inner.witness_script.clone(),
    ) {
        (Some(client_sig), Some(client_change), Some(contract_tx), Some(client_key), Some(witness_script)) => {
            let outpoint = contract_outpoint(&contract_tx, &witness_script, inner.value_locked)?;
            let server_script: Script = tx::payout_script_for_pubkey(inner.own_key.public_key).into();
            let client_script: Script = tx::payout_script_for_pubkey(client_key).into();
            let mut settlement_tx = tx::build_payment_transaction(
                outpoint,
                server_script,
                inner.paid,
                client_script,
                client_change,
            );
            let server_sig = wallet.sign(&settlement_tx, &inner.own_key, user_key)?;
            let witness_script_bare = Script::from(witness_script);
            let pubkeys = tx::lex_order_pubkeys(inner.own_key.public_key, client_key);
            let (first_sig, second_sig) = if pubkeys.0 == inner.own_key.public_key {
                (server_sig, client_sig)
            } else {
                (client_sig, server_sig)
            };
            settlement_tx.input[0].witness =
                tx::multisig_witness(&first_sig, &second_sig, &witness_script_bare);
            wallet.broadcast(&settlement_tx)?;
            wallet.store_channel(
                inner.peer_id,
                StoredClientChannel {
                    server_id: inner.peer_id,
                    contract_tx,
                    refund_tx: inner.refund_tx.clone().unwrap_or_else(empty_placeholder_tx),
                    best_payment_sig: Some(client_sig),
                    best_payment_value: inner.paid,
                    expire_time: inner.expire_time,
                    counterparty_key: client_key,
                    client_key_encrypted: Vec::new(),
                    version: inner.negotiated_major,
                    status: ChannelRecordStatus::AwaitingConfirmation,
                },
            );
            Some(bitcoin::consensus::encode::serialize(&settlement_tx))
        }
        _ => None,
    };

    connection.send_to_client(Close { settlement_tx: settlement_tx_bytes }.into());
    inner.lifecycle = ServerLifecycle::ChannelClosed;
    Ok(())
}
