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

//! Client state machine: drives the client side of the handshake,
//! payment increments, and settlement.

use std::cell::RefCell;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use parking_lot::ReentrantMutex;

use crate::error::ChannelError;
use crate::keys::{ChannelKeys, LocalKey, ServerId};
use crate::lifecycle::ClientLifecycle;
use crate::message::{self, ClientVersion, Message, ProvideContract, ProvideRefund, UpdatePayment};
use crate::policy::ChannelProperties;
use crate::state::{ChannelState, ChannelStateOps, V1ChannelState, V2ChannelState};
use crate::wallet::{Connection, Wallet};

/// Outcome of a previously issued [`ClientChannel::increment_payment`]
/// call, delivered once the matching `PaymentAck` (or a failure) arrives.
#[derive(Clone, Debug)]
pub enum PaymentOutcome {
    Acked { actual: u64, info: Option<Vec<u8>> },
    Failed(ChannelError),
}

/// One-shot handle returned by [`ClientChannel::increment_payment`].
/// Resolved outside the channel's mutex, so chaining another
/// `increment_payment` from within the resolution callback cannot
/// self-deadlock.
pub struct PaymentHandle {
    receiver: Receiver<PaymentOutcome>,
}

impl PaymentHandle {
    /// Blocks until the payment resolves.
    pub fn wait(self) -> PaymentOutcome {
        self.receiver
            .recv()
            .unwrap_or_else(|_| PaymentOutcome::Failed(ChannelError::ChannelClosedOrUninitialized))
    }

    /// Non-blocking poll; `None` if still in flight.
    pub fn poll(&self) -> Option<PaymentOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(PaymentOutcome::Failed(ChannelError::ChannelClosedOrUninitialized))
            }
        }
    }
}

struct Inner {
    server_id: ServerId,
    lifecycle: ClientLifecycle,
    properties: ChannelProperties,
    keys: ChannelKeys,
    value_locked: u64,
    negotiated_major: u8,
    requested_resumption: bool,
    pending_min_payment: u64,
    state: Option<ChannelState>,
    pending_payment: Option<(Sender<PaymentOutcome>, u64, Option<Vec<u8>>)>,
}

/// Client side of a single micropayment channel to one server. Every
/// entry point locks the same reentrant mutex for its duration, mirroring
/// the per-channel cooperative scheduling model: concurrent calls from
/// multiple threads serialize, but a callback invoked synchronously from
/// within an entry point (e.g. `Connection::channel_open`) may safely
/// call back into this channel without deadlocking.
pub struct ClientChannel {
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl ClientChannel {
    pub fn new(
        server_id: ServerId,
        client_key: LocalKey,
        value_locked: u64,
        properties: ChannelProperties,
    ) -> Self {
        ClientChannel {
            inner: ReentrantMutex::new(RefCell::new(Inner {
                server_id,
                lifecycle: ClientLifecycle::default(),
                properties,
                keys: ChannelKeys::new(client_key),
                value_locked,
                negotiated_major: 0,
                requested_resumption: false,
                pending_min_payment: 0,
                state: None,
                pending_payment: None,
            })),
        }
    }

    pub fn lifecycle(&self) -> ClientLifecycle {
        self.inner.lock().borrow().lifecycle
    }

    pub fn server_id(&self) -> ServerId {
        self.inner.lock().borrow().server_id
    }

    /// Enters `WaitVersion` and emits `ClientVersion`, requesting
    /// resumption if this object already remembers an open channel with
    /// this server.
    pub fn connection_open(&self, connection: &dyn Connection, wallet: &dyn Wallet) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        let previous_channel_contract_hash = inner.state.as_ref().and_then(|state| {
            state
                .get_contract()
                .map(|bytes| bitcoin::hashes::sha256d::Hash::hash(&bytes).into_inner())
        });
        inner.requested_resumption = previous_channel_contract_hash.is_some()
            && wallet.get_usable_channel(inner.server_id).is_some();

        inner.lifecycle = ClientLifecycle::WaitVersion;
        let major = inner.properties.version_selector.requested_major();
        let time_window_secs = inner.properties.time_window_secs;
        log::debug!("client {}: opening connection, requesting major {}", inner.server_id, major);
        connection.send_to_server(
            ClientVersion {
                major,
                minor: 0,
                time_window_secs,
                previous_channel_contract_hash,
            }
            .into(),
        );
    }

    /// Dispatches an inbound message according to the current lifecycle
    /// state. `user_key` is forwarded to the wallet whenever this call
    /// needs to sign something.
    pub fn receive(
        &self,
        message: Message,
        connection: &dyn Connection,
        wallet: &dyn Wallet,
        user_key: Option<&[u8]>,
    ) -> Result<(), ChannelError> {
        let guard = self.inner.lock();
        let result = dispatch(&mut guard.borrow_mut(), message, connection, wallet, user_key);
        if let Err(ref err) = result {
            fail(&mut guard.borrow_mut(), connection, err.clone());
        }
        result
    }

    /// Requests a new cumulative payment `guard.paid + size` sat. Fails
    /// synchronously if a payment is already in flight or the channel
    /// isn't open; otherwise signs and emits `UpdatePayment` and returns
    /// a handle resolved by the matching `PaymentAck`.
    pub fn increment_payment(
        &self,
        size: u64,
        info: Option<Vec<u8>>,
        connection: &dyn Connection,
        wallet: &dyn Wallet,
        user_key: Option<&[u8]>,
    ) -> Result<PaymentHandle, ChannelError> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        if inner.lifecycle != ClientLifecycle::ChannelOpen || inner.pending_payment.is_some() {
            return Err(ChannelError::ChannelClosedOrUninitialized);
        }
        let state = inner
            .state
            .as_mut()
            .ok_or(ChannelError::ChannelClosedOrUninitialized)?;
        let incremented = state.increment_payment_by(wallet, size, user_key)?;
        let client_change_value = state.best_payment_client_change();

        let (sender, receiver) = mpsc::channel();
        inner.pending_payment = Some((sender, incremented.amount, info.clone()));
        connection.send_to_server(
            UpdatePayment {
                signature: incremented.signature,
                client_change_value,
                info,
            }
            .into(),
        );
        Ok(PaymentHandle { receiver })
    }

    /// Requests settlement. Illegal while a payment is in flight.
    pub fn settle(&self, connection: &dyn Connection) -> Result<(), ChannelError> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.lifecycle != ClientLifecycle::ChannelOpen || inner.pending_payment.is_some() {
            return Err(ChannelError::ChannelClosedOrUninitialized);
        }
        inner.lifecycle = ClientLifecycle::WaitChannelClose;
        connection.send_to_server(message::Close { settlement_tx: None }.into());
        Ok(())
    }

    /// Unlinks from the (already torn down) transport without destroying
    /// the persisted channel record.
    pub fn connection_closed(&self) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if let Some(state) = inner.state.as_mut() {
            state.disconnect_from_channel();
        }
    }
}

fn fail(inner: &mut Inner, connection: &dyn Connection, err: ChannelError) {
    log::warn!("client {}: {}", inner.server_id, err);
    connection.send_to_server(
        message::Error {
            code: err.to_error_code(),
            explanation: Some(err.to_string()),
            expected_value: None,
        }
        .into(),
    );
    connection.destroy_connection(err.clone());
    if let Some((sender, _, _)) = inner.pending_payment.take() {
        let _ = sender.send(PaymentOutcome::Failed(err));
    }
    inner.lifecycle = ClientLifecycle::ChannelClosed;
}

fn protocol_violation(inner: &Inner, message: &Message) -> ChannelError {
    ChannelError::ProtocolViolation {
        current: lifecycle_name(inner.lifecycle),
        received: message.kind(),
    }
}

fn lifecycle_name(lifecycle: ClientLifecycle) -> &'static str {
    match lifecycle {
        ClientLifecycle::WaitConnOpen => "WaitConnOpen",
        ClientLifecycle::WaitVersion => "WaitVersion",
        ClientLifecycle::WaitInitiate => "WaitInitiate",
        ClientLifecycle::WaitRefundReturn => "WaitRefundReturn",
        ClientLifecycle::WaitChannelOpen => "WaitChannelOpen",
        ClientLifecycle::ChannelOpen => "ChannelOpen",
        ClientLifecycle::WaitChannelClose => "WaitChannelClose",
        ClientLifecycle::ChannelClosed => "ChannelClosed",
    }
}

fn dispatch(
    inner: &mut Inner,
    message: Message,
    connection: &dyn Connection,
    wallet: &dyn Wallet,
    user_key: Option<&[u8]>,
) -> Result<(), ChannelError> {
    match (inner.lifecycle, &message) {
        (ClientLifecycle::WaitVersion, Message::ServerVersion(payload)) => {
            if !inner.properties.version_selector.accepts_major(payload.major) {
                return Err(ChannelError::NoAcceptableVersion);
            }
            inner.negotiated_major = payload.major;
            inner.lifecycle = ClientLifecycle::WaitInitiate;
            Ok(())
        }

        (ClientLifecycle::WaitInitiate, Message::Initiate(payload)) => {
            on_initiate(inner, payload, connection, wallet, user_key)
        }

        (ClientLifecycle::WaitInitiate, Message::ChannelOpen(_)) => {
            on_resumed_channel_open(inner, connection, wallet, &message)
        }

        (ClientLifecycle::WaitRefundReturn, Message::ReturnRefund(payload)) => {
            on_return_refund(inner, payload.signature, connection, wallet, user_key)
        }

        (ClientLifecycle::WaitChannelOpen, Message::ChannelOpen(_)) => {
            inner.lifecycle = ClientLifecycle::ChannelOpen;
            connection.channel_open(true);
            Ok(())
        }

        (ClientLifecycle::ChannelOpen, Message::PaymentAck(payload)) => {
            let (sender, actual, _) = inner
                .pending_payment
                .take()
                .ok_or_else(|| protocol_violation(inner, &message))?;
            let _ = sender.send(PaymentOutcome::Acked {
                actual,
                info: payload.info.clone(),
            });
            Ok(())
        }

        (ClientLifecycle::ChannelOpen, Message::Close(payload))
        | (ClientLifecycle::WaitChannelClose, Message::Close(payload)) => {
            on_close(inner, payload, wallet)
        }

        (_, Message::Error(payload)) => {
            let remote = ChannelError::RemoteError {
                code: payload.code,
                explanation: payload.explanation.clone().unwrap_or_default(),
            };
            if let Some((sender, _, _)) = inner.pending_payment.take() {
                let _ = sender.send(PaymentOutcome::Failed(remote.clone()));
            }
            inner.lifecycle = ClientLifecycle::ChannelClosed;
            Err(remote)
        }

        _ => Err(protocol_violation(inner, &message)),
    }
}

/// Resumption shortcut: the server skipped `Initiate` and jumped straight
/// to `ChannelOpen`, so state is rebuilt from the wallet's own stored
/// record rather than a fresh `initiate()` round-trip.
fn on_resumed_channel_open(
    inner: &mut Inner,
    connection: &dyn Connection,
    wallet: &dyn Wallet,
    message: &Message,
) -> Result<(), ChannelError> {
    if !inner.requested_resumption {
        return Err(protocol_violation(inner, message));
    }
    let record = wallet
        .get_usable_channel(inner.server_id)
        .ok_or_else(|| protocol_violation(inner, message))?;

    inner.keys = inner.keys.clone().with_server_key(record.counterparty_key);
    inner.negotiated_major = record.version;
    inner.state = Some(ChannelState::from_stored(&record, inner.keys.clone(), inner.value_locked));
    inner.lifecycle = ClientLifecycle::ChannelOpen;
    connection.channel_open(false);
    Ok(())
}

fn on_initiate(
    inner: &mut Inner,
    payload: &message::Initiate,
    connection: &dyn Connection,
    wallet: &dyn Wallet,
    user_key: Option<&[u8]>,
) -> Result<(), ChannelError> {
    if !connection.accept_expire_time(payload.expire_time_secs) {
        return Err(ChannelError::TimeWindowUnacceptable {
            expire_time: payload.expire_time_secs,
        });
    }
    if inner.value_locked < payload.min_accepted_channel_size {
        return Err(ChannelError::ChannelValueTooLarge {
            contract_value: inner.value_locked,
            min_accepted_channel_size: payload.min_accepted_channel_size,
            missing: payload.min_accepted_channel_size - inner.value_locked,
        });
    }
    crate::policy::validate_min_payment(payload.min_payment, inner.properties.acceptable_min_payment)?;

    inner.keys = inner.keys.clone().with_server_key(payload.multisig_key);
    inner.pending_min_payment = payload.min_payment;

    let mut state = match inner.negotiated_major {
        1 => ChannelState::V1(V1ChannelState::new(
            inner.keys.clone(),
            inner.value_locked,
            payload.expire_time_secs,
        )),
        _ => ChannelState::V2(V2ChannelState::new(
            inner.keys.clone(),
            inner.value_locked,
            payload.expire_time_secs,
        )),
    };
    state.initiate(wallet, &inner.properties, user_key)?;

    if state.version() == 1 {
        let refund_tx_bytes = state
            .as_v1()
            .and_then(|v1| v1.get_incomplete_refund_transaction())
            .ok_or(ChannelError::ChannelClosedOrUninitialized)?;
        let client_key = inner.keys.client_key.public_key;
        inner.state = Some(state);
        inner.lifecycle = ClientLifecycle::WaitRefundReturn;
        connection.send_to_server(
            ProvideRefund {
                multisig_key: client_key,
                refund_tx_bytes,
            }
            .into(),
        );
        return Ok(());
    }

    state.store_channel_in_wallet(wallet, inner.server_id)?;
    let incremented = state.increment_payment_by(wallet, payload.min_payment, user_key)?;
    let contract_tx_bytes = state.get_contract().ok_or(ChannelError::ChannelClosedOrUninitialized)?;
    let client_key = inner.keys.client_key.public_key;
    inner.state = Some(state);
    inner.lifecycle = ClientLifecycle::WaitChannelOpen;
    connection.send_to_server(
        ProvideContract {
            contract_tx_bytes,
            client_key: Some(client_key),
            initial_payment: incremented.amount,
        }
        .into(),
    );
    Ok(())
}

fn on_return_refund(
    inner: &mut Inner,
    signature: bitcoin::secp256k1::ecdsa::Signature,
    connection: &dyn Connection,
    wallet: &dyn Wallet,
    user_key: Option<&[u8]>,
) -> Result<(), ChannelError> {
    let state = inner
        .state
        .as_mut()
        .ok_or(ChannelError::ChannelClosedOrUninitialized)?;
    let v1 = state.as_v1_mut().ok_or(ChannelError::ChannelClosedOrUninitialized)?;
    v1.provide_refund_signature(signature)?;
    state.store_channel_in_wallet(wallet, inner.server_id)?;

    let min_payment = inner.pending_min_payment;
    let incremented = state.increment_payment_by(wallet, min_payment, user_key)?;
    let contract_tx_bytes = state.get_contract().ok_or(ChannelError::ChannelClosedOrUninitialized)?;
    inner.lifecycle = ClientLifecycle::WaitChannelOpen;
    connection.send_to_server(
        ProvideContract {
            contract_tx_bytes,
            client_key: None,
            initial_payment: incremented.amount,
        }
        .into(),
    );
    Ok(())
}

fn on_close(
    inner: &mut Inner,
    payload: &message::Close,
    wallet: &dyn Wallet,
) -> Result<(), ChannelError> {
    if let Some(settlement_bytes) = &payload.settlement_tx {
        let tx: bitcoin::Transaction =
            bitcoin::consensus::encode::deserialize(settlement_bytes).map_err(|_| {
                ChannelError::BadTransaction {
                    reason: "settlement transaction does not parse".to_string(),
                }
            })?;
        let state = inner
            .state
            .as_ref()
            .ok_or(ChannelError::ChannelClosedOrUninitialized)?;
        if !state.is_settlement_transaction(&tx) {
            return Err(ChannelError::BadTransaction {
                reason: "settlement transaction does not spend this channel's contract".to_string(),
            });
        }
        wallet.receive_pending(tx)?;
    }
    if let Some(state) = inner.state.as_mut() {
        state.disconnect_from_channel();
    }
    inner.lifecycle = ClientLifecycle::ChannelClosed;
    Ok(())
}
