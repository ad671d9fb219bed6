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

//! End-to-end scenario coverage: a `ClientChannel`/`ServerChannel` pair
//! wired over an in-memory transport and a signing-capable stub wallet on
//! each side, exercising the full V1/V2 handshake, payment increments,
//! resumption, settlement, and pre-expiry auto-close.

use std::cell::RefCell;
use std::collections::VecDeque;

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message as SecpMessage, PublicKey, Secp256k1, SecretKey};
use bitcoin::{OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Witness};

use payment_channel_core::client::{ClientChannel, PaymentOutcome};
use payment_channel_core::keys::LocalKey;
use payment_channel_core::registry::ChannelRecordStatus;
use payment_channel_core::server::ServerChannel;
use payment_channel_core::{
    ChannelError, ChannelProperties, ClientLifecycle, Connection, Message, PreExpiryScheduler,
    ServerId, ServerLifecycle, ServerPolicy, StoredChannelRegistry, VersionSelector, Wallet,
};
use payment_channel_core::tx;

const NOW: u64 = 1_700_000_000;

fn dumb_secret(byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let mut buf = [0u8; 32];
    buf[31] = byte;
    let sk = SecretKey::from_slice(&buf).unwrap();
    let pk = PublicKey::from_secret_key(&secp, &sk);
    (sk, pk)
}

/// Records every message handed to it, in order, while also acting as a
/// FIFO queue that the test driver drains between channel calls.
struct Outbox {
    pending: RefCell<VecDeque<Message>>,
    history: RefCell<Vec<Message>>,
}

impl Outbox {
    fn new() -> Self {
        Outbox {
            pending: RefCell::new(VecDeque::new()),
            history: RefCell::new(Vec::new()),
        }
    }

    fn push(&self, message: Message) {
        self.history.borrow_mut().push(message.clone());
        self.pending.borrow_mut().push_back(message);
    }

    fn pop(&self) -> Option<Message> {
        self.pending.borrow_mut().pop_front()
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.history.borrow().iter().map(Message::kind).collect()
    }
}

struct ClientConn {
    out: Outbox,
    opened: RefCell<Vec<bool>>,
    accept_expire: bool,
}

impl ClientConn {
    fn new() -> Self {
        ClientConn {
            out: Outbox::new(),
            opened: RefCell::new(Vec::new()),
            accept_expire: true,
        }
    }
}

impl Connection for ClientConn {
    fn send_to_server(&self, message: Message) {
        self.out.push(message);
    }
    fn send_to_client(&self, _message: Message) {
        unreachable!("a client-side connection is never told to send to the client");
    }
    fn destroy_connection(&self, _reason: ChannelError) {}
    fn channel_open(&self, was_initiated: bool) {
        self.opened.borrow_mut().push(was_initiated);
    }
    fn accept_expire_time(&self, _expire_time: u64) -> bool {
        self.accept_expire
    }
}

struct ServerConn {
    out: Outbox,
}

impl ServerConn {
    fn new() -> Self {
        ServerConn { out: Outbox::new() }
    }
}

impl Connection for ServerConn {
    fn send_to_server(&self, _message: Message) {
        unreachable!("a server-side connection is never told to send to the server");
    }
    fn send_to_client(&self, message: Message) {
        self.out.push(message);
    }
    fn destroy_connection(&self, _reason: ChannelError) {}
    fn channel_open(&self, _was_initiated: bool) {}
    fn accept_expire_time(&self, _expire_time: u64) -> bool {
        true
    }
}

/// A wallet stub that signs real multisig spends against a fixed,
/// precomputed witness script and locked value (both contract parties
/// ultimately agree on the same two, so one fixture can hand each side a
/// wallet that knows only its own secret key).
struct TestWallet {
    secret: SecretKey,
    witness_script: Script,
    value_locked: u64,
    registry: StoredChannelRegistry,
    now: RefCell<u64>,
    safety_margin_secs: u64,
}

impl TestWallet {
    fn new(secret: SecretKey, witness_script: Script, value_locked: u64, now: u64, safety_margin_secs: u64) -> Self {
        TestWallet {
            secret,
            witness_script,
            value_locked,
            registry: StoredChannelRegistry::new(),
            now: RefCell::new(now),
            safety_margin_secs,
        }
    }
}

impl Wallet for TestWallet {
    fn store_channel(&self, _server_id: ServerId, record: payment_channel_core::registry::StoredClientChannel) {
        self.registry.put(record);
    }

    fn get_usable_channel(
        &self,
        server_id: ServerId,
    ) -> Option<payment_channel_core::registry::StoredClientChannel> {
        self.registry.get_usable(server_id, *self.now.borrow(), self.safety_margin_secs)
    }

    fn build_funding_transaction(&self, locked_value: u64, script_pubkey: Script) -> Result<Transaction, ChannelError> {
        Ok(Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: locked_value,
                script_pubkey,
            }],
        })
    }

    fn sign(&self, tx: &Transaction, _key: &LocalKey, _user_key: Option<&[u8]>) -> Result<Signature, ChannelError> {
        let secp = Secp256k1::new();
        let sighash = tx::segwit_sighash(tx, 0, &self.witness_script, self.value_locked);
        let message = SecpMessage::from_slice(&sighash).expect("sighash is always 32 bytes");
        Ok(secp.sign_ecdsa(&message, &self.secret))
    }

    fn broadcast(&self, _tx: &Transaction) -> Result<(), ChannelError> {
        Ok(())
    }

    fn receive_pending(&self, _tx: Transaction) -> Result<(), ChannelError> {
        Ok(())
    }

    fn is_encrypted(&self) -> bool {
        false
    }
}

struct Fixture {
    client: ClientChannel,
    server: ServerChannel,
    client_conn: ClientConn,
    server_conn: ServerConn,
    client_wallet: TestWallet,
    server_wallet: TestWallet,
    server_id: ServerId,
    value_locked: u64,
    expire_time: u64,
}

/// Drains both outboxes in turn until neither side has anything left to
/// say. Driven from outside any channel's lock, so a message that causes
/// the far side to reply immediately never reenters a still-borrowed
/// `Inner`.
fn pump(fx: &Fixture, now: u64) {
    pump_on(fx, &fx.client_conn, &fx.server_conn, now);
}

/// Same drain loop as [`pump`], but over an explicit connection pair, for
/// scenarios that reconnect with fresh `Connection`s partway through.
fn pump_on(fx: &Fixture, client_conn: &ClientConn, server_conn: &ServerConn, now: u64) {
    loop {
        let mut progressed = false;
        while let Some(message) = client_conn.out.pop() {
            fx.server
                .receive(message, server_conn, &fx.server_wallet, None, now)
                .expect("server accepts the message");
            progressed = true;
        }
        while let Some(message) = server_conn.out.pop() {
            fx.client
                .receive(message, client_conn, &fx.client_wallet, None)
                .expect("client accepts the message");
            progressed = true;
        }
        if !progressed {
            break;
        }
    }
}

fn setup_v2(min_payment: u64) -> Fixture {
    let (client_sk, client_pk) = dumb_secret(1);
    let (server_sk, server_pk) = dumb_secret(2);
    let server_id = ServerId::from_bytes([9u8; 32]);
    let value_locked = 1_000_000u64;
    let time_window_secs = 86_340u64;
    let expire_time = NOW + time_window_secs;

    let pubkeys = tx::lex_order_pubkeys(client_pk, server_pk);
    let witness_script = Script::from(tx::contract_witness_script_v2(pubkeys, client_pk, expire_time as u32));

    let client_wallet = TestWallet::new(client_sk, witness_script.clone(), value_locked, NOW, 3_600);
    let server_wallet = TestWallet::new(server_sk, witness_script, value_locked, NOW, 3_600);

    let properties = ChannelProperties {
        time_window_secs,
        ..ChannelProperties::default()
    };
    let client = ClientChannel::new(server_id, LocalKey::new(client_pk), value_locked, properties);

    let policy = ServerPolicy {
        min_accepted_channel_size: 100_000,
        min_payment,
        max_channel_size: 10_000_000,
        ..ServerPolicy::default()
    };
    let server = ServerChannel::new(server_id, LocalKey::new(server_pk), policy);
    server.connection_open();

    Fixture {
        client,
        server,
        client_conn: ClientConn::new(),
        server_conn: ServerConn::new(),
        client_wallet,
        server_wallet,
        server_id,
        value_locked,
        expire_time,
    }
}

fn setup_v1(min_payment: u64) -> Fixture {
    let (client_sk, client_pk) = dumb_secret(3);
    let (server_sk, server_pk) = dumb_secret(4);
    let server_id = ServerId::from_bytes([11u8; 32]);
    let value_locked = 1_000_000u64;
    let time_window_secs = 86_340u64;
    let expire_time = NOW + time_window_secs;

    let pubkeys = tx::lex_order_pubkeys(client_pk, server_pk);
    let witness_script = Script::from(tx::contract_witness_script_v1(pubkeys));

    let client_wallet = TestWallet::new(client_sk, witness_script.clone(), value_locked, NOW, 3_600);
    let server_wallet = TestWallet::new(server_sk, witness_script, value_locked, NOW, 3_600);

    let properties = ChannelProperties {
        time_window_secs,
        version_selector: VersionSelector::V1Only,
        ..ChannelProperties::default()
    };
    let client = ClientChannel::new(server_id, LocalKey::new(client_pk), value_locked, properties);

    let policy = ServerPolicy {
        min_accepted_channel_size: 100_000,
        min_payment,
        max_channel_size: 10_000_000,
        version_selector: VersionSelector::V1Only,
        ..ServerPolicy::default()
    };
    let server = ServerChannel::new(server_id, LocalKey::new(server_pk), policy);
    server.connection_open();

    Fixture {
        client,
        server,
        client_conn: ClientConn::new(),
        server_conn: ServerConn::new(),
        client_wallet,
        server_wallet,
        server_id,
        value_locked,
        expire_time,
    }
}

fn last_update_payment(fx: &Fixture) -> payment_channel_core::message::UpdatePayment {
    fx.client_conn
        .out
        .history
        .borrow()
        .iter()
        .rev()
        .find_map(|message| match message {
            Message::UpdatePayment(payload) => Some(payload.clone()),
            _ => None,
        })
        .expect("an UpdatePayment was sent")
}

#[test]
fn scenario_a_v2_happy_path() {
    let fx = setup_v2(500);
    fx.client.connection_open(&fx.client_conn, &fx.client_wallet);
    pump(&fx, NOW);

    assert_eq!(fx.client.lifecycle(), ClientLifecycle::ChannelOpen);
    assert_eq!(fx.server.lifecycle(), ServerLifecycle::ChannelOpen);
    assert_eq!(*fx.client_conn.opened.borrow(), vec![true]);

    assert_eq!(fx.client_conn.out.kinds(), vec!["ClientVersion", "ProvideContract"]);
    assert_eq!(fx.server_conn.out.kinds(), vec!["ServerVersion", "Initiate", "ChannelOpen"]);

    let record = fx.server_wallet.registry.get(fx.server_id).unwrap();
    assert_eq!(record.best_payment_value, 500);
}

#[test]
fn scenario_b_increment_and_ack() {
    let fx = setup_v2(500);
    fx.client.connection_open(&fx.client_conn, &fx.client_wallet);
    pump(&fx, NOW);

    let handle = fx
        .client
        .increment_payment(1_500, None, &fx.client_conn, &fx.client_wallet, None)
        .unwrap();
    pump(&fx, NOW);

    match handle.wait() {
        PaymentOutcome::Acked { actual, .. } => assert_eq!(actual, 1_500),
        PaymentOutcome::Failed(err) => panic!("payment failed: {:?}", err),
    }
    assert_eq!(last_update_payment(&fx).client_change_value, 998_000);
}

#[test]
fn scenario_c_dust_rounding() {
    let fx = setup_v2(500);
    fx.client.connection_open(&fx.client_conn, &fx.client_wallet);
    pump(&fx, NOW);

    let delta = fx.value_locked - 500 - tx::DUST_LIMIT_SATS + 1;
    let handle = fx
        .client
        .increment_payment(delta, None, &fx.client_conn, &fx.client_wallet, None)
        .unwrap();
    pump(&fx, NOW);

    match handle.wait() {
        PaymentOutcome::Acked { actual, .. } => assert_eq!(actual - delta, tx::DUST_LIMIT_SATS - 1),
        PaymentOutcome::Failed(err) => panic!("payment failed: {:?}", err),
    }
    assert_eq!(last_update_payment(&fx).client_change_value, 0);
}

#[test]
fn scenario_d_resumption() {
    let fx = setup_v2(500);
    fx.client.connection_open(&fx.client_conn, &fx.client_wallet);
    pump(&fx, NOW);
    assert_eq!(fx.client.lifecycle(), ClientLifecycle::ChannelOpen);

    fx.client.connection_closed();
    fx.server.connection_closed();
    fx.server.connection_open();

    let client_conn2 = ClientConn::new();
    let server_conn2 = ServerConn::new();
    fx.client.connection_open(&client_conn2, &fx.client_wallet);

    let resume_now = NOW + 10;
    pump_on(&fx, &client_conn2, &server_conn2, resume_now);

    assert_eq!(fx.client.lifecycle(), ClientLifecycle::ChannelOpen);
    assert_eq!(*client_conn2.opened.borrow(), vec![false]);
    assert_eq!(server_conn2.out.kinds(), vec!["ServerVersion", "ChannelOpen"]);

    match &client_conn2.out.history.borrow()[0] {
        Message::ClientVersion(payload) => assert!(payload.previous_channel_contract_hash.is_some()),
        other => panic!("unexpected first message: {:?}", other),
    }

    // A payment after resumption must succeed: both sides need their
    // restored `client_key`/`witness_script` to verify and settle it.
    let handle = fx
        .client
        .increment_payment(1_000, None, &client_conn2, &fx.client_wallet, None)
        .unwrap();
    pump_on(&fx, &client_conn2, &server_conn2, resume_now);
    match handle.wait() {
        PaymentOutcome::Acked { actual, .. } => assert_eq!(actual, 1_000),
        PaymentOutcome::Failed(err) => panic!("post-resumption payment failed: {:?}", err),
    }

    let record = fx.server_wallet.registry.get(fx.server_id).unwrap();
    assert_eq!(record.best_payment_value, 1_500);

    fx.client.settle(&client_conn2).unwrap();
    pump_on(&fx, &client_conn2, &server_conn2, resume_now);

    assert_eq!(fx.client.lifecycle(), ClientLifecycle::ChannelClosed);
    assert_eq!(fx.server.lifecycle(), ServerLifecycle::ChannelClosed);

    let close = server_conn2
        .out
        .history
        .borrow()
        .iter()
        .rev()
        .find_map(|message| match message {
            Message::Close(payload) => Some(payload.clone()),
            _ => None,
        })
        .expect("a Close was sent to the client");
    assert!(close.settlement_tx.is_some());
}

#[test]
fn scenario_e_v1_happy_path() {
    let fx = setup_v1(500);
    fx.client.connection_open(&fx.client_conn, &fx.client_wallet);
    pump(&fx, NOW);

    assert_eq!(fx.client.lifecycle(), ClientLifecycle::ChannelOpen);
    assert_eq!(fx.server.lifecycle(), ServerLifecycle::ChannelOpen);
    assert_eq!(
        fx.client_conn.out.kinds(),
        vec!["ClientVersion", "ProvideRefund", "ProvideContract"]
    );
    assert_eq!(
        fx.server_conn.out.kinds(),
        vec!["ServerVersion", "Initiate", "ReturnRefund", "ChannelOpen"]
    );

    let record = fx.server_wallet.registry.get(fx.server_id).unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.best_payment_value, 500);
}

#[test]
fn scenario_f_server_closes_with_settlement() {
    let fx = setup_v2(500);
    fx.client.connection_open(&fx.client_conn, &fx.client_wallet);
    pump(&fx, NOW);

    let handle = fx
        .client
        .increment_payment(2_000, None, &fx.client_conn, &fx.client_wallet, None)
        .unwrap();
    pump(&fx, NOW);
    handle.wait();

    fx.client.settle(&fx.client_conn).unwrap();
    pump(&fx, NOW);

    assert_eq!(fx.client.lifecycle(), ClientLifecycle::ChannelClosed);
    assert_eq!(fx.server.lifecycle(), ServerLifecycle::ChannelClosed);

    let close = fx
        .server_conn
        .out
        .history
        .borrow()
        .iter()
        .rev()
        .find_map(|message| match message {
            Message::Close(payload) => Some(payload.clone()),
            _ => None,
        })
        .expect("a Close was sent to the client");
    assert!(close.settlement_tx.is_some());

    let record = fx.server_wallet.registry.get(fx.server_id).unwrap();
    assert_eq!(record.status, ChannelRecordStatus::AwaitingConfirmation);
}

#[test]
fn scenario_g_pre_expiry_auto_close() {
    let fx = setup_v2(500);
    fx.client.connection_open(&fx.client_conn, &fx.client_wallet);
    pump(&fx, NOW);

    let scheduler = PreExpiryScheduler::new(3_600);

    assert!(scheduler.poll(&fx.client_wallet.registry, &fx.client_wallet, NOW).is_empty());

    let closed = scheduler.poll(&fx.client_wallet.registry, &fx.client_wallet, fx.expire_time - 3_600);
    assert_eq!(closed, vec![fx.server_id]);

    let record = fx.client_wallet.registry.get(fx.server_id).unwrap();
    assert_eq!(record.status, ChannelRecordStatus::AwaitingConfirmation);
}
