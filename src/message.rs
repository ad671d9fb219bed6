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

//! The protocol envelope: a tagged union of message payloads exchanged
//! between client and server over an abstract reliable transport.

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;

use crate::error::ErrorCode;

/// `ClientVersion` — opens the handshake. `previous_channel_contract_hash`
/// requests resumption of a previously stored channel with this server.
#[derive(Clone, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("client_version({major}.{minor}, window={time_window_secs}s)")]
pub struct ClientVersion {
    pub major: u8,
    pub minor: u8,
    pub time_window_secs: u64,
    pub previous_channel_contract_hash: Option<[u8; 32]>,
}

/// `ServerVersion` — echoes the highest mutually acceptable major/minor.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("server_version({major}.{minor})")]
pub struct ServerVersion {
    pub major: u8,
    pub minor: u8,
}

/// `Initiate` — server-chosen channel parameters.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("initiate(min_size={min_accepted_channel_size}, expire={expire_time_secs}, min_payment={min_payment})")]
pub struct Initiate {
    pub multisig_key: PublicKey,
    pub min_accepted_channel_size: u64,
    pub expire_time_secs: u64,
    pub min_payment: u64,
}

/// `ProvideRefund` — V1 only: the client's incomplete refund transaction.
#[derive(Clone, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("provide_refund(...)")]
pub struct ProvideRefund {
    pub multisig_key: PublicKey,
    pub refund_tx_bytes: Vec<u8>,
}

/// `ReturnRefund` — V1 only: the server's signature over the client's
/// refund transaction.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("return_refund(...)")]
pub struct ReturnRefund {
    pub signature: Signature,
}

/// `ProvideContract` — the client's signed contract transaction, plus the
/// initial payment it grants the server.
#[derive(Clone, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("provide_contract(initial_payment={initial_payment})")]
pub struct ProvideContract {
    pub contract_tx_bytes: Vec<u8>,
    pub client_key: Option<PublicKey>,
    pub initial_payment: u64,
}

/// `ChannelOpen` — notifies the peer the channel is now usable.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("channel_open()")]
pub struct ChannelOpen;

/// `UpdatePayment` — the client's latest signed payment transaction.
#[derive(Clone, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("update_payment(change={client_change_value})")]
pub struct UpdatePayment {
    pub signature: Signature,
    pub client_change_value: u64,
    pub info: Option<Vec<u8>>,
}

/// `PaymentAck` — server's acknowledgement of the latest `UpdatePayment`.
#[derive(Clone, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("payment_ack()")]
pub struct PaymentAck {
    pub info: Option<Vec<u8>>,
}

/// `Close` — requests or confirms channel settlement.
#[derive(Clone, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("close(...)")]
pub struct Close {
    pub settlement_tx: Option<Vec<u8>>,
}

/// `Error` — a protocol-level failure report.
#[derive(Clone, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("error({code})")]
pub struct Error {
    pub code: ErrorCode,
    pub explanation: Option<String>,
    pub expected_value: Option<u64>,
}

/// The protocol envelope: a tagged union of all message payloads that may
/// cross the transport in either direction.
#[derive(Clone, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display(inner)]
pub enum Message {
    ClientVersion(ClientVersion),
    ServerVersion(ServerVersion),
    Initiate(Initiate),
    ProvideRefund(ProvideRefund),
    ReturnRefund(ReturnRefund),
    ProvideContract(ProvideContract),
    ChannelOpen(ChannelOpen),
    UpdatePayment(UpdatePayment),
    PaymentAck(PaymentAck),
    Close(Close),
    Error(Error),
}

impl Message {
    /// Short, stable name of the variant, used in protocol-violation error
    /// messages (`ProtocolViolation { received, .. }`).
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ClientVersion(_) => "ClientVersion",
            Message::ServerVersion(_) => "ServerVersion",
            Message::Initiate(_) => "Initiate",
            Message::ProvideRefund(_) => "ProvideRefund",
            Message::ReturnRefund(_) => "ReturnRefund",
            Message::ProvideContract(_) => "ProvideContract",
            Message::ChannelOpen(_) => "ChannelOpen",
            Message::UpdatePayment(_) => "UpdatePayment",
            Message::PaymentAck(_) => "PaymentAck",
            Message::Close(_) => "Close",
            Message::Error(_) => "Error",
        }
    }
}

macro_rules! message_from {
    ($ty:ident) => {
        impl From<$ty> for Message {
            fn from(payload: $ty) -> Self {
                Message::$ty(payload)
            }
        }
    };
}

message_from!(ClientVersion);
message_from!(ServerVersion);
message_from!(Initiate);
message_from!(ProvideRefund);
message_from!(ReturnRefund);
message_from!(ProvideContract);
message_from!(ChannelOpen);
message_from!(UpdatePayment);
message_from!(PaymentAck);
message_from!(Close);
message_from!(Error);
