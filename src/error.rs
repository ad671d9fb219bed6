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

//! Wire-visible error codes and the richer in-process error taxonomy used
//! by the client and server state machines.

/// Closed set of error codes carried over the wire inside an [`crate::message::Error`]
/// payload. Unlike [`ChannelError`] this enum never grows fields: a code is
/// all the remote peer is told.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, Display, StrictEncode, StrictDecode
)]
#[repr(u8)]
pub enum ErrorCode {
    /// a timeout elapsed while waiting for the expected message
    #[display("TIMEOUT")]
    Timeout,

    /// a received message could not be parsed
    #[display("SYNTAX_ERROR")]
    SyntaxError,

    /// no protocol major version is mutually acceptable
    #[display("NO_ACCEPTABLE_VERSION")]
    NoAcceptableVersion,

    /// a transaction failed structural or signature validation
    #[display("BAD_TRANSACTION")]
    BadTransaction,

    /// the proposed refund lock time window is unacceptable
    #[display("TIME_WINDOW_UNACCEPTABLE")]
    TimeWindowUnacceptable,

    /// the proposed contract value is larger than what the peer is willing
    /// to lock up
    #[display("CHANNEL_VALUE_TOO_LARGE")]
    ChannelValueTooLarge,

    /// the server-requested minimum payment exceeds what the client will
    /// accept
    #[display("MIN_PAYMENT_TOO_LARGE")]
    MinPaymentTooLarge,

    /// any other error not covered by a more specific code
    #[display("OTHER")]
    Other,
}

/// Richer in-process error taxonomy. Each variant names the *kind* of
/// failure (per the error handling design) together with whatever operands
/// are needed to render a useful message; [`ChannelError::to_error_code`]
/// collapses a variant down to the closed wire-visible [`ErrorCode`].
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ChannelError {
    /// received message {received} is not valid while the channel is in
    /// state {current}
    ProtocolViolation {
        current: &'static str,
        received: &'static str,
    },

    /// signature verification failed for {context}
    BadSignature { context: &'static str },

    /// transaction failed validation: {reason}
    BadTransaction { reason: String },

    /// requested value is out of the allowed range: {reason}
    ValueOutOfRange { reason: String },

    /// proposed refund lock time {expire_time} was rejected by the local
    /// acceptance policy
    TimeWindowUnacceptable { expire_time: u64 },

    /// no protocol major version is mutually acceptable between client and
    /// server
    NoAcceptableVersion,

    /// proposed channel value is too large: the contract provides
    /// {contract_value} sat but only {min_accepted_channel_size} sat is
    /// required as a minimum, leaving {missing} sat short of what the peer
    /// demands
    ChannelValueTooLarge {
        contract_value: u64,
        min_accepted_channel_size: u64,
        missing: u64,
    },

    /// the server-requested minimum payment of {requested} sat exceeds the
    /// caller's acceptable minimum of {acceptable}, short by {missing} sat
    MinPaymentTooLarge {
        requested: u64,
        acceptable: u64,
        missing: u64,
    },

    /// the peer requested settlement paying itself {requested} sat, which
    /// exceeds the locked contract value minus fee of {limit} sat
    ServerRequestedTooMuchValue { requested: u64, limit: u64 },

    /// the operation requires a user-supplied key because the wallet is
    /// encrypted, but none was provided
    KeyIsEncrypted,

    /// the channel is closed, not yet initialized, or already has a payment
    /// in flight
    ChannelClosedOrUninitialized,

    /// the remote peer reported an error: {code} ({explanation})
    RemoteError {
        code: ErrorCode,
        explanation: String,
    },
}

impl ChannelError {
    /// Maps this error down to the closed wire-visible error code, for use
    /// when constructing an outbound [`crate::message::Error`] message.
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            ChannelError::ProtocolViolation { .. } => ErrorCode::Other,
            ChannelError::BadSignature { .. } => ErrorCode::BadTransaction,
            ChannelError::BadTransaction { .. } => ErrorCode::BadTransaction,
            ChannelError::ValueOutOfRange { .. } => ErrorCode::Other,
            ChannelError::TimeWindowUnacceptable { .. } => {
                ErrorCode::TimeWindowUnacceptable
            }
            ChannelError::NoAcceptableVersion => {
                ErrorCode::NoAcceptableVersion
            }
            ChannelError::ChannelValueTooLarge { .. } => {
                ErrorCode::ChannelValueTooLarge
            }
            ChannelError::MinPaymentTooLarge { .. } => {
                ErrorCode::MinPaymentTooLarge
            }
            ChannelError::ServerRequestedTooMuchValue { .. } => {
                ErrorCode::BadTransaction
            }
            ChannelError::KeyIsEncrypted => ErrorCode::Other,
            ChannelError::ChannelClosedOrUninitialized => ErrorCode::Other,
            ChannelError::RemoteError { code, .. } => *code,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_code_mapping_is_stable() {
        let err = ChannelError::ChannelValueTooLarge {
            contract_value: 900_000,
            min_accepted_channel_size: 1_000_000,
            missing: 100_000,
        };
        assert_eq!(err.to_error_code(), ErrorCode::ChannelValueTooLarge);
    }

    #[test]
    fn min_payment_too_large_carries_missing() {
        let err = ChannelError::MinPaymentTooLarge {
            requested: 5_000,
            acceptable: 1_000,
            missing: 4_000,
        };
        match err {
            ChannelError::MinPaymentTooLarge { missing, .. } => {
                assert_eq!(missing, 4_000)
            }
            _ => panic!("wrong variant"),
        }
    }
}
