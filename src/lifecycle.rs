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

//! Client- and server-side channel lifecycle: states of the two coupled
//! state machines.

/// Client-side channel lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum ClientLifecycle {
    /// Transport not yet opened
    #[display("WAIT_CONN_OPEN")]
    WaitConnOpen,

    /// Sent `ClientVersion`, waiting for `ServerVersion`
    #[display("WAIT_VERSION")]
    WaitVersion,

    /// Waiting for `Initiate` (or a resumption `ChannelOpen`)
    #[display("WAIT_INITIATE")]
    WaitInitiate,

    /// V1 only: refund sent to server, waiting for its signature
    #[display("WAIT_REFUND_RETURN")]
    WaitRefundReturn,

    /// Contract sent, waiting for `ChannelOpen`
    #[display("WAIT_CHANNEL_OPEN")]
    WaitChannelOpen,

    /// Channel usable for payments
    #[display("CHANNEL_OPEN")]
    ChannelOpen,

    /// `settle()` called, waiting for the server's `Close` reply
    #[display("WAIT_CHANNEL_CLOSE")]
    WaitChannelClose,

    /// Channel torn down; the persisted refund (if any) remains in the
    /// wallet
    #[display("CHANNEL_CLOSED")]
    ChannelClosed,
}

impl Default for ClientLifecycle {
    fn default() -> Self {
        ClientLifecycle::WaitConnOpen
    }
}

/// Server-side channel lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum ServerLifecycle {
    /// Transport not yet opened
    #[display("WAIT_CONN_OPEN")]
    WaitConnOpen,

    /// Waiting for `ClientVersion`
    #[display("WAIT_CLIENT_VERSION")]
    WaitClientVersion,

    /// Sent `Initiate`, waiting for the client's refund/contract
    #[display("WAIT_CONTRACT")]
    WaitContract,

    /// Resuming a previously stored channel; contract already on record
    #[display("READY_FOR_PAYMENT")]
    ReadyForPayment,

    /// Channel usable for payments
    #[display("CHANNEL_OPEN")]
    ChannelOpen,

    /// Channel torn down
    #[display("CHANNEL_CLOSED")]
    ChannelClosed,
}

impl Default for ServerLifecycle {
    fn default() -> Self {
        ServerLifecycle::WaitConnOpen
    }
}
