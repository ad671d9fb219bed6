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

//! Client and server acceptance policy: version negotiation and the
//! parameter checks applied to `Initiate`/`ClientVersion`.

use std::sync::Arc;

use bitcoin::Transaction;

use crate::error::ChannelError;

/// Default requested/accepted refund lock duration: 24 hours minus a
/// minute of slack for clock skew and message round-trips.
pub const DEFAULT_TIME_WINDOW_SECS: u64 = 24 * 60 * 60 - 60;

/// Client-side policy governing which protocol major versions are
/// acceptable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
pub enum VersionSelector {
    /// Only the pre-signed-refund protocol (major 1) is acceptable.
    #[display("V1_ONLY")]
    V1Only,

    /// Prefer the time-locked-multisig protocol (major 2) but fall back to
    /// major 1 if the server does not support it.
    #[display("V2_PREFER_V1_FALLBACK")]
    V2PreferV1Fallback,

    /// Only the time-locked-multisig protocol (major 2) is acceptable.
    #[display("V2_ONLY")]
    V2Only,
}

impl VersionSelector {
    /// The major version the client requests in its `ClientVersion`.
    pub fn requested_major(&self) -> u8 {
        match self {
            VersionSelector::V1Only => 1,
            VersionSelector::V2PreferV1Fallback => 2,
            VersionSelector::V2Only => 2,
        }
    }

    /// Whether the server's echoed major is acceptable under this policy.
    pub fn accepts_major(&self, major: u8) -> bool {
        match self {
            VersionSelector::V1Only => major == 1,
            VersionSelector::V2PreferV1Fallback => major == 1 || major == 2,
            VersionSelector::V2Only => major == 2,
        }
    }
}

/// Caller configuration for a client channel.
#[derive(Clone)]
pub struct ChannelProperties {
    /// Desired refund lock duration.
    pub time_window_secs: u64,

    /// Upper bound on a server-requested minimum payment; exceeding this
    /// causes `Initiate` to be rejected with `MIN_PAYMENT_TOO_LARGE`.
    pub acceptable_min_payment: u64,

    /// Which protocol major versions the client is willing to use.
    pub version_selector: VersionSelector,

    /// Optional hook to adjust the contract-creation transaction (fee,
    /// coin selection) before it is signed.
    pub modify_contract_send_request:
        Option<Arc<dyn Fn(&mut Transaction) + Send + Sync>>,
}

impl std::fmt::Debug for ChannelProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ChannelProperties")
            .field("time_window_secs", &self.time_window_secs)
            .field("acceptable_min_payment", &self.acceptable_min_payment)
            .field("version_selector", &self.version_selector)
            .field(
                "modify_contract_send_request",
                &self.modify_contract_send_request.is_some(),
            )
            .finish()
    }
}

impl Default for ChannelProperties {
    fn default() -> Self {
        ChannelProperties {
            time_window_secs: DEFAULT_TIME_WINDOW_SECS,
            acceptable_min_payment: u64::MAX,
            version_selector: VersionSelector::V2PreferV1Fallback,
            modify_contract_send_request: None,
        }
    }
}

/// Server-side acceptance policy for incoming channel requests.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ServerPolicy {
    /// Minimum contract value the server will accept.
    pub min_accepted_channel_size: u64,

    /// Minimum payment the server demands before opening the channel, and
    /// the minimum increment accepted thereafter.
    pub min_payment: u64,

    /// Upper bound on contract value the server is willing to lock up.
    pub max_channel_size: u64,

    /// Safety margin `S`: how long before `expire_time` the server (and
    /// the client's own registry) treats a channel as no longer usable
    /// for new payments.
    pub safety_margin_secs: u64,

    /// Which protocol majors the server is willing to negotiate, mirroring
    /// the client's own [`VersionSelector`].
    pub version_selector: VersionSelector,
}

impl Default for ServerPolicy {
    fn default() -> Self {
        ServerPolicy {
            min_accepted_channel_size: 100_000,
            min_payment: 1_000,
            max_channel_size: 100_000_000,
            safety_margin_secs: 3_600,
            version_selector: VersionSelector::V2PreferV1Fallback,
        }
    }
}

impl ServerPolicy {
    /// Validates a contract value the client intends to lock: the contract
    /// must reach the server's advertised minimum. Reported under
    /// `ChannelValueTooLarge` even though the check is a floor rather than
    /// a ceiling, matching the wire error code's name.
    pub fn validate_contract_value(
        &self,
        contract_value: u64,
    ) -> Result<(), ChannelError> {
        if contract_value < self.min_accepted_channel_size {
            return Err(ChannelError::ChannelValueTooLarge {
                contract_value,
                min_accepted_channel_size: self.min_accepted_channel_size,
                missing: self.min_accepted_channel_size - contract_value,
            });
        }
        Ok(())
    }
}

/// Validates the server's requested minimum payment against the client's
/// own ceiling.
pub fn validate_min_payment(
    requested: u64,
    acceptable: u64,
) -> Result<(), ChannelError> {
    if requested > acceptable {
        return Err(ChannelError::MinPaymentTooLarge {
            requested,
            acceptable,
            missing: requested - acceptable,
        });
    }
    Ok(())
}
