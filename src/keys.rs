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

//! Per-channel identity: the opaque server id used as the registry key,
//! and the client/server multisig key pair.

use amplify::{Slice32, Wrapper};
use bitcoin::secp256k1::PublicKey;
use bitcoin::util::bip32::KeySource;
use wallet::lex_order::LexOrder;

/// Opaque, client-chosen identifier associating a channel with a
/// particular counterparty. Produced by hashing whatever the caller uses
/// to name the server (host:port, node pubkey, ...); the core never
/// interprets its bytes.
#[derive(
    Wrapper,
    Copy,
    Clone,
    Ord,
    PartialOrd,
    Eq,
    PartialEq,
    Hash,
    Debug,
    Display,
    From,
    StrictEncode,
    StrictDecode
)]
#[display(LowerHex)]
#[wrapper(FromStr, LowerHex, UpperHex)]
pub struct ServerId(Slice32);

impl ServerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ServerId(Slice32::from(bytes))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.as_inner().as_inner()
    }
}

/// The client's per-channel key, together with the wallet-supplied
/// derivation source used to ask the wallet to sign with it later.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct LocalKey {
    pub public_key: PublicKey,
    pub source: Option<KeySource>,
}

impl LocalKey {
    #[inline]
    pub fn new(public_key: PublicKey) -> Self {
        LocalKey {
            public_key,
            source: None,
        }
    }

    #[inline]
    pub fn with_source(public_key: PublicKey, source: KeySource) -> Self {
        LocalKey {
            public_key,
            source: Some(source),
        }
    }
}

/// Channel identity & keys: the client's own multisig key plus the
/// server's multisig public key, once known.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct ChannelKeys {
    /// `K_c`: generated fresh per channel, used both in the contract's
    /// multisig output and as the refund destination.
    pub client_key: LocalKey,

    /// `K_s`: supplied by the server during `Initiate`.
    pub server_key: Option<PublicKey>,
}

impl ChannelKeys {
    #[inline]
    pub fn new(client_key: LocalKey) -> Self {
        ChannelKeys {
            client_key,
            server_key: None,
        }
    }

    #[inline]
    pub fn with_server_key(mut self, server_key: PublicKey) -> Self {
        self.server_key = Some(server_key);
        self
    }

    /// The two multisig public keys in canonical lexicographic order, as
    /// required for a deterministic 2-of-2 script. Panics if the server
    /// key is not yet known.
    pub fn multisig_pubkeys(&self) -> (PublicKey, PublicKey) {
        let server_key =
            self.server_key.expect("server key must be set before contract construction");
        let mut keys = [self.client_key.public_key, server_key];
        keys.lex_order();
        (keys[0], keys[1])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn dumb_pubkey(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let mut buf = [0u8; 32];
        buf[31] = byte;
        let sk = SecretKey::from_slice(&buf).unwrap();
        PublicKey::from_secret_key(&secp, &sk)
    }

    #[test]
    fn multisig_pubkeys_are_lex_ordered() {
        let client = dumb_pubkey(1);
        let server = dumb_pubkey(2);
        let keys = ChannelKeys::new(LocalKey::new(client)).with_server_key(server);
        let (a, b) = keys.multisig_pubkeys();
        assert!(a.serialize() <= b.serialize());
    }

    #[test]
    fn server_id_round_trips_bytes() {
        let bytes = [7u8; 32];
        let id = ServerId::from_bytes(bytes);
        assert_eq!(id.as_bytes(), &bytes);
    }
}
