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

//! Transaction and script construction shared by the V1 and V2 channel
//! state variants: the 2-of-2 multisig contract output, the V1/V2 refund,
//! and the payment transaction.

use bitcoin::blockdata::opcodes::all::*;
use bitcoin::blockdata::script::Builder;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message as SecpMessage, PublicKey, Secp256k1, Verification};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{
    EcdsaSighashType, OutPoint, PackedLockTime, Script, Sequence, Transaction,
    TxIn, TxOut, Witness,
};
use wallet::lex_order::LexOrder;
use wallet::scripts::{LockScript, PubkeyScript, WitnessScript};

use crate::error::ChannelError;

/// Minimum value, in satoshis, below which an output is considered dust
/// and will not relay on the bitcoin network.
pub const DUST_LIMIT_SATS: u64 = 546;

/// Computes the BIP-143 segwit signature hash for spending `witness_script`
/// at `input_index`, the shared building block for both signing and
/// verifying refund and payment transaction signatures.
pub fn segwit_sighash(
    tx: &Transaction,
    input_index: usize,
    witness_script: &Script,
    prevout_value: u64,
) -> [u8; 32] {
    let mut cache = SighashCache::new(tx);
    cache
        .segwit_signature_hash(
            input_index,
            witness_script,
            prevout_value,
            EcdsaSighashType::All,
        )
        .expect("input index within bounds")
        .into_inner()
}

/// Verifies that `signature` is a valid ECDSA signature by `pubkey` over
/// the segwit sighash of `tx`'s `input_index`-th input spending
/// `witness_script` locking `prevout_value` satoshis.
pub fn verify_segwit_signature<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    input_index: usize,
    witness_script: &Script,
    prevout_value: u64,
    pubkey: &PublicKey,
    signature: &Signature,
) -> Result<(), ChannelError> {
    let sighash = segwit_sighash(tx, input_index, witness_script, prevout_value);
    let message = SecpMessage::from_slice(&sighash)
        .expect("sighash is always 32 bytes");
    secp.verify_ecdsa(&message, signature, pubkey).map_err(|_| {
        ChannelError::BadSignature {
            context: "multisig spend",
        }
    })
}

/// Assembles the 2-of-2 multisig witness stack (empty dummy for the
/// OP_CHECKMULTISIG off-by-one bug, then the two signatures in the same
/// order as the pubkeys appear in `witness_script`, then the script
/// itself).
pub fn multisig_witness(
    first_sig: &Signature,
    second_sig: &Signature,
    witness_script: &Script,
) -> Witness {
    let mut der_with_sighash = |sig: &Signature| -> Vec<u8> {
        let mut bytes = sig.serialize_der().to_vec();
        bytes.push(EcdsaSighashType::All as u8);
        bytes
    };
    let mut witness = Witness::new();
    witness.push(Vec::new());
    witness.push(der_with_sighash(first_sig));
    witness.push(der_with_sighash(second_sig));
    witness.push(witness_script.to_bytes());
    witness
}

/// Assembles the witness stack for spending a [`timelocked_contract_script`]
/// through its CLTV branch: the client's signature, a falsy selector that
/// steers execution into the `OP_ELSE` branch, then the witness script.
pub fn timelocked_branch_witness(signature: &Signature, witness_script: &Script) -> Witness {
    let mut sig_bytes = signature.serialize_der().to_vec();
    sig_bytes.push(EcdsaSighashType::All as u8);
    let mut witness = Witness::new();
    witness.push(sig_bytes);
    witness.push(Vec::new());
    witness.push(witness_script.to_bytes());
    witness
}

/// Builds the bare 2-of-2 multisig lock script shared by both V1 and V2
/// contracts. Keys must already be in canonical lexicographic order (see
/// [`crate::keys::ChannelKeys::multisig_pubkeys`]).
pub fn multisig_lock_script(pubkeys: (PublicKey, PublicKey)) -> LockScript {
    let (a, b) = pubkeys;
    Builder::new()
        .push_int(2)
        .push_key(&bitcoin::PublicKey::new(a))
        .push_key(&bitcoin::PublicKey::new(b))
        .push_int(2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
        .into()
}

/// Builds the V2 contract script: either party may spend cooperatively
/// through the 2-of-2 branch, or the client may spend unilaterally once
/// `expire_time` has passed.
pub fn timelocked_contract_script(
    pubkeys: (PublicKey, PublicKey),
    client_pubkey: PublicKey,
    expire_time: u32,
) -> LockScript {
    let (a, b) = pubkeys;
    Builder::new()
        .push_opcode(OP_IF)
        .push_int(2)
        .push_key(&bitcoin::PublicKey::new(a))
        .push_key(&bitcoin::PublicKey::new(b))
        .push_int(2)
        .push_opcode(OP_CHECKMULTISIG)
        .push_opcode(OP_ELSE)
        .push_int(expire_time as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_key(&bitcoin::PublicKey::new(client_pubkey))
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script()
        .into()
}

/// The witness (P2WSH) script wrapping a V1 contract's bare multisig lock
/// script.
pub fn contract_witness_script_v1(
    pubkeys: (PublicKey, PublicKey),
) -> WitnessScript {
    multisig_lock_script(pubkeys).into()
}

/// The witness (P2WSH) script wrapping a V2 contract's time-locked lock
/// script.
pub fn contract_witness_script_v2(
    pubkeys: (PublicKey, PublicKey),
    client_pubkey: PublicKey,
    expire_time: u32,
) -> WitnessScript {
    timelocked_contract_script(pubkeys, client_pubkey, expire_time).into()
}

/// The scriptPubkey of the contract's multisig output.
pub fn contract_script_pubkey(witness_script: &WitnessScript) -> PubkeyScript {
    witness_script.clone().to_p2wsh()
}

/// A plain P2WPKH output paying directly to `pubkey`, used as the refund
/// and settlement destination for both client and server (neither the
/// refund nor the payment message carries an explicit destination script,
/// so it is always derived from the multisig key in this way).
pub fn payout_script_for_pubkey(pubkey: PublicKey) -> PubkeyScript {
    bitcoin::PublicKey::new(pubkey)
        .wpubkey_hash()
        .expect("multisig keys are always compressed")
        .into()
}

/// Builds the contract transaction: an unsigned skeleton spending the
/// given inputs into the multisig output (plus an optional change output
/// back to the client). Callers apply `modify_contract_send_request`
/// before signing, and hand the result to the wallet for coin selection
/// and signatures.
pub fn build_contract_transaction(
    inputs: Vec<OutPoint>,
    multisig_script_pubkey: Script,
    locked_value: u64,
    change_script_pubkey: Option<Script>,
    change_value: u64,
) -> Transaction {
    let mut output = vec![TxOut {
        value: locked_value,
        script_pubkey: multisig_script_pubkey,
    }];
    if let Some(change_script) = change_script_pubkey {
        if change_value > 0 {
            output.push(TxOut {
                value: change_value,
                script_pubkey: change_script,
            });
        }
    }
    Transaction {
        version: 2,
        lock_time: PackedLockTime(0),
        input: inputs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output,
    }
}

/// Builds the refund transaction: spends the contract's multisig output
/// back to the client, locked until (at least) `expire_time`. The
/// sequence number is set below `0xffffffff` so the transaction-level
/// `nLockTime` actually takes effect.
pub fn build_refund_transaction(
    contract_outpoint: OutPoint,
    client_script_pubkey: Script,
    refund_value: u64,
    expire_time: u32,
) -> Transaction {
    Transaction {
        version: 2,
        lock_time: PackedLockTime(expire_time),
        input: vec![TxIn {
            previous_output: contract_outpoint,
            script_sig: Script::new(),
            sequence: Sequence(0xFFFF_FFFE),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: refund_value,
            script_pubkey: client_script_pubkey,
        }],
    }
}

/// Builds the payment transaction `T_pay_i`: spends the contract's
/// multisig output with one output to the server (the cumulative paid
/// amount) and one back to the client (the residual change), omitting
/// the client output entirely when it would be dust.
pub fn build_payment_transaction(
    contract_outpoint: OutPoint,
    server_script_pubkey: Script,
    paid_value: u64,
    client_script_pubkey: Script,
    client_change_value: u64,
) -> Transaction {
    let mut output = vec![TxOut {
        value: paid_value,
        script_pubkey: server_script_pubkey,
    }];
    if client_change_value > 0 {
        output.push(TxOut {
            value: client_change_value,
            script_pubkey: client_script_pubkey,
        });
    }
    Transaction {
        version: 2,
        lock_time: PackedLockTime(0),
        input: vec![TxIn {
            previous_output: contract_outpoint,
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output,
    }
}

/// Sorts two multisig public keys into canonical lexicographic order, as
/// required by [`multisig_lock_script`] and [`timelocked_contract_script`].
pub fn lex_order_pubkeys(a: PublicKey, b: PublicKey) -> (PublicKey, PublicKey) {
    let mut keys = [a, b];
    keys.lex_order();
    (keys[0], keys[1])
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
    fn multisig_script_is_p2wsh() {
        let pubkeys = lex_order_pubkeys(dumb_pubkey(1), dumb_pubkey(2));
        let witness_script = contract_witness_script_v1(pubkeys);
        let script_pubkey = contract_script_pubkey(&witness_script);
        assert!(Script::from(script_pubkey).is_v0_p2wsh());
    }

    #[test]
    fn payment_transaction_drops_dust_change() {
        let outpoint = OutPoint::null();
        let server_script = Script::new();
        let client_script = Script::new();
        let tx = build_payment_transaction(
            outpoint,
            server_script,
            1_000_000,
            client_script,
            0,
        );
        assert_eq!(tx.output.len(), 1);
    }

    #[test]
    fn refund_transaction_uses_nonfinal_sequence() {
        let outpoint = OutPoint::null();
        let tx = build_refund_transaction(outpoint, Script::new(), 500_000, 123);
        assert!(tx.input[0].sequence.0 < 0xFFFF_FFFF);
        assert_eq!(tx.lock_time.0, 123);
    }
}
