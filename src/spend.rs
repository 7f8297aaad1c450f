//! Creating the spend transaction and collating the signatures into it.

use crate::{descriptors::DerivedMultisigDesc, device::SignatureEntry};

use std::{
    collections::BTreeMap,
    error, fmt,
};

use miniscript::{
    bitcoin::{
        self, absolute,
        psbt::{Input as PsbtIn, Output as PsbtOut, Psbt},
        secp256k1, transaction,
    },
    psbt::PsbtExt,
};

/// Assume that paying more than 1BTC in fee is a bug.
pub const MAX_FEE: bitcoin::Amount = bitcoin::Amount::ONE_BTC;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendCreationError {
    InsaneFee(bitcoin::Amount),
    /// The coin's value doesn't even cover the fee.
    InsufficientFunds {
        available: bitcoin::Amount,
        fee: bitcoin::Amount,
    },
    /// The output would be too small to be relayed.
    DustOutput(bitcoin::Amount),
    /// The provided previous transaction doesn't create the coin we spend.
    PreviousTxMismatch(bitcoin::OutPoint),
}

impl fmt::Display for SpendCreationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InsaneFee(amount) => write!(
                f,
                "We assume a fee of {} is a mistake. The maximum is {}.",
                amount, MAX_FEE
            ),
            Self::InsufficientFunds { available, fee } => write!(
                f,
                "Cannot pay a fee of {} out of a coin worth {}.",
                fee, available
            ),
            Self::DustOutput(amount) => {
                write!(f, "An output of {} would not be relayed.", amount)
            }
            Self::PreviousTxMismatch(op) => write!(
                f,
                "The previous transaction does not create the coin at '{}'.",
                op
            ),
        }
    }
}

impl error::Error for SpendCreationError {}

/// Create a PSBT spending the coin at `outpoint`, worth `amount`, to `recipient`,
/// minus the fee. The coin must pay to the script of `derived_desc`, at whose index
/// the wallet keys are derived.
///
/// The previous transaction is required in full as the coin is not a native segwit
/// output. Refuses to create a transaction whose output would underflow or be dust, or
/// paying more than [MAX_FEE] in fees.
pub fn create_spend_psbt(
    derived_desc: &DerivedMultisigDesc,
    outpoint: bitcoin::OutPoint,
    amount: bitcoin::Amount,
    prev_tx: bitcoin::Transaction,
    recipient: &bitcoin::Address,
    fee: bitcoin::Amount,
) -> Result<Psbt, SpendCreationError> {
    if fee > MAX_FEE || fee == bitcoin::Amount::ZERO {
        return Err(SpendCreationError::InsaneFee(fee));
    }

    // The coin must be an output of the provided transaction, and one of ours.
    if prev_tx.compute_txid() != outpoint.txid {
        return Err(SpendCreationError::PreviousTxMismatch(outpoint));
    }
    let prev_txo = prev_tx
        .output
        .get(outpoint.vout as usize)
        .ok_or(SpendCreationError::PreviousTxMismatch(outpoint))?;
    if prev_txo.value != amount || prev_txo.script_pubkey != derived_desc.script_pubkey() {
        return Err(SpendCreationError::PreviousTxMismatch(outpoint));
    }

    // Rule out an underflowing or non-relayable output right away instead of letting
    // the arithmetic wrap around.
    let out_value = amount
        .checked_sub(fee)
        .ok_or(SpendCreationError::InsufficientFunds {
            available: amount,
            fee,
        })?;
    let out_script = recipient.script_pubkey();
    if out_value < out_script.minimal_non_dust() {
        return Err(SpendCreationError::DustOutput(out_value));
    }

    let tx = bitcoin::Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![bitcoin::TxIn {
            previous_output: outpoint,
            sequence: bitcoin::Sequence::ENABLE_RBF_NO_LOCKTIME,
            ..bitcoin::TxIn::default()
        }],
        output: vec![bitcoin::TxOut {
            value: out_value,
            script_pubkey: out_script,
        }],
    };

    // Populate the input with the information needed by both signers: the redeem
    // script, the key origins and the full previous transaction.
    let mut psbt_in = PsbtIn::default();
    derived_desc.update_psbt_in(&mut psbt_in);
    psbt_in.non_witness_utxo = Some(prev_tx);

    Ok(Psbt {
        unsigned_tx: tx,
        version: 0,
        xpub: BTreeMap::new(),
        proprietary: BTreeMap::new(),
        unknown: BTreeMap::new(),
        inputs: vec![psbt_in],
        outputs: vec![PsbtOut::default()],
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollationError {
    /// A signature entry refers to an input we don't have.
    UnknownInputIndex(usize),
    Finalization(String),
    TxExtraction(String),
}

impl fmt::Display for CollationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownInputIndex(i) => {
                write!(f, "Signature entry for unknown input at index {}.", i)
            }
            Self::Finalization(e) => {
                write!(f, "Failed to finalize the spend transaction PSBT: '{}'.", e)
            }
            Self::TxExtraction(e) => write!(
                f,
                "Failed to extract the transaction from the PSBT: '{}'.",
                e
            ),
        }
    }
}

impl error::Error for CollationError {}

/// Apply signature entries returned by the signing device to the PSBT. Each entry goes
/// to the partial signatures of the input it refers to.
pub fn apply_signature_entries(
    psbt: &mut Psbt,
    entries: &[SignatureEntry],
) -> Result<(), CollationError> {
    for entry in entries {
        let psbt_in = psbt
            .inputs
            .get_mut(entry.input_index)
            .ok_or(CollationError::UnknownInputIndex(entry.input_index))?;
        psbt_in.partial_sigs.insert(entry.pubkey, entry.signature);
    }
    Ok(())
}

/// Finalize the PSBT and extract the transaction to broadcast.
///
/// This fails if any input's accumulated signatures don't satisfy its script: we rely
/// on it as the completeness check, no threshold accounting is done beforehand. The
/// order the signatures were applied in doesn't matter, only the script does.
pub fn finalize_spend<C: secp256k1::Verification>(
    psbt: &mut Psbt,
    secp: &secp256k1::Secp256k1<C>,
) -> Result<bitcoin::Transaction, CollationError> {
    psbt.finalize_mut(secp).map_err(|e| {
        CollationError::Finalization(e.into_iter().map(|e| e.to_string() + ". ").collect())
    })?;
    psbt.clone()
        .extract_tx()
        .map_err(|e| CollationError::TxExtraction(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptors::{CosignerKey, MultisigDescriptor},
        device::signature_entries,
        signer::HotSigner,
        testutils::funding_tx,
        DEPOSIT_DERIV_INDEX,
    };

    use std::str::FromStr;

    use miniscript::bitcoin::{bip32, Address, Amount, Network, OutPoint};

    struct TestWallet {
        device_signer: HotSigner,
        local_signer: HotSigner,
        desc: MultisigDescriptor,
        secp: secp256k1::Secp256k1<secp256k1::All>,
    }

    fn test_wallet() -> TestWallet {
        let secp = secp256k1::Secp256k1::new();
        let account_path = bip32::DerivationPath::from_str("m/84'/1'/0'").unwrap();
        let device_signer = HotSigner::from_seed(Network::Testnet, &[0xcd; 32]).unwrap();
        let local_signer = HotSigner::from_seed(Network::Testnet, &[0xab; 32]).unwrap();
        let key = |signer: &HotSigner| CosignerKey {
            origin: (signer.fingerprint(&secp), account_path.clone()),
            xpub: signer.xpub_at(&account_path, &secp),
        };
        let desc =
            MultisigDescriptor::new(key(&device_signer), key(&local_signer), Network::Testnet)
                .unwrap();
        TestWallet {
            device_signer,
            local_signer,
            desc,
            secp,
        }
    }

    fn recipient() -> Address {
        Address::from_str("2MvD5Ug9arybH1K4rJNDwiNaSCw9cPxfyZn")
            .unwrap()
            .require_network(Network::Testnet)
            .unwrap()
    }

    fn funded_psbt(wallet: &TestWallet, amount: Amount, fee: Amount) -> Psbt {
        let derived = wallet.desc.receive_descriptor().derive(DEPOSIT_DERIV_INDEX);
        let prev_tx = funding_tx(&[(derived.script_pubkey(), amount)]);
        let outpoint = OutPoint::new(prev_tx.compute_txid(), 0);
        create_spend_psbt(&derived, outpoint, amount, prev_tx, &recipient(), fee).unwrap()
    }

    #[test]
    fn create_spend_psbt_contents() {
        let wallet = test_wallet();
        let psbt = funded_psbt(&wallet, Amount::from_sat(2_000), Amount::from_sat(500));

        assert_eq!(psbt.unsigned_tx.input.len(), 1);
        assert_eq!(psbt.unsigned_tx.output.len(), 1);
        // Output value is exactly the input value minus the fee.
        assert_eq!(psbt.unsigned_tx.output[0].value, Amount::from_sat(1_500));
        assert_eq!(
            psbt.unsigned_tx.output[0].script_pubkey,
            recipient().script_pubkey()
        );
        // Everything the signers need is in the input.
        let psbt_in = &psbt.inputs[0];
        assert!(psbt_in.non_witness_utxo.is_some());
        assert!(psbt_in.redeem_script.is_some());
        assert_eq!(psbt_in.bip32_derivation.len(), 2);
        // We signal replaceability.
        assert!(psbt.unsigned_tx.input[0].sequence.is_rbf());
    }

    #[test]
    fn create_spend_psbt_insufficient_funds() {
        let wallet = test_wallet();
        let derived = wallet.desc.receive_descriptor().derive(DEPOSIT_DERIV_INDEX);

        // Value not even covering the fee.
        for sats in [400, 500] {
            let amount = Amount::from_sat(sats);
            let prev_tx = funding_tx(&[(derived.script_pubkey(), amount)]);
            let outpoint = OutPoint::new(prev_tx.compute_txid(), 0);
            let res = create_spend_psbt(
                &derived,
                outpoint,
                amount,
                prev_tx,
                &recipient(),
                Amount::from_sat(500),
            );
            if sats < 500 {
                assert_eq!(
                    res,
                    Err(SpendCreationError::InsufficientFunds {
                        available: amount,
                        fee: Amount::from_sat(500),
                    })
                );
            } else {
                // Exactly the fee: a null output, which is dust.
                assert_eq!(
                    res,
                    Err(SpendCreationError::DustOutput(Amount::ZERO))
                );
            }
        }

        // A remainder below the dust threshold is refused too.
        let amount = Amount::from_sat(700);
        let prev_tx = funding_tx(&[(derived.script_pubkey(), amount)]);
        let outpoint = OutPoint::new(prev_tx.compute_txid(), 0);
        assert!(matches!(
            create_spend_psbt(
                &derived,
                outpoint,
                amount,
                prev_tx,
                &recipient(),
                Amount::from_sat(500)
            ),
            Err(SpendCreationError::DustOutput(..))
        ));
    }

    #[test]
    fn create_spend_psbt_sanity_checks() {
        let wallet = test_wallet();
        let derived = wallet.desc.receive_descriptor().derive(DEPOSIT_DERIV_INDEX);
        let amount = Amount::from_sat(2_000);
        let prev_tx = funding_tx(&[(derived.script_pubkey(), amount)]);
        let txid = prev_tx.compute_txid();

        // Wrong vout.
        assert!(matches!(
            create_spend_psbt(
                &derived,
                OutPoint::new(txid, 1),
                amount,
                prev_tx.clone(),
                &recipient(),
                Amount::from_sat(500)
            ),
            Err(SpendCreationError::PreviousTxMismatch(..))
        ));

        // Wrong txid.
        let other_tx = funding_tx(&[(recipient().script_pubkey(), amount)]);
        assert!(matches!(
            create_spend_psbt(
                &derived,
                OutPoint::new(txid, 0),
                amount,
                other_tx,
                &recipient(),
                Amount::from_sat(500)
            ),
            Err(SpendCreationError::PreviousTxMismatch(..))
        ));

        // Wrong amount.
        assert!(matches!(
            create_spend_psbt(
                &derived,
                OutPoint::new(txid, 0),
                Amount::from_sat(3_000),
                prev_tx.clone(),
                &recipient(),
                Amount::from_sat(500)
            ),
            Err(SpendCreationError::PreviousTxMismatch(..))
        ));

        // Insane fee.
        assert!(matches!(
            create_spend_psbt(
                &derived,
                OutPoint::new(txid, 0),
                amount,
                prev_tx,
                &recipient(),
                Amount::from_sat(200_000_000)
            ),
            Err(SpendCreationError::InsaneFee(..))
        ));
    }

    #[test]
    fn collate_and_finalize_threshold() {
        let wallet = test_wallet();
        let psbt = funded_psbt(&wallet, Amount::from_sat(2_000), Amount::from_sat(500));

        // Unsigned: no way to finalize.
        let mut unsigned = psbt.clone();
        assert!(matches!(
            finalize_spend(&mut unsigned, &wallet.secp),
            Err(CollationError::Finalization(..))
        ));

        // A single signature out of two: still no.
        let mut half_signed = wallet
            .local_signer
            .sign_psbt(psbt.clone(), &wallet.secp)
            .unwrap();
        assert_eq!(half_signed.inputs[0].partial_sigs.len(), 1);
        assert!(matches!(
            finalize_spend(&mut half_signed, &wallet.secp),
            Err(CollationError::Finalization(..))
        ));

        // Both signatures: finalizes, and the script sig carries the redeem script.
        let mut complete = wallet
            .device_signer
            .sign_psbt(half_signed.clone(), &wallet.secp)
            .unwrap();
        let tx = finalize_spend(&mut complete, &wallet.secp).unwrap();
        assert!(!tx.input[0].script_sig.is_empty());
        assert!(tx.input[0].witness.is_empty());

        // Same outcome with the signatures applied in the opposite order.
        let mut reversed = wallet
            .local_signer
            .sign_psbt(
                wallet
                    .device_signer
                    .sign_psbt(psbt, &wallet.secp)
                    .unwrap(),
                &wallet.secp,
            )
            .unwrap();
        let tx_reversed = finalize_spend(&mut reversed, &wallet.secp).unwrap();
        assert_eq!(tx, tx_reversed);
    }

    #[test]
    fn collate_signature_entries() {
        let wallet = test_wallet();
        let psbt = funded_psbt(&wallet, Amount::from_sat(2_000), Amount::from_sat(500));

        // Signatures the device would return, as entries.
        let device_signed = wallet
            .device_signer
            .sign_psbt(psbt.clone(), &wallet.secp)
            .unwrap();
        let entries = signature_entries(&psbt, &device_signed);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].input_index, 0);

        // Applying them to the PSBT puts them at the right input.
        let mut collated = psbt.clone();
        apply_signature_entries(&mut collated, &entries).unwrap();
        assert_eq!(
            collated.inputs[0].partial_sigs,
            device_signed.inputs[0].partial_sigs
        );

        // An entry pointing to a non-existing input is rejected, and the funded input
        // stays unfinalizable.
        let mut wrong_index = entries.clone();
        wrong_index[0].input_index = 1;
        let mut collated = psbt.clone();
        assert_eq!(
            apply_signature_entries(&mut collated, &wrong_index),
            Err(CollationError::UnknownInputIndex(1))
        );
        assert!(collated.inputs[0].partial_sigs.is_empty());
        assert!(matches!(
            finalize_spend(&mut collated, &wallet.secp),
            Err(CollationError::Finalization(..))
        ));
    }
}
