//! Signer module
//!
//! The locally-held co-signer. It keeps its key in memory, derived from a seed or a
//! BIP39 mnemonic, and can sign for the P2SH inputs of our spend transaction.

use std::{error, fmt, str::FromStr};

use miniscript::bitcoin::{
    self, bip32,
    hashes::Hash,
    psbt::Psbt,
    secp256k1,
    sighash::SighashCache,
    EcdsaSighashType,
};

/// An error related to using a signer.
#[derive(Debug)]
pub enum SignerError {
    Mnemonic(bip39::Error),
    Bip32(bip32::Error),
    /// Different number of PSBT and transaction inputs, etc..
    InsanePsbt,
    /// The input has a sighash type we can't sign for.
    UnsupportedSighashType(usize),
    /// The input is missing the redeem script we'd sign for.
    MissingRedeemScript(usize),
    /// A key in the input's derivation map doesn't match what we derive.
    KeyMismatch(usize),
}

impl fmt::Display for SignerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Mnemonic(e) => write!(f, "Error when working with mnemonics: {}", e),
            Self::Bip32(e) => write!(f, "BIP32 error: {}", e),
            Self::InsanePsbt => write!(f, "Signed PSBT is empty or malformed."),
            Self::UnsupportedSighashType(i) => {
                write!(f, "Unsupported sighash type for input at index {}.", i)
            }
            Self::MissingRedeemScript(i) => {
                write!(f, "No redeem script for input at index {}.", i)
            }
            Self::KeyMismatch(i) => write!(
                f,
                "A key in the derivation map of input at index {} isn't derived from our master key.",
                i
            ),
        }
    }
}

impl error::Error for SignerError {}

/// A signer that keeps the key on the machine running us.
pub struct HotSigner {
    master_xpriv: bip32::Xpriv,
}

impl HotSigner {
    /// Create a hot signer from a raw BIP32 seed.
    pub fn from_seed(network: bitcoin::Network, seed: &[u8]) -> Result<Self, SignerError> {
        let master_xpriv = bip32::Xpriv::new_master(network, seed).map_err(SignerError::Bip32)?;
        Ok(Self { master_xpriv })
    }

    /// Create a hot signer from BIP39 mnemonic words, without a passphrase.
    pub fn from_mnemonic(network: bitcoin::Network, words: &str) -> Result<Self, SignerError> {
        let mnemonic = bip39::Mnemonic::from_str(words).map_err(SignerError::Mnemonic)?;
        Self::from_seed(network, &mnemonic.to_seed(""))
    }

    /// Fingerprint of the master key of this signer.
    pub fn fingerprint(
        &self,
        secp: &secp256k1::Secp256k1<secp256k1::All>,
    ) -> bip32::Fingerprint {
        self.master_xpriv.fingerprint(secp)
    }

    /// The extended public key at this derivation path.
    pub fn xpub_at(
        &self,
        path: &bip32::DerivationPath,
        secp: &secp256k1::Secp256k1<secp256k1::All>,
    ) -> bip32::Xpub {
        let xpriv = self.xpriv_at(path, secp);
        bip32::Xpub::from_priv(secp, &xpriv)
    }

    fn xpriv_at(
        &self,
        path: &bip32::DerivationPath,
        secp: &secp256k1::Secp256k1<secp256k1::All>,
    ) -> bip32::Xpriv {
        self.master_xpriv
            .derive_priv(secp, path)
            .expect("Never deriving at a depth higher than 255")
    }

    /// Sign all inputs of this PSBT for which the derivation map contains a key derived
    /// from our master key. The redeem script must be set for those: we only ever sign
    /// for the P2SH multisig.
    pub fn sign_psbt(
        &self,
        mut psbt: Psbt,
        secp: &secp256k1::Secp256k1<secp256k1::All>,
    ) -> Result<Psbt, SignerError> {
        let fingerprint = self.fingerprint(secp);
        let tx = psbt.unsigned_tx.clone();
        if psbt.inputs.len() != tx.input.len() {
            return Err(SignerError::InsanePsbt);
        }
        let mut sighash_cache = SighashCache::new(&tx);

        for i in 0..psbt.inputs.len() {
            let sighash_type = psbt.inputs[i]
                .sighash_type
                .map(|t| t.ecdsa_hash_ty())
                .transpose()
                .map_err(|_| SignerError::UnsupportedSighashType(i))?
                .unwrap_or(EcdsaSighashType::All);

            let derivs: Vec<_> = psbt.inputs[i]
                .bip32_derivation
                .iter()
                .map(|(key, (fg, path))| (*key, (*fg, path.clone())))
                .collect();
            for (key, (fg, path)) in derivs {
                if fg != fingerprint {
                    continue;
                }
                let xpriv = self
                    .master_xpriv
                    .derive_priv(secp, &path)
                    .map_err(SignerError::Bip32)?;
                if xpriv.private_key.public_key(secp) != key {
                    return Err(SignerError::KeyMismatch(i));
                }

                let redeem_script = psbt.inputs[i]
                    .redeem_script
                    .clone()
                    .ok_or(SignerError::MissingRedeemScript(i))?;
                let sighash = sighash_cache
                    .legacy_signature_hash(i, &redeem_script, sighash_type.to_u32())
                    .expect("Input index was checked against the transaction");
                let message = secp256k1::Message::from_digest(sighash.to_byte_array());
                let signature = secp.sign_ecdsa(&message, &xpriv.private_key);
                psbt.inputs[i].partial_sigs.insert(
                    bitcoin::PublicKey::new(key),
                    bitcoin::ecdsa::Signature {
                        signature,
                        sighash_type,
                    },
                );
            }
        }

        Ok(psbt)
    }
}
