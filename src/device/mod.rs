//! Interface to the hardware signing device.
//!
//! The device holds one of the two keys of the wallet. It only signs for wallet
//! policies it has registered, and hands us back one signature per (input, key) it
//! controls, to be collated into the PSBT on our side.

pub mod ledger;

use crate::descriptors::MultisigDescriptor;

use std::{error, fmt};

use async_trait::async_trait;
use miniscript::bitcoin::{
    self,
    bip32::{ChildNumber, DerivationPath, Fingerprint, Xpub},
    ecdsa,
    hashes::{sha256, Hash, HashEngine},
    psbt::Psbt,
};

#[derive(Debug)]
pub enum DeviceError {
    Hwi(async_hwi::Error),
    /// The device wouldn't give us a registration proof for the policy.
    RegistrationRefused,
    /// No policy with this id was ever registered on the device.
    UnknownPolicy(sha256::Hash),
    /// The registration proof doesn't match the policy.
    InvalidAuthCode,
    Unexpected(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Hwi(e) => write!(f, "Device error: '{}'.", e),
            Self::RegistrationRefused => {
                write!(f, "The device refused to register the wallet policy.")
            }
            Self::UnknownPolicy(id) => {
                write!(f, "No wallet policy with id '{}' registered on the device.", id)
            }
            Self::InvalidAuthCode => write!(
                f,
                "The registration proof for this wallet policy is invalid."
            ),
            Self::Unexpected(e) => write!(f, "Unexpected device error: '{}'.", e),
        }
    }
}

impl error::Error for DeviceError {}

impl From<async_hwi::Error> for DeviceError {
    fn from(e: async_hwi::Error) -> Self {
        Self::Hwi(e)
    }
}

/// Proof that a wallet policy was registered on a signing device. To be provided on
/// every subsequent call referencing the policy. Opaque, with no expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRegistration {
    /// Name under which the policy was registered.
    pub name: String,
    /// Stable identifier of the registered policy.
    pub policy_id: sha256::Hash,
    /// Authentication code returned by the device at registration time.
    pub hmac: [u8; 32],
}

/// Stable identifier of a named wallet policy, from its serialization.
pub fn wallet_policy_id(name: &str, policy: &MultisigDescriptor) -> sha256::Hash {
    let mut engine = sha256::Hash::engine();
    engine.input(name.as_bytes());
    engine.input(policy.to_string().as_bytes());
    sha256::Hash::from_engine(engine)
}

/// A signature produced by the device for one key of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureEntry {
    pub input_index: usize,
    pub pubkey: bitcoin::PublicKey,
    pub signature: ecdsa::Signature,
}

/// The signatures present in `signed` but not in `unsigned`, one entry per
/// (input, key) pair.
pub fn signature_entries(unsigned: &Psbt, signed: &Psbt) -> Vec<SignatureEntry> {
    let mut entries = Vec::new();
    for (input_index, input) in signed.inputs.iter().enumerate() {
        for (pubkey, signature) in &input.partial_sigs {
            let already_there = unsigned
                .inputs
                .get(input_index)
                .map(|inp| inp.partial_sigs.contains_key(pubkey))
                .unwrap_or(false);
            if !already_there {
                entries.push(SignatureEntry {
                    input_index,
                    pubkey: *pubkey,
                    signature: *signature,
                });
            }
        }
    }
    entries
}

/// Our signing device.
#[async_trait]
pub trait SigningDevice: Send + Sync {
    /// Get the fingerprint of the device's master key.
    async fn get_master_fingerprint(&self) -> Result<Fingerprint, DeviceError>;

    /// Get the extended public key at this derivation path.
    async fn get_extended_pubkey(&self, path: &DerivationPath) -> Result<Xpub, DeviceError>;

    /// Register the wallet policy on the device under this name, getting back the
    /// registration proof.
    async fn register_wallet(
        &self,
        name: &str,
        policy: &MultisigDescriptor,
    ) -> Result<PolicyRegistration, DeviceError>;

    /// The address of the wallet at this derivation index, optionally displayed on the
    /// device's screen for verification by the user.
    async fn get_wallet_address(
        &self,
        policy: &MultisigDescriptor,
        registration: &PolicyRegistration,
        change: bool,
        index: ChildNumber,
        display: bool,
    ) -> Result<bitcoin::Address, DeviceError>;

    /// Have the device sign this PSBT for the registered policy. Returns one entry per
    /// (input, key) the device signed for; the PSBT itself is left untouched.
    async fn sign_psbt(
        &self,
        psbt: &Psbt,
        policy: &MultisigDescriptor,
        registration: &PolicyRegistration,
    ) -> Result<Vec<SignatureEntry>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    use miniscript::bitcoin::{secp256k1, EcdsaSighashType};

    fn dummy_signature(byte: u8) -> (bitcoin::PublicKey, ecdsa::Signature) {
        let secp = secp256k1::Secp256k1::new();
        let sk = secp256k1::SecretKey::from_slice(&[byte; 32]).unwrap();
        let message = secp256k1::Message::from_digest([byte; 32]);
        (
            bitcoin::PublicKey::new(sk.public_key(&secp)),
            ecdsa::Signature {
                signature: secp.sign_ecdsa(&message, &sk),
                sighash_type: EcdsaSighashType::All,
            },
        )
    }

    fn dummy_psbt() -> Psbt {
        let tx = bitcoin::Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn::default(), bitcoin::TxIn::default()],
            output: vec![],
        };
        Psbt::from_unsigned_tx(tx).unwrap()
    }

    #[test]
    fn signature_entries_diffing() {
        let unsigned = dummy_psbt();
        let mut signed = unsigned.clone();

        // Nothing new, nothing to report.
        assert_eq!(signature_entries(&unsigned, &signed), vec![]);

        // A signature on each input is picked up, with the right index.
        let (pubkey1, sig1) = dummy_signature(1);
        let (pubkey2, sig2) = dummy_signature(2);
        signed.inputs[0].partial_sigs.insert(pubkey1, sig1);
        signed.inputs[1].partial_sigs.insert(pubkey2, sig2);
        let entries = signature_entries(&unsigned, &signed);
        assert_eq!(entries.len(), 2);
        assert!(entries.contains(&SignatureEntry {
            input_index: 0,
            pubkey: pubkey1,
            signature: sig1
        }));
        assert!(entries.contains(&SignatureEntry {
            input_index: 1,
            pubkey: pubkey2,
            signature: sig2
        }));

        // Signatures already present before aren't reported again.
        let mut unsigned = unsigned;
        unsigned.inputs[0].partial_sigs.insert(pubkey1, sig1);
        let entries = signature_entries(&unsigned, &signed);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].input_index, 1);
    }

    #[test]
    fn policy_id_is_stable() {
        use crate::{descriptors::CosignerKey, signer::HotSigner};

        let secp = secp256k1::Secp256k1::new();
        let account_path = DerivationPath::from_str("m/84'/1'/0'").unwrap();
        let key = |byte: u8| {
            let signer =
                HotSigner::from_seed(bitcoin::Network::Testnet, &[byte; 32]).unwrap();
            CosignerKey {
                origin: (signer.fingerprint(&secp), account_path.clone()),
                xpub: signer.xpub_at(&account_path, &secp),
            }
        };
        let policy =
            MultisigDescriptor::new(key(0xcd), key(0xab), bitcoin::Network::Testnet).unwrap();

        assert_eq!(wallet_policy_id("duosig", &policy), wallet_policy_id("duosig", &policy));
        assert_ne!(wallet_policy_id("duosig", &policy), wallet_policy_id("other", &policy));
    }
}
