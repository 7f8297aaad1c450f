//! Descriptors for the 2-of-2 wallet.
//!
//! The wallet is a single multipath `sh(multi(2,..))` descriptor between the signing
//! device's key and the locally-held one. Being a legacy P2SH, signers must be handed
//! the full previous transaction of every spent coin.

use std::{error, fmt, str::FromStr};

use miniscript::{
    bitcoin::{self, bip32},
    descriptor::{self, Descriptor, DescriptorPublicKey},
    psbt::PsbtInputExt,
    ForEachKey,
};

#[derive(Debug)]
pub enum DescCreationError {
    Miniscript(miniscript::Error),
    DuplicateKey,
    /// Some key in the descriptor is for another network.
    NetworkMismatch(bitcoin::Network),
}

impl fmt::Display for DescCreationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Miniscript(e) => write!(f, "Miniscript error: '{}'.", e),
            Self::DuplicateKey => write!(f, "The two co-signers must use distinct keys."),
            Self::NetworkMismatch(net) => {
                write!(f, "Not all keys in the descriptor are for network '{}'.", net)
            }
        }
    }
}

impl error::Error for DescCreationError {}

impl From<miniscript::Error> for DescCreationError {
    fn from(e: miniscript::Error) -> Self {
        Self::Miniscript(e)
    }
}

/// Account-level key material for one of the two co-signers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosignerKey {
    /// Master fingerprint of the signer and the hardened path down to the account.
    pub origin: (bip32::Fingerprint, bip32::DerivationPath),
    /// The extended public key at the account.
    pub xpub: bip32::Xpub,
}

impl fmt::Display for CosignerKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (fingerprint, deriv_path) = &self.origin;
        write!(f, "[{}", fingerprint)?;
        for child in deriv_path {
            write!(f, "/{}", child)?;
        }
        write!(f, "]{}/<0;1>/*", self.xpub)
    }
}

/// The multipath descriptor of the 2-of-2 wallet, with its receive and change
/// single-path sub-descriptors. We use /0/* for receiving and /1/* for change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigDescriptor {
    multi_desc: Descriptor<DescriptorPublicKey>,
    receive_desc: SinglePathDesc,
    change_desc: SinglePathDesc,
    network: bitcoin::Network,
}

impl fmt::Display for MultisigDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.multi_desc)
    }
}

impl MultisigDescriptor {
    /// A 2-of-2 between the device key and the locally-held key. The order of the keys
    /// in the script is the order they are given in here.
    pub fn new(
        device_key: CosignerKey,
        local_key: CosignerKey,
        network: bitcoin::Network,
    ) -> Result<Self, DescCreationError> {
        if device_key.xpub == local_key.xpub {
            return Err(DescCreationError::DuplicateKey);
        }

        // Sanity checks are not always performed when parsing a descriptor, so we
        // perform them explicitly.
        let desc_str = format!("sh(multi(2,{},{}))", device_key, local_key);
        let multi_desc = Descriptor::<DescriptorPublicKey>::from_str(&desc_str)
            .and_then(|desc| desc.sanity_check().map(|_| desc))
            .map_err(DescCreationError::Miniscript)?;
        if !multi_desc.for_each_key(|k| {
            if let DescriptorPublicKey::MultiXPub(xpub) = k {
                xpub.xkey.network == network.into()
            } else {
                false
            }
        }) {
            return Err(DescCreationError::NetworkMismatch(network));
        }

        // Compute the receive and change "sub" descriptors right away. There must be
        // only two derivation paths, 0 and 1.
        // FIXME: don't rely on into_single_descriptors()'s ordering.
        let mut singlepath_descs = multi_desc
            .clone()
            .into_single_descriptors()
            .expect("Can't error, all paths have the same length")
            .into_iter();
        assert_eq!(singlepath_descs.len(), 2);
        let receive_desc = SinglePathDesc(singlepath_descs.next().expect("First of 2"));
        let change_desc = SinglePathDesc(singlepath_descs.next().expect("Second of 2"));

        Ok(Self {
            multi_desc,
            receive_desc,
            change_desc,
            network,
        })
    }

    /// The network all keys of this descriptor are for.
    pub fn network(&self) -> bitcoin::Network {
        self.network
    }

    /// Get the descriptor for receiving addresses.
    pub fn receive_descriptor(&self) -> &SinglePathDesc {
        &self.receive_desc
    }

    /// Get the descriptor for change addresses.
    pub fn change_descriptor(&self) -> &SinglePathDesc {
        &self.change_desc
    }
}

/// One keychain of the wallet, derivable at any normal index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinglePathDesc(Descriptor<DescriptorPublicKey>);

impl fmt::Display for SinglePathDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SinglePathDesc {
    /// Derive this descriptor at a given index.
    ///
    /// # Panics
    /// - If the given index is hardened.
    pub fn derive(&self, index: bip32::ChildNumber) -> DerivedMultisigDesc {
        assert!(index.is_normal());
        DerivedMultisigDesc(
            self.0
                .at_derivation_index(index.into())
                .expect("A single path descriptor with a normal derivation index"),
        )
    }
}

/// Derived (at a single index) version of the wallet descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedMultisigDesc(Descriptor<descriptor::DefiniteDescriptorKey>);

impl DerivedMultisigDesc {
    pub fn address(&self, network: bitcoin::Network) -> bitcoin::Address {
        self.0.address(network).expect("A P2SH always has an address")
    }

    pub fn script_pubkey(&self) -> bitcoin::ScriptBuf {
        self.0.script_pubkey()
    }

    // NB: panics if called for a Taproot descriptor.
    pub fn redeem_script(&self) -> bitcoin::ScriptBuf {
        self.0.explicit_script().expect("Not a Taproot descriptor")
    }

    /// Update the PSBT input with the redeem script and the key origins, so both
    /// signers can recognize the keys they control.
    pub fn update_psbt_in(&self, psbtin: &mut bitcoin::psbt::Input) {
        if let Err(e) = psbtin.update_with_descriptor_unchecked(&self.0) {
            log::error!(
                "BUG! Please report this! Error when updating PSBT input for desc: {}. Descriptor: {}.",
                e,
                self.0
            );
        }
    }
}

/// The single-sig segwit receive address of a co-signer, for display purpose.
pub fn wpkh_receive_address(
    key: &CosignerKey,
    index: bip32::ChildNumber,
    network: bitcoin::Network,
) -> Result<bitcoin::Address, DescCreationError> {
    let desc_str = format!("wpkh({})", key);
    let desc = Descriptor::<DescriptorPublicKey>::from_str(&desc_str)
        .map_err(DescCreationError::Miniscript)?;
    let receive_desc = desc
        .into_single_descriptors()
        .expect("Can't error, all paths have the same length")
        .into_iter()
        .next()
        .expect("First of 2");
    assert!(index.is_normal());
    Ok(receive_desc
        .at_derivation_index(index.into())
        .expect("A single path descriptor with a normal derivation index")
        .address(network)
        .expect("A P2WPKH always has an address"))
}
