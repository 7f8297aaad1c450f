//! # duosig
//!
//! A one-shot spender for a 2-of-2 multisig between a hardware signing device and a
//! locally-held hot key. It derives the wallet from the two co-signers' account keys,
//! registers the policy on the device, locates a coin to spend through a block
//! explorer, collects both signatures and broadcasts the result.

pub mod config;
pub mod descriptors;
pub mod device;
pub mod explorer;
pub mod signer;
pub mod spend;
#[cfg(test)]
pub mod testutils;

pub use miniscript;

use crate::{
    config::Config,
    descriptors::{CosignerKey, DescCreationError, MultisigDescriptor},
    device::{DeviceError, SigningDevice},
    explorer::{Explorer, ExplorerError},
    signer::{HotSigner, SignerError},
};

use std::{error, fmt};

use miniscript::bitcoin::{self, bip32::ChildNumber, secp256k1};

#[derive(Debug, Clone)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}-dev", self.major, self.minor)
    }
}

pub const VERSION: Version = Version { major: 0, minor: 1 };

/// The derivation index of the deposit address. We only ever use the first address of
/// the receive keychain.
pub const DEPOSIT_DERIV_INDEX: ChildNumber = ChildNumber::Normal { index: 0 };

/// An error occurring while running the spend pipeline.
#[derive(Debug)]
pub enum Error {
    Device(DeviceError),
    Signer(SignerError),
    Explorer(ExplorerError),
    Descriptor(DescCreationError),
    Spend(spend::SpendCreationError),
    Collation(spend::CollationError),
    /// No unspent output was found at the deposit address.
    NoFundingUtxo(bitcoin::Address),
    /// The device and us disagree on the wallet's address.
    AddressMismatch {
        derived: bitcoin::Address,
        device: bitcoin::Address,
    },
    Address(bitcoin::address::ParseError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Device(e) => write!(f, "Signing device error: {}", e),
            Self::Signer(e) => write!(f, "Local signer error: {}", e),
            Self::Explorer(e) => write!(f, "Block explorer error: {}", e),
            Self::Descriptor(e) => write!(f, "Descriptor error: {}", e),
            Self::Spend(e) => write!(f, "Creating spend: {}", e),
            Self::Collation(e) => write!(f, "Collating signatures: {}", e),
            Self::NoFundingUtxo(addr) => write!(
                f,
                "No unspent output to spend at address '{}'. Send funds to it and try again.",
                addr
            ),
            Self::AddressMismatch { derived, device } => write!(
                f,
                "The signing device derived address '{}' for the wallet but we derived '{}'.",
                device, derived
            ),
            Self::Address(e) => write!(f, "Address error: {}", e),
        }
    }
}

impl error::Error for Error {}

impl From<DeviceError> for Error {
    fn from(e: DeviceError) -> Self {
        Self::Device(e)
    }
}

impl From<SignerError> for Error {
    fn from(e: SignerError) -> Self {
        Self::Signer(e)
    }
}

impl From<ExplorerError> for Error {
    fn from(e: ExplorerError) -> Self {
        Self::Explorer(e)
    }
}

impl From<DescCreationError> for Error {
    fn from(e: DescCreationError) -> Self {
        Self::Descriptor(e)
    }
}

impl From<spend::SpendCreationError> for Error {
    fn from(e: spend::SpendCreationError) -> Self {
        Self::Spend(e)
    }
}

impl From<spend::CollationError> for Error {
    fn from(e: spend::CollationError) -> Self {
        Self::Collation(e)
    }
}

/// The outcome of a successful run of the spend pipeline.
#[derive(Debug, Clone)]
pub struct SpendSummary {
    /// The wallet's deposit address the spent coin was sitting at.
    pub deposit_address: bitcoin::Address,
    /// Txid of the broadcast transaction.
    pub txid: bitcoin::Txid,
    /// Value of the single output of the broadcast transaction.
    pub amount: bitcoin::Amount,
}

// A participant in the 2-of-2 wallet. Only the local variant can produce signatures by
// itself, the hardware one goes through the signing device.
enum Cosigner<'a, D> {
    Hardware(&'a D),
    Local(&'a HotSigner),
}

/// Run the whole spend pipeline: derive the wallet from the two co-signers, register
/// it on the device, find a coin to spend, get both signatures and broadcast.
///
/// All external collaborators are taken as parameters so they can be substituted.
/// Every step is awaited to completion before the next one begins.
pub async fn run_spend<D: SigningDevice, E: Explorer>(
    device: &D,
    local_signer: &HotSigner,
    explorer: &E,
    config: &Config,
) -> Result<SpendSummary, Error> {
    let secp = secp256k1::Secp256k1::new();
    let network = config.bitcoin_config.network;
    let account_path = &config.wallet_config.account_path;

    // Gather the key material of both co-signers at the account level.
    let device_fingerprint = device.get_master_fingerprint().await?;
    log::info!(
        "Connected to signing device with fingerprint {}.",
        device_fingerprint
    );
    let device_key = CosignerKey {
        origin: (device_fingerprint, account_path.clone()),
        xpub: device.get_extended_pubkey(account_path).await?,
    };
    let local_key = CosignerKey {
        origin: (local_signer.fingerprint(&secp), account_path.clone()),
        xpub: local_signer.xpub_at(account_path, &secp),
    };

    // The device's own single-sig receive address, for reference.
    let single_sig_addr =
        descriptors::wpkh_receive_address(&device_key, DEPOSIT_DERIV_INDEX, network)?;
    log::info!("Device single-sig receive address: {}.", single_sig_addr);

    let policy = MultisigDescriptor::new(device_key, local_key, network)?;
    log::info!("Using wallet descriptor '{}'.", policy);

    // The registration proof must accompany all further calls referencing the policy.
    let registration = device
        .register_wallet(&config.wallet_config.name, &policy)
        .await?;
    log::info!(
        "Registered wallet policy '{}' on the device with id {}.",
        registration.name,
        registration.policy_id
    );

    // The device must agree with us on where the funds are.
    let deposit_address = policy
        .receive_descriptor()
        .derive(DEPOSIT_DERIV_INDEX)
        .address(network);
    let device_address = device
        .get_wallet_address(&policy, &registration, false, DEPOSIT_DERIV_INDEX, false)
        .await?;
    if device_address != deposit_address {
        return Err(Error::AddressMismatch {
            derived: deposit_address,
            device: device_address,
        });
    }
    log::info!("Multisig deposit address: {}.", deposit_address);

    // Find a coin to spend. We just pick the first unspent output at the address.
    let utxos = explorer.unspent_outputs(&deposit_address).await?;
    let utxo = match utxos.first() {
        Some(utxo) => *utxo,
        None => return Err(Error::NoFundingUtxo(deposit_address)),
    };
    if !utxo.confirmed {
        log::warn!("Spending an unconfirmed coin at {}.", utxo.outpoint);
    }
    log::info!("Spending coin {} worth {}.", utxo.outpoint, utxo.amount);
    let prev_tx = explorer.raw_transaction(&utxo.outpoint.txid).await?;

    let recipient = config
        .wallet_config
        .recipient
        .clone()
        .require_network(network)
        .map_err(Error::Address)?;
    let derived_desc = policy.receive_descriptor().derive(DEPOSIT_DERIV_INDEX);
    let mut psbt = spend::create_spend_psbt(
        &derived_desc,
        utxo.outpoint,
        utxo.amount,
        prev_tx,
        &recipient,
        config.wallet_config.fee,
    )?;

    // Collect both signatures, the device's first and the hot key's afterward. The
    // redeem script alone dictates their position on the script stack.
    for cosigner in [Cosigner::Hardware(device), Cosigner::Local(local_signer)] {
        match cosigner {
            Cosigner::Hardware(device) => {
                let entries = device.sign_psbt(&psbt, &policy, &registration).await?;
                log::info!("Device returned {} signature(s).", entries.len());
                spend::apply_signature_entries(&mut psbt, &entries)?;
            }
            Cosigner::Local(signer) => {
                psbt = signer.sign_psbt(psbt, &secp)?;
            }
        }
    }

    let tx = spend::finalize_spend(&mut psbt, &secp)?;
    let amount = tx
        .output
        .first()
        .expect("the spend transaction has one output")
        .value;
    let txid = explorer.broadcast_tx(&tx).await?;
    log::info!("Broadcast transaction {}.", txid);

    Ok(SpendSummary {
        deposit_address,
        txid,
        amount,
    })
}
