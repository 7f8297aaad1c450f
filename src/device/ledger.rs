//! Ledger signing device, over the HID transport.

use crate::{
    descriptors::MultisigDescriptor,
    device::{
        signature_entries, wallet_policy_id, DeviceError, PolicyRegistration, SignatureEntry,
        SigningDevice,
    },
};

use async_hwi::{ledger, HWI};
use async_trait::async_trait;
use miniscript::bitcoin::{
    self,
    bip32::{ChildNumber, DerivationPath, Fingerprint, Xpub},
    psbt::Psbt,
};
use tokio::sync::Mutex;

/// A Ledger device with the Bitcoin app open.
///
/// Attaching a wallet policy to the underlying handle consumes it, so the handle is
/// taken out and put back for every call referencing a registration. If attaching
/// fails the handle is lost, but so is the run.
pub struct LedgerDevice {
    device: Mutex<Option<ledger::Ledger<ledger::TransportHID>>>,
}

impl LedgerDevice {
    /// Connect to the first Ledger found on USB.
    pub fn connect_hid() -> Result<Self, DeviceError> {
        let api = ledger::HidApi::new()
            .map_err(|e| DeviceError::Hwi(async_hwi::Error::Device(e.to_string())))?;
        for detected in ledger::Ledger::<ledger::TransportHID>::enumerate(&api) {
            match ledger::Ledger::<ledger::TransportHID>::connect(&api, detected) {
                Ok(device) => {
                    return Ok(Self {
                        device: Mutex::new(Some(device)),
                    });
                }
                Err(async_hwi::Error::DeviceNotFound) => {}
                Err(e) => {
                    log::debug!("Error connecting to Ledger candidate: {}.", e);
                }
            }
        }
        Err(DeviceError::Hwi(async_hwi::Error::DeviceNotFound))
    }
}

#[async_trait]
impl SigningDevice for LedgerDevice {
    async fn get_master_fingerprint(&self) -> Result<Fingerprint, DeviceError> {
        let guard = self.device.lock().await;
        let device = guard.as_ref().expect("The handle is always put back");
        Ok(device.get_master_fingerprint().await?)
    }

    async fn get_extended_pubkey(&self, path: &DerivationPath) -> Result<Xpub, DeviceError> {
        let guard = self.device.lock().await;
        let device = guard.as_ref().expect("The handle is always put back");
        Ok(device.get_extended_pubkey(path).await?)
    }

    async fn register_wallet(
        &self,
        name: &str,
        policy: &MultisigDescriptor,
    ) -> Result<PolicyRegistration, DeviceError> {
        let guard = self.device.lock().await;
        let device = guard.as_ref().expect("The handle is always put back");
        let hmac = device
            .register_wallet(name, &policy.to_string())
            .await?
            .ok_or(DeviceError::RegistrationRefused)?;
        Ok(PolicyRegistration {
            name: name.to_string(),
            policy_id: wallet_policy_id(name, policy),
            hmac,
        })
    }

    async fn get_wallet_address(
        &self,
        policy: &MultisigDescriptor,
        registration: &PolicyRegistration,
        change: bool,
        index: ChildNumber,
        display: bool,
    ) -> Result<bitcoin::Address, DeviceError> {
        // The app only ever derives addresses for the registered descriptor, which is
        // the one we derive from. It can still display it for the user to verify.
        let desc = if change {
            policy.change_descriptor()
        } else {
            policy.receive_descriptor()
        };
        let address = desc.derive(index).address(policy.network());

        if display {
            let mut guard = self.device.lock().await;
            let device = guard
                .take()
                .expect("The handle is always put back")
                .with_wallet(
                    &registration.name,
                    &policy.to_string(),
                    Some(registration.hmac),
                )?;
            let res = device
                .display_address(&async_hwi::AddressScript::Miniscript {
                    change,
                    index: index.into(),
                })
                .await;
            *guard = Some(device);
            res?;
        }

        Ok(address)
    }

    async fn sign_psbt(
        &self,
        psbt: &Psbt,
        policy: &MultisigDescriptor,
        registration: &PolicyRegistration,
    ) -> Result<Vec<SignatureEntry>, DeviceError> {
        let mut guard = self.device.lock().await;
        let device = guard
            .take()
            .expect("The handle is always put back")
            .with_wallet(
                &registration.name,
                &policy.to_string(),
                Some(registration.hmac),
            )?;

        // The device adds its partial signatures to a copy, we report the diff.
        let mut signed = psbt.clone();
        let res = device.sign_tx(&mut signed).await;
        *guard = Some(device);
        res?;

        Ok(signature_entries(psbt, &signed))
    }
}
