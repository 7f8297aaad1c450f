//! Fakes for the external collaborators of the spend pipeline.

use crate::{
    descriptors::MultisigDescriptor,
    device::{
        signature_entries, wallet_policy_id, DeviceError, PolicyRegistration, SignatureEntry,
        SigningDevice,
    },
    explorer::{Explorer, ExplorerError, Utxo},
    signer::HotSigner,
};

use std::{
    collections::HashMap,
    sync::Mutex,
};

use async_trait::async_trait;
use miniscript::bitcoin::{
    self, absolute,
    bip32::{ChildNumber, DerivationPath, Fingerprint, Xpub},
    hashes::{sha256, Hash, HashEngine, Hmac, HmacEngine},
    psbt::Psbt,
    secp256k1, transaction,
};

/// A signing device faked with an in-process hot signer. It hands out registration
/// proofs and refuses to operate on policies it doesn't know or with a bad proof, as
/// the real thing would.
pub struct FakeDevice {
    signer: HotSigner,
    secp: secp256k1::Secp256k1<secp256k1::All>,
    registered: Mutex<HashMap<sha256::Hash, [u8; 32]>>,
}

impl FakeDevice {
    pub fn new(signer: HotSigner) -> Self {
        Self {
            signer,
            secp: secp256k1::Secp256k1::new(),
            registered: Mutex::new(HashMap::new()),
        }
    }

    fn auth_code(&self, policy_id: &sha256::Hash) -> [u8; 32] {
        let mut engine =
            HmacEngine::<sha256::Hash>::new(self.signer.fingerprint(&self.secp).as_bytes());
        engine.input(policy_id.as_byte_array());
        Hmac::<sha256::Hash>::from_engine(engine).to_byte_array()
    }

    fn check_registration(
        &self,
        policy: &MultisigDescriptor,
        registration: &PolicyRegistration,
    ) -> Result<(), DeviceError> {
        let policy_id = wallet_policy_id(&registration.name, policy);
        let registered = self.registered.lock().unwrap();
        let hmac = registered
            .get(&policy_id)
            .filter(|_| policy_id == registration.policy_id)
            .ok_or(DeviceError::UnknownPolicy(registration.policy_id))?;
        if *hmac != registration.hmac {
            return Err(DeviceError::InvalidAuthCode);
        }
        Ok(())
    }
}

#[async_trait]
impl SigningDevice for FakeDevice {
    async fn get_master_fingerprint(&self) -> Result<Fingerprint, DeviceError> {
        Ok(self.signer.fingerprint(&self.secp))
    }

    async fn get_extended_pubkey(&self, path: &DerivationPath) -> Result<Xpub, DeviceError> {
        Ok(self.signer.xpub_at(path, &self.secp))
    }

    async fn register_wallet(
        &self,
        name: &str,
        policy: &MultisigDescriptor,
    ) -> Result<PolicyRegistration, DeviceError> {
        let policy_id = wallet_policy_id(name, policy);
        let hmac = self.auth_code(&policy_id);
        self.registered.lock().unwrap().insert(policy_id, hmac);
        Ok(PolicyRegistration {
            name: name.to_string(),
            policy_id,
            hmac,
        })
    }

    async fn get_wallet_address(
        &self,
        policy: &MultisigDescriptor,
        registration: &PolicyRegistration,
        change: bool,
        index: ChildNumber,
        _display: bool,
    ) -> Result<bitcoin::Address, DeviceError> {
        self.check_registration(policy, registration)?;
        let desc = if change {
            policy.change_descriptor()
        } else {
            policy.receive_descriptor()
        };
        Ok(desc.derive(index).address(policy.network()))
    }

    async fn sign_psbt(
        &self,
        psbt: &Psbt,
        policy: &MultisigDescriptor,
        registration: &PolicyRegistration,
    ) -> Result<Vec<SignatureEntry>, DeviceError> {
        self.check_registration(policy, registration)?;
        let signed = self
            .signer
            .sign_psbt(psbt.clone(), &self.secp)
            .map_err(|e| DeviceError::Unexpected(e.to_string()))?;
        Ok(signature_entries(psbt, &signed))
    }
}

/// A block explorer faked with in-memory maps. Broadcast transactions are recorded.
pub struct FakeExplorer {
    utxos: HashMap<bitcoin::ScriptBuf, Vec<Utxo>>,
    txs: HashMap<bitcoin::Txid, bitcoin::Transaction>,
    broadcast: Mutex<Vec<bitcoin::Transaction>>,
}

impl FakeExplorer {
    pub fn new() -> Self {
        Self {
            utxos: HashMap::new(),
            txs: HashMap::new(),
            broadcast: Mutex::new(Vec::new()),
        }
    }

    /// Record this transaction as confirmed, all its outputs unspent.
    pub fn add_funding_tx(&mut self, tx: bitcoin::Transaction) {
        let txid = tx.compute_txid();
        for (vout, txo) in tx.output.iter().enumerate() {
            self.utxos
                .entry(txo.script_pubkey.clone())
                .or_insert_with(Vec::new)
                .push(Utxo {
                    outpoint: bitcoin::OutPoint::new(txid, vout as u32),
                    amount: txo.value,
                    confirmed: true,
                });
        }
        self.txs.insert(txid, tx);
    }

    /// All the transactions broadcast through us, in order.
    pub fn broadcasted(&self) -> Vec<bitcoin::Transaction> {
        self.broadcast.lock().unwrap().clone()
    }
}

#[async_trait]
impl Explorer for FakeExplorer {
    async fn unspent_outputs(
        &self,
        address: &bitcoin::Address,
    ) -> Result<Vec<Utxo>, ExplorerError> {
        Ok(self
            .utxos
            .get(&address.script_pubkey())
            .cloned()
            .unwrap_or_default())
    }

    async fn raw_transaction(
        &self,
        txid: &bitcoin::Txid,
    ) -> Result<bitcoin::Transaction, ExplorerError> {
        self.txs
            .get(txid)
            .cloned()
            .ok_or(ExplorerError::TxNotFound(*txid))
    }

    async fn broadcast_tx(
        &self,
        tx: &bitcoin::Transaction,
    ) -> Result<bitcoin::Txid, ExplorerError> {
        self.broadcast.lock().unwrap().push(tx.clone());
        Ok(tx.compute_txid())
    }
}

/// A confirmed-looking transaction paying the given amounts to the given scripts.
pub fn funding_tx(outputs: &[(bitcoin::ScriptBuf, bitcoin::Amount)]) -> bitcoin::Transaction {
    bitcoin::Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![bitcoin::TxIn::default()],
        output: outputs
            .iter()
            .map(|(script_pubkey, amount)| bitcoin::TxOut {
                value: *amount,
                script_pubkey: script_pubkey.clone(),
            })
            .collect(),
    }
}
