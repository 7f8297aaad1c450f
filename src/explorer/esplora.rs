//! Esplora HTTP API client.
//!
//! We only implement the three endpoints the spend pipeline needs: unspent outputs of
//! an address, raw transaction by txid, and transaction broadcast.

use crate::explorer::{Explorer, ExplorerError, Utxo};

use std::str::FromStr;

use async_trait::async_trait;
use miniscript::bitcoin::{self, consensus::encode};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct UtxoEntry {
    txid: bitcoin::Txid,
    vout: u32,
    value: u64,
    status: UtxoStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct UtxoStatus {
    confirmed: bool,
}

/// Esplora API client
#[derive(Debug, Clone)]
pub struct EsploraClient {
    http: reqwest::Client,
    base_url: String,
}

impl EsploraClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }
}

#[async_trait]
impl Explorer for EsploraClient {
    async fn unspent_outputs(
        &self,
        address: &bitcoin::Address,
    ) -> Result<Vec<Utxo>, ExplorerError> {
        let entries: Vec<UtxoEntry> = self
            .http
            .get(self.url(&format!("/address/{}/utxo", address)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(entries
            .into_iter()
            .map(|entry| Utxo {
                outpoint: bitcoin::OutPoint::new(entry.txid, entry.vout),
                amount: bitcoin::Amount::from_sat(entry.value),
                confirmed: entry.status.confirmed,
            })
            .collect())
    }

    async fn raw_transaction(
        &self,
        txid: &bitcoin::Txid,
    ) -> Result<bitcoin::Transaction, ExplorerError> {
        let response = self
            .http
            .get(self.url(&format!("/tx/{}/hex", txid)))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ExplorerError::TxNotFound(*txid));
        }
        let tx_hex = response.error_for_status()?.text().await?;
        let tx_bytes = hex::decode(tx_hex.trim())
            .map_err(|_| ExplorerError::InvalidResponse("transaction hex"))?;
        encode::deserialize(&tx_bytes)
            .map_err(|_| ExplorerError::InvalidResponse("transaction bytes"))
    }

    async fn broadcast_tx(
        &self,
        tx: &bitcoin::Transaction,
    ) -> Result<bitcoin::Txid, ExplorerError> {
        let response = self
            .http
            .post(self.url("/tx"))
            .body(hex::encode(encode::serialize(tx)))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        bitcoin::Txid::from_str(response.trim())
            .map_err(|_| ExplorerError::InvalidResponse("txid"))
    }
}
