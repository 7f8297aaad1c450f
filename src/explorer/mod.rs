//! Interface to the Bitcoin network, through a block explorer.
//!
//! List unspent coins at an address, fetch previous transactions, broadcast the spend.

pub mod esplora;

use std::{error, fmt};

use async_trait::async_trait;
use miniscript::bitcoin;

#[derive(Debug)]
pub enum ExplorerError {
    Http(reqwest::Error),
    /// The explorer responded with something we can't make sense of.
    InvalidResponse(&'static str),
    TxNotFound(bitcoin::Txid),
}

impl fmt::Display for ExplorerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "HTTP request to the explorer failed: '{}'.", e),
            Self::InvalidResponse(what) => {
                write!(f, "Unexpected response from the explorer: invalid {}.", what)
            }
            Self::TxNotFound(txid) => {
                write!(f, "The explorer doesn't know transaction '{}'.", txid)
            }
        }
    }
}

impl error::Error for ExplorerError {}

impl From<reqwest::Error> for ExplorerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

/// An unspent transaction output, as reported by the explorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: bitcoin::OutPoint,
    pub amount: bitcoin::Amount,
    /// Whether the transaction creating this output is confirmed.
    pub confirmed: bool,
}

/// Our view of the Bitcoin network.
#[async_trait]
pub trait Explorer: Send + Sync {
    /// Get all unspent outputs paying to this address.
    async fn unspent_outputs(
        &self,
        address: &bitcoin::Address,
    ) -> Result<Vec<Utxo>, ExplorerError>;

    /// Get a transaction by its txid, in full.
    async fn raw_transaction(
        &self,
        txid: &bitcoin::Txid,
    ) -> Result<bitcoin::Transaction, ExplorerError>;

    /// Broadcast this transaction to the Bitcoin P2P network.
    async fn broadcast_tx(
        &self,
        tx: &bitcoin::Transaction,
    ) -> Result<bitcoin::Txid, ExplorerError>;
}
