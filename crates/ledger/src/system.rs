//! Read-only system contract: transaction status and chain information.

use serde::{Deserialize, Serialize};

use recordchain_core::ValidationCode;

/// Name of the query system contract.
pub const SYSTEM_CONTRACT: &str = "qscc";

/// `GetTransactionByID(channel, txId)` -> [`ProcessedTransaction`].
pub const GET_TRANSACTION_BY_ID: &str = "GetTransactionByID";

/// `GetChainInfo(channel)` -> [`ChainInfo`].
pub const GET_CHAIN_INFO: &str = "GetChainInfo";

/// Status of one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedTransaction {
    pub validation_code: ValidationCode,
    pub block_number: u64,
}

/// Channel summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainInfo {
    pub height: u64,
}
