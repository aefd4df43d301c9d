use ethers_core::types::transaction::eip1559::Eip1559TransactionRequest;
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Address, Bytes, H256, NameOrAddress, U256};
use ethers_core::utils::keccak256;

use crate::node::FeeQuote;
use crate::types::Step;

/// Build a basic EIP-1559 `TypedTransaction`.
#[allow(clippy::too_many_arguments)]
pub fn build_eip1559_tx(
    nonce: U256,
    to: Address,
    value: U256,
    data: Bytes,
    gas_limit: U256,
    max_priority_fee_per_gas: U256,
    max_fee_per_gas: U256,
    chain_id: u64,
) -> TypedTransaction {
    let tx = Eip1559TransactionRequest::new()
        .nonce(nonce)
        .to(NameOrAddress::Address(to))
        .value(value)
        .data(data)
        .gas(gas_limit)
        .max_priority_fee_per_gas(max_priority_fee_per_gas)
        .max_fee_per_gas(max_fee_per_gas)
        .chain_id(chain_id);

    TypedTransaction::Eip1559(tx)
}

/// Unsigned transaction for one candidate step at a reserved nonce.
pub fn step_tx(step: &Step, nonce: u64, fees: &FeeQuote, chain_id: u64) -> TypedTransaction {
    let mut tx = build_eip1559_tx(
        U256::from(nonce),
        step.action.target(),
        U256::from(step.action.value()),
        step.action.calldata(),
        U256::from(step.gas_limit),
        U256::from(fees.priority_fee),
        U256::from(fees.max_fee()),
        chain_id,
    );
    tx.set_from(step.account);
    tx
}

/// Hash of a signed raw transaction.
pub fn tx_hash(raw: &[u8]) -> H256 {
    H256::from(keccak256(raw))
}

/// Given a list of signed raw tx bytes, produce a JSON array suitable for a
/// Flashbots-style bundle submission (array of hex strings prefixed with 0x).
pub fn bundle_from_signed_txs(signed: &[Vec<u8>]) -> serde_json::Value {
    serde_json::Value::Array(
        signed
            .iter()
            .map(|s| serde_json::Value::String(format!("0x{}", hex::encode(s))))
            .collect(),
    )
}
