use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ethers_core::types::Address;
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_signers::{LocalWallet, Signer as _};

use crate::error::SignerError;

/// Signing abstraction. In prod, implement an HSM/KMS-backed signer.
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    /// Sign a `TypedTransaction` (EIP-1559 aware) and return signed raw tx bytes.
    async fn sign_typed_transaction(&self, tx: &TypedTransaction) -> Result<Vec<u8>, SignerError>;
}

/// Signer backed by an in-memory private key. Development only; in production
/// use a hardware signer or remote KMS.
pub struct LocalKeySigner {
    wallet: LocalWallet,
}

impl LocalKeySigner {
    /// Hex private key, with or without `0x`.
    pub fn from_secret(secret: &str) -> Result<Self, SignerError> {
        let wallet = LocalWallet::from_str(secret.trim().trim_start_matches("0x"))
            .map_err(|e| SignerError::Unauthorized(format!("invalid private key: {e}")))?;
        Ok(Self { wallet })
    }

    /// Reads `PRIVATE_KEY`; one key per comma-separated entry.
    pub fn from_env() -> Result<Vec<Self>, SignerError> {
        let raw = std::env::var("PRIVATE_KEY")
            .map_err(|_| SignerError::Unauthorized("PRIVATE_KEY not set".to_string()))?;
        raw.split(',').filter(|s| !s.trim().is_empty()).map(Self::from_secret).collect()
    }
}

#[async_trait]
impl Signer for LocalKeySigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_typed_transaction(&self, tx: &TypedTransaction) -> Result<Vec<u8>, SignerError> {
        let sig = self
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        Ok(tx.rlp_signed(&sig).to_vec())
    }
}

/// Signers indexed by the account they control.
#[derive(Clone, Default)]
pub struct Keyring {
    signers: HashMap<Address, Arc<dyn Signer>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, signer: Arc<dyn Signer>) {
        self.signers.insert(signer.address(), signer);
    }

    pub fn accounts(&self) -> Vec<Address> {
        let mut all: Vec<_> = self.signers.keys().copied().collect();
        all.sort_unstable();
        all
    }

    pub async fn sign(&self, account: Address, tx: &TypedTransaction) -> Result<Vec<u8>, SignerError> {
        let signer = self
            .signers
            .get(&account)
            .ok_or_else(|| SignerError::Unauthorized(format!("no signer for {account:?}")))?;
        signer.sign_typed_transaction(tx).await
    }
}
