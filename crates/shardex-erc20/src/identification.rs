//! ERC20 contract identification.
//!
//! A contract is an ERC20 token when its bytecode carries every selector and
//! topic in [`REQUIRED_SIGNATURES`] and its `name`/`symbol`/`decimals` reads
//! return acceptable values.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use shardex::abi::ContractCaller;
use shardex::etl::tracker::{validate_metadata, SYMBOL_LENGTH};
use shardex::etl::Fingerprint;
use shardex::types::TokenStandard;

use crate::abi::{erc20_abi, REQUIRED_SIGNATURES};

pub fn fingerprint() -> Fingerprint {
    Fingerprint {
        standard: TokenStandard::Erc20,
        abi: Arc::new(erc20_abi()),
        required: REQUIRED_SIGNATURES,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc20Metadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Read and validate the immutable token metadata.
pub async fn fetch_metadata(caller: &ContractCaller, address: &str) -> Result<Erc20Metadata> {
    let values = caller
        .call_all(address, &["name", "symbol", "decimals"])
        .await
        .with_context(|| format!("Failed to read ERC20 metadata of {address}"))?;
    let [name, symbol, decimals] = values.as_slice() else {
        bail!("Unexpected metadata result count for {address}");
    };

    let name = name.as_string().context("name() is not a string")?;
    let symbol = symbol.as_string().context("symbol() is not a string")?;
    let decimals = decimals.as_uint().context("decimals() is not a number")?;
    if decimals > 255.into() {
        bail!("decimals() out of range: {decimals}");
    }

    let (name, symbol) = validate_metadata(&name, &symbol, SYMBOL_LENGTH)?;
    Ok(Erc20Metadata {
        name,
        symbol,
        decimals: decimals.low_u32() as u8,
    })
}
