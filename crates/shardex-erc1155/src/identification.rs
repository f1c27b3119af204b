//! ERC1155 contract identification.
//!
//! Multi-token contracts rarely implement `name()`/`symbol()`, so both come
//! from the JSON document behind `contractURI()`.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use shardex::abi::ContractCaller;
use shardex::etl::tracker::{validate_metadata, MULTI_TOKEN_SYMBOL_LENGTH};
use shardex::etl::Fingerprint;
use shardex::types::TokenStandard;
use shardex_common::metadata::json_string_field;
use shardex_common::MetadataResolver;

use crate::abi::{erc1155_abi, REQUIRED_SIGNATURES};

pub fn fingerprint() -> Fingerprint {
    Fingerprint {
        standard: TokenStandard::Erc1155,
        abi: Arc::new(erc1155_abi()),
        required: REQUIRED_SIGNATURES,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Erc1155Metadata {
    pub name: String,
    pub symbol: String,
    pub contract_uri: String,
    pub document: Value,
}

pub async fn fetch_metadata(
    caller: &ContractCaller,
    resolver: &MetadataResolver,
    address: &str,
) -> Result<Erc1155Metadata> {
    let contract_uri = caller
        .call(address, "contractURI", &[])
        .await
        .with_context(|| format!("contractURI() failed on {address}"))?
        .as_string()
        .context("contractURI() is not a string")?;

    let document = resolver
        .resolve(&contract_uri)
        .await
        .ok_or_else(|| anyhow!("Unresolvable contract metadata at {contract_uri}"))?;
    let name = json_string_field(&document, "name").context("contract metadata has no name")?;
    let symbol =
        json_string_field(&document, "symbol").context("contract metadata has no symbol")?;

    let (name, symbol) = validate_metadata(&name, &symbol, MULTI_TOKEN_SYMBOL_LENGTH)?;
    Ok(Erc1155Metadata {
        name,
        symbol,
        contract_uri,
        document,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardex::rpc::{ChainClient, ChainClientConfig};
    use shardex::testing::{string_output, ScriptedTransport};
    use shardex_common::MetadataResolverConfig;

    const COLLECTION: &str = "0x00000000000000000000000000000000000000c9";

    async fn fetch(contract_uri: &str) -> Result<Erc1155Metadata> {
        let transport = ScriptedTransport::new(0).with_call(
            COLLECTION,
            "0xe8a3d485",
            &string_output(contract_uri),
        );
        let client = ChainClient::new(0, Arc::new(transport), ChainClientConfig::default());
        let caller = ContractCaller::new(Arc::new(erc1155_abi()), client);
        let resolver = MetadataResolver::new(MetadataResolverConfig::default()).unwrap();
        fetch_metadata(&caller, &resolver, COLLECTION).await
    }

    #[tokio::test]
    async fn test_metadata_from_contract_uri() {
        let metadata = fetch(
            "data:application/json;base64,eyJuYW1lIjoiSGFybW9ueSBJdGVtcyIsInN5bWJvbCI6IklURU1TX09GX0hBUk1PTlkifQ==",
        )
        .await
        .unwrap();
        assert_eq!(metadata.name, "Harmony Items");
        // Longer than an ERC20 symbol may be.
        assert_eq!(metadata.symbol, "ITEMS_OF_HARMONY");
    }

    #[tokio::test]
    async fn test_missing_symbol_rejected() {
        assert!(fetch(r#"{"name":"Harmony Items"}"#).await.is_err());
        assert!(fetch("").await.is_err());
    }
}
