//! ERC721 contract identification.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use shardex::abi::ContractCaller;
use shardex::etl::tracker::{validate_metadata, SYMBOL_LENGTH};
use shardex::etl::Fingerprint;
use shardex::types::TokenStandard;

use crate::abi::{erc721_abi, REQUIRED_SIGNATURES};

pub fn fingerprint() -> Fingerprint {
    Fingerprint {
        standard: TokenStandard::Erc721,
        abi: Arc::new(erc721_abi()),
        required: REQUIRED_SIGNATURES,
    }
}

/// Read `name()` and `symbol()` and validate them.
pub async fn fetch_metadata(caller: &ContractCaller, address: &str) -> Result<(String, String)> {
    let values = caller
        .call_all(address, &["name", "symbol"])
        .await
        .with_context(|| format!("Failed to read ERC721 metadata of {address}"))?;
    let [name, symbol] = values.as_slice() else {
        bail!("Unexpected metadata result count for {address}");
    };

    let name = name.as_string().context("name() is not a string")?;
    let symbol = symbol.as_string().context("symbol() is not a string")?;
    Ok(validate_metadata(&name, &symbol, SYMBOL_LENGTH)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardex::rpc::{ChainClient, ChainClientConfig};
    use shardex::testing::{string_output, ScriptedTransport};

    const COLLECTION: &str = "0x00000000000000000000000000000000000000c7";

    #[tokio::test]
    async fn test_fetch_metadata() {
        let transport = ScriptedTransport::new(0)
            .with_call(COLLECTION, "0x06fdde03", &string_output("  Harmony Punks  "))
            .with_call(COLLECTION, "0x95d89b41", &string_output("HPUNK"));
        let client = ChainClient::new(0, Arc::new(transport), ChainClientConfig::default());
        let caller = ContractCaller::new(Arc::new(erc721_abi()), client);

        assert_eq!(
            fetch_metadata(&caller, COLLECTION).await.unwrap(),
            ("Harmony Punks".to_string(), "HPUNK".to_string())
        );
    }

    #[test]
    fn test_fingerprint_requires_owner_of() {
        let fingerprint = fingerprint();
        let abi = &fingerprint.abi;
        let mut bytecode = String::from("0x6080604052");
        for name in REQUIRED_SIGNATURES {
            if *name == "ownerOf" {
                continue;
            }
            let hash = abi.selector(name).or_else(|_| abi.topic(name)).unwrap();
            bytecode.push_str(&hash[2..]);
        }
        assert!(!fingerprint.matches(&bytecode));

        bytecode.push_str("6352211e");
        assert!(fingerprint.matches(&bytecode));
    }
}
