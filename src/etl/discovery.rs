//! Contract discovery from creation traces.
//!
//! Runtime bytecode ends with CBOR metadata produced by the compiler. The
//! solc version follows the `solc` key (`64736f6c6343`) as three bytes and the
//! IPFS hash follows the `ipfs` key (`697066735822`) as a 34-byte multihash.

use std::sync::Arc;

use crate::abi::Abi;
use crate::types::{Contract, InternalTransaction, TokenStandard};

const SOLC_MARKER: &str = "64736f6c6343";
const SOLC_VERSION_HEX_LEN: usize = 6;
const IPFS_MARKER: &str = "697066735822";
const IPFS_HASH_HEX_LEN: usize = 68;

/// Compiler version as `major.minor.patch`.
pub fn solidity_version(bytecode: &str) -> Option<String> {
    let bytes = metadata_field(bytecode, SOLC_MARKER, SOLC_VERSION_HEX_LEN)?;
    Some(format!("{}.{}.{}", bytes[0], bytes[1], bytes[2]))
}

/// Base58 IPFS hash of the contract metadata.
pub fn ipfs_hash(bytecode: &str) -> Option<String> {
    let bytes = metadata_field(bytecode, IPFS_MARKER, IPFS_HASH_HEX_LEN)?;
    Some(bs58::encode(bytes).into_string())
}

fn metadata_field(bytecode: &str, marker: &str, len: usize) -> Option<Vec<u8>> {
    let code = bytecode.to_ascii_lowercase();
    let start = code.rfind(marker)? + marker.len();
    let field = code.get(start..start + len)?;
    hex::decode(field).ok()
}

/// Contract row for a successful creation trace, `None` for anything else.
pub fn contract_from_trace(trace: &InternalTransaction) -> Option<Contract> {
    if !trace.is_contract_creation() || trace.to.is_empty() {
        return None;
    }
    let bytecode = trace.deployed_code.clone().unwrap_or_default();
    Some(Contract {
        id: None,
        address: trace.to.clone(),
        creator: trace.from.clone(),
        block_number: trace.block_number,
        transaction_hash: trace.transaction_hash.clone(),
        solidity_version: solidity_version(&bytecode),
        ipfs_hash: ipfs_hash(&bytecode),
        bytecode,
    })
}

/// Bytecode fingerprint of a token standard: every required signature's
/// selector or topic must appear in the runtime code.
#[derive(Clone)]
pub struct Fingerprint {
    pub standard: TokenStandard,
    pub abi: Arc<Abi>,
    pub required: &'static [&'static str],
}

impl Fingerprint {
    pub fn matches(&self, bytecode: &str) -> bool {
        !bytecode.is_empty() && self.abi.has_all_signatures(self.required, bytecode)
    }
}
