//! ERC721 interface description.

use shardex::abi::{Abi, AbiEntry, Param, ParamType};

/// Entries whose selectors/topics must all appear in a contract's bytecode.
pub const REQUIRED_SIGNATURES: &[&str] = &[
    "Transfer",
    "Approval",
    "totalSupply",
    "transfer",
    "balanceOf",
    "symbol",
    "name",
    "approve",
    "ownerOf",
    "tokenURI",
    "transferFrom",
    "safeTransferFrom",
];

pub fn erc721_abi() -> Abi {
    let uint256 = || ParamType::Uint(256);
    let token_id = || Param::new("tokenId", ParamType::Uint(256));
    Abi::new(vec![
        AbiEntry::event(
            "Transfer",
            vec![
                Param::indexed("from", ParamType::Address),
                Param::indexed("to", ParamType::Address),
                Param::indexed("tokenId", uint256()),
            ],
        ),
        AbiEntry::event(
            "Approval",
            vec![
                Param::indexed("owner", ParamType::Address),
                Param::indexed("approved", ParamType::Address),
                Param::indexed("tokenId", uint256()),
            ],
        ),
        AbiEntry::event(
            "ApprovalForAll",
            vec![
                Param::indexed("owner", ParamType::Address),
                Param::indexed("operator", ParamType::Address),
                Param::new("approved", ParamType::Bool),
            ],
        ),
        AbiEntry::function("name", vec![], vec![Param::new("", ParamType::String)]),
        AbiEntry::function("symbol", vec![], vec![Param::new("", ParamType::String)]),
        AbiEntry::function("totalSupply", vec![], vec![Param::new("", uint256())]),
        AbiEntry::function(
            "balanceOf",
            vec![Param::new("owner", ParamType::Address)],
            vec![Param::new("", uint256())],
        ),
        AbiEntry::function("ownerOf", vec![token_id()], vec![Param::new("", ParamType::Address)]),
        AbiEntry::function("tokenURI", vec![token_id()], vec![Param::new("", ParamType::String)]),
        AbiEntry::function(
            "transfer",
            vec![Param::new("to", ParamType::Address), token_id()],
            vec![],
        ),
        AbiEntry::function(
            "approve",
            vec![Param::new("to", ParamType::Address), token_id()],
            vec![],
        ),
        AbiEntry::function(
            "transferFrom",
            vec![
                Param::new("from", ParamType::Address),
                Param::new("to", ParamType::Address),
                token_id(),
            ],
            vec![],
        ),
        // First overload wins name lookups.
        AbiEntry::function(
            "safeTransferFrom",
            vec![
                Param::new("from", ParamType::Address),
                Param::new("to", ParamType::Address),
                token_id(),
            ],
            vec![],
        ),
        AbiEntry::function(
            "safeTransferFrom",
            vec![
                Param::new("from", ParamType::Address),
                Param::new("to", ParamType::Address),
                token_id(),
                Param::new("data", ParamType::Bytes),
            ],
            vec![],
        ),
        AbiEntry::function(
            "setApprovalForAll",
            vec![
                Param::new("operator", ParamType::Address),
                Param::new("approved", ParamType::Bool),
            ],
            vec![],
        ),
        AbiEntry::function(
            "getApproved",
            vec![token_id()],
            vec![Param::new("", ParamType::Address)],
        ),
    ])
}
