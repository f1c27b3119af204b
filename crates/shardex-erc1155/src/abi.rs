//! ERC1155 interface description.

use shardex::abi::{Abi, AbiEntry, Param, ParamType};

/// Entries whose selectors/topics must all appear in a contract's bytecode.
pub const REQUIRED_SIGNATURES: &[&str] = &[
    "TransferSingle",
    "TransferBatch",
    "owner",
    "balanceOfBatch",
    "contractURI",
];

pub fn erc1155_abi() -> Abi {
    let uint256 = || ParamType::Uint(256);
    let uint256_array = || ParamType::Array(Box::new(ParamType::Uint(256)));
    Abi::new(vec![
        AbiEntry::event(
            "TransferSingle",
            vec![
                Param::indexed("operator", ParamType::Address),
                Param::indexed("from", ParamType::Address),
                Param::indexed("to", ParamType::Address),
                Param::new("id", uint256()),
                Param::new("value", uint256()),
            ],
        ),
        AbiEntry::event(
            "TransferBatch",
            vec![
                Param::indexed("operator", ParamType::Address),
                Param::indexed("from", ParamType::Address),
                Param::indexed("to", ParamType::Address),
                Param::new("ids", uint256_array()),
                Param::new("values", uint256_array()),
            ],
        ),
        AbiEntry::event(
            "ApprovalForAll",
            vec![
                Param::indexed("account", ParamType::Address),
                Param::indexed("operator", ParamType::Address),
                Param::new("approved", ParamType::Bool),
            ],
        ),
        AbiEntry::event(
            "URI",
            vec![
                Param::new("value", ParamType::String),
                Param::indexed("id", uint256()),
            ],
        ),
        AbiEntry::function("owner", vec![], vec![Param::new("", ParamType::Address)]),
        AbiEntry::function("contractURI", vec![], vec![Param::new("", ParamType::String)]),
        AbiEntry::function(
            "uri",
            vec![Param::new("id", uint256())],
            vec![Param::new("", ParamType::String)],
        ),
        AbiEntry::function(
            "balanceOf",
            vec![Param::new("account", ParamType::Address), Param::new("id", uint256())],
            vec![Param::new("", uint256())],
        ),
        AbiEntry::function(
            "balanceOfBatch",
            vec![
                Param::new("accounts", ParamType::Array(Box::new(ParamType::Address))),
                Param::new("ids", uint256_array()),
            ],
            vec![Param::new("", uint256_array())],
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
            "safeTransferFrom",
            vec![
                Param::new("from", ParamType::Address),
                Param::new("to", ParamType::Address),
                Param::new("id", uint256()),
                Param::new("amount", uint256()),
                Param::new("data", ParamType::Bytes),
            ],
            vec![],
        ),
        AbiEntry::function(
            "safeBatchTransferFrom",
            vec![
                Param::new("from", ParamType::Address),
                Param::new("to", ParamType::Address),
                Param::new("ids", uint256_array()),
                Param::new("amounts", uint256_array()),
                Param::new("data", ParamType::Bytes),
            ],
            vec![],
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_hashes() {
        let abi = erc1155_abi();
        assert_eq!(
            abi.topic("TransferSingle").unwrap(),
            "0xc3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62"
        );
        assert_eq!(
            abi.topic("TransferBatch").unwrap(),
            "0x4a39dc06d4c0dbc64b70af90fd698a233a518aa5d07e595d983b8c0526c8f7fb"
        );
        assert_eq!(abi.selector("owner").unwrap(), "0x8da5cb5b");
        assert_eq!(abi.selector("balanceOfBatch").unwrap(), "0x4e1273f4");
        assert_eq!(abi.selector("contractURI").unwrap(), "0xe8a3d485");
        assert_eq!(abi.selector("uri").unwrap(), "0x0e89341c");
    }
}
