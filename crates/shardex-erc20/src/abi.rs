//! ERC20 interface description.

use shardex::abi::{Abi, AbiEntry, Param, ParamType};

/// Entries whose selectors/topics must all appear in a contract's bytecode.
pub const REQUIRED_SIGNATURES: &[&str] = &[
    "Transfer",
    "Approval",
    "totalSupply",
    "decimals",
    "transfer",
    "balanceOf",
    "symbol",
    "name",
    "approve",
];

pub fn erc20_abi() -> Abi {
    let uint256 = || ParamType::Uint(256);
    Abi::new(vec![
        AbiEntry::event(
            "Transfer",
            vec![
                Param::indexed("from", ParamType::Address),
                Param::indexed("to", ParamType::Address),
                Param::new("value", uint256()),
            ],
        ),
        AbiEntry::event(
            "Approval",
            vec![
                Param::indexed("owner", ParamType::Address),
                Param::indexed("spender", ParamType::Address),
                Param::new("value", uint256()),
            ],
        ),
        AbiEntry::function("name", vec![], vec![Param::new("", ParamType::String)]),
        AbiEntry::function("symbol", vec![], vec![Param::new("", ParamType::String)]),
        AbiEntry::function("decimals", vec![], vec![Param::new("", ParamType::Uint(8))]),
        AbiEntry::function("totalSupply", vec![], vec![Param::new("", uint256())]),
        AbiEntry::function(
            "balanceOf",
            vec![Param::new("account", ParamType::Address)],
            vec![Param::new("", uint256())],
        ),
        AbiEntry::function(
            "transfer",
            vec![Param::new("to", ParamType::Address), Param::new("value", uint256())],
            vec![Param::new("", ParamType::Bool)],
        ),
        AbiEntry::function(
            "approve",
            vec![
                Param::new("spender", ParamType::Address),
                Param::new("value", uint256()),
            ],
            vec![Param::new("", ParamType::Bool)],
        ),
        AbiEntry::function(
            "allowance",
            vec![
                Param::new("owner", ParamType::Address),
                Param::new("spender", ParamType::Address),
            ],
            vec![Param::new("", uint256())],
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors() {
        let abi = erc20_abi();
        assert_eq!(abi.selector("totalSupply").unwrap(), "0x18160ddd");
        assert_eq!(abi.selector("decimals").unwrap(), "0x313ce567");
        assert_eq!(abi.selector("transfer").unwrap(), "0xa9059cbb");
        assert_eq!(abi.selector("approve").unwrap(), "0x095ea7b3");
        assert_eq!(abi.selector("name").unwrap(), "0x06fdde03");
        assert_eq!(
            abi.topic("Approval").unwrap(),
            "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925"
        );
        for name in REQUIRED_SIGNATURES {
            assert!(abi.contains(name), "{name} missing");
        }
    }
}
