//! Flash-loan executor calldata.
//!
//! Two incompatible encodings selected by protocol tag:
//!   Aave V3 flash loan:  executeArbitrage(asset, amount, path[], minProfit)
//!   Uniswap-V3 flash swap: executeArbitrage(pool, asset, amount, path[],
//!                          minProfit, deadline)
//! The callback entry points differ too (executeOperation vs the
//! *flashCallback pair), so there is deliberately no shared interface —
//! dispatch happens here, on the tag carried by the opportunity.

use crate::types::{FlashLoanProtocol, SwapStep};
use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolCall;

mod aave {
    use alloy::sol;

    sol! {
        struct SwapStep {
            address router;
            address tokenIn;
            address tokenOut;
            uint256 amountIn;
            bytes data;
        }

        function executeArbitrage(
            address asset,
            uint256 amount,
            SwapStep[] path,
            uint256 minProfit
        );
    }
}

mod v3_flash {
    use alloy::sol;

    sol! {
        struct SwapStep {
            address router;
            address tokenIn;
            address tokenOut;
            uint256 amountIn;
            bytes data;
        }

        function executeArbitrage(
            address pool,
            address asset,
            uint256 amount,
            SwapStep[] path,
            uint256 minProfit,
            uint256 deadline
        );
    }
}

fn aave_steps(path: &[SwapStep]) -> Vec<aave::SwapStep> {
    path.iter()
        .map(|s| aave::SwapStep {
            router: s.router,
            tokenIn: s.token_in,
            tokenOut: s.token_out,
            amountIn: s.amount_in,
            data: Bytes::from(s.data.clone()),
        })
        .collect()
}

fn v3_steps(path: &[SwapStep]) -> Vec<v3_flash::SwapStep> {
    path.iter()
        .map(|s| v3_flash::SwapStep {
            router: s.router,
            tokenIn: s.token_in,
            tokenOut: s.token_out,
            amountIn: s.amount_in,
            data: Bytes::from(s.data.clone()),
        })
        .collect()
}

/// Parameters the flash strategy resolves before encoding.
#[derive(Debug, Clone)]
pub struct FlashCallParams {
    pub asset: Address,
    pub amount: U256,
    pub min_profit: U256,
    /// Flash-swap pool; required for the Uniswap-V3 style only.
    pub pool: Option<Address>,
    /// Unix-seconds deadline; required for the Uniswap-V3 style only.
    pub deadline_secs: Option<u64>,
}

/// Generic executor entry, also used by the non-flash direct strategies:
/// executeArbitrage(asset, amount, path, minProfit).
pub fn encode_execute_arbitrage(params: &FlashCallParams, path: &[SwapStep]) -> Vec<u8> {
    let call = aave::executeArbitrageCall {
        asset: params.asset,
        amount: params.amount,
        path: aave_steps(path),
        minProfit: params.min_profit,
    };
    call.abi_encode()
}

/// Build executor calldata for the given protocol. Returns None when the
/// protocol's required parameters are missing.
pub fn encode_flash_arbitrage(
    protocol: FlashLoanProtocol,
    params: &FlashCallParams,
    path: &[SwapStep],
) -> Option<Vec<u8>> {
    match protocol {
        FlashLoanProtocol::AaveV3 => Some(encode_execute_arbitrage(params, path)),
        FlashLoanProtocol::UniswapV3 => {
            let pool = params.pool?;
            let deadline = params.deadline_secs?;
            let call = v3_flash::executeArbitrageCall {
                pool,
                asset: params.asset,
                amount: params.amount,
                path: v3_steps(path),
                minProfit: params.min_profit,
                deadline: U256::from(deadline),
            };
            Some(call.abi_encode())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step() -> SwapStep {
        SwapStep {
            router: Address::repeat_byte(0xe1),
            token_in: Address::repeat_byte(0x01),
            token_out: Address::repeat_byte(0x02),
            amount_in: U256::from(1_000u64),
            data: vec![0xde, 0xad],
        }
    }

    fn params() -> FlashCallParams {
        FlashCallParams {
            asset: Address::repeat_byte(0x01),
            amount: U256::from(1_000_000u64),
            min_profit: U256::from(50u64),
            pool: Some(Address::repeat_byte(0x77)),
            deadline_secs: Some(1_700_000_000),
        }
    }

    #[test]
    fn test_selectors_differ_by_protocol() {
        let aave = encode_flash_arbitrage(FlashLoanProtocol::AaveV3, &params(), &[step()]).unwrap();
        let v3 =
            encode_flash_arbitrage(FlashLoanProtocol::UniswapV3, &params(), &[step()]).unwrap();
        assert_ne!(&aave[..4], &v3[..4], "overloads must encode distinct selectors");
    }

    #[test]
    fn test_aave_encoding_shape() {
        let data = encode_flash_arbitrage(FlashLoanProtocol::AaveV3, &params(), &[step()]).unwrap();
        // selector + at least (asset, amount, path offset, minProfit) head words
        assert!(data.len() > 4 + 4 * 32);
        assert_eq!(
            &data[..4],
            &aave::executeArbitrageCall::SELECTOR,
            "selector mismatch"
        );
    }

    #[test]
    fn test_v3_requires_pool_and_deadline() {
        let mut p = params();
        p.pool = None;
        assert!(encode_flash_arbitrage(FlashLoanProtocol::UniswapV3, &p, &[step()]).is_none());

        let mut p = params();
        p.deadline_secs = None;
        assert!(encode_flash_arbitrage(FlashLoanProtocol::UniswapV3, &p, &[step()]).is_none());

        // Aave needs neither.
        let mut p = params();
        p.pool = None;
        p.deadline_secs = None;
        assert!(encode_flash_arbitrage(FlashLoanProtocol::AaveV3, &p, &[step()]).is_some());
    }

    #[test]
    fn test_empty_path_encodes() {
        let data = encode_flash_arbitrage(FlashLoanProtocol::AaveV3, &params(), &[]).unwrap();
        assert_eq!(&data[..4], &aave::executeArbitrageCall::SELECTOR);
    }
}
