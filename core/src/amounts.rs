// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Token registry and minor-unit normalization.
//!
//! Every monetary amount in this crate is a [`Decimal`]; binary floats never
//! touch money. Wire formats carry integer minor units, and conversion always
//! goes through the token registry so that an unknown token is rejected
//! instead of being scaled by a guessed divisor.

use rust_decimal::Decimal;
use snafu::Snafu;

/// Stablecoins the settlement rails accept, with their on-chain decimals.
pub const SUPPORTED_TOKENS: &[(&str, u32)] = &[
    ("USDC", 6),
    ("USDT", 6),
    ("PYUSD", 6),
    ("EURC", 6),
];

#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum AmountError {
    #[snafu(display("token not permitted: {}", token))]
    TokenNotPermitted { token: String },
}

impl AmountError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TokenNotPermitted { .. } => "token_not_permitted",
        }
    }
}

/// Number of decimals for a supported token, case-insensitive.
pub fn token_decimals(token: &str) -> Option<u32> {
    let token = token.trim();
    SUPPORTED_TOKENS
        .iter()
        .find(|(sym, _)| sym.eq_ignore_ascii_case(token))
        .map(|(_, d)| *d)
}

/// Convert integer minor units to a `Decimal` using the token's registered
/// decimals. `normalize_token_amount("USDC", 1_000_000)` is exactly
/// `1.000000`; the scale is preserved so the canonical string form is stable.
pub fn normalize_token_amount(token: &str, amount_minor: u64) -> Result<Decimal, AmountError> {
    let decimals = token_decimals(token).ok_or_else(|| AmountError::TokenNotPermitted {
        token: token.to_string(),
    })?;
    Ok(Decimal::from_i128_with_scale(amount_minor as i128, decimals))
}

/// Canonical string form of an amount. This is what gets hashed into Merkle
/// leaves and serialized into ledger rows.
pub fn amount_str(amount: &Decimal) -> String {
    amount.to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize_uses_token_decimals() {
        // 1_000_000 minor units of USDC is one dollar, not ten thousand.
        let amount = normalize_token_amount("USDC", 1_000_000).unwrap();
        assert_eq!(amount, Decimal::new(1_000_000, 6));
        assert_eq!(amount_str(&amount), "1.000000");
    }

    #[test]
    fn test_normalize_preserves_scale() {
        let amount = normalize_token_amount("usdt", 5_000_000).unwrap();
        assert_eq!(amount_str(&amount), "5.000000");
    }

    #[test]
    fn test_unknown_token_rejected() {
        let err = normalize_token_amount("DOGE", 100).unwrap_err();
        assert_eq!(err.reason(), "token_not_permitted");
    }

    #[test]
    fn test_lookup_case_insensitive() {
        assert_eq!(token_decimals("usdc"), Some(6));
        assert_eq!(token_decimals("PyUsd"), Some(6));
        assert_eq!(token_decimals("DAI"), None);
    }
}
