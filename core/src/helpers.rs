// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock in unix seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

/// Current wall clock in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Case-insensitive, whitespace-trimmed string equality used wherever the
/// protocol compares chain names, token symbols, and addresses.
pub fn eq_normalized(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Normalized form used as a map/list key for the same comparisons.
pub fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

/// Short unique identifier with a type prefix, e.g. `txn_4f2a...`.
pub fn prefixed_id(prefix: &str) -> String {
    let mut bytes = [0u8; 16];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
    format!("{}_{}", prefix, hex::encode(bytes))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_eq_normalized() {
        assert!(eq_normalized("Base", "base"));
        assert!(eq_normalized(" 0xAbC ", "0xabc"));
        assert!(!eq_normalized("base", "base_sepolia"));
    }

    #[test]
    fn test_prefixed_id_shape() {
        let id = prefixed_id("txn");
        assert!(id.starts_with("txn_"));
        assert_eq!(id.len(), 4 + 32);
        assert_ne!(id, prefixed_id("txn"));
    }
}
