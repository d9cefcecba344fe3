use alloy::primitives::{
    Address,
    U256,
    utils::format_ether,
};

/// Every supported network settles in MATIC.
pub const NATIVE_SYMBOL: &str = "MATIC";

/// `0x1234...abcd`
pub fn short_address(address: &Address) -> String {
    let full = alloy::hex::encode(address);
    format!("0x{}...{}", &full[..4], &full[full.len() - 4..])
}

/// Wei amount as ether units, trimmed to `decimals` places.
pub fn format_units(amount: U256, decimals: usize) -> String {
    let formatted = format_ether(amount);
    match formatted.split_once('.') {
        Some((whole, _)) if decimals == 0 => whole.to_string(),
        Some((whole, fraction)) => {
            let fraction: String = fraction
                .chars()
                .chain(std::iter::repeat('0'))
                .take(decimals)
                .collect();
            format!("{whole}.{fraction}")
        }
        None if decimals == 0 => formatted,
        None => format!("{formatted}.{}", "0".repeat(decimals)),
    }
}

/// Whole ether units, rounded down, saturating at `u64::MAX`.
pub fn whole_units(amount: U256) -> u64 {
    let unit = U256::from(1_000_000_000_000_000_000u128);
    u64::try_from(amount / unit).unwrap_or(u64::MAX)
}
