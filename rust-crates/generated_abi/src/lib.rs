use sha2::{
    Digest,
    Sha256,
};

/// Raw ABI the bindings below are generated from.
pub const LOTTERY_ABI_JSON: &str = include_str!("../abi/ImprovedLottery.json");

pub mod lottery_types {
    use alloy::sol;

    sol!(
        #[sol(rpc, all_derives)]
        ImprovedLottery,
        "abi/ImprovedLottery.json"
    );
}

pub use lottery_types::ImprovedLottery;

/// Hex sha256 of the checked-in ABI.
///
/// Deployment records carry the fingerprint of the ABI they were recorded
/// against; a mismatch means the bindings and the deployed contract may have
/// drifted apart.
pub fn abi_fingerprint() -> String {
    let mut hasher = Sha256::new();
    hasher.update(LOTTERY_ABI_JSON.as_bytes());
    hex::encode(hasher.finalize())
}
