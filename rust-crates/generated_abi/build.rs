fn main() {
    // the bindings are generated from the checked-in ABI file at compile time
    println!("cargo:rerun-if-changed=abi/ImprovedLottery.json");
}
