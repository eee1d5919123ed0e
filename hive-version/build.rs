use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=HIVE_CI_TAG");

    // Release builds stamp the tag; local builds fall back to the crate version.
    let tag = env::var("HIVE_CI_TAG")
        .ok()
        .filter(|tag| !tag.trim().is_empty())
        .unwrap_or_else(|| env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "unknown".into()));
    println!("cargo:rustc-env=HIVE_CI_TAG={}", tag.trim());

    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=HIVE_TARGET_TRIPLE={}", target);
}
