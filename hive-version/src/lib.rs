pub fn hive_version() -> &'static str {
    // See build.rs
    env!("HIVE_CI_TAG")
}

pub fn hive_target_triple() -> &'static str {
    // See build.rs
    env!("HIVE_TARGET_TRIPLE")
}
