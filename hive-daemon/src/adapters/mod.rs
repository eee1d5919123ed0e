pub mod process;
pub mod stores;
