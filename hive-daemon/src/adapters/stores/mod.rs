pub mod file;
pub mod mem;

pub use file::FileSessionStore;
pub use mem::InMemorySessionStore;
