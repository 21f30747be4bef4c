pub mod in_memory;
pub mod migrations;
pub mod storage_service;

pub use in_memory::{InMemoryBus, InMemoryStorage};
pub use migrations::run_migrations;
pub use storage_service::StorageService;

#[cfg(test)]
mod in_memory_test;
