//! In-memory implementations of the persistence contracts.

mod context_dao;
mod memory;

pub use context_dao::InMemoryExecutionContextDao;
pub use memory::InMemoryJobRepository;
