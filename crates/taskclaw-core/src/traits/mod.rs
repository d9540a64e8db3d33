//! Collaborator interfaces the scheduler consumes.

pub mod executor;
pub mod ledger;
pub mod store;

pub use executor::PrimaryExecutor;
pub use ledger::Ledger;
pub use store::CircuitStateStore;
