pub mod index;

pub use index::{RedbStore, RunStore, RunUpdate};
