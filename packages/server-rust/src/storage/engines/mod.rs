//! In-process storage backends.

#[cfg(test)]
pub(crate) mod interleaving;
mod memory;

pub use memory::MemoryStore;
