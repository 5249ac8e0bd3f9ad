//! [`FileStore`](crate::traits::FileStore) implementations.

mod local;
mod null;

pub use local::LocalFileStore;
pub use null::NullFileStore;
