//! An append-only, single-file ordered key-value store.
//!
//! The on-disk layout is a B-tree of fixed-size [`node`] blocks keyed by
//! [`Key128`], with values held as opaque byte ranges appended to the
//! file's tail and verified on read by a running FNV-1a 64 hash (see
//! [`pair`] and [`reader`]). A fixed-size superblock at offset 0 records
//! the root node's address, the key count, and store identity.
//!
//! Commits flush the in-memory dirty-set in child-before-parent order and
//! rewrite the superblock last, so a crash mid-flush leaves the superblock
//! pointing at the previous, fully-synced tree rather than at a partially
//! written one.

mod btree;
mod error;
mod key;
mod node;
mod pair;
mod reader;
mod store;
mod utils;

pub use key::Key128;
pub use pair::Pair;
pub use reader::DataReader;
pub use store::{Store, LS_ASYNC_COMMIT};
