#![doc = include_str!("../README.md")]

pub mod backend;
pub mod cluster;
mod error;
pub mod levels;
mod lru;

mod index;
mod tree;

pub use backend::{Backend, MemBackend, NoopBackend};
pub use error::Error;
pub use index::{Cursor, EntryRef, IndexConfig, IndexStats, RadixIndex};
pub use levels::{LevelDesc, LevelMap};
pub use tree::node::ValueRef;
