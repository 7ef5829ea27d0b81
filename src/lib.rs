#![doc = include_str!("../README.md")]

mod bulk;
mod error;
mod map;
mod raw;

#[cfg(feature = "serde")]
mod serde_impls;

pub use error::Error;
pub use map::{HashMap, HashMapBuilder, HashMapRef, Iter, Keys, Values};
pub use seize::{Guard, LocalGuard, OwnedGuard};
