#![doc = include_str!("../README.md")]
#![warn(
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code
)]

pub mod loader;
pub mod model;
pub mod storage;
pub mod store;

pub use crate::store::Store;
