#![doc = include_str!("RUSTDOC.md")]

pub mod firestore;
pub mod platform;
