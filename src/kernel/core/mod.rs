// src/kernel/core/mod.rs
//! カーネル共通の型とエラー定義

pub mod result;

pub use result::{ErrorKind, KernelError, KernelResult};
