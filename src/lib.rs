// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workspace root crate. Re-exports the [`fanout`] facade so `cargo doc`
//! and `cargo test` at the workspace root have a default target.

pub use fanout::*;
