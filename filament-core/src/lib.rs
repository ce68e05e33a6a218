//! Filament Core
//!
//! This crate provides the reactive state runtime for the Filament UI
//! framework: a graph of cells that tracks its own dependencies, defers
//! and deduplicates notifications, and recomputes as little as possible.
//!
//! It implements:
//!
//! - Writable cells (directly settable leaf state)
//! - Derived cells (lazy, memoized computations with automatic
//!   dependency discovery)
//! - Batched writes with exactly-once notification per changed cell
//! - Watches (side effects with cleanup, driven by the cells they read)
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_core::reactive::{batch, watch, Derived, Writable};
//!
//! let first = Writable::new(String::from("Ada"));
//! let last = Writable::new(String::from("Lovelace"));
//!
//! let full = {
//!     let (first, last) = (first.clone(), last.clone());
//!     Derived::new(move || format!("{} {}", first.get(), last.get()))
//! };
//!
//! let _watch = watch({
//!     let full = full.clone();
//!     move || {
//!         println!("{}", full.get());
//!         None
//!     }
//! });
//!
//! // One notification, not two.
//! batch(|| {
//!     first.set(String::from("Grace"));
//!     last.set(String::from("Hopper"));
//! });
//! ```

pub mod reactive;
