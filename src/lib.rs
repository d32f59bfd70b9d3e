//! # xpdep Core Library
//!
//! This crate contains the core logic of `xpdep`, a dependency manager for
//! Crossplane packages. It resolves declared provider and configuration
//! dependencies to concrete versions and keeps the packages in a local cache
//! (`~/.up/cache/` by default) so later runs never go back to the registry.
//!
//! The library backs the `xpdep` CLI, but every piece can be reused on its
//! own: the cache and the resolver are traits with in-memory implementations
//! for tests and offline use.
//!
//! ## Modules Overview
//! - [`reference`] – Parsing and normalizing OCI package references
//! - [`dep`] – Declared dependencies and package kinds
//! - [`xpkg`] – Package artifacts and package-metadata documents
//! - [`global`] – The package cache and the filesystem it runs on
//! - [`resolver`] – Turning constraints into concrete tags
//! - [`registry`] – OCI registry client used as the default resolver
//! - [`manager`] – Resolving dependencies and filling the cache
//! - [`workspace`] – Reading and updating a project's `crossplane.yaml`
//! - [`config`] – User configuration (`config.toml`)
//! - [`util`] – Shared helpers (hashing, version parsing)

pub mod config;
pub mod dep;
pub mod error;
pub mod global;
pub mod manager;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod util;
pub mod workspace;
pub mod xpkg;

pub use config::*;
pub use dep::*;
pub use error::*;
pub use global::cache::*;
pub use manager::*;
pub use reference::*;
pub use registry::*;
pub use resolver::*;
pub use workspace::*;
pub use xpkg::*;
