//! # molt-core
//!
//! Core library for molt — a framework for single-binary CLI/daemon
//! applications that can safely replace their own executable and migrate
//! their persistent state in place while sibling instances are running.
//!
//! The hard part is not serving requests; it is the update lifecycle:
//!
//! - **Migration guard** ([`guard`]): a cross-process presence registry and
//!   shared/exclusive advisory lock that lets an installer stop every live
//!   instance and take exclusive ownership before touching the store.
//! - **Store** ([`store`]): an embedded ACID key-value store shared by all
//!   instances on a host, carrying the configuration record and a schema
//!   version marker advanced by a forward-only migration runner.
//! - **Updater** ([`update`]): version checks against a release source, and
//!   the deferred/detached launch of the install payload.
//! - **Lifecycle** ([`lifecycle`]): ordered teardown with a single
//!   post-cleanup hook that runs only after every other resource has been
//!   released, so the payload observes a quiesced process.
//!
//! [`paths`], [`net`], and [`release`] carry the supporting glue: filesystem
//! layout, base-URL derivation, and the HTTP release-source client.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod guard;
pub mod lifecycle;
pub mod net;
pub mod paths;
pub mod release;
pub mod store;
pub mod update;

pub use guard::MigrationGuard;
pub use lifecycle::Lifecycle;
pub use store::Store;
pub use update::Updater;
