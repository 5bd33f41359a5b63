//! warehouse-sync — mirrors a remote package Index into a Warehouse-style
//! catalog.
//!
//! The engine (`engine`, `reconciler`, `dispatch`, `fingerprint`,
//! `normalize`, `model`) is expressible purely in terms of the
//! [`index::IndexClient`], [`warehouse::WarehouseClient`], and
//! [`store::Store`] traits, so it can be exercised without a live network or
//! Redis instance; `index::xmlrpc` and `warehouse::rest` are the concrete
//! production adapters, `store::RedisStore` the concrete production Store.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod fingerprint;
pub mod index;
pub mod model;
pub mod normalize;
pub mod reconciler;
pub mod retry;
pub mod store;
pub mod warehouse;
