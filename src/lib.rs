//! Checkout fabric: order, payment, and stock services cooperating over a
//! shared scripted KV store.
//!
//! A checkout is a two-phase, compensation-driven saga: the orchestrator
//! fans the stock and payment legs out in parallel, each leg settles through
//! an atomic conditional decrement, and a stream-fed reconciliation pass
//! commits or compensates once both legs are known.
//!
//! # Modules
//!
//! - [`kv`] - typed facade over the store: records, scripts, streams
//! - [`models`] - field-addressable record types
//! - [`txn`] - transaction record lifecycle and advisory lock
//! - [`rpc`] - wire contracts and typed clients
//! - [`stock`] / [`payment`] - the two saga leg services
//! - [`order`] - the checkout orchestrator
//! - [`reconcile`] - the reconciliation stream processor
//! - [`snapshot`] / [`snapctl`] - coordinated snapshot protocol
//! - [`config`] / [`logging`] - startup plumbing

pub mod config;
pub mod kv;
pub mod logging;
pub mod models;
pub mod order;
pub mod payment;
pub mod reconcile;
pub mod rpc;
pub mod snapctl;
pub mod snapshot;
pub mod stock;
pub mod txn;

// Convenient re-exports at crate root
pub use config::{LogConfig, ServiceConfig};
pub use kv::{KvError, KvStore};
pub use models::{Counter, Flag, Item, Order, Transaction, TransactionStatus, User};
pub use order::OrderService;
pub use payment::PaymentService;
pub use reconcile::{PAYMENT_LEG, STOCK_LEG, VibeChecker};
pub use snapctl::SnapshotController;
pub use snapshot::SnapshotGate;
pub use stock::StockService;
pub use txn::TxnLog;
