// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Connection-management core for pipe/proxy services.
//!
//! Two primitives make up the crate: [`server::Server`], a bounded-concurrency
//! TCP server that hands every completed read to a caller-supplied
//! [`server::MessageHandler`] and can drain its live connections cleanly, and
//! [`pump::Pump`], a one-directional byte copier that owns both of its streams
//! and runs to end-of-stream on a dedicated worker. [`shutdown`] provides the
//! thin signal watcher that usually triggers the server's graceful drain.

pub mod pump;
pub mod server;
pub mod shutdown;
pub mod util;
