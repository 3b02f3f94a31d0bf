//! LBaaS v2 control-plane engine
//!
//! Provider dispatch, completion tracking and the built-in drivers.

pub mod agent;
pub mod api;
pub mod auth;
pub mod certificates;
pub mod completion;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod haproxy;
pub mod locks;
pub mod model;
pub mod network;
pub mod orchestrator;
pub mod plugin;
pub mod queue;
pub mod rest;
pub mod store;

pub use context::RequestContext;
pub use driver::{DriverRegistry, Finalizer, ProviderDriver};
pub use error::{LbaasError, Result};
pub use plugin::{Dispatcher, StoreFinalizer};
