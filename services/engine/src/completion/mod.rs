//! Asynchronous completion engines
//!
//! Inline finalization lives with the driver contract
//! ([`crate::driver::finalize_sync`]). The deferred strategies are here:
//! a timer-multiplexed poller, a pending-set sweeper, and a status event
//! consumer.

pub mod events;
pub mod poller;
pub mod tracker;

pub use events::{topic, EventConsumer, EventHandler, EventPublisher, InfoContainer, InfoType};
pub use poller::{LoadBalancerProbe, PollDispatcher, PollHandle, ProbeReport};
pub use tracker::{PendingLoadBalancers, RemoteStatus, StatusSource, StatusSweeper};
