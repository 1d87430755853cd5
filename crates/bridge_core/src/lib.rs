//! Connection monitor and command dispatch for the terminal bridge.

pub mod bridge;
pub mod bus;
pub mod dispatch;
pub mod lookup;
pub mod monitor;
pub mod render;
pub mod state;
pub mod throttle;
pub mod validation;

pub use bridge::{Bridge, BridgeOptions, ConnectionSettings};
pub use bus::{LocalBus, MessageBus, Responder};
pub use dispatch::CommandDispatcher;
pub use monitor::ConnectionMonitor;
pub use state::ConnectionHub;
