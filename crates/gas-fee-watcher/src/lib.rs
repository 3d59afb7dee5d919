//! Background watcher for network gas fee estimates.
//!
//! The watcher periodically fetches EIP-1559 fee estimates from a fee API,
//! falling back to the node's legacy gas price where those are unavailable,
//! derives expected confirmation times and publishes every result to
//! subscribers through a watch channel. Polling runs while at least one
//! caller holds a poll token; queries are answered from the last published
//! state and never block on the network.

pub mod estimates;
pub mod fetch;
pub mod time_bounds;
pub mod watcher;

pub use self::watcher::{GasFeeWatcher, PollToken, StateWatcher, WatcherConfig};
