//! Agent-side pieces: instrumentation control, data collection and the
//! remotely invokable profiler contract.

mod collector;
mod contract;
mod controller;
mod port;

pub use collector::*;
pub use contract::*;
pub use controller::*;
pub use port::*;

#[cfg(test)]
pub(crate) use port::fake;
