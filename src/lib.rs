//! jprof core library: CPU profiler control for an attached process and
//! call-tree reconstruction from profiler dumps.

mod agent;
mod cmd;
mod config;
mod dump;
mod error;
mod events;
mod facade;
mod filter;
mod model;
mod parser;
mod remote;
mod sampling;
mod session;
mod snapshot;
mod state;

pub use agent::*;
pub use cmd::*;
pub use config::*;
pub use dump::*;
pub use error::*;
pub use events::*;
pub use facade::*;
pub use filter::*;
pub use model::*;
pub use parser::*;
pub use remote::*;
pub use sampling::*;
pub use session::*;
pub use snapshot::*;
pub use state::*;
