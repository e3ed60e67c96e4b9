//! Hot-reloading module supervisor.
//!
//! A module runs inside a worker process. `launch` watches its files, restarts
//! the worker when they change, and hands out a handle that stays usable across
//! reloads: a JSON value, or a [`ModuleFn`] whose calls are relayed to
//! whichever worker is alive.

pub mod config;
pub mod protocol;
pub mod supervisor;
pub mod utils;
pub mod watch;

pub use config::{HotmodConfig, UnitConfig, WorkerCommand};
pub use supervisor::{launch, Module, ModuleError, ModuleFn, SupervisorError, Unit};
