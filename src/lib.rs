#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate getset;
#[macro_use]
extern crate quick_error;
#[macro_use]
pub extern crate slog;
extern crate slog_stdlog;

pub mod log;
pub use crate::log::Logger as GlobalLogger;

pub mod assignment;
pub mod config;
pub mod error;
pub mod inventory;
pub mod notify;
pub mod pool;
pub mod power;
pub mod preclear;
pub mod sysfs;
pub mod swap;
pub mod throughput;
pub mod tool;
pub mod util;
pub mod zram;
