//! Remote container driver
//!
//! Translates instance operations into docker commands on a remote host:
//! - Creating, starting, stopping and removing instance containers
//! - Host port selection
//! - Reading resource stats and logs

mod driver;
mod logs;
mod ports;
mod stats;

pub use driver::{
    container_name, ContainerHandle, ContainerSpec, DriverRegistry, DriverSettings,
    RemoteContainerDriver,
};
pub use logs::parse_logs;
pub use ports::{PortAllocator, PortLease};
pub use stats::{parse_size_mb, parse_stats};
