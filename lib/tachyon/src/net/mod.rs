//! The networking modules in `Tachyon` handle the long-lived client connection that
//! multiplexes all traffic between the host application and a single remote origin.

pub mod buffer;
pub mod bus;
pub mod connection;
pub mod contract;
pub mod driver;
pub mod policy;
pub mod registry;
pub mod response;
pub mod support;
pub mod transport;
