pub use crate::net::buffer::WriteBuffer;
pub use crate::net::bus::{BusEvent, Topic};
pub use crate::net::connection::{Connection, ConnectionConfig, Half, StreamEvent, StreamState};
pub use crate::net::contract::{ConnectionDataSource, ConnectionDelegate};
pub use crate::net::driver::Driver;
pub use crate::net::policy::{SecurityLevel, SecurityOptions};
pub use crate::net::registry::{ConnectionRegistry, SHARED_CONNECTION_IDENTIFIER};
pub use crate::net::support::{Domain, Fault, NetError, NetResult};
pub use lumen::config::{ClientConfig, Profile};
