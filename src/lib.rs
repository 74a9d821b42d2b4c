//! Transport adapter layering a connection-oriented, message-preserving
//! request/reply protocol on top of an unreliable L2 overlay network.

pub mod addr;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod host;
pub mod logging;
pub mod op;
pub mod options;
pub mod overlay;
pub mod persistence;
pub mod pipe;
pub mod reassembly;
pub mod registry;
pub mod scheduler;
pub mod support;
pub mod time;
pub mod transport;
pub mod url;

pub use error::{Result, TransportError};
pub use host::Host;
pub use options::OptionTable;
pub use transport::{Endpoint, Pipe, Transport};
