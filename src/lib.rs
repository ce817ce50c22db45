#[macro_use]
extern crate log;

pub mod codec;
pub mod config;
pub mod doctor;
pub mod events;
pub mod flow;
pub mod id;
pub mod kernel;
pub mod node;
pub mod registry;
pub mod routing;
pub mod scale;
pub mod transport;
pub mod wire;

pub use config::NodeConfig;
pub use id::NodeId;
pub use kernel::Kernel;
