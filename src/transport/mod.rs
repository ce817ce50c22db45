pub mod flow;

pub use flow::{FlowDatagram, FlowHeader, FlowTransport};
