//! The component layer: buffer headers, ports, the per-component kernel
//! and processor servant, and the component shell.
//!
//! This is the substrate the graph layer builds on. A component is the
//! smallest independently-scheduled unit of a pipeline; it owns one worker
//! that drains a mailbox in FIFO order and moves buffers across its ports
//! under the custody rules enforced by its kernel.

pub mod buffer;
pub mod component;
pub mod error;
pub mod event;
pub mod format;
pub mod port;
pub mod processor;
pub mod state;

pub(crate) mod kernel;

pub use buffer::*;
pub use component::*;
pub use error::*;
pub use event::*;
pub use format::*;
pub use port::{
    ConfigId, ConfigValue, ParamId, Parameter, PortConfig, PortDirection, RejectedBuffer,
};
pub use processor::{ProcContext, ProcessorOps};
pub use state::*;

/// Identifies a component within its graph. Assigned at graph load, with
/// the source first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u32);

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Identifies a port on a component. Ports are numbered from 0 in the
/// component's port table order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortIndex(pub u32);

impl std::fmt::Display for PortIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}
