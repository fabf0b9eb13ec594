//! Commands accepted by components and events they report upward.

use super::buffer::{BufferFlags, BufferHeader};
use super::error::ErrorCode;
use super::port::ParamId;
use super::state::IlState;
use super::{ComponentId, PortIndex};

/// Selects the port(s) a command applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortSelector {
    /// Every port on the component.
    All,
    /// A single port.
    One(PortIndex),
}

impl From<PortIndex> for PortSelector {
    fn from(port: PortIndex) -> Self {
        PortSelector::One(port)
    }
}

/// A lifecycle command, delivered to the servant's mailbox.
///
/// The declaration order is stable: it indexes the servant's command
/// dispatch table. Do not re-order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    /// Request a state transition.
    StateSet(IlState),
    /// Return every buffer on the selected port(s) without processing.
    Flush(PortSelector),
    /// Stop and depopulate the selected port(s).
    PortDisable(PortSelector),
    /// Re-enable and repopulate the selected port(s).
    PortEnable(PortSelector),
}

impl Command {
    pub(crate) fn table_index(&self) -> usize {
        match self {
            Command::StateSet(_) => 0,
            Command::Flush(_) => 1,
            Command::PortDisable(_) => 2,
            Command::PortEnable(_) => 3,
        }
    }
}

/// Identifies a completed command in a [`Event::CmdComplete`] report.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompletedCommand {
    /// A state transition finished.
    StateSet(IlState),
    /// A port finished flushing.
    Flush(PortIndex),
    /// A port finished disabling.
    PortDisable(PortIndex),
    /// A port finished enabling.
    PortEnable(PortIndex),
}

/// An event reported upward by a component.
#[derive(Debug)]
pub enum Event {
    /// A previously submitted command completed.
    CmdComplete {
        /// The command that completed.
        cmd: CompletedCommand,
        /// The failure code, if the command failed.
        error: Option<ErrorCode>,
    },
    /// An unrecoverable error. The component now awaits `StateSet(Loaded)`
    /// to tear down.
    Error {
        /// The failure code.
        code: ErrorCode,
        /// The port the failure is associated with, if any.
        port: Option<PortIndex>,
    },
    /// A port detected a change in the stream format. The graph reacts by
    /// cycling the affected tunnel.
    PortSettingsChanged {
        /// The port whose settings changed.
        port: PortIndex,
        /// The parameter that changed.
        param: ParamId,
    },
    /// A buffer carrying the given flags was consumed by this component.
    /// The terminal component reports `EOS` this way.
    BufferFlag {
        /// The port the buffer arrived on.
        port: PortIndex,
        /// The flags observed.
        flags: BufferFlags,
    },
    /// A client-owned buffer is returned to the client (no tunnel attached
    /// to the port).
    BufferReturned {
        /// The port returning the buffer.
        port: PortIndex,
        /// The returned header; ownership passes back to the client.
        buffer: BufferHeader,
    },
}

/// An event paired with the component that reported it.
#[derive(Debug)]
pub struct ComponentEvent {
    /// The reporting component.
    pub component: ComponentId,
    /// The event.
    pub event: Event,
}

/// The upward event path out of a component.
///
/// The graph installs a sink that forwards into the graph thread's channel;
/// tests install plain `mpsc` senders.
pub trait EventSink: Send + Sync + 'static {
    /// Delivers one event. Must not call back into component APIs.
    fn emit(&self, event: ComponentEvent);
}

impl EventSink for std::sync::mpsc::Sender<ComponentEvent> {
    fn emit(&self, event: ComponentEvent) {
        // A gone receiver means the graph is tearing down; late events are
        // dropped.
        let _ = self.send(event);
    }
}
