//! Typed events crossing the graph thread's channel: control events from
//! the manager, component events from below, and the notifications the
//! graph sends back up.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::il::{
    ComponentEvent, ComponentId, CompletedCommand, ErrorCode, Event, IlState, ParamId, PcmFormat,
    PortIndex,
};

use super::config::GraphConfig;
use super::fsm::GraphState;

/// A control event driving the graph FSM, issued by the playback manager
/// (or a test harness).
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// Instantiate and configure the source for the first URI.
    Load(GraphConfig),
    /// Bring the pipeline up to Executing.
    Execute,
    /// Suspend playback.
    Pause,
    /// Resume after a pause.
    Resume,
    /// Drain and stop, descending the state ladder.
    Stop,
    /// Jump within the graph's URI list. Negative jumps go backward;
    /// jumping past the end ends playback.
    Skip {
        /// The number of entries to advance (or rewind).
        jump: i64,
    },
    /// Seek within the current track.
    Seek {
        /// The requested offset in seconds from the start of the track.
        offset_secs: i64,
    },
    /// Change rendering volume in steps of five points.
    Volume {
        /// The number of steps, negative to lower.
        step: i32,
    },
    /// Toggle rendering mute.
    Mute,
    /// Tear everything down. The graph thread exits afterwards.
    Destroy,
}

/// A message on the graph thread's single multiplexed channel.
#[derive(Debug)]
pub enum GraphMsg {
    /// A control event from above.
    Control(ControlEvent),
    /// An event reported by one of the graph's components.
    Component(ComponentEvent),
}

/// The event vocabulary the FSM tables are keyed on.
#[derive(Debug)]
pub(crate) enum FsmEvent {
    Control(ControlEvent),
    /// A component completed a state transition.
    TransComplete { component: ComponentId, state: IlState },
    /// A component finished disabling a port.
    PortDisabled { component: ComponentId, port: PortIndex },
    /// A component finished enabling a port.
    PortEnabled { component: ComponentId, port: PortIndex },
    /// A component finished flushing a port.
    FlushDone { component: ComponentId, port: PortIndex },
    /// A component detected a stream format change.
    PortSettings { component: ComponentId, port: PortIndex, param: ParamId },
    /// A component consumed an end-of-stream buffer.
    Eos { component: ComponentId, port: PortIndex },
    /// A component reported an unrecoverable error.
    CompError {
        component: ComponentId,
        code: ErrorCode,
        port: Option<PortIndex>,
    },
    /// Periodic liveness tick from the graph thread.
    Tick,
}

/// The kind of an [`FsmEvent`], used as a transition-table key.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum EventKind {
    Load,
    Execute,
    Pause,
    Resume,
    Stop,
    Skip,
    Seek,
    Volume,
    Mute,
    Destroy,
    TransComplete,
    PortDisabled,
    PortEnabled,
    FlushDone,
    PortSettings,
    Eos,
    CompError,
    Tick,
}

impl FsmEvent {
    pub(crate) fn kind(&self) -> EventKind {
        match self {
            FsmEvent::Control(c) => match c {
                ControlEvent::Load(_) => EventKind::Load,
                ControlEvent::Execute => EventKind::Execute,
                ControlEvent::Pause => EventKind::Pause,
                ControlEvent::Resume => EventKind::Resume,
                ControlEvent::Stop => EventKind::Stop,
                ControlEvent::Skip { .. } => EventKind::Skip,
                ControlEvent::Seek { .. } => EventKind::Seek,
                ControlEvent::Volume { .. } => EventKind::Volume,
                ControlEvent::Mute => EventKind::Mute,
                ControlEvent::Destroy => EventKind::Destroy,
            },
            FsmEvent::TransComplete { .. } => EventKind::TransComplete,
            FsmEvent::PortDisabled { .. } => EventKind::PortDisabled,
            FsmEvent::PortEnabled { .. } => EventKind::PortEnabled,
            FsmEvent::FlushDone { .. } => EventKind::FlushDone,
            FsmEvent::PortSettings { .. } => EventKind::PortSettings,
            FsmEvent::Eos { .. } => EventKind::Eos,
            FsmEvent::CompError { .. } => EventKind::CompError,
            FsmEvent::Tick => EventKind::Tick,
        }
    }

    /// Translates a component event into the FSM vocabulary. Events the
    /// FSM has no use for map to `None`.
    pub(crate) fn from_component(ev: ComponentEvent) -> Option<FsmEvent> {
        let component = ev.component;
        match ev.event {
            Event::CmdComplete { cmd, error: None } => Some(match cmd {
                CompletedCommand::StateSet(state) => FsmEvent::TransComplete { component, state },
                CompletedCommand::Flush(port) => FsmEvent::FlushDone { component, port },
                CompletedCommand::PortDisable(port) => {
                    FsmEvent::PortDisabled { component, port }
                }
                CompletedCommand::PortEnable(port) => FsmEvent::PortEnabled { component, port },
            }),
            Event::CmdComplete {
                error: Some(code), ..
            } => Some(FsmEvent::CompError {
                component,
                code,
                port: None,
            }),
            Event::Error { code, port } => Some(FsmEvent::CompError {
                component,
                code,
                port,
            }),
            Event::PortSettingsChanged { port, param } => Some(FsmEvent::PortSettings {
                component,
                port,
                param,
            }),
            Event::BufferFlag { port, flags } => flags
                .contains(crate::il::BufferFlags::EOS)
                .then_some(FsmEvent::Eos { component, port }),
            // Client buffer returns never reach the FSM.
            Event::BufferReturned { .. } => None,
        }
    }
}

/// The upward notification path out of a graph.
///
/// The playback manager installs a sink that forwards into its own
/// multiplexed channel; tests install plain `mpsc` senders.
pub trait NotifySink: Send + Sync + 'static {
    /// Delivers one notification.
    fn notify(&self, notification: GraphNotification);
}

impl NotifySink for std::sync::mpsc::Sender<GraphNotification> {
    fn notify(&self, notification: GraphNotification) {
        // A gone receiver means the owner is tearing down.
        let _ = self.send(notification);
    }
}

/// A notification from a graph to its owner.
#[derive(Debug, Clone)]
pub enum GraphNotification {
    /// The FSM moved to a new top-level state.
    StateChanged(GraphState),
    /// A track started executing.
    TrackStarted {
        /// Index of the track within the graph's URI list.
        index: usize,
        /// The track URI.
        uri: String,
        /// Metadata scanned during the probe.
        metadata: BTreeMap<String, String>,
        /// The negotiated PCM format.
        pcm: PcmFormat,
        /// Estimated track duration, when the probe could tell.
        duration: Option<Duration>,
    },
    /// Playback progressed to the given byte count of rendered audio.
    Progress {
        /// Bytes rendered since the track started.
        bytes: u64,
    },
    /// The graph's URI list is exhausted and the pipeline has stopped.
    EndOfPlay,
    /// A fatal error was recorded; the graph tore itself down.
    Fatal {
        /// The recorded error code.
        code: ErrorCode,
        /// Human-readable description for the control surfaces.
        message: String,
    },
    /// The rendering volume changed.
    VolumeChanged(u32),
    /// The rendering mute flag changed.
    MuteChanged(bool),
}
