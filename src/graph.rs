//! The graph layer: a wired set of components realising one playback
//! configuration, orchestrated by a state machine on a dedicated thread.
//!
//! The graph thread multiplexes two inputs over a single channel,
//! control events from the owner and component events from below, and
//! runs the FSM synchronously over them. There is no re-entrance from the
//! event path into component APIs: everything the FSM does goes through
//! the graph ops verbs.

pub mod config;
pub mod events;
pub mod probe;
pub mod reactor;

pub(crate) mod fsm;
pub(crate) mod ops;

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use crate::il::{
    ComponentEvent, ComponentHandle, ComponentId, Encoding, EventSink, IlError,
};

pub use config::GraphConfig;
pub use events::{ControlEvent, GraphMsg, GraphNotification, NotifySink};
pub use fsm::GraphState;
pub use probe::ProbeResult;
pub use reactor::ReactorHandle;

use events::FsmEvent;
use fsm::GraphFsm;
use ops::GraphOps;
use reactor::Reactor;

/// The liveness tick period of the graph thread.
const TICK: Duration = Duration::from_millis(200);

/// An error encountered by a [`GraphHandle`] or during graph
/// construction.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A component-layer failure.
    #[error("component error")]
    Il(#[from] IlError),
    /// The graph thread is gone.
    #[error("graph disconnected")]
    Disconnected,
}

/// Builds the components of one kind of pipeline.
///
/// A builder must produce at least two components (a source and a sink);
/// adjacent components are tunneled in list order, the source's output
/// port being port 0 and every downstream input being port 0 (with
/// pass-through components using port 1 for output).
pub trait GraphBuilder: Send + Sync + 'static {
    /// A short name for logs.
    fn name(&self) -> &str;

    /// Whether this builder's pipeline can play the given encoding.
    fn handles(&self, encoding: Encoding) -> bool;

    /// Builds the source component.
    fn build_source(
        &self,
        id: ComponentId,
        events: Arc<dyn EventSink>,
    ) -> Result<ComponentHandle, IlError>;

    /// Builds everything downstream of the source, in pipeline order,
    /// with component ids starting at `first_id`.
    fn build_rest(
        &self,
        probe: &ProbeResult,
        first_id: u32,
        events: Arc<dyn EventSink>,
        reactor: &ReactorHandle,
    ) -> Result<Vec<ComponentHandle>, IlError>;

    /// Applies the probe result to the components' port parameters.
    /// Called while everything is Loaded.
    fn configure(
        &self,
        components: &[ComponentHandle],
        probe: &ProbeResult,
    ) -> Result<(), IlError>;
}

/// Forwards component events into the graph thread's channel.
struct ComponentEventTx(Sender<GraphMsg>);

impl EventSink for ComponentEventTx {
    fn emit(&self, event: ComponentEvent) {
        // A gone graph thread means teardown is in progress; late events
        // are dropped.
        let _ = self.0.send(GraphMsg::Component(event));
    }
}

/// A handle to a running graph.
///
/// Control methods enqueue events; all effects are reported back through
/// the notification channel given at spawn time.
pub struct GraphHandle {
    control: Sender<GraphMsg>,
    thread: Mutex<Option<JoinHandle<()>>>,
    reactor: ReactorHandle,
    reactor_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for GraphHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphHandle").finish_non_exhaustive()
    }
}

impl GraphHandle {
    /// Spawns the graph thread (and its reactor) for the given builder.
    /// Notifications go to `notify`.
    pub fn spawn(
        builder: Arc<dyn GraphBuilder>,
        notify: Arc<dyn NotifySink>,
    ) -> Result<Self, GraphError> {
        let (tx, rx) = channel();
        let (reactor, reactor_thread) = Reactor::spawn()?;

        let events: Arc<dyn EventSink> = Arc::new(ComponentEventTx(tx.clone()));
        let ops = GraphOps::new(builder, events, notify, reactor.clone());

        let mut runner = GraphRunner {
            fsm: GraphFsm::new(),
            ops,
            rx,
        };

        let thread = std::thread::Builder::new()
            .name("graph".into())
            .spawn(move || runner.run())
            .map_err(|e| IlError::InsufficientResources(format!("spawning graph: {e}")))?;

        Ok(Self {
            control: tx,
            thread: Mutex::new(Some(thread)),
            reactor,
            reactor_thread: Mutex::new(Some(reactor_thread)),
        })
    }

    /// Submits a control event.
    pub fn submit(&self, event: ControlEvent) -> Result<(), GraphError> {
        self.control
            .send(GraphMsg::Control(event))
            .map_err(|_| GraphError::Disconnected)
    }

    /// Loads the configuration and starts playback.
    pub fn play(&self, config: GraphConfig) -> Result<(), GraphError> {
        self.submit(ControlEvent::Load(config))?;
        self.submit(ControlEvent::Execute)
    }

    /// Suspends playback.
    pub fn pause(&self) -> Result<(), GraphError> {
        self.submit(ControlEvent::Pause)
    }

    /// Resumes after a pause.
    pub fn resume(&self) -> Result<(), GraphError> {
        self.submit(ControlEvent::Resume)
    }

    /// Drains and stops playback.
    pub fn stop(&self) -> Result<(), GraphError> {
        self.submit(ControlEvent::Stop)
    }

    /// Jumps within the graph's URI list.
    pub fn skip(&self, jump: i64) -> Result<(), GraphError> {
        self.submit(ControlEvent::Skip { jump })
    }

    /// Adjusts volume by steps.
    pub fn volume(&self, step: i32) -> Result<(), GraphError> {
        self.submit(ControlEvent::Volume { step })
    }

    /// Toggles mute.
    pub fn mute(&self) -> Result<(), GraphError> {
        self.submit(ControlEvent::Mute)
    }

    /// Tears the graph down and joins its threads. Idempotent.
    pub fn destroy(&self) {
        let _ = self.submit(ControlEvent::Destroy);
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }

        self.reactor.shutdown();
        if let Some(thread) = self.reactor_thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for GraphHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct GraphRunner {
    fsm: GraphFsm,
    ops: GraphOps,
    rx: Receiver<GraphMsg>,
}

impl GraphRunner {
    fn run(&mut self) {
        log::debug!("graph thread up");

        loop {
            match self.rx.recv_timeout(TICK) {
                Ok(GraphMsg::Control(ControlEvent::Destroy)) => {
                    self.fsm
                        .process_event(&mut self.ops, FsmEvent::Control(ControlEvent::Destroy));
                    break;
                }
                Ok(GraphMsg::Control(event)) => {
                    log::debug!("control event {event:?} in {:?}", self.fsm.state());
                    self.fsm.process_event(&mut self.ops, FsmEvent::Control(event));
                }
                Ok(GraphMsg::Component(event)) => {
                    if let Some(evt) = FsmEvent::from_component(event) {
                        self.fsm.process_event(&mut self.ops, evt);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.fsm.process_event(&mut self.ops, FsmEvent::Tick);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Make sure nothing survives the thread.
        self.ops.do_tear_down_tunnels();
        self.ops.do_destroy_graph();
        log::debug!("graph thread down");
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Instant;

    use crate::components::{MemorySink, PcmGraphBuilder, SampleSink};
    use crate::testutil;

    use super::*;

    fn builder_for(sink: MemorySink) -> Arc<dyn GraphBuilder> {
        Arc::new(PcmGraphBuilder::new(move || Box::new(sink.clone())))
    }

    fn full_volume(uri: String) -> GraphConfig {
        GraphConfig {
            volume: 100,
            ..GraphConfig::single(uri)
        }
    }

    /// Collects notifications until `pred` accepts one, remembering every
    /// state the FSM visited along the way.
    fn drain_until(
        rx: &Receiver<GraphNotification>,
        visited: &mut Vec<GraphState>,
        what: &str,
        timeout: Duration,
        mut pred: impl FnMut(&GraphNotification) -> bool,
    ) -> GraphNotification {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| panic!("timed out waiting for {what}; saw {visited:?}"));
            let n = rx
                .recv_timeout(left)
                .unwrap_or_else(|e| panic!("waiting for {what}: {e}"));

            if let GraphNotification::StateChanged(s) = &n {
                visited.push(*s);
            }
            if pred(&n) {
                return n;
            }
        }
    }

    fn assert_visited_in_order(visited: &[GraphState], expected: &[GraphState]) {
        let mut it = visited.iter();
        for want in expected {
            assert!(
                it.any(|s| s == want),
                "expected {expected:?} in order, got {visited:?}"
            );
        }
    }

    #[test_log::test]
    fn single_track_plays_to_the_sink_and_stops() {
        let rate = 44100;
        let seconds = 0.5;
        let path = testutil::wav_file("single", rate, 2, seconds);
        let sink = MemorySink::new();

        let (tx, rx) = channel();
        let graph = GraphHandle::spawn(builder_for(sink.clone()), Arc::new(tx)).unwrap();
        graph
            .play(full_volume(path.display().to_string()))
            .unwrap();

        let mut visited = Vec::new();
        drain_until(&rx, &mut visited, "end of play", Duration::from_secs(10), |n| {
            matches!(n, GraphNotification::EndOfPlay)
        });

        assert_visited_in_order(
            &visited,
            &[
                GraphState::Loaded,
                GraphState::AutoDetecting,
                GraphState::Configuring,
                GraphState::Executing,
                GraphState::Stopped,
            ],
        );

        // Every PCM byte of the stream reached the sink.
        let expected = testutil::wav_payload(rate, 2, seconds);
        let got = sink.data();
        assert_eq!(got.len(), expected.len());
        pretty_assertions::assert_eq!(got, expected);

        graph.destroy();
        let _ = std::fs::remove_file(path);
    }

    #[test_log::test]
    fn mid_stream_rate_change_reconfigures_without_sample_loss() {
        let segments = [(44100u32, 2u16, 0.25f64), (48000, 2, 0.25)];
        let path = testutil::concat_wav_file("ratechange", &segments);
        let sink = MemorySink::new();

        let (tx, rx) = channel();
        let graph = GraphHandle::spawn(builder_for(sink.clone()), Arc::new(tx)).unwrap();
        graph
            .play(full_volume(path.display().to_string()))
            .unwrap();

        let mut visited = Vec::new();
        drain_until(&rx, &mut visited, "end of play", Duration::from_secs(10), |n| {
            matches!(n, GraphNotification::EndOfPlay)
        });

        // The tunnel cycled mid-stream...
        assert_visited_in_order(
            &visited,
            &[
                GraphState::Executing,
                GraphState::Reconfiguring,
                GraphState::Executing,
                GraphState::Stopped,
            ],
        );

        // ...and not one sample went missing on either side of the change.
        let mut expected = testutil::wav_payload(44100, 2, 0.25);
        expected.extend(testutil::wav_payload(48000, 2, 0.25));
        let got = sink.data();
        assert_eq!(got.len(), expected.len());
        pretty_assertions::assert_eq!(got, expected);

        graph.destroy();
        let _ = std::fs::remove_file(path);
    }

    /// A sink whose fd never becomes writable, as far as the pipeline can
    /// tell: every write would block and no readiness ever arrives.
    struct NeverWritableSink;

    impl SampleSink for NeverWritableSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    #[test_log::test]
    fn back_pressured_sink_times_out_to_fault() {
        let path = testutil::wav_file("blocked", 44100, 2, 0.5);

        let builder: Arc<dyn GraphBuilder> =
            Arc::new(PcmGraphBuilder::new(|| Box::new(NeverWritableSink)));
        let (tx, rx) = channel();
        let graph = GraphHandle::spawn(builder, Arc::new(tx)).unwrap();
        graph
            .play(full_volume(path.display().to_string()))
            .unwrap();

        let mut visited = Vec::new();
        let fault = drain_until(&rx, &mut visited, "fault", Duration::from_secs(15), |n| {
            matches!(n, GraphNotification::Fatal { .. })
        });

        let GraphNotification::Fatal { code, .. } = fault else {
            unreachable!()
        };
        assert_eq!(code, crate::il::ErrorCode::Timeout);

        graph.destroy();
        let _ = std::fs::remove_file(path);
    }
}
