//! The playback manager: cross-graph policy.
//!
//! The manager owns the playlist iterator and a registry of graph
//! builders. It partitions the playlist into runs of same-kind tracks,
//! brings up one graph per run, forwards user commands, and surfaces the
//! state the control surfaces (CLI, MPRIS) observe. When a graph dies,
//! at the end of its run or on a fatal error, the manager advances the playlist
//! and brings up the next graph: playlist-level recovery.

pub mod introspect;
pub mod playlist;

use std::collections::BTreeMap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bitflags::bitflags;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

use crate::graph::{
    probe, GraphBuilder, GraphConfig, GraphError, GraphHandle, GraphNotification, GraphState,
    NotifySink,
};
use crate::il::PcmFormat;

pub use playlist::{Playlist, Track, TrackSource};

/// The observable playback state, in control-surface vocabulary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    /// Buffers are flowing.
    Playing,
    /// Suspended by the user.
    Paused,
    /// Nothing is playing.
    #[default]
    Stopped,
}

impl std::fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlaybackStatus::Playing => "Playing",
            PlaybackStatus::Paused => "Paused",
            PlaybackStatus::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// The loop policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LoopMode {
    /// Play through once.
    #[default]
    None,
    /// Repeat the current track.
    Track,
    /// Restart the playlist when it ends.
    Playlist,
}

impl std::fmt::Display for LoopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopMode::None => "None",
            LoopMode::Track => "Track",
            LoopMode::Playlist => "Playlist",
        };
        f.write_str(s)
    }
}

bitflags! {
    /// What the player can currently do, for the control surfaces.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        /// A next track exists.
        const CAN_GO_NEXT = 0x01;
        /// Something can be played.
        const CAN_PLAY = 0x02;
        /// Playback can be suspended.
        const CAN_PAUSE = 0x04;
        /// Seeking within a track is supported.
        const CAN_SEEK = 0x08;
        /// The player accepts control at all.
        const CAN_CONTROL = 0x10;
    }
}

/// A snapshot of everything the control surfaces observe.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    /// Current playback status.
    pub status: PlaybackStatus,
    /// Current loop policy.
    pub loop_mode: LoopMode,
    /// Whether shuffle is active.
    pub shuffle: bool,
    /// Metadata of the current track (artist, title, uri, ...).
    pub metadata: BTreeMap<String, String>,
    /// Rendering volume, 0..=100.
    pub volume: u32,
    /// Rendering mute.
    pub muted: bool,
    /// Position within the current track.
    pub position: Duration,
    /// Duration of the current track, when known.
    pub duration: Option<Duration>,
    /// Capability flags.
    pub caps: Capabilities,
    /// The most recent failure reason, for surfaces that show one.
    pub last_error: Option<String>,
}

/// Typed notification callbacks fired by the manager on observable
/// changes. All callbacks run on the manager thread; keep them short.
#[derive(Default)]
pub struct PlaybackSignals {
    /// Playback status changed.
    pub playback_status: Option<Box<dyn Fn(PlaybackStatus) + Send>>,
    /// Loop policy changed.
    pub loop_status: Option<Box<dyn Fn(LoopMode) + Send>>,
    /// Current-track metadata changed.
    pub metadata: Option<Box<dyn Fn(&BTreeMap<String, String>) + Send>>,
    /// Volume changed; the value is 0.0..=1.0.
    pub volume: Option<Box<dyn Fn(f64) + Send>>,
}

impl std::fmt::Debug for PlaybackSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSignals")
            .field("playback_status", &self.playback_status.is_some())
            .field("loop_status", &self.loop_status.is_some())
            .field("metadata", &self.metadata.is_some())
            .field("volume", &self.volume.is_some())
            .finish()
    }
}

/// A user command, as delivered by the CLI or MPRIS surface.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PlayerCommand {
    /// Start (or resume) playback.
    Play,
    /// Toggle pause.
    TogglePause,
    /// Stop playback, keeping the playlist position.
    Stop,
    /// Advance to the next track.
    Next,
    /// Go back to the previous track.
    Previous,
    /// Seek within the current track.
    Seek {
        /// Offset in seconds from the start of the track.
        offset_secs: i64,
    },
    /// Adjust volume by steps.
    Volume {
        /// Steps of five points; negative to lower.
        step: i32,
    },
    /// Toggle mute.
    Mute,
    /// Stop everything and shut the manager down.
    Quit,
}

enum ManagerMsg {
    Cmd(PlayerCommand),
    SetLoop(LoopMode),
    SetShuffle(bool),
    Graph(u64, GraphNotification),
}

/// Forwards graph notifications into the manager's channel, tagged with
/// the graph's generation so a torn-down graph's stragglers are ignored.
struct GraphToManager {
    generation: u64,
    tx: Sender<ManagerMsg>,
}

impl NotifySink for GraphToManager {
    fn notify(&self, notification: GraphNotification) {
        let _ = self.tx.send(ManagerMsg::Graph(self.generation, notification));
    }
}

/// The playback manager handle.
pub struct PlaybackManager {
    tx: Sender<ManagerMsg>,
    status: Arc<Mutex<StatusSnapshot>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    end_of_list: Shared<oneshot::Receiver<()>>,
}

impl std::fmt::Debug for PlaybackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackManager").finish_non_exhaustive()
    }
}

impl PlaybackManager {
    /// Creates a manager over a track source and a registry of graph
    /// builders, and starts its worker thread. Playback begins on
    /// [`PlaybackManager::play`].
    pub fn new(
        source: Box<dyn TrackSource>,
        builders: Vec<Arc<dyn GraphBuilder>>,
        signals: PlaybackSignals,
    ) -> Result<Self, GraphError> {
        let (tx, rx) = channel();
        let (end_tx, end_rx) = oneshot::channel();

        let status = Arc::new(Mutex::new(StatusSnapshot {
            volume: 75,
            caps: Capabilities::CAN_CONTROL
                | if source.is_empty() {
                    Capabilities::empty()
                } else {
                    Capabilities::CAN_PLAY
                },
            ..Default::default()
        }));

        let mut worker = ManagerWorker {
            source,
            builders,
            graph: None,
            generation: 0,
            run_len: 0,
            run_metadata: Vec::new(),
            last_started: 0,
            track_pcm: PcmFormat::default(),
            loop_mode: LoopMode::None,
            status: status.clone(),
            signals,
            rx,
            tx: tx.clone(),
            end_tx: Some(end_tx),
        };

        let thread = std::thread::Builder::new()
            .name("playback-manager".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                GraphError::Il(crate::il::IlError::InsufficientResources(format!(
                    "spawning manager: {e}"
                )))
            })?;

        Ok(Self {
            tx,
            status,
            thread: Mutex::new(Some(thread)),
            end_of_list: end_rx.shared(),
        })
    }

    fn send(&self, msg: ManagerMsg) -> Result<(), GraphError> {
        self.tx.send(msg).map_err(|_| GraphError::Disconnected)
    }

    /// Starts (or resumes) playback.
    pub fn play(&self) -> Result<(), GraphError> {
        self.send(ManagerMsg::Cmd(PlayerCommand::Play))
    }

    /// Toggles pause.
    pub fn toggle_pause(&self) -> Result<(), GraphError> {
        self.send(ManagerMsg::Cmd(PlayerCommand::TogglePause))
    }

    /// Stops playback.
    pub fn stop(&self) -> Result<(), GraphError> {
        self.send(ManagerMsg::Cmd(PlayerCommand::Stop))
    }

    /// Advances to the next track.
    pub fn next(&self) -> Result<(), GraphError> {
        self.send(ManagerMsg::Cmd(PlayerCommand::Next))
    }

    /// Goes back to the previous track (or replays the first).
    pub fn previous(&self) -> Result<(), GraphError> {
        self.send(ManagerMsg::Cmd(PlayerCommand::Previous))
    }

    /// Requests a seek within the current track.
    pub fn seek(&self, offset_secs: i64) -> Result<(), GraphError> {
        self.send(ManagerMsg::Cmd(PlayerCommand::Seek { offset_secs }))
    }

    /// Adjusts volume by steps of five points.
    pub fn volume(&self, step: i32) -> Result<(), GraphError> {
        self.send(ManagerMsg::Cmd(PlayerCommand::Volume { step }))
    }

    /// Toggles mute.
    pub fn mute(&self) -> Result<(), GraphError> {
        self.send(ManagerMsg::Cmd(PlayerCommand::Mute))
    }

    /// Sets the loop policy.
    pub fn set_loop(&self, mode: LoopMode) -> Result<(), GraphError> {
        self.send(ManagerMsg::SetLoop(mode))
    }

    /// Toggles shuffle.
    pub fn set_shuffle(&self, shuffle: bool) -> Result<(), GraphError> {
        self.send(ManagerMsg::SetShuffle(shuffle))
    }

    /// The current observable state.
    pub fn status(&self) -> StatusSnapshot {
        self.status.lock().unwrap().clone()
    }

    /// Resolves when the playlist has been exhausted (not on user stop).
    pub fn end_of_list(&self) -> impl std::future::Future<Output = ()> {
        self.end_of_list.clone().map(|_| ())
    }

    /// Stops everything and joins the worker. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.send(ManagerMsg::Cmd(PlayerCommand::Quit));
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ManagerWorker {
    source: Box<dyn TrackSource>,
    builders: Vec<Arc<dyn GraphBuilder>>,
    graph: Option<GraphHandle>,
    /// Generation of the current graph; stale notifications are dropped.
    generation: u64,
    /// Length of the run handed to the current graph.
    run_len: usize,
    /// Service-side metadata for each track of the run.
    run_metadata: Vec<BTreeMap<String, String>>,
    /// Index (within the run) of the last track the graph started.
    last_started: usize,
    track_pcm: PcmFormat,
    loop_mode: LoopMode,
    status: Arc<Mutex<StatusSnapshot>>,
    signals: PlaybackSignals,
    rx: Receiver<ManagerMsg>,
    tx: Sender<ManagerMsg>,
    end_tx: Option<oneshot::Sender<()>>,
}

impl ManagerWorker {
    fn run(&mut self) {
        log::debug!("playback manager up");

        loop {
            match self.rx.recv_timeout(Duration::from_millis(300)) {
                Ok(ManagerMsg::Cmd(PlayerCommand::Quit)) => {
                    self.teardown_graph();
                    self.set_status(PlaybackStatus::Stopped);
                    break;
                }
                Ok(ManagerMsg::Cmd(cmd)) => self.handle_command(cmd),
                Ok(ManagerMsg::SetLoop(mode)) => {
                    self.loop_mode = mode;
                    self.status.lock().unwrap().loop_mode = mode;
                    if let Some(cb) = &self.signals.loop_status {
                        cb(mode);
                    }
                }
                Ok(ManagerMsg::SetShuffle(shuffle)) => {
                    self.source.set_shuffle(shuffle);
                    self.status.lock().unwrap().shuffle = self.source.shuffled();
                }
                Ok(ManagerMsg::Graph(generation, n)) => {
                    if generation == self.generation {
                        self.handle_notification(n);
                    } else {
                        log::trace!("dropping stale notification from graph {generation}");
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        log::debug!("playback manager down");
    }

    fn handle_command(&mut self, cmd: PlayerCommand) {
        log::debug!("command {cmd:?}");
        let status = self.status.lock().unwrap().status;

        match cmd {
            PlayerCommand::Play => match status {
                PlaybackStatus::Stopped => self.start_run(),
                PlaybackStatus::Paused => self.with_graph(|g| g.resume()),
                PlaybackStatus::Playing => {}
            },
            PlayerCommand::TogglePause => match status {
                PlaybackStatus::Playing => self.with_graph(|g| g.pause()),
                PlaybackStatus::Paused => self.with_graph(|g| g.resume()),
                PlaybackStatus::Stopped => self.start_run(),
            },
            PlayerCommand::Stop => self.with_graph(|g| g.stop()),
            PlayerCommand::Next => {
                if self.graph.is_some() {
                    self.with_graph(|g| g.skip(1));
                } else {
                    self.start_run();
                }
            }
            PlayerCommand::Previous => {
                if self.graph.is_some() {
                    self.with_graph(|g| g.skip(-1));
                } else {
                    self.start_run();
                }
            }
            PlayerCommand::Seek { offset_secs } => {
                self.with_graph(|g| g.submit(crate::graph::ControlEvent::Seek { offset_secs }));
            }
            PlayerCommand::Volume { step } => {
                if self.graph.is_some() {
                    self.with_graph(|g| g.volume(step));
                } else {
                    let mut st = self.status.lock().unwrap();
                    st.volume = (st.volume as i32 + step * 5).clamp(0, 100) as u32;
                    let volume = st.volume;
                    drop(st);
                    if let Some(cb) = &self.signals.volume {
                        cb(volume as f64 / 100.0);
                    }
                }
            }
            PlayerCommand::Mute => {
                if self.graph.is_some() {
                    self.with_graph(|g| g.mute());
                } else {
                    let mut st = self.status.lock().unwrap();
                    st.muted = !st.muted;
                }
            }
            PlayerCommand::Quit => unreachable!("handled by the loop"),
        }
    }

    fn with_graph(&mut self, f: impl FnOnce(&GraphHandle) -> Result<(), GraphError>) {
        let Some(graph) = &self.graph else {
            return;
        };

        if let Err(err) = f(graph) {
            log::warn!("graph command failed: {err}; tearing down");
            self.teardown_graph();
            self.set_status(PlaybackStatus::Stopped);
        }
    }

    /// Brings up a graph for the next run of playable tracks. Unplayable
    /// entries (dead links, unknown formats) are skipped with a recorded
    /// reason: playlist-level recovery.
    fn start_run(&mut self) {
        loop {
            if self.source.exhausted() {
                if self.loop_mode == LoopMode::Playlist && !self.source.is_empty() {
                    self.source.restart();
                    continue;
                }
                self.finish_playback();
                return;
            }

            let upcoming = self.source.upcoming();
            let first = &upcoming[0];

            let probed = match probe::probe_uri(&first.uri) {
                Ok(p) => p,
                Err(err) => {
                    log::warn!("skipping {}: {err}", first.uri);
                    self.record_error(format!("{}: {err}", first.uri));
                    self.source.advance(1);
                    continue;
                }
            };

            let Some(builder) = self
                .builders
                .iter()
                .find(|b| b.handles(probed.encoding))
                .cloned()
            else {
                log::warn!("no graph handles {:?} ({})", probed.encoding, first.uri);
                self.record_error(format!("{}: unsupported format", first.uri));
                self.source.advance(1);
                continue;
            };

            // The run: the maximal prefix of upcoming tracks this graph
            // can play.
            let mut uris = vec![first.uri.clone()];
            let mut metadata = vec![first.metadata.clone()];
            for track in &upcoming[1..] {
                match probe::probe_uri(&track.uri) {
                    Ok(p) if builder.handles(p.encoding) => {
                        uris.push(track.uri.clone());
                        metadata.push(track.metadata.clone());
                    }
                    _ => break,
                }
            }

            self.run_len = uris.len();
            self.run_metadata = metadata;
            self.last_started = 0;
            self.generation += 1;

            let sink = Arc::new(GraphToManager {
                generation: self.generation,
                tx: self.tx.clone(),
            });

            let config = GraphConfig {
                uris,
                start: 0,
                loop_list: false,
                loop_track: self.loop_mode == LoopMode::Track,
                volume: self.status.lock().unwrap().volume,
            };

            log::info!(
                "starting a {} run of {} track(s)",
                builder.name(),
                self.run_len
            );
            match GraphHandle::spawn(builder, sink) {
                Ok(graph) => {
                    if let Err(err) = graph.play(config) {
                        log::error!("graph refused to start: {err}");
                        graph.destroy();
                        self.source.advance(1);
                        continue;
                    }
                    self.graph = Some(graph);
                    return;
                }
                Err(err) => {
                    log::error!("spawning graph failed: {err}");
                    self.record_error(err.to_string());
                    self.source.advance(1);
                    continue;
                }
            }
        }
    }

    fn handle_notification(&mut self, n: GraphNotification) {
        match n {
            GraphNotification::StateChanged(state) => match state {
                GraphState::Executing => self.set_status(PlaybackStatus::Playing),
                GraphState::Paused => self.set_status(PlaybackStatus::Paused),
                GraphState::Stopped => {
                    self.teardown_graph();
                    self.set_status(PlaybackStatus::Stopped);
                }
                _ => {}
            },
            GraphNotification::TrackStarted {
                index,
                uri,
                metadata,
                pcm,
                duration,
            } => {
                self.last_started = index;
                self.track_pcm = pcm;

                let mut merged = self
                    .run_metadata
                    .get(index)
                    .cloned()
                    .unwrap_or_default();
                merged.extend(metadata);
                merged.insert("uri".into(), uri);

                {
                    let mut st = self.status.lock().unwrap();
                    st.metadata = merged.clone();
                    st.duration = duration;
                    st.position = Duration::ZERO;
                }
                self.refresh_caps();

                if let Some(cb) = &self.signals.metadata {
                    cb(&merged);
                }
            }
            GraphNotification::Progress { bytes } => {
                let rate = self.track_pcm.byte_rate().max(1);
                self.status.lock().unwrap().position =
                    Duration::from_secs_f64(bytes as f64 / rate as f64);
            }
            GraphNotification::EndOfPlay => {
                let consumed = self.run_len;
                self.teardown_graph();
                self.source.advance(consumed);
                self.start_run();
            }
            GraphNotification::Fatal { code, message } => {
                log::error!("graph failed: {code:?}: {message}");
                self.record_error(message);
                let consumed = self.last_started + 1;
                self.teardown_graph();
                self.source.advance(consumed);
                self.start_run();
            }
            GraphNotification::VolumeChanged(volume) => {
                self.status.lock().unwrap().volume = volume;
                if let Some(cb) = &self.signals.volume {
                    cb(volume as f64 / 100.0);
                }
            }
            GraphNotification::MuteChanged(muted) => {
                self.status.lock().unwrap().muted = muted;
            }
        }
    }

    fn teardown_graph(&mut self) {
        // The generation is NOT bumped here: a graph announces Stopped
        // before EndOfPlay, and the latter must still be honored after
        // the teardown the former triggers. Fresh generations are minted
        // when the next run starts.
        if let Some(graph) = self.graph.take() {
            graph.destroy();
        }
    }

    /// Playback has genuinely run out of material.
    fn finish_playback(&mut self) {
        log::info!("end of playlist");
        self.teardown_graph();
        self.set_status(PlaybackStatus::Stopped);
        if let Some(end) = self.end_tx.take() {
            let _ = end.send(());
        }
    }

    fn set_status(&mut self, status: PlaybackStatus) {
        {
            let mut st = self.status.lock().unwrap();
            if st.status == status {
                return;
            }
            st.status = status;
        }
        self.refresh_caps();

        if let Some(cb) = &self.signals.playback_status {
            cb(status);
        }
    }

    fn refresh_caps(&self) {
        let mut st = self.status.lock().unwrap();

        let mut caps = Capabilities::CAN_CONTROL;
        let playing = st.status != PlaybackStatus::Stopped;
        let more_in_run = playing && self.last_started + 1 < self.run_len;
        let more_in_source = !self.source.exhausted();

        if playing || more_in_source || self.loop_mode == LoopMode::Playlist {
            caps |= Capabilities::CAN_PLAY;
        }
        if playing {
            caps |= Capabilities::CAN_PAUSE;
        }
        if more_in_run || more_in_source || self.loop_mode != LoopMode::None {
            caps |= Capabilities::CAN_GO_NEXT;
        }

        st.caps = caps;
    }

    fn record_error(&self, message: String) {
        self.status.lock().unwrap().last_error = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use futures::executor::block_on;

    use crate::components::{MemorySink, PcmGraphBuilder, SampleSink};
    use crate::testutil;

    use super::*;

    fn builders_for(sink: MemorySink) -> Vec<Arc<dyn GraphBuilder>> {
        vec![Arc::new(PcmGraphBuilder::new(move || {
            Box::new(sink.clone())
        }))]
    }

    fn wait_until(what: &str, timeout: Duration, mut pred: impl FnMut() -> bool) {
        let deadline = Instant::now() + timeout;
        while !pred() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test_log::test]
    fn playlist_exhaustion_stops_and_idles() {
        let a = testutil::wav_file("exh-a", 44100, 2, 0.2);
        let b = testutil::wav_file("exh-b", 44100, 2, 0.2);
        let sink = MemorySink::new();

        let playlist = Playlist::from_uris([a.display().to_string(), b.display().to_string()]);
        let manager =
            PlaybackManager::new(Box::new(playlist), builders_for(sink.clone()), Default::default())
                .unwrap();

        manager.play().unwrap();
        block_on(manager.end_of_list());

        let status = manager.status();
        assert_eq!(status.status, PlaybackStatus::Stopped);
        assert!(!status.caps.contains(Capabilities::CAN_PAUSE));
        assert!(status.caps.contains(Capabilities::CAN_CONTROL));

        // Both tracks were rendered in order.
        let mut expected = testutil::wav_payload(44100, 2, 0.2);
        expected.extend(testutil::wav_payload(44100, 2, 0.2));
        // The default volume of 75 scales the samples; compare lengths.
        assert_eq!(sink.len(), expected.len());

        manager.shutdown();
        let _ = std::fs::remove_file(a);
        let _ = std::fs::remove_file(b);
    }

    /// A sink that accepts a byte budget, then would-blocks until the
    /// gate is opened.
    #[derive(Clone)]
    struct GatedSink {
        inner: MemorySink,
        budget: Arc<AtomicUsize>,
    }

    impl GatedSink {
        fn new(budget: usize) -> Self {
            Self {
                inner: MemorySink::new(),
                budget: Arc::new(AtomicUsize::new(budget)),
            }
        }

        fn open(&self) {
            self.budget.store(usize::MAX, Ordering::SeqCst);
        }
    }

    impl SampleSink for GatedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let budget = self.budget.load(Ordering::SeqCst);
            if budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let n = buf.len().min(budget);
            if budget != usize::MAX {
                self.budget.fetch_sub(n, Ordering::SeqCst);
            }
            self.inner.write(&buf[..n])
        }
    }

    #[test_log::test]
    fn skip_while_paused_advances_to_the_next_track() {
        let a = testutil::wav_file("pause-a", 44100, 2, 1.0);
        let b = testutil::wav_file("pause-b", 44100, 2, 0.2);

        // Let a little of track one render, then hold the sink so the
        // pipeline is genuinely mid-track when the pause arrives.
        let sink = GatedSink::new(16 * 1024);
        let sink_for_builder = sink.clone();
        let builders: Vec<Arc<dyn GraphBuilder>> = vec![Arc::new(PcmGraphBuilder::new(
            move || Box::new(sink_for_builder.clone()),
        ))];

        let playlist = Playlist::from_uris([a.display().to_string(), b.display().to_string()]);
        let manager =
            PlaybackManager::new(Box::new(playlist), builders, Default::default()).unwrap();

        manager.play().unwrap();
        wait_until("playing", Duration::from_secs(5), || {
            manager.status().status == PlaybackStatus::Playing
        });

        manager.toggle_pause().unwrap();
        wait_until("paused", Duration::from_secs(5), || {
            manager.status().status == PlaybackStatus::Paused
        });

        // Skip while paused: resume, drain, advance, re-detect, play.
        manager.next().unwrap();
        wait_until("track two", Duration::from_secs(5), || {
            let st = manager.status();
            st.status == PlaybackStatus::Playing
                && st
                    .metadata
                    .get("uri")
                    .is_some_and(|u| u.contains("pause-b"))
        });

        // Unblock the sink and let the second track run out.
        sink.open();
        block_on(manager.end_of_list());
        assert_eq!(manager.status().status, PlaybackStatus::Stopped);

        manager.shutdown();
        let _ = std::fs::remove_file(a);
        let _ = std::fs::remove_file(b);
    }

    #[test_log::test]
    fn corrupt_stream_recovers_at_the_playlist_level() {
        // Track one probes fine but goes bad mid-stream: a valid WAV
        // segment followed by garbage where the next header should be.
        let mut broken = testutil::wav_bytes(44100, 2, 0.2);
        broken.extend_from_slice(&[0xA5; 4096]);
        let a = testutil::byte_file("broken", &broken);
        let b = testutil::wav_file("good", 44100, 2, 0.2);

        let sink = MemorySink::new();
        let playlist = Playlist::from_uris([a.display().to_string(), b.display().to_string()]);
        let manager =
            PlaybackManager::new(Box::new(playlist), builders_for(sink.clone()), Default::default())
                .unwrap();

        // Full volume, so rendered bytes compare equal to the source PCM.
        manager.volume(5).unwrap();
        wait_until("full volume", Duration::from_secs(2), || {
            manager.status().volume == 100
        });

        manager.play().unwrap();
        block_on(manager.end_of_list());

        let status = manager.status();
        assert_eq!(status.status, PlaybackStatus::Stopped);
        assert!(status.last_error.is_some(), "the failure was recorded");

        // The good track played to completion after the recovery.
        let expected = testutil::wav_payload(44100, 2, 0.2);
        let got = sink.data();
        assert!(got.len() >= expected.len());
        assert_eq!(&got[got.len() - expected.len()..], expected.as_slice());

        manager.shutdown();
        let _ = std::fs::remove_file(a);
        let _ = std::fs::remove_file(b);
    }

    #[test]
    fn volume_and_loop_surface_updates_while_stopped() {
        let playlist = Playlist::from_uris(Vec::<String>::new());
        let manager = PlaybackManager::new(
            Box::new(playlist),
            builders_for(MemorySink::new()),
            Default::default(),
        )
        .unwrap();

        manager.volume(2).unwrap();
        manager.set_loop(LoopMode::Playlist).unwrap();
        wait_until("volume applied", Duration::from_secs(2), || {
            manager.status().volume == 85
        });
        assert_eq!(manager.status().loop_mode, LoopMode::Playlist);

        manager.shutdown();
    }
}
