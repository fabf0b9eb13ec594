//! Graph ops: the composite verbs the FSM's actions call, and the
//! pollable completion slots its guards read.
//!
//! Each verb may touch several components, but it is atomic from the
//! FSM's point of view: it either succeeds (and the FSM will later see
//! the "last component reported complete" event) or records an error for
//! the fatal path. The completion slots (`trans_complete`,
//! `port_op_complete`, `is_end_of_play`, ...) are consumed by the guard
//! functions in the transition table.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::il::{
    connect_tunnel, disconnect_tunnel, Command, ComponentHandle, ComponentId, ConfigId,
    ConfigValue, Encoding, ErrorCode, EventSink, IlError, IlState, ParamId, Parameter,
    PortIndex, PortSelector,
};

use super::config::GraphConfig;
use super::events::{GraphNotification, NotifySink};
use super::probe::{self, ProbeResult};
use super::reactor::ReactorHandle;
use super::GraphBuilder;

/// How long a guard may stay false before the FSM gives up.
pub(crate) const GUARD_DEADLINE: Duration = Duration::from_secs(5);

/// How long the sink may fail to make progress while Executing before the
/// graph is declared stalled.
pub(crate) const STALL_DEADLINE: Duration = Duration::from_secs(5);

/// Volume points moved per volume step.
const VOLUME_STEP: i32 = 5;

/// One tunnel between adjacent components, by index into the component
/// list.
#[derive(Debug, Copy, Clone)]
pub(crate) struct TunnelLink {
    pub(crate) upstream: usize,
    pub(crate) out_port: PortIndex,
    pub(crate) downstream: usize,
    pub(crate) in_port: PortIndex,
}

pub(crate) struct GraphOps {
    builder: Arc<dyn GraphBuilder>,
    events: Arc<dyn EventSink>,
    notify: Arc<dyn NotifySink>,
    reactor: ReactorHandle,

    config: Option<GraphConfig>,
    position: usize,
    components: Vec<ComponentHandle>,
    tunnels: Vec<TunnelLink>,
    probe: Option<ProbeResult>,

    expected_transitions: HashSet<ComponentId>,
    expected_state: Option<IlState>,
    expected_port_ops: HashSet<(ComponentId, PortIndex)>,

    last_error: Option<(ErrorCode, String)>,
    jump: i64,
    deferred_jump: i64,
    end_of_play: bool,
    reconfiguring: Option<usize>,
    track_started_pending: bool,

    /// When the FSM entered its current state. Maintained by the runner.
    pub(crate) state_entered: Instant,
    last_progress: (Instant, u64),
}

impl GraphOps {
    pub(crate) fn new(
        builder: Arc<dyn GraphBuilder>,
        events: Arc<dyn EventSink>,
        notify: Arc<dyn NotifySink>,
        reactor: ReactorHandle,
    ) -> Self {
        Self {
            builder,
            events,
            notify,
            reactor,
            config: None,
            position: 0,
            components: Vec::new(),
            tunnels: Vec::new(),
            probe: None,
            expected_transitions: HashSet::new(),
            expected_state: None,
            expected_port_ops: HashSet::new(),
            last_error: None,
            jump: 0,
            deferred_jump: 0,
            end_of_play: false,
            reconfiguring: None,
            track_started_pending: false,
            state_entered: Instant::now(),
            last_progress: (Instant::now(), 0),
        }
    }

    pub(crate) fn notify(&self, n: GraphNotification) {
        self.notify.notify(n);
    }

    // ---- completion slots ----

    /// Records a verb failure for the fatal path. The first error wins.
    pub(crate) fn record_error(&mut self, err: IlError) {
        log::error!("graph op failed: {err}");
        self.record_fatal_code(err.code(), err.to_string());
    }

    /// Records a fatal error reported by a component.
    pub(crate) fn record_fatal_code(&mut self, code: ErrorCode, message: String) {
        if self.last_error.is_none() {
            self.last_error = Some((code, message));
        }
    }

    pub(crate) fn last_op_succeeded(&self) -> bool {
        self.last_error.is_none()
    }

    pub(crate) fn take_fatal(&mut self) -> (ErrorCode, String) {
        self.last_error
            .take()
            .unwrap_or((ErrorCode::Undefined, "unspecified failure".into()))
    }

    /// Consumes one expected state-transition completion. True when it was
    /// the last outstanding one.
    pub(crate) fn trans_complete(&mut self, component: ComponentId, state: IlState) -> bool {
        if self.expected_state != Some(state) {
            return false;
        }

        self.expected_transitions.remove(&component);
        let done = self.expected_transitions.is_empty();
        log::trace!("trans_complete {component} -> {state:?}: all done [{done}]");
        if done {
            self.expected_state = None;
        }
        done
    }

    /// Consumes one expected port enable/disable completion. True when it
    /// was the last outstanding one.
    pub(crate) fn port_op_complete(&mut self, component: ComponentId, port: PortIndex) -> bool {
        self.expected_port_ops.remove(&(component, port));
        let done = self.expected_port_ops.is_empty();
        log::trace!("port_op_complete {component}:{port}: all done [{done}]");
        done
    }

    pub(crate) fn has_outstanding(&self) -> bool {
        !self.expected_transitions.is_empty() || !self.expected_port_ops.is_empty()
    }

    pub(crate) fn is_end_of_play(&self) -> bool {
        self.end_of_play
    }

    pub(crate) fn is_last_component(&self, component: ComponentId) -> bool {
        self.components
            .last()
            .map(|c| c.id() == component)
            .unwrap_or(false)
    }

    pub(crate) fn is_source(&self, component: ComponentId) -> bool {
        self.components
            .first()
            .map(|c| c.id() == component)
            .unwrap_or(false)
    }

    pub(crate) fn take_track_started(&mut self) -> bool {
        std::mem::take(&mut self.track_started_pending)
    }

    // ---- configuration ----

    pub(crate) fn do_store_config(&mut self, config: GraphConfig) {
        self.position = config.start.min(config.uris.len().saturating_sub(1));
        self.config = Some(config);
        self.end_of_play = false;
    }

    pub(crate) fn do_store_skip(&mut self, jump: i64) {
        self.jump = jump;
    }

    pub(crate) fn defer_skip(&mut self, jump: i64) {
        log::debug!("deferring skip of {jump} until the probe completes");
        self.deferred_jump += jump;
    }

    pub(crate) fn take_deferred_skip(&mut self) -> i64 {
        std::mem::take(&mut self.deferred_jump)
    }

    pub(crate) fn current_uri(&self) -> Result<&str, IlError> {
        let config = self.config.as_ref().ok_or(IlError::EndOfList)?;
        config
            .uris
            .get(self.position)
            .map(String::as_str)
            .ok_or(IlError::EndOfList)
    }

    pub(crate) fn current_index(&self) -> usize {
        self.position
    }

    pub(crate) fn loop_track(&self) -> bool {
        self.config.as_ref().map(|c| c.loop_track).unwrap_or(false)
    }

    /// Advances the URI cursor by the stored jump. Falling off the end
    /// (without list looping) raises the end-of-play flag.
    pub(crate) fn do_skip(&mut self) {
        let Some(config) = self.config.as_ref() else {
            self.end_of_play = true;
            return;
        };

        let len = config.uris.len() as i64;
        let next = self.position as i64 + self.jump;
        self.jump = 0;

        if next < 0 {
            // Backing up past the start replays the first entry.
            self.position = 0;
        } else if next >= len {
            if config.loop_list && len > 0 {
                self.position = (next % len) as usize;
            } else {
                log::info!("uri list exhausted");
                self.end_of_play = true;
            }
        } else {
            self.position = next as usize;
        }
    }

    // ---- load / configure / tunnel verbs ----

    pub(crate) fn do_load_source(&mut self) -> Result<(), IlError> {
        if self.components.is_empty() {
            let source = self
                .builder
                .build_source(ComponentId(0), self.events.clone())?;
            log::info!("loaded source {:?}", source);
            self.components.push(source);
        }
        Ok(())
    }

    pub(crate) fn do_configure_source(&mut self) -> Result<(), IlError> {
        let uri = self.current_uri()?.to_string();
        let source = &self.components[0];

        source.set_parameter(Parameter::ContentUri(uri))?;

        // The output port sniffs the stream and publishes what it finds.
        let Parameter::PortDefinition(_, mut def) =
            source.get_parameter(ParamId::PortDefinition(PortIndex(0)))?
        else {
            unreachable!()
        };
        def.encoding = Encoding::Autodetect;
        source.set_parameter(Parameter::PortDefinition(PortIndex(0), def))?;
        Ok(())
    }

    /// Starts auto-detection: the source runs with its output port
    /// disabled until a format is published.
    pub(crate) fn do_enable_auto_detection(&mut self) -> Result<(), IlError> {
        let source = &self.components[0];
        source.send_command(Command::PortDisable(PortSelector::One(PortIndex(0))))?;
        self.transition(&[0], IlState::Idle)
    }

    pub(crate) fn do_probe(&mut self) -> Result<(), IlError> {
        let uri = self.current_uri()?.to_string();
        let result = probe::probe_uri(&uri)?;
        log::info!(
            "probed {uri}: {:?} {}Hz x{}ch",
            result.encoding,
            result.pcm.sample_rate,
            result.pcm.channels
        );
        self.probe = Some(result);
        Ok(())
    }

    pub(crate) fn do_load_rest(&mut self) -> Result<(), IlError> {
        if self.components.len() > 1 {
            return Ok(());
        }

        let probe = self
            .probe
            .as_ref()
            .ok_or_else(|| IlError::StreamCorrupt("configure before probe".into()))?;
        let rest = self
            .builder
            .build_rest(probe, 1, self.events.clone(), &self.reactor)?;
        self.components.extend(rest);
        Ok(())
    }

    pub(crate) fn do_configure(&mut self) -> Result<(), IlError> {
        let probe = self
            .probe
            .as_ref()
            .ok_or_else(|| IlError::StreamCorrupt("configure before probe".into()))?;

        self.builder.configure(&self.components, probe)?;

        if let Some(config) = &self.config {
            if let Some(sink) = self.components.last() {
                sink.set_config(ConfigValue::Volume(config.volume))?;
            }
        }

        self.track_started_pending = true;
        Ok(())
    }

    /// Tunnels every adjacent pair. Idempotent across tracks.
    pub(crate) fn do_setup_tunnels(&mut self) -> Result<(), IlError> {
        if !self.tunnels.is_empty() {
            return Ok(());
        }

        for i in 0..self.components.len() - 1 {
            let out_port = if i == 0 { PortIndex(0) } else { PortIndex(1) };
            let in_port = PortIndex(0);
            connect_tunnel(
                &self.components[i],
                out_port,
                &self.components[i + 1],
                in_port,
            )?;
            self.tunnels.push(TunnelLink {
                upstream: i,
                out_port,
                downstream: i + 1,
                in_port,
            });
        }

        Ok(())
    }

    // ---- state ladder verbs ----

    /// Issues a state transition to the given component indices and
    /// records the expected completions. Components already at the target
    /// are skipped.
    fn transition(&mut self, indices: &[usize], target: IlState) -> Result<(), IlError> {
        self.expected_transitions.clear();
        self.expected_state = Some(target);

        for &i in indices {
            let c = &self.components[i];
            if c.state() == target {
                continue;
            }

            c.send_command(Command::StateSet(target))?;
            self.expected_transitions.insert(c.id());
        }

        Ok(())
    }

    /// Whether the last `transition` call had anything left to do.
    pub(crate) fn transition_was_trivial(&self) -> bool {
        self.expected_transitions.is_empty()
    }

    fn all_indices(&self) -> Vec<usize> {
        (0..self.components.len()).collect()
    }

    fn rest_indices(&self) -> Vec<usize> {
        (1..self.components.len()).collect()
    }

    /// Brings everything downstream of the source to Idle, consumers
    /// first so they are ready before their producers. The source runs
    /// its own ladder during auto-detection.
    pub(crate) fn do_omx_loaded2idle(&mut self) -> Result<(), IlError> {
        let mut idx = self.rest_indices();
        idx.reverse();
        self.transition(&idx, IlState::Idle)
    }

    /// Brings everything downstream of the source to Executing.
    pub(crate) fn do_omx_idle2exe(&mut self) -> Result<(), IlError> {
        let mut idx = self.rest_indices();
        idx.reverse();
        self.transition(&idx, IlState::Executing)
    }

    pub(crate) fn do_source_omx_idle2exe(&mut self) -> Result<(), IlError> {
        self.transition(&[0], IlState::Executing)
    }

    pub(crate) fn do_omx_exe2pause(&mut self) -> Result<(), IlError> {
        self.transition(&self.all_indices(), IlState::Paused)
    }

    pub(crate) fn do_omx_pause2exe(&mut self) -> Result<(), IlError> {
        self.transition(&self.all_indices(), IlState::Executing)
    }

    /// Source first on the way down, draining toward the sink.
    pub(crate) fn do_omx_exe2idle(&mut self) -> Result<(), IlError> {
        self.transition(&self.all_indices(), IlState::Idle)
    }

    pub(crate) fn do_omx_idle2loaded(&mut self) -> Result<(), IlError> {
        self.transition(&self.all_indices(), IlState::Loaded)
    }

    /// Cancels in-flight data by flushing every port of every component.
    /// Completions are not tracked: the flushes are ordered before the
    /// descent commands in each mailbox, so the descent completion
    /// subsumes them.
    pub(crate) fn do_flush_graph(&mut self) {
        for c in &self.components {
            let _ = c.send_command(Command::Flush(PortSelector::All));
        }
    }

    /// Whether every component currently sits in `state` with nothing
    /// outstanding.
    pub(crate) fn all_components_at(&self, state: IlState) -> bool {
        self.components.iter().all(|c| c.state() == state)
    }

    pub(crate) fn any_component_at_or_above(&self, state: IlState) -> bool {
        let rank = |s: IlState| match s {
            IlState::Loaded | IlState::WaitForResources => 0,
            IlState::Idle => 1,
            IlState::Executing | IlState::Paused => 2,
        };
        self.components.iter().any(|c| rank(c.state()) >= rank(state))
    }

    // ---- tunnel cycling (port-settings-changed) ----

    /// Records which tunnel a PortSettingsChanged event names.
    pub(crate) fn note_settings_changed(
        &mut self,
        component: ComponentId,
        port: PortIndex,
    ) -> Option<usize> {
        let idx = self.tunnels.iter().position(|t| {
            self.components[t.upstream].id() == component && t.out_port == port
        })?;
        self.reconfiguring = Some(idx);
        Some(idx)
    }

    pub(crate) fn do_disable_tunnel(&mut self, idx: usize) -> Result<(), IlError> {
        let t = self.tunnels[idx];
        self.expected_port_ops.clear();

        let up = &self.components[t.upstream];
        up.send_command(Command::PortDisable(PortSelector::One(t.out_port)))?;
        self.expected_port_ops.insert((up.id(), t.out_port));

        let down = &self.components[t.downstream];
        down.send_command(Command::PortDisable(PortSelector::One(t.in_port)))?;
        self.expected_port_ops.insert((down.id(), t.in_port));
        Ok(())
    }

    pub(crate) fn do_enable_tunnel(&mut self, idx: usize) -> Result<(), IlError> {
        let t = self.tunnels[idx];
        self.expected_port_ops.clear();

        // Non-supplier end first, so the supplier's redistribution finds
        // it ready.
        let up = &self.components[t.upstream];
        up.send_command(Command::PortEnable(PortSelector::One(t.out_port)))?;
        self.expected_port_ops.insert((up.id(), t.out_port));

        let down = &self.components[t.downstream];
        down.send_command(Command::PortEnable(PortSelector::One(t.in_port)))?;
        self.expected_port_ops.insert((down.id(), t.in_port));
        Ok(())
    }

    pub(crate) fn reconfiguring_tunnel(&self) -> Option<usize> {
        self.reconfiguring
    }

    pub(crate) fn clear_reconfiguring(&mut self) {
        self.reconfiguring = None;
    }

    /// Copies the upstream port's re-detected format across the disabled
    /// tunnel.
    pub(crate) fn do_reconfigure_tunnel(&mut self) -> Result<(), IlError> {
        let idx = self
            .reconfiguring
            .ok_or_else(|| IlError::BadParameter("no tunnel is reconfiguring".into()))?;
        let t = self.tunnels[idx];

        let Parameter::Pcm(_, pcm) =
            self.components[t.upstream].get_parameter(ParamId::Pcm(t.out_port))?
        else {
            unreachable!()
        };

        log::info!(
            "reconfiguring tunnel {idx}: {}Hz x{}ch @{}bit",
            pcm.sample_rate,
            pcm.channels,
            pcm.bits_per_sample
        );
        self.components[t.downstream].set_parameter(Parameter::Pcm(t.in_port, pcm))?;

        if let Some(probe) = self.probe.as_mut() {
            probe.pcm = pcm;
        }
        Ok(())
    }

    /// The index of the source's tunnel, enabled last during bring-up.
    pub(crate) fn source_tunnel(&self) -> usize {
        0
    }

    // ---- rendering config verbs ----

    pub(crate) fn do_volume(&mut self, step: i32) -> Result<(), IlError> {
        let Some(sink) = self.components.last() else {
            return Ok(());
        };

        let ConfigValue::Volume(current) = sink.get_config(ConfigId::Volume)? else {
            unreachable!()
        };

        let new = (current as i32 + step * VOLUME_STEP).clamp(0, 100) as u32;
        if new != current {
            sink.set_config(ConfigValue::Volume(new))?;
            if let Some(config) = self.config.as_mut() {
                config.volume = new;
            }
        }
        self.notify(GraphNotification::VolumeChanged(new));
        Ok(())
    }

    pub(crate) fn do_mute(&mut self) -> Result<(), IlError> {
        let Some(sink) = self.components.last() else {
            return Ok(());
        };

        let ConfigValue::Mute(muted) = sink.get_config(ConfigId::Mute)? else {
            unreachable!()
        };

        sink.set_config(ConfigValue::Mute(!muted))?;
        self.notify(GraphNotification::MuteChanged(!muted));
        Ok(())
    }

    // ---- progress / stall tracking ----

    pub(crate) fn sink_position(&self) -> u64 {
        let Some(sink) = self.components.last() else {
            return 0;
        };

        match sink.get_config(ConfigId::Position) {
            Ok(ConfigValue::Position(bytes)) => bytes,
            _ => 0,
        }
    }

    /// Samples sink progress. Returns true when nothing has moved for
    /// longer than the stall deadline.
    pub(crate) fn check_stalled(&mut self, now: Instant) -> bool {
        let bytes = self.sink_position();
        if bytes != self.last_progress.1 {
            self.last_progress = (now, bytes);
            return false;
        }

        now.duration_since(self.last_progress.0) > STALL_DEADLINE
    }

    pub(crate) fn reset_progress(&mut self) {
        self.last_progress = (Instant::now(), self.sink_position());
    }

    pub(crate) fn probe_result(&self) -> Option<&ProbeResult> {
        self.probe.as_ref()
    }

    // ---- teardown ----

    pub(crate) fn do_tear_down_tunnels(&mut self) {
        for t in std::mem::take(&mut self.tunnels) {
            if let Err(err) = disconnect_tunnel(
                &self.components[t.upstream],
                t.out_port,
                &self.components[t.downstream],
                t.in_port,
            ) {
                log::warn!("tunnel teardown failed cleanly ({err}); forcing");
                self.components[t.upstream].force_clear_tunnels();
                self.components[t.downstream].force_clear_tunnels();
            }
        }
    }

    pub(crate) fn do_destroy_graph(&mut self) {
        for c in &self.components {
            c.force_clear_tunnels();
        }
        for c in &self.components {
            log::debug!("destroying {:?}", c);
            c.shutdown();
        }

        self.components.clear();
        self.tunnels.clear();
        self.expected_transitions.clear();
        self.expected_port_ops.clear();
    }
}
