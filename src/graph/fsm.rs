//! The graph FSM: a state machine over the pipeline's macro-phases.
//!
//! Transitions live in one table keyed by (state, event kind); each row
//! carries a guard and an action. `process_event` finds the first row
//! whose guard holds, runs its action, and moves. Entry actions run in
//! `enter`, which may chain straight into another state when a phase
//! turns out to be trivial (e.g. stopping an already-idle pipeline).
//!
//! Two rules sit outside the table: a fatal component error always wins
//! over whatever the FSM is doing, and ticks bound the liveness of every
//! guard.

use std::time::Instant;

use crate::il::{IlError, IlState};

use super::events::{ControlEvent, EventKind, FsmEvent, GraphNotification};
use super::ops::{GraphOps, GUARD_DEADLINE};

/// The top-level states of a graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GraphState {
    /// Just constructed; nothing loaded.
    Inited,
    /// Source instantiated and configured; format unknown.
    Loaded,
    /// Source running with its output disabled, sniffing the stream.
    AutoDetecting,
    /// Format known; wiring and bringing up the rest of the pipeline.
    Configuring,
    /// Steady state: buffers flowing.
    Executing,
    /// One tunnel is cycling through a mid-stream format change.
    Reconfiguring,
    /// Tearing the pipeline down to Loaded to jump within the URI list.
    Skipping,
    /// Waiting for the pipeline to acknowledge a pause.
    Pausing,
    /// Suspended.
    Paused,
    /// Waiting for the pipeline to acknowledge a resume.
    Resuming,
    /// Draining and descending the state ladder for good.
    Stopping,
    /// Torn down. Terminal unless a fresh graph is built.
    Stopped,
    /// A fatal error was recorded and the pipeline destroyed.
    Fault,
}

type Guard = fn(&mut GraphOps, &FsmEvent) -> bool;
type Action = fn(&mut GraphOps, &FsmEvent) -> Result<(), IlError>;

struct Transition {
    from: GraphState,
    on: EventKind,
    guard: Guard,
    action: Action,
    to: Option<GraphState>,
}

// ---- guards ----

fn g_always(_ops: &mut GraphOps, _evt: &FsmEvent) -> bool {
    true
}

fn g_trans_complete(ops: &mut GraphOps, evt: &FsmEvent, want: IlState) -> bool {
    match evt {
        FsmEvent::TransComplete { component, state } if *state == want => {
            ops.trans_complete(*component, want)
        }
        _ => false,
    }
}

fn g_trans_idle(ops: &mut GraphOps, evt: &FsmEvent) -> bool {
    g_trans_complete(ops, evt, IlState::Idle)
}

fn g_trans_exe(ops: &mut GraphOps, evt: &FsmEvent) -> bool {
    g_trans_complete(ops, evt, IlState::Executing)
}

fn g_trans_paused(ops: &mut GraphOps, evt: &FsmEvent) -> bool {
    g_trans_complete(ops, evt, IlState::Paused)
}

fn g_trans_loaded(ops: &mut GraphOps, evt: &FsmEvent) -> bool {
    g_trans_complete(ops, evt, IlState::Loaded)
}

fn g_port_ops_done(ops: &mut GraphOps, evt: &FsmEvent) -> bool {
    match evt {
        FsmEvent::PortDisabled { component, port }
        | FsmEvent::PortEnabled { component, port } => ops.port_op_complete(*component, *port),
        _ => false,
    }
}

fn g_settings_from_source(ops: &mut GraphOps, evt: &FsmEvent) -> bool {
    matches!(evt, FsmEvent::PortSettings { component, .. } if ops.is_source(*component))
}

fn g_settings_on_tunnel(ops: &mut GraphOps, evt: &FsmEvent) -> bool {
    match evt {
        FsmEvent::PortSettings { component, port, .. } => {
            ops.note_settings_changed(*component, *port).is_some()
        }
        _ => false,
    }
}

fn g_last_eos(ops: &mut GraphOps, evt: &FsmEvent) -> bool {
    matches!(evt, FsmEvent::Eos { component, .. } if ops.is_last_component(*component))
}

/// A transient phase has waited longer than the guard deadline with
/// completions still outstanding.
fn g_deadline_expired(ops: &mut GraphOps, _evt: &FsmEvent) -> bool {
    ops.has_outstanding() && ops.state_entered.elapsed() > GUARD_DEADLINE
}

fn g_stalled(ops: &mut GraphOps, _evt: &FsmEvent) -> bool {
    ops.check_stalled(Instant::now())
}

// ---- actions ----

fn a_none(_ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    Ok(())
}

fn a_load(ops: &mut GraphOps, evt: &FsmEvent) -> Result<(), IlError> {
    let FsmEvent::Control(ControlEvent::Load(config)) = evt else {
        unreachable!()
    };

    ops.do_store_config(config.clone());
    ops.do_load_source()?;
    ops.do_configure_source()
}

fn a_source_idle2exe(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    ops.do_source_omx_idle2exe()
}

fn a_probe(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    ops.do_probe()
}

fn a_idle2exe_rest(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    ops.do_omx_idle2exe()
}

fn a_enable_source_tunnel(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    let idx = ops.source_tunnel();
    ops.do_enable_tunnel(idx)
}

fn a_defer_skip(ops: &mut GraphOps, evt: &FsmEvent) -> Result<(), IlError> {
    if let FsmEvent::Control(ControlEvent::Skip { jump }) = evt {
        ops.defer_skip(*jump);
    }
    Ok(())
}

fn a_store_skip(ops: &mut GraphOps, evt: &FsmEvent) -> Result<(), IlError> {
    if let FsmEvent::Control(ControlEvent::Skip { jump }) = evt {
        ops.do_store_skip(*jump);
    }
    Ok(())
}

fn a_add_skip(ops: &mut GraphOps, evt: &FsmEvent) -> Result<(), IlError> {
    if let FsmEvent::Control(ControlEvent::Skip { jump }) = evt {
        ops.defer_skip(*jump);
    }
    Ok(())
}

fn a_store_eos_advance(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    // A finished track advances by one, or replays under track looping.
    let jump = if ops.loop_track() { 0 } else { 1 };
    ops.do_store_skip(jump);
    Ok(())
}

fn a_seek_unsupported(ops: &mut GraphOps, evt: &FsmEvent) -> Result<(), IlError> {
    if let FsmEvent::Control(ControlEvent::Seek { offset_secs }) = evt {
        log::warn!("seek to {offset_secs}s requested, but seeking is not supported");
    }
    ops.notify(GraphNotification::Progress {
        bytes: ops.sink_position(),
    });
    Ok(())
}

fn a_volume(ops: &mut GraphOps, evt: &FsmEvent) -> Result<(), IlError> {
    if let FsmEvent::Control(ControlEvent::Volume { step }) = evt {
        ops.do_volume(*step)?;
    }
    Ok(())
}

fn a_mute(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    ops.do_mute()
}

fn a_reconfigure_and_enable(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    ops.do_reconfigure_tunnel()?;
    let idx = ops
        .reconfiguring_tunnel()
        .expect("reconfiguration in progress");
    ops.do_enable_tunnel(idx)
}

fn a_clear_reconfiguring(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    ops.clear_reconfiguring();
    Ok(())
}

fn a_flush_and_exe2idle(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    ops.do_flush_graph();
    ops.do_omx_exe2idle()
}

fn a_idle2loaded(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    ops.do_omx_idle2loaded()
}

fn a_do_skip(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    ops.do_skip();
    Ok(())
}

fn a_timeout(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    ops.record_error(IlError::Timeout(format!(
        "guard unsatisfied after {GUARD_DEADLINE:?}"
    )));
    Ok(())
}

fn a_progress(ops: &mut GraphOps, _evt: &FsmEvent) -> Result<(), IlError> {
    ops.notify(GraphNotification::Progress {
        bytes: ops.sink_position(),
    });
    Ok(())
}

/// The transition table. Rows are matched top to bottom within a state;
/// the first row whose guard holds wins.
const TRANSITIONS: &[Transition] = &[
    // -- Inited --
    t(GraphState::Inited, EventKind::Load, g_always, a_load, Some(GraphState::Loaded)),
    t(GraphState::Inited, EventKind::Destroy, g_always, a_none, Some(GraphState::Stopped)),
    // -- Loaded --
    t(GraphState::Loaded, EventKind::Execute, g_always, a_none, Some(GraphState::AutoDetecting)),
    t(GraphState::Loaded, EventKind::Destroy, g_always, a_none, Some(GraphState::Stopped)),
    // -- AutoDetecting --
    t(GraphState::AutoDetecting, EventKind::TransComplete, g_trans_idle, a_source_idle2exe, None),
    t(GraphState::AutoDetecting, EventKind::TransComplete, g_trans_exe, a_none, None),
    t(GraphState::AutoDetecting, EventKind::PortSettings, g_settings_from_source, a_probe, Some(GraphState::Configuring)),
    t(GraphState::AutoDetecting, EventKind::Skip, g_always, a_defer_skip, None),
    t(GraphState::AutoDetecting, EventKind::Stop, g_always, a_none, Some(GraphState::Stopping)),
    t(GraphState::AutoDetecting, EventKind::Destroy, g_always, a_none, Some(GraphState::Stopped)),
    t(GraphState::AutoDetecting, EventKind::Tick, g_deadline_expired, a_timeout, Some(GraphState::Fault)),
    // -- Configuring --
    t(GraphState::Configuring, EventKind::TransComplete, g_trans_idle, a_idle2exe_rest, None),
    t(GraphState::Configuring, EventKind::TransComplete, g_trans_exe, a_enable_source_tunnel, None),
    t(GraphState::Configuring, EventKind::PortEnabled, g_port_ops_done, a_none, Some(GraphState::Executing)),
    t(GraphState::Configuring, EventKind::Skip, g_always, a_defer_skip, None),
    t(GraphState::Configuring, EventKind::Stop, g_always, a_none, Some(GraphState::Stopping)),
    t(GraphState::Configuring, EventKind::Destroy, g_always, a_none, Some(GraphState::Stopped)),
    t(GraphState::Configuring, EventKind::Tick, g_deadline_expired, a_timeout, Some(GraphState::Fault)),
    // -- Executing --
    t(GraphState::Executing, EventKind::Pause, g_always, a_none, Some(GraphState::Pausing)),
    t(GraphState::Executing, EventKind::Stop, g_always, a_none, Some(GraphState::Stopping)),
    t(GraphState::Executing, EventKind::Skip, g_always, a_store_skip, Some(GraphState::Skipping)),
    t(GraphState::Executing, EventKind::Seek, g_always, a_seek_unsupported, None),
    t(GraphState::Executing, EventKind::Volume, g_always, a_volume, None),
    t(GraphState::Executing, EventKind::Mute, g_always, a_mute, None),
    t(GraphState::Executing, EventKind::Eos, g_last_eos, a_store_eos_advance, Some(GraphState::Skipping)),
    t(GraphState::Executing, EventKind::PortSettings, g_settings_on_tunnel, a_none, Some(GraphState::Reconfiguring)),
    t(GraphState::Executing, EventKind::Tick, g_stalled, a_timeout, Some(GraphState::Fault)),
    t(GraphState::Executing, EventKind::Tick, g_always, a_progress, None),
    t(GraphState::Executing, EventKind::Destroy, g_always, a_none, Some(GraphState::Stopped)),
    // -- Reconfiguring --
    t(GraphState::Reconfiguring, EventKind::PortDisabled, g_port_ops_done, a_reconfigure_and_enable, None),
    t(GraphState::Reconfiguring, EventKind::PortEnabled, g_port_ops_done, a_clear_reconfiguring, Some(GraphState::Executing)),
    t(GraphState::Reconfiguring, EventKind::Tick, g_deadline_expired, a_timeout, Some(GraphState::Fault)),
    t(GraphState::Reconfiguring, EventKind::Destroy, g_always, a_none, Some(GraphState::Stopped)),
    // -- Skipping --
    t(GraphState::Skipping, EventKind::TransComplete, g_trans_exe, a_flush_and_exe2idle, None),
    t(GraphState::Skipping, EventKind::TransComplete, g_trans_idle, a_idle2loaded, None),
    t(GraphState::Skipping, EventKind::TransComplete, g_trans_loaded, a_do_skip, Some(GraphState::Skipping)),
    t(GraphState::Skipping, EventKind::Skip, g_always, a_add_skip, None),
    t(GraphState::Skipping, EventKind::Tick, g_deadline_expired, a_timeout, Some(GraphState::Fault)),
    t(GraphState::Skipping, EventKind::Destroy, g_always, a_none, Some(GraphState::Stopped)),
    // -- Pausing --
    t(GraphState::Pausing, EventKind::TransComplete, g_trans_paused, a_none, Some(GraphState::Paused)),
    t(GraphState::Pausing, EventKind::Tick, g_deadline_expired, a_timeout, Some(GraphState::Fault)),
    t(GraphState::Pausing, EventKind::Destroy, g_always, a_none, Some(GraphState::Stopped)),
    // -- Paused --
    t(GraphState::Paused, EventKind::Resume, g_always, a_none, Some(GraphState::Resuming)),
    t(GraphState::Paused, EventKind::Stop, g_always, a_none, Some(GraphState::Stopping)),
    t(GraphState::Paused, EventKind::Skip, g_always, a_store_skip, Some(GraphState::Skipping)),
    t(GraphState::Paused, EventKind::Volume, g_always, a_volume, None),
    t(GraphState::Paused, EventKind::Mute, g_always, a_mute, None),
    t(GraphState::Paused, EventKind::Destroy, g_always, a_none, Some(GraphState::Stopped)),
    // -- Resuming --
    t(GraphState::Resuming, EventKind::TransComplete, g_trans_exe, a_none, Some(GraphState::Executing)),
    t(GraphState::Resuming, EventKind::Tick, g_deadline_expired, a_timeout, Some(GraphState::Fault)),
    t(GraphState::Resuming, EventKind::Destroy, g_always, a_none, Some(GraphState::Stopped)),
    // -- Stopping --
    t(GraphState::Stopping, EventKind::TransComplete, g_trans_idle, a_idle2loaded, None),
    t(GraphState::Stopping, EventKind::TransComplete, g_trans_loaded, a_none, Some(GraphState::Stopped)),
    t(GraphState::Stopping, EventKind::Tick, g_deadline_expired, a_timeout, Some(GraphState::Fault)),
    t(GraphState::Stopping, EventKind::Destroy, g_always, a_none, Some(GraphState::Stopped)),
    // -- Stopped / Fault --
    t(GraphState::Stopped, EventKind::Destroy, g_always, a_none, None),
    t(GraphState::Fault, EventKind::Destroy, g_always, a_none, None),
];

/// Row constructor, to keep the table readable.
const fn t(
    from: GraphState,
    on: EventKind,
    guard: Guard,
    action: Action,
    to: Option<GraphState>,
) -> Transition {
    Transition {
        from,
        on,
        guard,
        action,
        to,
    }
}

pub(crate) struct GraphFsm {
    state: GraphState,
}

impl GraphFsm {
    pub(crate) fn new() -> Self {
        Self {
            state: GraphState::Inited,
        }
    }

    pub(crate) fn state(&self) -> GraphState {
        self.state
    }

    /// Feeds one event through the tables.
    pub(crate) fn process_event(&mut self, ops: &mut GraphOps, evt: FsmEvent) {
        // A fatal error takes precedence over whatever is in flight.
        if let FsmEvent::CompError {
            component,
            code,
            port,
        } = &evt
        {
            if !matches!(self.state, GraphState::Fault | GraphState::Stopped) {
                ops.record_fatal_code(
                    *code,
                    format!("component {component} reported {code:?} (port {port:?})"),
                );
                self.advance(ops, GraphState::Fault);
            }
            return;
        }

        let kind = evt.kind();
        for row in TRANSITIONS
            .iter()
            .filter(|row| row.from == self.state && row.on == kind)
        {
            if !(row.guard)(ops, &evt) {
                continue;
            }

            if let Err(err) = (row.action)(ops, &evt) {
                ops.record_error(err);
                self.advance(ops, GraphState::Fault);
                return;
            }

            if let Some(next) = row.to {
                self.advance(ops, next);
            }
            return;
        }

        log::trace!("fsm: no transition for {kind:?} in {:?}", self.state);
    }

    /// Moves to `next`, running entry actions and chaining through any
    /// trivially-complete phases.
    fn advance(&mut self, ops: &mut GraphOps, next: GraphState) {
        let mut next = Some(next);
        while let Some(state) = next.take() {
            log::debug!("graph fsm: {:?} -> {state:?}", self.state);
            self.state = state;
            ops.state_entered = Instant::now();
            ops.notify(GraphNotification::StateChanged(state));

            match self.enter(ops) {
                Ok(chain) => next = chain,
                Err(err) => {
                    ops.record_error(err);
                    if state != GraphState::Fault {
                        next = Some(GraphState::Fault);
                    }
                }
            }
        }
    }

    /// Entry actions. Returns the next state when this phase completes
    /// synchronously.
    fn enter(&mut self, ops: &mut GraphOps) -> Result<Option<GraphState>, IlError> {
        match self.state {
            GraphState::Inited | GraphState::Loaded | GraphState::Paused => Ok(None),
            GraphState::AutoDetecting => {
                ops.do_enable_auto_detection()?;
                Ok(None)
            }
            GraphState::Configuring => {
                ops.do_load_rest()?;
                ops.do_configure()?;
                ops.do_setup_tunnels()?;
                ops.do_omx_loaded2idle()?;
                Ok(None)
            }
            GraphState::Executing => {
                let deferred = ops.take_deferred_skip();
                if deferred != 0 {
                    ops.do_store_skip(deferred);
                    return Ok(Some(GraphState::Skipping));
                }

                if ops.take_track_started() {
                    let index = ops.current_index();
                    let uri = ops.current_uri()?.to_string();
                    if let Some(probe) = ops.probe_result() {
                        ops.notify(GraphNotification::TrackStarted {
                            index,
                            uri,
                            metadata: probe.metadata.clone(),
                            pcm: probe.pcm,
                            duration: probe.duration,
                        });
                    }
                }

                ops.reset_progress();
                Ok(None)
            }
            GraphState::Reconfiguring => {
                let idx = ops
                    .reconfiguring_tunnel()
                    .expect("entered Reconfiguring without a tunnel");
                ops.do_disable_tunnel(idx)?;
                Ok(None)
            }
            GraphState::Skipping => {
                if ops.any_component_at_or_above(IlState::Executing) {
                    if ops.all_components_at(IlState::Paused) {
                        // A skip while paused resumes first, then drains.
                        ops.do_omx_pause2exe()?;
                    } else {
                        ops.do_flush_graph();
                        ops.do_omx_exe2idle()?;
                    }
                    Ok(None)
                } else if ops.any_component_at_or_above(IlState::Idle) {
                    ops.do_omx_idle2loaded()?;
                    Ok(None)
                } else {
                    // All the way down: advance the cursor and either end
                    // play or go around again.
                    if ops.is_end_of_play() {
                        Ok(Some(GraphState::Stopped))
                    } else {
                        ops.do_configure_source()?;
                        Ok(Some(GraphState::AutoDetecting))
                    }
                }
            }
            GraphState::Pausing => {
                ops.do_omx_exe2pause()?;
                if ops.transition_was_trivial() {
                    return Ok(Some(GraphState::Paused));
                }
                Ok(None)
            }
            GraphState::Resuming => {
                ops.do_omx_pause2exe()?;
                if ops.transition_was_trivial() {
                    return Ok(Some(GraphState::Executing));
                }
                Ok(None)
            }
            GraphState::Stopping => {
                if ops.any_component_at_or_above(IlState::Executing) {
                    ops.do_flush_graph();
                    ops.do_omx_exe2idle()?;
                    Ok(None)
                } else if ops.any_component_at_or_above(IlState::Idle) {
                    ops.do_omx_idle2loaded()?;
                    Ok(None)
                } else {
                    Ok(Some(GraphState::Stopped))
                }
            }
            GraphState::Stopped => {
                ops.do_tear_down_tunnels();
                ops.do_destroy_graph();
                if ops.is_end_of_play() {
                    ops.notify(GraphNotification::EndOfPlay);
                }
                Ok(None)
            }
            GraphState::Fault => {
                let (code, message) = ops.take_fatal();
                log::error!("graph fault: {code:?}: {message}");
                ops.notify(GraphNotification::Fatal { code, message });
                ops.do_destroy_graph();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_has_a_destroy_or_terminal_row() {
        // Destroy must be handled everywhere the runner can sit, so the
        // owner can always tear a graph down.
        for state in [
            GraphState::Inited,
            GraphState::Loaded,
            GraphState::AutoDetecting,
            GraphState::Configuring,
            GraphState::Executing,
            GraphState::Reconfiguring,
            GraphState::Skipping,
            GraphState::Pausing,
            GraphState::Paused,
            GraphState::Resuming,
            GraphState::Stopping,
            GraphState::Stopped,
            GraphState::Fault,
        ] {
            assert!(
                TRANSITIONS
                    .iter()
                    .any(|t| t.from == state && t.on == EventKind::Destroy),
                "{state:?} has no Destroy row"
            );
        }
    }

    #[test]
    fn transient_states_are_deadline_bounded() {
        for state in [
            GraphState::AutoDetecting,
            GraphState::Configuring,
            GraphState::Reconfiguring,
            GraphState::Skipping,
            GraphState::Pausing,
            GraphState::Resuming,
            GraphState::Stopping,
        ] {
            assert!(
                TRANSITIONS.iter().any(|t| t.from == state
                    && t.on == EventKind::Tick
                    && t.to == Some(GraphState::Fault)),
                "{state:?} has no liveness bound"
            );
        }
    }
}
