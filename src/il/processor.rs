//! The processor servant: the active object that performs a component's
//! actual work.
//!
//! Each component owns one servant worker. The worker drains a mailbox in
//! FIFO order and dispatches each message through a pair of tables: one
//! indexed by the message class, and, for `SendCommand`, a second indexed
//! by the command kind. State transitions go through a third,
//! two-dimensional table keyed on (current state, requested state) that
//! mirrors the component state lattice.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use super::buffer::BufferHeader;
use super::component::{dispatch_outbound, Body, PendingTransition, Shared};
use super::error::IlError;
use super::event::{Command, CompletedCommand, Event, PortSelector};
use super::format::{Encoding, PcmFormat};
use super::kernel::Outbound;
use super::port::{ConfigId, PortConfig};
use super::state::{classify, IlState, TransitionVerdict};
use super::PortIndex;

/// A message in the servant's mailbox.
///
/// The declaration order is stable: it indexes the message dispatch table.
/// Do not re-order.
#[derive(Debug)]
pub(crate) enum Message {
    /// A lifecycle command from the component shell.
    SendCommand(Command),
    /// One or more buffers arrived on a port (or an external readiness
    /// source nudged the component).
    BuffersReady { port: PortIndex },
    /// A config value changed.
    ConfigChange { id: ConfigId },
    /// Retry a state transition that previously reported not-ready.
    DeferredResume { target: IlState },
}

impl Message {
    fn table_index(&self) -> usize {
        match self {
            Message::SendCommand(_) => 0,
            Message::BuffersReady { .. } => 1,
            Message::ConfigChange { .. } => 2,
            Message::DeferredResume { .. } => 3,
        }
    }
}

/// The working context handed to [`ProcessorOps`] callbacks.
///
/// All custody movement goes through here, so the kernel bookkeeping stays
/// consistent no matter what the component-specific code does. Effects that
/// must leave the component (deliveries, events) are queued and dispatched
/// after the component's lock is released.
pub struct ProcContext<'a> {
    pub(crate) body: &'a mut Body,
    pub(crate) out: &'a mut Vec<Outbound>,
    pub(crate) core: &'a Arc<Shared>,
}

impl std::fmt::Debug for ProcContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcContext")
            .field("component", &self.core.id)
            .field("state", &self.body.state)
            .finish_non_exhaustive()
    }
}

impl ProcContext<'_> {
    /// The component's current state.
    pub fn state(&self) -> IlState {
        self.body.state
    }

    /// A handle to the component this context belongs to, for registering
    /// with external readiness sources. Must not be used to call component
    /// APIs from inside a callback.
    pub fn self_handle(&self) -> super::component::ComponentHandle {
        super::component::ComponentHandle::from_shared(self.core.clone())
    }

    /// Puts a claimed buffer back at the head of its port, unprocessed.
    /// Used when an external sink reports not-writable mid-buffer; the
    /// next nudge claims it again with nothing lost.
    pub fn defer(&mut self, port: PortIndex, hdr: BufferHeader) -> Result<(), IlError> {
        let p = self.body.kernel.port_mut(port)?;
        p.unclaim()?;
        p.park_front(hdr);
        Ok(())
    }

    /// Claims the head buffer of a port, if one is ready.
    pub fn claim(&mut self, port: PortIndex) -> Result<Option<BufferHeader>, IlError> {
        self.body.kernel.claim(port)
    }

    /// Releases a buffer back to its port, which routes it onward.
    pub fn release(&mut self, port: PortIndex, hdr: BufferHeader) -> Result<(), IlError> {
        let parking = self.body.is_parking();
        self.body.kernel.release(port, hdr, parking, self.out)
    }

    /// Emits an event upward.
    pub fn emit(&mut self, event: Event) {
        self.out.push(Outbound::Event(event));
    }

    /// The configuration of a port.
    pub fn port_config(&self, port: PortIndex) -> Result<&PortConfig, IlError> {
        Ok(self.body.kernel.port(port)?.config())
    }

    /// Whether a port is currently enabled.
    pub fn port_enabled(&self, port: PortIndex) -> Result<bool, IlError> {
        Ok(self.body.kernel.port(port)?.is_enabled())
    }

    /// Updates a port's detected encoding. Part of the auto-detection and
    /// port-settings-changed protocols; the new value becomes visible to
    /// `get_parameter` immediately.
    pub fn set_port_encoding(&mut self, port: PortIndex, encoding: Encoding) -> Result<(), IlError> {
        self.body.kernel.port_mut(port)?.config_mut().encoding = encoding;
        Ok(())
    }

    /// Updates a port's PCM format. Part of the port-settings-changed
    /// protocol.
    pub fn set_port_pcm(&mut self, port: PortIndex, pcm: PcmFormat) -> Result<(), IlError> {
        self.body.kernel.port_mut(port)?.config_mut().pcm = pcm;
        Ok(())
    }

    /// The content URI, if one has been set.
    pub fn uri(&self) -> Option<&str> {
        self.body.uri.as_deref()
    }

    /// The current rendering volume, 0..=100.
    pub fn volume(&self) -> u32 {
        self.body.volume
    }

    /// Whether rendering is muted.
    pub fn muted(&self) -> bool {
        self.body.muted
    }

    /// Advances the rendered-bytes counter surfaced as
    /// [`ConfigId::Position`].
    pub fn add_position(&mut self, bytes: u64) {
        self.body.position += bytes;
    }

    /// Resets the rendered-bytes counter.
    pub fn reset_position(&mut self) {
        self.body.position = 0;
    }
}

/// The component-specific behavior plugged into a servant.
///
/// Every callback has a no-op default, so a component implements only the
/// subset it needs. Callbacks run on the component's worker with the
/// component lock held; they must not call other components' APIs (the
/// context queues cross-component effects instead).
#[allow(unused_variables)]
pub trait ProcessorOps: Send + 'static {
    /// Acquire codec or device resources. Runs during Loaded→Idle.
    fn allocate_resources(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        Ok(())
    }

    /// Release everything acquired by `allocate_resources`. Runs during
    /// Idle→Loaded.
    fn deallocate_resources(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        Ok(())
    }

    /// Get ready to move data. Runs during Idle→Executing, before any
    /// buffer is claimed.
    fn prepare_to_transfer(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        Ok(())
    }

    /// Start moving data. Runs during Idle→Executing.
    fn transfer_and_process(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        Ok(())
    }

    /// Stop moving data and surrender any held buffers. Runs during
    /// Executing/Paused→Idle.
    fn stop_and_return(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        Ok(())
    }

    /// Buffers are available. The usual transform loop: claim, process,
    /// release, until a side runs dry.
    fn buffers_ready(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        Ok(())
    }

    /// A reduced drain pass that runs instead of `buffers_ready` while
    /// Paused, for components that deliberately pre-buffer.
    fn paused_drain(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        Ok(())
    }

    /// Processing is being suspended (Executing→Paused).
    fn pause(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        Ok(())
    }

    /// Processing is resuming (Paused→Executing). Returning
    /// [`IlError::NotReady`] defers the resume until the next nudge.
    fn resume(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        Ok(())
    }

    /// A config value changed.
    fn config_change(&mut self, ctx: &mut ProcContext<'_>, id: ConfigId) -> Result<(), IlError> {
        Ok(())
    }

    /// A port is flushing. Internal stores tied to in-flight buffers should
    /// be discarded; format state and look-ahead stores survive.
    fn port_flush(&mut self, ctx: &mut ProcContext<'_>, port: PortIndex) -> Result<(), IlError> {
        Ok(())
    }

    /// A port is disabling. Look-ahead stores survive disable so that
    /// processing resumes from the next byte after re-enable.
    fn port_disable(&mut self, ctx: &mut ProcContext<'_>, port: PortIndex) -> Result<(), IlError> {
        Ok(())
    }

    /// A port was re-enabled.
    fn port_enable(&mut self, ctx: &mut ProcContext<'_>, port: PortIndex) -> Result<(), IlError> {
        Ok(())
    }
}

type MsgHandler = fn(&mut Servant, Message);

/// Message class dispatch table. Indexed by [`Message::table_index`]; do
/// not re-order.
const MSG_DISPATCH: [MsgHandler; 4] = [
    Servant::dispatch_send_command,
    Servant::dispatch_buffers_ready,
    Servant::dispatch_config_change,
    Servant::dispatch_deferred_resume,
];

type CommandHandler = fn(&mut Servant, Command);

/// `SendCommand` dispatch table. Indexed by [`Command::table_index`]; do
/// not re-order.
const COMMAND_DISPATCH: [CommandHandler; 4] = [
    Servant::dispatch_state_set,
    Servant::dispatch_flush,
    Servant::dispatch_port_disable,
    Servant::dispatch_port_enable,
];

/// A state transition handler. Returns whether the transition finished
/// synchronously; `false` leaves it pending on buffer movement.
type StateHandler =
    fn(&mut Box<dyn ProcessorOps>, &mut ProcContext<'_>) -> Result<bool, IlError>;

fn loaded_to_idle(
    ops: &mut Box<dyn ProcessorOps>,
    ctx: &mut ProcContext<'_>,
) -> Result<bool, IlError> {
    ops.allocate_resources(ctx)?;
    let out = &mut *ctx.out;
    ctx.body.kernel.populate(out);
    Ok(ctx.body.kernel.all_populated())
}

fn idle_to_loaded(
    ops: &mut Box<dyn ProcessorOps>,
    ctx: &mut ProcContext<'_>,
) -> Result<bool, IlError> {
    ops.deallocate_resources(ctx)?;
    ctx.body.kernel.depopulate(ctx.out);
    Ok(ctx.body.kernel.all_depopulated())
}

fn idle_to_exe(
    ops: &mut Box<dyn ProcessorOps>,
    ctx: &mut ProcContext<'_>,
) -> Result<bool, IlError> {
    ops.prepare_to_transfer(ctx)?;
    ops.transfer_and_process(ctx)?;
    Ok(true)
}

fn exe_or_pause_to_idle(
    ops: &mut Box<dyn ProcessorOps>,
    ctx: &mut ProcContext<'_>,
) -> Result<bool, IlError> {
    ops.stop_and_return(ctx)?;
    Ok(ctx.body.kernel.quiesced())
}

fn exe_to_exe(
    _ops: &mut Box<dyn ProcessorOps>,
    _ctx: &mut ProcContext<'_>,
) -> Result<bool, IlError> {
    Ok(true)
}

fn to_pause(
    ops: &mut Box<dyn ProcessorOps>,
    ctx: &mut ProcContext<'_>,
) -> Result<bool, IlError> {
    ops.pause(ctx)?;
    Ok(true)
}

fn pause_to_exe(
    ops: &mut Box<dyn ProcessorOps>,
    ctx: &mut ProcContext<'_>,
) -> Result<bool, IlError> {
    ops.resume(ctx)?;
    Ok(true)
}

fn trivially_done(
    _ops: &mut Box<dyn ProcessorOps>,
    _ctx: &mut ProcContext<'_>,
) -> Result<bool, IlError> {
    Ok(true)
}

/// State transition handler table, indexed by (current, requested) in
/// `IlState` declaration order. `None` cells are rejections or no-ops per
/// the lattice. Do not re-order.
const STATE_SET_TABLE: [[Option<StateHandler>; 5]; 5] = [
    // To:        Loaded              Idle                   Exe                Paused          WaitForRes
    /* Loaded */
    [None, Some(loaded_to_idle), None, None, Some(trivially_done)],
    /* Idle */
    [
        Some(idle_to_loaded),
        None,
        Some(idle_to_exe),
        Some(to_pause),
        None,
    ],
    /* Exe */
    [
        None,
        Some(exe_or_pause_to_idle),
        Some(exe_to_exe),
        Some(to_pause),
        None,
    ],
    /* Paused */
    [
        None,
        Some(exe_or_pause_to_idle),
        Some(pause_to_exe),
        None,
        None,
    ],
    /* WaitForRes */
    [Some(trivially_done), None, None, None, None],
];

fn state_handler(from: IlState, to: IlState) -> Option<StateHandler> {
    STATE_SET_TABLE[from as usize - 1][to as usize - 1]
}

/// The per-component worker. Owns the mailbox receiver and the
/// component-specific [`ProcessorOps`].
pub(crate) struct Servant {
    core: Arc<Shared>,
    ops: Box<dyn ProcessorOps>,
    mailbox: Receiver<Message>,
    deferred_resume: Option<IlState>,
}

impl Servant {
    pub(crate) fn new(
        core: Arc<Shared>,
        ops: Box<dyn ProcessorOps>,
        mailbox: Receiver<Message>,
    ) -> Self {
        Self {
            core,
            ops,
            mailbox,
            deferred_resume: None,
        }
    }

    /// The worker loop: receive until the shell closes the mailbox.
    pub(crate) fn run(mut self) {
        while let Ok(msg) = self.mailbox.recv() {
            log::trace!("{}: {:?}", self.core.name, msg);
            MSG_DISPATCH[msg.table_index()](&mut self, msg);
        }

        log::debug!("{}: mailbox closed, worker exiting", self.core.name);
    }

    /// Runs `f` with the component locked, then dispatches whatever
    /// outbound effects it queued.
    fn with_body<R>(&mut self, f: impl FnOnce(&mut Box<dyn ProcessorOps>, &mut ProcContext<'_>) -> R) -> R {
        let mut out = Vec::new();
        let r = {
            let mut body = self.core.body.lock().unwrap();
            let mut ctx = ProcContext {
                body: &mut body,
                out: &mut out,
                core: &self.core,
            };
            let r = f(&mut self.ops, &mut ctx);
            body.settle(&mut out);
            r
        };

        dispatch_outbound(&self.core, out);
        r
    }

    fn dispatch_send_command(&mut self, msg: Message) {
        let Message::SendCommand(cmd) = msg else {
            unreachable!()
        };

        COMMAND_DISPATCH[cmd.table_index()](self, cmd);
    }

    fn dispatch_state_set(&mut self, cmd: Command) {
        let Command::StateSet(target) = cmd else {
            unreachable!()
        };

        self.run_state_set(target);
    }

    fn run_state_set(&mut self, target: IlState) {
        let name = self.core.name.clone();
        let deferred = self.with_body(|ops, ctx| {
            if ctx.body.pending.is_some() {
                ctx.emit(Event::Error {
                    code: IlError::IncorrectStateOperation(format!(
                        "state transition already in progress on {name}"
                    ))
                    .code(),
                    port: None,
                });
                return None;
            }

            let current = ctx.body.state;
            match classify(current, target) {
                TransitionVerdict::NoOp => {
                    ctx.emit(Event::CmdComplete {
                        cmd: CompletedCommand::StateSet(target),
                        error: None,
                    });
                    None
                }
                TransitionVerdict::Reject => {
                    log::warn!("{name}: rejecting transition {current:?} -> {target:?}");
                    ctx.emit(Event::Error {
                        code: IlError::IncorrectStateTransition(current, target).code(),
                        port: None,
                    });
                    None
                }
                TransitionVerdict::Run => {
                    let handler =
                        state_handler(current, target).expect("lattice and table agree");
                    ctx.body.pending = Some(PendingTransition {
                        from: current,
                        to: target,
                    });

                    match handler(ops, ctx) {
                        Ok(true) => {
                            ctx.body.finalize_transition(ctx.out);
                            None
                        }
                        // Deferred: settled later by buffer movement.
                        Ok(false) => None,
                        Err(IlError::NotReady) => Some(target),
                        Err(err) => {
                            log::error!("{name}: transition to {target:?} failed: {err}");
                            ctx.body.pending = None;
                            ctx.emit(Event::Error {
                                code: err.code(),
                                port: None,
                            });
                            None
                        }
                    }
                }
            }
        });

        if let Some(target) = deferred {
            // Not ready; retry on the next nudge.
            self.deferred_resume = Some(target);
        }
    }

    fn dispatch_flush(&mut self, cmd: Command) {
        let Command::Flush(sel) = cmd else {
            unreachable!()
        };

        self.with_body(|ops, ctx| {
            let ports = selected_ports(ctx.body, sel);
            ctx.body.kernel.flush(sel, ctx.out);
            for port in ports {
                if let Err(err) = ops.port_flush(ctx, port) {
                    log::warn!("port {port} flush hook failed: {err}");
                }
            }
        });
    }

    fn dispatch_port_disable(&mut self, cmd: Command) {
        let Command::PortDisable(sel) = cmd else {
            unreachable!()
        };

        self.with_body(|ops, ctx| {
            let ports = selected_ports(ctx.body, sel);
            ctx.body.kernel.disable(sel, ctx.out);
            for port in ports {
                if let Err(err) = ops.port_disable(ctx, port) {
                    log::warn!("port {port} disable hook failed: {err}");
                }
            }
        });
    }

    fn dispatch_port_enable(&mut self, cmd: Command) {
        let Command::PortEnable(sel) = cmd else {
            unreachable!()
        };

        self.with_body(|ops, ctx| {
            let populate_now = matches!(
                ctx.body.state,
                IlState::Idle | IlState::Executing | IlState::Paused
            );
            let ports = selected_ports(ctx.body, sel);
            ctx.body.kernel.enable(sel, populate_now, ctx.out);
            for port in ports {
                if let Err(err) = ops.port_enable(ctx, port) {
                    log::warn!("port {port} enable hook failed: {err}");
                }
            }
        });
    }

    fn dispatch_buffers_ready(&mut self, msg: Message) {
        let Message::BuffersReady { .. } = msg else {
            unreachable!()
        };

        if let Some(target) = self.deferred_resume.take() {
            self.retry_deferred(target);
        }

        let name = self.core.name.clone();
        self.with_body(|ops, ctx| {
            let r = match ctx.body.state {
                IlState::Executing => ops.buffers_ready(ctx),
                IlState::Paused => ops.paused_drain(ctx),
                // Buffers stay parked until the component executes.
                _ => Ok(()),
            };

            match r {
                Ok(()) => {}
                Err(err) if err.is_retriable() => {}
                Err(err) => {
                    log::error!("{name}: processing failed: {err}");
                    ctx.emit(Event::Error {
                        code: err.code(),
                        port: None,
                    });
                }
            }
        });
    }

    fn dispatch_config_change(&mut self, msg: Message) {
        let Message::ConfigChange { id } = msg else {
            unreachable!()
        };

        let name = self.core.name.clone();
        self.with_body(|ops, ctx| {
            if let Err(err) = ops.config_change(ctx, id) {
                log::warn!("{name}: config change {id:?} failed: {err}");
            }
        });
    }

    fn dispatch_deferred_resume(&mut self, msg: Message) {
        let Message::DeferredResume { target } = msg else {
            unreachable!()
        };

        self.retry_deferred(target);
    }

    fn retry_deferred(&mut self, target: IlState) {
        let deferred = self.with_body(|ops, ctx| {
            let Some(pending) = ctx.body.pending else {
                return None;
            };
            debug_assert_eq!(pending.to, target);

            let handler = state_handler(pending.from, pending.to)
                .expect("pending transition came from the table");
            match handler(ops, ctx) {
                Ok(true) => {
                    ctx.body.finalize_transition(ctx.out);
                    None
                }
                Ok(false) => None,
                Err(IlError::NotReady) => Some(target),
                Err(err) => {
                    ctx.body.pending = None;
                    ctx.emit(Event::Error {
                        code: err.code(),
                        port: None,
                    });
                    None
                }
            }
        });

        if let Some(target) = deferred {
            self.deferred_resume = Some(target);
        }
    }
}

fn selected_ports(body: &Body, sel: PortSelector) -> Vec<PortIndex> {
    match sel {
        PortSelector::All => body.kernel.ports().map(|p| p.index()).collect(),
        PortSelector::One(p) => vec![p],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_table_matches_the_lattice() {
        let states = [
            IlState::Loaded,
            IlState::Idle,
            IlState::Executing,
            IlState::Paused,
            IlState::WaitForResources,
        ];

        for from in states {
            for to in states {
                let runs = classify(from, to) == TransitionVerdict::Run;
                assert_eq!(
                    state_handler(from, to).is_some(),
                    runs,
                    "table and lattice disagree on {from:?} -> {to:?}"
                );
            }
        }
    }
}
