//! The component shell: the public façade over a kernel and a processor
//! servant.
//!
//! A [`ComponentHandle`] can be freely cloned and shared between threads.
//! API calls are validated inline; commands and buffer submissions are
//! forwarded onto the servant's mailbox, and events come back through the
//! [`EventSink`] installed at spawn time.

use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::buffer::{AllocatorTag, BufferHeader};
use super::error::IlError;
use super::event::{Command, ComponentEvent, Event, EventSink, PortSelector};
use super::kernel::{Kernel, Outbound};
use super::port::{
    ConfigId, ConfigValue, ParamId, Parameter, PortConfig, PortDirection, RejectedBuffer,
    TunnelEnd,
};
use super::processor::{Message, ProcessorOps, Servant};
use super::state::IlState;
use super::{ComponentId, PortIndex};

/// The static description of a component: its name, role, and port table.
#[derive(Debug, Clone)]
pub struct ComponentDef {
    /// Component name, e.g. `"file_reader.binary"`.
    pub name: String,
    /// Standard role string, e.g. `"audio_source.file"`.
    pub role: String,
    /// Ordered port table. Port indices are assigned in order from 0.
    pub ports: Vec<PortConfig>,
}

/// A state transition in progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PendingTransition {
    pub(crate) from: IlState,
    pub(crate) to: IlState,
}

/// The mutable half of a component, guarded by one lock.
///
/// Only one mailbox worker and the (serialized) API callers ever touch
/// this; everything that must leave the component goes through an
/// [`Outbound`] list dispatched after unlock.
pub(crate) struct Body {
    pub(crate) state: IlState,
    pub(crate) pending: Option<PendingTransition>,
    pub(crate) kernel: Kernel,
    pub(crate) uri: Option<String>,
    pub(crate) volume: u32,
    pub(crate) muted: bool,
    pub(crate) position: u64,
}

impl Body {
    /// Whether released buffers should be parked rather than forwarded
    /// (the Executing/Paused→Idle accounting mode).
    pub(crate) fn is_parking(&self) -> bool {
        matches!(
            self.pending,
            Some(PendingTransition {
                from: IlState::Executing | IlState::Paused,
                to: IlState::Idle,
            })
        )
    }

    /// Re-checks every deferred completion: port commands first, then the
    /// pending state transition. Called after any buffer movement.
    pub(crate) fn settle(&mut self, out: &mut Vec<Outbound>) {
        self.kernel.settle_port_commands(out);

        let Some(pending) = self.pending else {
            return;
        };

        let done = match (pending.from, pending.to) {
            (IlState::Loaded, IlState::Idle) => self.kernel.all_populated(),
            (IlState::Idle, IlState::Loaded) => {
                self.kernel.continue_depopulate();
                self.kernel.all_depopulated()
            }
            (IlState::Executing | IlState::Paused, IlState::Idle) => self.kernel.quiesced(),
            // Everything else completes synchronously in its handler.
            _ => false,
        };

        if done {
            self.finalize_transition(out);
        }
    }

    /// Completes the pending transition and reports it.
    pub(crate) fn finalize_transition(&mut self, out: &mut Vec<Outbound>) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        self.state = pending.to;

        // Buffers may have parked while the transition was in flight; get
        // the servant moving again.
        if pending.to == IlState::Executing {
            out.push(Outbound::SelfNudge);
        }

        out.push(Outbound::Event(Event::CmdComplete {
            cmd: super::event::CompletedCommand::StateSet(pending.to),
            error: None,
        }));
    }

    fn accepts_buffers(&self) -> bool {
        matches!(
            self.state,
            IlState::Idle | IlState::Executing | IlState::Paused
        ) || self.pending.is_some()
    }
}

/// State shared between the handle clones and the servant worker.
pub(crate) struct Shared {
    pub(crate) id: ComponentId,
    pub(crate) name: String,
    pub(crate) role: String,
    pub(crate) body: Mutex<Body>,
    mailbox: Mutex<Option<Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pub(crate) events: Arc<dyn EventSink>,
}

/// A handle to a running component.
///
/// The handle can be freely cloned; the component lives until
/// [`ComponentHandle::shutdown`] closes its mailbox.
#[derive(Clone)]
pub struct ComponentHandle(Arc<Shared>);

impl ComponentHandle {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self(shared)
    }
}

impl std::fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Component")
            .field(&self.0.id)
            .field(&self.0.name)
            .finish()
    }
}

impl ComponentHandle {
    /// Creates a component and starts its servant worker.
    pub fn spawn(
        def: ComponentDef,
        id: ComponentId,
        events: Arc<dyn EventSink>,
        ops: Box<dyn ProcessorOps>,
    ) -> Result<Self, IlError> {
        let (tx, rx) = channel();

        let shared = Arc::new(Shared {
            id,
            name: def.name.clone(),
            role: def.role,
            body: Mutex::new(Body {
                state: IlState::Loaded,
                pending: None,
                kernel: Kernel::new(id, def.ports),
                uri: None,
                volume: 75,
                muted: false,
                position: 0,
            }),
            mailbox: Mutex::new(Some(tx)),
            worker: Mutex::new(None),
            events,
        });

        let servant = Servant::new(shared.clone(), ops, rx);
        let worker = std::thread::Builder::new()
            .name(def.name)
            .spawn(move || servant.run())
            .map_err(|e| IlError::InsufficientResources(format!("spawning worker: {e}")))?;

        *shared.worker.lock().unwrap() = Some(worker);
        Ok(Self(shared))
    }

    /// The component's id within its graph.
    pub fn id(&self) -> ComponentId {
        self.0.id
    }

    /// The component's name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The component's role string.
    pub fn role(&self) -> &str {
        &self.0.role
    }

    /// The component's current state. During a transition this reports the
    /// state being left, never an intermediate one.
    pub fn state(&self) -> IlState {
        self.0.body.lock().unwrap().state
    }

    fn with_body<R>(&self, f: impl FnOnce(&mut Body, &mut Vec<Outbound>) -> R) -> R {
        let mut out = Vec::new();
        let r = {
            let mut body = self.0.body.lock().unwrap();
            let r = f(&mut body, &mut out);
            body.settle(&mut out);
            r
        };

        dispatch_outbound(&self.0, out);
        r
    }

    fn post(&self, msg: Message) -> Result<(), IlError> {
        let mailbox = self.0.mailbox.lock().unwrap();
        let Some(tx) = mailbox.as_ref() else {
            return Err(IlError::Disconnected);
        };

        tx.send(msg).map_err(|_| IlError::Disconnected)
    }

    /// Nudges the servant: buffers (or external readiness) are waiting.
    pub(crate) fn nudge(&self, port: PortIndex) {
        let _ = self.post(Message::BuffersReady { port });
    }

    /// Submits a lifecycle command. Completion is reported asynchronously
    /// with a `CmdComplete` event.
    pub fn send_command(&self, cmd: Command) -> Result<(), IlError> {
        if let Command::Flush(PortSelector::One(p))
        | Command::PortDisable(PortSelector::One(p))
        | Command::PortEnable(PortSelector::One(p)) = cmd
        {
            let body = self.0.body.lock().unwrap();
            if !body.kernel.has_port(p) {
                return Err(IlError::BadParameter(format!("no port {p}")));
            }
        }

        log::debug!("{}: command {:?}", self.0.name, cmd);
        self.post(Message::SendCommand(cmd))
    }

    /// Delivers a filled buffer to an input port.
    ///
    /// On failure the header comes back with the error, so ownership never
    /// goes missing.
    pub fn empty_this_buffer(
        &self,
        port: PortIndex,
        mut hdr: BufferHeader,
    ) -> Result<(), RejectedBuffer> {
        hdr.port = port;
        let r = self.with_body(|body, _out| {
            if let Err(error) = check_deliverable(body, port, PortDirection::Input) {
                return Err(RejectedBuffer { error, buffer: hdr });
            }

            body.kernel.deliver(port, hdr)
        });

        if r.is_ok() {
            self.nudge(port);
        }
        r
    }

    /// Hands an empty buffer to an output port to be filled.
    ///
    /// On failure the header comes back with the error.
    pub fn fill_this_buffer(
        &self,
        port: PortIndex,
        mut hdr: BufferHeader,
    ) -> Result<(), RejectedBuffer> {
        hdr.port = port;
        let r = self.with_body(|body, _out| {
            if let Err(error) = check_deliverable(body, port, PortDirection::Output) {
                return Err(RejectedBuffer { error, buffer: hdr });
            }

            body.kernel.deliver(port, hdr)
        });

        if r.is_ok() {
            self.nudge(port);
        }
        r
    }

    /// Accepts a buffer coming home outside the data path (flush, disable,
    /// teardown). Always accepted; the cancellation protocols depend on it.
    pub(crate) fn return_buffer(&self, port: PortIndex, hdr: BufferHeader) -> Result<(), IlError> {
        let r = self.with_body(|body, _out| body.kernel.take_back(port, hdr));
        if r.is_ok() {
            self.nudge(port);
        }
        r
    }

    /// Peer notification: the other end of the tunnel on `port` is enabled
    /// again.
    pub(crate) fn peer_port_enabled(&self, port: PortIndex) {
        self.with_body(|body, out| body.kernel.peer_port_enabled(port, out));
    }

    /// Reads a parameter. Executed inline.
    pub fn get_parameter(&self, id: ParamId) -> Result<Parameter, IlError> {
        let body = self.0.body.lock().unwrap();
        match id {
            ParamId::ContentUri => body
                .uri
                .clone()
                .map(Parameter::ContentUri)
                .ok_or_else(|| IlError::BadParameter("no content uri set".into())),
            ParamId::PortDefinition(p) => Ok(Parameter::PortDefinition(
                p,
                body.kernel.port(p)?.config().clone(),
            )),
            ParamId::Pcm(p) => Ok(Parameter::Pcm(p, body.kernel.port(p)?.config().pcm)),
        }
    }

    /// Writes a parameter. Port parameters may only change while the port
    /// is disabled or the component is Loaded; the content URI only while
    /// Loaded.
    pub fn set_parameter(&self, param: Parameter) -> Result<(), IlError> {
        let mut body = self.0.body.lock().unwrap();
        match param {
            Parameter::ContentUri(uri) => {
                if body.state != IlState::Loaded {
                    return Err(IlError::IncorrectStateOperation(format!(
                        "content uri is only settable while Loaded, not {:?}",
                        body.state
                    )));
                }
                body.uri = Some(uri);
                Ok(())
            }
            Parameter::PortDefinition(p, cfg) => {
                check_port_mutable(&body, p)?;
                let port = body.kernel.port_mut(p)?;
                if cfg.direction != port.config().direction {
                    return Err(IlError::BadParameter(format!(
                        "port {p} direction is immutable"
                    )));
                }
                *port.config_mut() = cfg;
                Ok(())
            }
            Parameter::Pcm(p, pcm) => {
                check_port_mutable(&body, p)?;
                body.kernel.port_mut(p)?.config_mut().pcm = pcm;
                Ok(())
            }
        }
    }

    /// Reads a config value. Executed inline.
    pub fn get_config(&self, id: ConfigId) -> Result<ConfigValue, IlError> {
        let body = self.0.body.lock().unwrap();
        Ok(match id {
            ConfigId::Volume => ConfigValue::Volume(body.volume),
            ConfigId::Mute => ConfigValue::Mute(body.muted),
            ConfigId::Position => ConfigValue::Position(body.position),
        })
    }

    /// Writes a config value and notifies the servant. Unlike parameters,
    /// configs may change while Executing.
    pub fn set_config(&self, value: ConfigValue) -> Result<(), IlError> {
        {
            let mut body = self.0.body.lock().unwrap();
            match value {
                ConfigValue::Volume(v) => {
                    if v > 100 {
                        return Err(IlError::BadParameter(format!("volume {v} out of range")));
                    }
                    body.volume = v;
                }
                ConfigValue::Mute(m) => body.muted = m,
                ConfigValue::Position(_) => {
                    return Err(IlError::BadParameter("position is read-only".into()));
                }
            }
        }

        self.post(Message::ConfigChange { id: value.id() })
    }

    /// Registers a client-allocated payload with a non-tunneled port and
    /// returns the header, owned by the client.
    pub fn use_buffer(&self, port: PortIndex, payload: Vec<u8>) -> Result<BufferHeader, IlError> {
        let id = self.0.id;
        self.with_body(|body, _out| {
            check_client_pool_mutable(body, port)?;
            let p = body.kernel.port_mut(port)?;
            if payload.len() < p.config().buffer_size {
                return Err(IlError::BadParameter(format!(
                    "payload of {} bytes is under the port minimum of {}",
                    payload.len(),
                    p.config().buffer_size
                )));
            }

            p.note_allocated(1);
            Ok(BufferHeader::with_payload(
                payload,
                AllocatorTag { component: id, port },
            ))
        })
    }

    /// Allocates a buffer on behalf of the client for a non-tunneled port
    /// and returns the header, owned by the client.
    pub fn allocate_buffer(&self, port: PortIndex) -> Result<BufferHeader, IlError> {
        let id = self.0.id;
        self.with_body(|body, _out| {
            check_client_pool_mutable(body, port)?;
            let p = body.kernel.port_mut(port)?;
            let size = p.config().buffer_size;
            p.note_allocated(1);
            Ok(BufferHeader::new(size, AllocatorTag { component: id, port }))
        })
    }

    /// Releases a client-owned header. The inverse of
    /// [`ComponentHandle::use_buffer`]/[`ComponentHandle::allocate_buffer`].
    pub fn free_buffer(&self, port: PortIndex, hdr: BufferHeader) -> Result<(), IlError> {
        self.with_body(|body, _out| {
            drop(hdr);
            body.kernel.port_mut(port)?.note_freed()
        })
    }

    /// Drops tunnel references and buffers unconditionally. Only for
    /// post-fault teardown; breaks the handle cycles between tunneled
    /// peers so the components can actually be freed.
    pub(crate) fn force_clear_tunnels(&self) {
        self.0.body.lock().unwrap().kernel.force_clear_tunnels();
    }

    /// Closes the mailbox and joins the worker. Idempotent.
    pub fn shutdown(&self) {
        self.0.mailbox.lock().unwrap().take();
        if let Some(worker) = self.0.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

fn check_deliverable(body: &Body, port: PortIndex, dir: PortDirection) -> Result<(), IlError> {
    let p = body.kernel.port(port)?;
    if p.direction() != dir {
        return Err(IlError::BadParameter(format!(
            "port {port} has the wrong direction for this call"
        )));
    }

    // A tunnel may hand buffers over while this side's own Idle command is
    // still in its mailbox; they park until the transition picks them up.
    // Clients get the strict state check.
    if !p.is_tunneled() && !body.accepts_buffers() {
        return Err(IlError::IncorrectStateOperation(format!(
            "component is {:?} and not accepting buffers",
            body.state
        )));
    }

    Ok(())
}

fn check_port_mutable(body: &Body, port: PortIndex) -> Result<(), IlError> {
    let enabled = body.kernel.port(port)?.is_enabled();
    if body.state != IlState::Loaded && enabled {
        return Err(IlError::IncorrectStateOperation(format!(
            "port {port} parameters are frozen while the port is enabled and the \
             component is {:?}",
            body.state
        )));
    }
    Ok(())
}

fn check_client_pool_mutable(body: &Body, port: PortIndex) -> Result<(), IlError> {
    let p = body.kernel.port(port)?;
    if p.is_tunneled() {
        return Err(IlError::BadParameter(format!(
            "port {port} is tunneled; its buffers are supplied by the tunnel"
        )));
    }

    let transitioning = matches!(
        body.pending,
        Some(PendingTransition {
            to: IlState::Idle | IlState::Loaded,
            ..
        })
    );
    if body.state != IlState::Loaded && !transitioning && p.is_enabled() {
        return Err(IlError::IncorrectStateOperation(format!(
            "client pool on port {port} is only mutable while Loaded, transitioning, \
             or with the port disabled"
        )));
    }

    Ok(())
}

/// Connects two ports into a tunnel.
///
/// Both components must be Loaded (or the ports disabled). The buffer
/// contract is negotiated as the pairwise maximum of the two ports'
/// minimums, and the downstream (input) side becomes the supplier.
pub fn connect_tunnel(
    upstream: &ComponentHandle,
    out_port: PortIndex,
    downstream: &ComponentHandle,
    in_port: PortIndex,
) -> Result<(), IlError> {
    let (up_count, up_size) = {
        let body = upstream.0.body.lock().unwrap();
        let p = body.kernel.port(out_port)?;
        if p.direction() != PortDirection::Output {
            return Err(IlError::BadParameter(format!(
                "tunnel upstream port {out_port} is not an output"
            )));
        }
        if body.state != IlState::Loaded && p.is_enabled() {
            return Err(IlError::IncorrectStateOperation(
                "tunnels can only form while Loaded or with the port disabled".into(),
            ));
        }
        (p.config().buffer_count, p.config().buffer_size)
    };

    let (count, size) = {
        let body = downstream.0.body.lock().unwrap();
        let p = body.kernel.port(in_port)?;
        if p.direction() != PortDirection::Input {
            return Err(IlError::BadParameter(format!(
                "tunnel downstream port {in_port} is not an input"
            )));
        }
        if body.state != IlState::Loaded && p.is_enabled() {
            return Err(IlError::IncorrectStateOperation(
                "tunnels can only form while Loaded or with the port disabled".into(),
            ));
        }
        (
            up_count.max(p.config().buffer_count),
            up_size.max(p.config().buffer_size),
        )
    };

    log::debug!(
        "tunneling {:?}:{out_port} -> {:?}:{in_port} ({count} x {size}B, input supplies)",
        upstream,
        downstream
    );

    upstream.0.body.lock().unwrap().kernel.set_tunnel(
        out_port,
        TunnelEnd {
            peer: downstream.clone(),
            peer_component: downstream.id(),
            peer_port: in_port,
            supplier: false,
            count,
            size,
        },
    )?;

    downstream.0.body.lock().unwrap().kernel.set_tunnel(
        in_port,
        TunnelEnd {
            peer: upstream.clone(),
            peer_component: upstream.id(),
            peer_port: out_port,
            supplier: true,
            count,
            size,
        },
    )?;

    Ok(())
}

/// Tears down a tunnel. Both ports must own no buffers (i.e. the
/// components are Loaded, or the ports disabled and depopulated).
pub fn disconnect_tunnel(
    upstream: &ComponentHandle,
    out_port: PortIndex,
    downstream: &ComponentHandle,
    in_port: PortIndex,
) -> Result<(), IlError> {
    upstream
        .0
        .body
        .lock()
        .unwrap()
        .kernel
        .clear_tunnel(out_port)?;
    downstream
        .0
        .body
        .lock()
        .unwrap()
        .kernel
        .clear_tunnel(in_port)?;
    Ok(())
}

/// Executes the cross-component effects queued while the lock was held.
///
/// Rejected deliveries re-park the header at its origin port: the buffer
/// is treated as discarded in flight, which is exactly the flush
/// semantics that cause rejections in the first place.
pub(crate) fn dispatch_outbound(core: &Arc<Shared>, out: Vec<Outbound>) {
    for action in out {
        match action {
            Outbound::Deliver {
                from,
                peer,
                port,
                hdr,
            } => {
                if let Err(rejected) = peer.empty_this_buffer(port, hdr) {
                    log::debug!(
                        "{}: delivery to {:?}:{port} rejected ({}), re-parking",
                        core.name,
                        peer,
                        rejected.error
                    );
                    repark(core, from, rejected.buffer);
                }
            }
            Outbound::Return {
                from,
                peer,
                port,
                hdr,
            } => {
                if let Err(rejected) = peer.fill_this_buffer(port, hdr) {
                    log::debug!(
                        "{}: return to {:?}:{port} rejected ({}), re-parking",
                        core.name,
                        peer,
                        rejected.error
                    );
                    repark(core, from, rejected.buffer);
                }
            }
            Outbound::GiveBack { peer, port, hdr } => {
                if let Err(err) = peer.return_buffer(port, hdr) {
                    log::warn!("{}: buffer give-back to {:?} failed: {err}", core.name, peer);
                }
            }
            Outbound::NotifyEnabled { peer, port } => peer.peer_port_enabled(port),
            Outbound::SelfNudge => {
                let mailbox = core.mailbox.lock().unwrap();
                if let Some(tx) = mailbox.as_ref() {
                    let _ = tx.send(Message::BuffersReady { port: PortIndex(0) });
                }
            }
            Outbound::Event(event) => {
                log::trace!("{}: event {:?}", core.name, event);
                core.events.emit(ComponentEvent {
                    component: core.id,
                    event,
                });
            }
        }
    }
}

fn repark(core: &Arc<Shared>, port: PortIndex, mut hdr: BufferHeader) {
    hdr.reset();
    let mut out = Vec::new();
    {
        let mut body = core.body.lock().unwrap();
        if let Ok(p) = body.kernel.port_mut(port) {
            p.park(hdr);
        }
        body.settle(&mut out);
    }
    dispatch_outbound(core, out);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::Receiver;
    use std::time::{Duration, Instant};

    use assert_matches::assert_matches;

    use super::*;
    use crate::il::buffer::BufferFlags;
    use crate::il::error::ErrorCode;
    use crate::il::event::CompletedCommand;
    use crate::il::format::PcmFormat;
    use crate::il::processor::ProcContext;

    const P0: PortIndex = PortIndex(0);

    fn wait_for(
        rx: &Receiver<ComponentEvent>,
        what: &str,
        mut pred: impl FnMut(&ComponentEvent) -> bool,
    ) -> ComponentEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let left = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| panic!("timed out waiting for {what}"));
            match rx.recv_timeout(left) {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) => continue,
                Err(err) => panic!("waiting for {what}: {err}"),
            }
        }
    }

    fn wait_for_state(rx: &Receiver<ComponentEvent>, id: ComponentId, state: IlState) {
        wait_for_states(rx, &[(id, state)]);
    }

    /// Waits for each (component, state) completion, in any order, without
    /// losing unrelated events... other than the ones it skips itself.
    fn wait_for_states(rx: &Receiver<ComponentEvent>, expected: &[(ComponentId, IlState)]) {
        let mut pending: Vec<(ComponentId, IlState)> = expected.to_vec();
        let deadline = Instant::now() + Duration::from_secs(5);

        while !pending.is_empty() {
            let left = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| panic!("timed out waiting for {pending:?}"));
            match rx.recv_timeout(left) {
                Ok(ComponentEvent {
                    component,
                    event:
                        Event::CmdComplete {
                            cmd: CompletedCommand::StateSet(s),
                            error: None,
                        },
                }) => pending.retain(|&(c, want)| !(c == component && want == s)),
                Ok(_) => continue,
                Err(err) => panic!("waiting for {pending:?}: {err}"),
            }
        }
    }

    /// Produces `total` counted bytes followed by a zero-sized EOS buffer.
    struct CountingProducer {
        total: usize,
        sent: usize,
        eos_sent: bool,
    }

    impl ProcessorOps for CountingProducer {
        fn buffers_ready(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
            while !self.eos_sent {
                let mut hdr = match ctx.claim(P0)? {
                    Some(hdr) => hdr,
                    None => break,
                };

                let n = (self.total - self.sent).min(hdr.capacity());
                if n == 0 {
                    hdr.set_region(0, 0)?;
                    hdr.flags = BufferFlags::EOS;
                    self.eos_sent = true;
                } else {
                    for (i, b) in hdr.space_mut()[..n].iter_mut().enumerate() {
                        *b = (self.sent + i) as u8;
                    }
                    hdr.set_region(0, n)?;
                    self.sent += n;
                }

                ctx.release(P0, hdr)?;
            }

            Ok(())
        }
    }

    /// Consumes buffers, recording payloads and reporting EOS upward.
    /// Zero-sized EOS buffers bypass the transform entirely.
    struct CollectingConsumer {
        data: Arc<Mutex<Vec<u8>>>,
        transforms: Arc<AtomicUsize>,
    }

    impl ProcessorOps for CollectingConsumer {
        fn buffers_ready(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
            loop {
                let mut hdr = match ctx.claim(P0)? {
                    Some(hdr) => hdr,
                    None => break,
                };

                let flags = hdr.flags;
                if hdr.filled() > 0 {
                    self.transforms.fetch_add(1, Ordering::SeqCst);
                    self.data.lock().unwrap().extend_from_slice(hdr.payload());
                    hdr.set_region(0, 0)?;
                }

                if flags.contains(BufferFlags::EOS) {
                    ctx.emit(Event::BufferFlag { port: P0, flags });
                }

                ctx.release(P0, hdr)?;
            }

            Ok(())
        }
    }

    fn consumer_def(count: usize, size: usize) -> ComponentDef {
        ComponentDef {
            name: "test.consumer".into(),
            role: "audio_renderer.test".into(),
            ports: vec![PortConfig::audio_input(count, size)],
        }
    }

    fn producer_def(count: usize, size: usize) -> ComponentDef {
        ComponentDef {
            name: "test.producer".into(),
            role: "audio_source.test".into(),
            ports: vec![PortConfig::audio_output(count, size)],
        }
    }

    fn spawn_consumer(
        id: u32,
        tx: std::sync::mpsc::Sender<ComponentEvent>,
    ) -> (ComponentHandle, Arc<Mutex<Vec<u8>>>, Arc<AtomicUsize>) {
        let data = Arc::new(Mutex::new(Vec::new()));
        let transforms = Arc::new(AtomicUsize::new(0));
        let handle = ComponentHandle::spawn(
            consumer_def(2, 16),
            ComponentId(id),
            Arc::new(tx),
            Box::new(CollectingConsumer {
                data: data.clone(),
                transforms: transforms.clone(),
            }),
        )
        .unwrap();

        (handle, data, transforms)
    }

    #[test_log::test]
    fn same_state_command_completes_immediately() {
        let (tx, rx) = channel();
        let (comp, _, _) = spawn_consumer(0, tx);

        comp.send_command(Command::StateSet(IlState::Loaded)).unwrap();
        wait_for_state(&rx, ComponentId(0), IlState::Loaded);
        assert_eq!(comp.state(), IlState::Loaded);

        comp.shutdown();
    }

    #[test_log::test]
    fn non_adjacent_transition_is_rejected() {
        let (tx, rx) = channel();
        let (comp, _, _) = spawn_consumer(0, tx);

        comp.send_command(Command::StateSet(IlState::Executing))
            .unwrap();
        let ev = wait_for(&rx, "rejection", |ev| matches!(ev.event, Event::Error { .. }));
        assert_matches!(
            ev.event,
            Event::Error {
                code: ErrorCode::IncorrectStateTransition,
                port: None,
            }
        );
        assert_eq!(comp.state(), IlState::Loaded);

        comp.shutdown();
    }

    #[test_log::test]
    fn disabling_a_disabled_port_succeeds_immediately() {
        let (tx, rx) = channel();
        let (comp, _, _) = spawn_consumer(0, tx);

        comp.send_command(Command::PortDisable(P0.into())).unwrap();
        wait_for(&rx, "first disable", |ev| {
            matches!(
                ev.event,
                Event::CmdComplete {
                    cmd: CompletedCommand::PortDisable(_),
                    error: None,
                }
            )
        });

        comp.send_command(Command::PortDisable(P0.into())).unwrap();
        wait_for(&rx, "second disable", |ev| {
            matches!(
                ev.event,
                Event::CmdComplete {
                    cmd: CompletedCommand::PortDisable(_),
                    error: None,
                }
            )
        });

        comp.shutdown();
    }

    #[test_log::test]
    fn port_parameters_survive_a_disable_enable_cycle() {
        let (tx, rx) = channel();
        let (comp, _, _) = spawn_consumer(0, tx);

        comp.send_command(Command::PortDisable(P0.into())).unwrap();
        wait_for(&rx, "disable", |ev| {
            matches!(
                ev.event,
                Event::CmdComplete {
                    cmd: CompletedCommand::PortDisable(_),
                    ..
                }
            )
        });

        let pcm = PcmFormat::new(48000, 1, 16).unwrap();
        comp.set_parameter(Parameter::Pcm(P0, pcm)).unwrap();

        comp.send_command(Command::PortEnable(P0.into())).unwrap();
        wait_for(&rx, "enable", |ev| {
            matches!(
                ev.event,
                Event::CmdComplete {
                    cmd: CompletedCommand::PortEnable(_),
                    ..
                }
            )
        });

        assert_eq!(
            comp.get_parameter(ParamId::Pcm(P0)).unwrap(),
            Parameter::Pcm(P0, pcm)
        );

        comp.shutdown();
    }

    #[test_log::test]
    fn client_buffer_lifecycle_balances() {
        let (tx, rx) = channel();
        let (comp, data, _) = spawn_consumer(3, tx);
        let id = ComponentId(3);

        // Register the client pool, then go to Idle.
        let b1 = comp.allocate_buffer(P0).unwrap();
        let b2 = comp.allocate_buffer(P0).unwrap();
        comp.send_command(Command::StateSet(IlState::Idle)).unwrap();
        wait_for_state(&rx, id, IlState::Idle);

        comp.send_command(Command::StateSet(IlState::Executing))
            .unwrap();
        wait_for_state(&rx, id, IlState::Executing);

        // Feed one data buffer and one EOS buffer.
        let mut b1 = b1;
        b1.space_mut()[..4].copy_from_slice(b"ring");
        b1.set_region(0, 4).unwrap();
        comp.empty_this_buffer(P0, b1).unwrap();

        let mut b2 = b2;
        b2.set_region(0, 0).unwrap();
        b2.flags = BufferFlags::EOS;
        comp.empty_this_buffer(P0, b2).unwrap();

        // Collect the EOS report and both buffer returns, in whatever
        // order they interleave.
        let mut returned = Vec::new();
        let mut eos_seen = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !(eos_seen && returned.len() == 2) {
            let left = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out draining events");
            match rx.recv_timeout(left).expect("event stream ended").event {
                Event::BufferFlag { flags, .. } if flags.contains(BufferFlags::EOS) => {
                    eos_seen = true;
                }
                Event::BufferReturned { buffer, .. } => returned.push(buffer),
                _ => {}
            }
        }
        assert_eq!(data.lock().unwrap().as_slice(), b"ring");

        // Descend. Freeing the pool completes Idle→Loaded.
        comp.send_command(Command::StateSet(IlState::Idle)).unwrap();
        wait_for_state(&rx, id, IlState::Idle);

        for hdr in returned {
            comp.free_buffer(P0, hdr).unwrap();
        }
        comp.send_command(Command::StateSet(IlState::Loaded)).unwrap();
        wait_for_state(&rx, id, IlState::Loaded);

        comp.shutdown();
    }

    #[test_log::test]
    fn zero_sized_eos_skips_the_transform_loop() {
        let (tx, rx) = channel();
        let (comp, data, transforms) = spawn_consumer(0, tx);
        let id = ComponentId(0);

        let b1 = comp.allocate_buffer(P0).unwrap();
        let b2 = comp.allocate_buffer(P0).unwrap();
        comp.send_command(Command::StateSet(IlState::Idle)).unwrap();
        wait_for_state(&rx, id, IlState::Idle);
        comp.send_command(Command::StateSet(IlState::Executing))
            .unwrap();
        wait_for_state(&rx, id, IlState::Executing);

        let mut eos = b1;
        eos.set_region(0, 0).unwrap();
        eos.flags = BufferFlags::EOS;
        comp.empty_this_buffer(P0, eos).unwrap();

        wait_for(&rx, "EOS flag", |ev| {
            matches!(ev.event, Event::BufferFlag { flags, .. } if flags.contains(BufferFlags::EOS))
        });

        assert_eq!(transforms.load(Ordering::SeqCst), 0);
        assert!(data.lock().unwrap().is_empty());

        drop(b2);
        comp.shutdown();
    }

    #[test_log::test]
    fn tunneled_pair_streams_to_eos_and_balances() {
        let (tx, rx) = channel();

        let producer = ComponentHandle::spawn(
            producer_def(2, 16),
            ComponentId(0),
            Arc::new(tx.clone()),
            Box::new(CountingProducer {
                total: 100,
                sent: 0,
                eos_sent: false,
            }),
        )
        .unwrap();

        let data = Arc::new(Mutex::new(Vec::new()));
        let transforms = Arc::new(AtomicUsize::new(0));
        let consumer = ComponentHandle::spawn(
            consumer_def(2, 16),
            ComponentId(1),
            Arc::new(tx),
            Box::new(CollectingConsumer {
                data: data.clone(),
                transforms: transforms.clone(),
            }),
        )
        .unwrap();

        connect_tunnel(&producer, P0, &consumer, P0).unwrap();

        for comp in [&consumer, &producer] {
            comp.send_command(Command::StateSet(IlState::Idle)).unwrap();
        }
        wait_for_states(
            &rx,
            &[
                (ComponentId(0), IlState::Idle),
                (ComponentId(1), IlState::Idle),
            ],
        );

        for comp in [&consumer, &producer] {
            comp.send_command(Command::StateSet(IlState::Executing))
                .unwrap();
        }
        wait_for_states(
            &rx,
            &[
                (ComponentId(0), IlState::Executing),
                (ComponentId(1), IlState::Executing),
            ],
        );

        wait_for(&rx, "EOS at the consumer", |ev| {
            ev.component == ComponentId(1)
                && matches!(
                    ev.event,
                    Event::BufferFlag { flags, .. } if flags.contains(BufferFlags::EOS)
                )
        });

        let collected = data.lock().unwrap().clone();
        assert_eq!(collected.len(), 100);
        let expected: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        pretty_assertions::assert_eq!(collected, expected);

        // Descend both components; ownership must balance for the Loaded
        // transitions to complete at all.
        for comp in [&producer, &consumer] {
            comp.send_command(Command::StateSet(IlState::Idle)).unwrap();
        }
        wait_for_states(
            &rx,
            &[
                (ComponentId(0), IlState::Idle),
                (ComponentId(1), IlState::Idle),
            ],
        );

        for comp in [&producer, &consumer] {
            comp.send_command(Command::StateSet(IlState::Loaded)).unwrap();
        }
        wait_for_states(
            &rx,
            &[
                (ComponentId(0), IlState::Loaded),
                (ComponentId(1), IlState::Loaded),
            ],
        );

        disconnect_tunnel(&producer, P0, &consumer, P0).unwrap();
        producer.shutdown();
        consumer.shutdown();
    }
}
