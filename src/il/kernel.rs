//! The kernel: per-component custodian of ports and buffers.
//!
//! The kernel is the only entity that moves buffer headers between "parked
//! in a port" and "claimed by the processor", and it executes the
//! port-facing protocols (populate, flush, disable, enable, depopulate) on
//! behalf of the component.
//!
//! Kernel methods never call into a peer component directly. Anything that
//! must leave the component (a delivery, a buffer return, an upward event)
//! is appended to an [`Outbound`] list that the shell dispatches *after*
//! releasing the component's lock. That one rule keeps the lock order
//! acyclic across a tunneled graph.

use super::buffer::{AllocatorTag, BufferHeader};
use super::component::ComponentHandle;
use super::error::IlError;
use super::event::{CompletedCommand, Event, PortSelector};
use super::port::{Port, PortConfig, PortDirection, PortPending, RejectedBuffer, TunnelEnd};
use super::{ComponentId, PortIndex};

/// An action to perform after the component's lock is released.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Forward a filled buffer downstream (`empty_this_buffer` on the peer).
    Deliver {
        /// The local port the buffer left from, for re-parking on
        /// rejection.
        from: PortIndex,
        peer: ComponentHandle,
        port: PortIndex,
        hdr: BufferHeader,
    },
    /// Hand an emptied buffer back upstream (`fill_this_buffer` on the
    /// peer).
    Return {
        /// The local port the buffer left from, for re-parking on
        /// rejection.
        from: PortIndex,
        peer: ComponentHandle,
        port: PortIndex,
        hdr: BufferHeader,
    },
    /// Return a buffer to its supplier outside the data path (flush,
    /// disable, depopulate).
    GiveBack {
        peer: ComponentHandle,
        port: PortIndex,
        hdr: BufferHeader,
    },
    /// Tell the peer this end of the tunnel is enabled again, so it can
    /// redistribute any stranded empties.
    NotifyEnabled {
        peer: ComponentHandle,
        port: PortIndex,
    },
    /// Re-nudge this component's own servant; buffers parked during a
    /// transition are ready to move again.
    SelfNudge,
    /// Report an event upward.
    Event(Event),
}

/// Per-component buffer custodian.
pub(crate) struct Kernel {
    component: ComponentId,
    ports: Vec<Port>,
}

impl Kernel {
    pub(crate) fn new(component: ComponentId, configs: Vec<PortConfig>) -> Self {
        let ports = configs
            .into_iter()
            .enumerate()
            .map(|(i, cfg)| Port::new(PortIndex(i as u32), cfg))
            .collect();

        Self { component, ports }
    }

    pub(crate) fn port(&self, index: PortIndex) -> Result<&Port, IlError> {
        self.ports
            .get(index.0 as usize)
            .ok_or_else(|| IlError::BadParameter(format!("no port {index}")))
    }

    pub(crate) fn port_mut(&mut self, index: PortIndex) -> Result<&mut Port, IlError> {
        self.ports
            .get_mut(index.0 as usize)
            .ok_or_else(|| IlError::BadParameter(format!("no port {index}")))
    }

    pub(crate) fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter()
    }

    fn selected(&self, sel: PortSelector) -> Vec<PortIndex> {
        match sel {
            PortSelector::All => self.ports.iter().map(|p| p.index()).collect(),
            PortSelector::One(i) => vec![i],
        }
    }

    pub(crate) fn has_port(&self, index: PortIndex) -> bool {
        (index.0 as usize) < self.ports.len()
    }

    /// Records one end of a tunnel on a port.
    pub(crate) fn set_tunnel(&mut self, port: PortIndex, end: TunnelEnd) -> Result<(), IlError> {
        self.port_mut(port)?.tunnel = Some(end);
        Ok(())
    }

    /// Drops every tunnel reference and every buffer, regardless of
    /// custody state. Only for post-fault teardown, where the peers are
    /// being destroyed too.
    pub(crate) fn force_clear_tunnels(&mut self) {
        for port in &mut self.ports {
            port.tunnel = None;
            port.drop_pool();
        }
    }

    /// Clears the tunnel on a port. The port must own no buffers.
    pub(crate) fn clear_tunnel(&mut self, port: PortIndex) -> Result<(), IlError> {
        let p = self.port_mut(port)?;
        if p.owned() != 0 {
            return Err(IlError::IncorrectStateOperation(format!(
                "port {} still owns {} buffers",
                port,
                p.owned()
            )));
        }

        p.tunnel = None;
        Ok(())
    }

    // ---- population ----

    /// Allocates and distributes buffers for every enabled port, as part of
    /// the Loaded→Idle transition. Supplier ports allocate their pool
    /// synchronously; non-supplier and client ports become populated as
    /// buffers arrive from outside.
    pub(crate) fn populate(&mut self, out: &mut Vec<Outbound>) {
        for i in 0..self.ports.len() {
            let index = PortIndex(i as u32);
            if self.ports[i].is_enabled() && self.ports[i].is_supplier() {
                self.allocate_pool(index, out);
            }
        }
    }

    /// Allocates a supplier port's negotiated pool and routes the empties:
    /// an input supplier pushes them upstream to be filled, an output
    /// supplier parks them for its own processor.
    fn allocate_pool(&mut self, index: PortIndex, out: &mut Vec<Outbound>) {
        let component = self.component;
        let port = &mut self.ports[index.0 as usize];
        let count = port.contract_count();
        let size = port.contract_size();
        let tag = AllocatorTag { component, port: index };

        port.note_allocated(count);
        log::debug!(
            "{:?} port {index}: allocated {count} x {size}B tunnel buffers",
            component
        );

        for _ in 0..count {
            let hdr = BufferHeader::new(size, tag);
            match port.direction() {
                PortDirection::Input => {
                    let t = port.tunnel.as_ref().expect("supplier port has a tunnel");
                    out.push(Outbound::Return {
                        from: index,
                        peer: t.peer.clone(),
                        port: t.peer_port,
                        hdr,
                    });
                }
                PortDirection::Output => port.park(hdr),
            }
        }
    }

    /// Starts returning buffers home for the Idle→Loaded transition.
    /// Completion is deferred until [`Kernel::all_depopulated`] holds; call
    /// [`Kernel::continue_depopulate`] again as returns arrive.
    pub(crate) fn depopulate(&mut self, out: &mut Vec<Outbound>) {
        for port in &mut self.ports {
            match (&port.tunnel, port.is_supplier()) {
                // Non-supplier: everything parked here belongs to the peer.
                (Some(_), false) => {
                    let t = port.tunnel.clone().unwrap();
                    for hdr in port.drain() {
                        out.push(Outbound::GiveBack {
                            peer: t.peer.clone(),
                            port: t.peer_port,
                            hdr,
                        });
                    }
                }
                // Client port: hand parked headers back to the client; the
                // client completes the protocol with `free_buffer`.
                (None, _) => {
                    let index = port.index();
                    for hdr in port.drain() {
                        out.push(Outbound::Event(Event::BufferReturned {
                            port: index,
                            buffer: hdr,
                        }));
                    }
                }
                // Supplier: wait for the pool to come home.
                (Some(_), true) => {}
            }
        }

        self.continue_depopulate();
    }

    /// Drops any supplier pool whose buffers are all home. Called whenever
    /// a return arrives while the component is descending to Loaded.
    pub(crate) fn continue_depopulate(&mut self) {
        for port in &mut self.ports {
            if port.is_supplier()
                && port.allocated() > 0
                && port.claimed() == 0
                && port.queued() == port.allocated()
            {
                log::debug!("port {}: pool back home, freeing", port.index());
                port.drop_pool();
            }
        }
    }

    pub(crate) fn all_populated(&self) -> bool {
        self.ports.iter().all(|p| p.is_populated())
    }

    pub(crate) fn first_unpopulated(&self) -> Option<PortIndex> {
        self.ports
            .iter()
            .find(|p| !p.is_populated())
            .map(|p| p.index())
    }

    pub(crate) fn all_depopulated(&self) -> bool {
        self.ports.iter().all(|p| p.is_depopulated())
    }

    /// Whether no port has a buffer out at the processor.
    pub(crate) fn quiesced(&self) -> bool {
        self.ports.iter().all(|p| p.claimed() == 0)
    }

    // ---- data path ----

    /// Accepts a buffer from a peer or client, in arrival order.
    pub(crate) fn deliver(
        &mut self,
        index: PortIndex,
        hdr: BufferHeader,
    ) -> Result<(), RejectedBuffer> {
        let port = match self.port_mut(index) {
            Ok(p) => p,
            Err(error) => return Err(RejectedBuffer { error, buffer: hdr }),
        };

        port.deliver(hdr)
    }

    /// Hands the head buffer of a port to the processor, if one is ready.
    pub(crate) fn claim(&mut self, index: PortIndex) -> Result<Option<BufferHeader>, IlError> {
        Ok(self.port_mut(index)?.claim())
    }

    /// Accepts a buffer back from the processor and routes it onward.
    ///
    /// `parking` is set while the component is descending from
    /// Executing/Paused to Idle: released buffers are then parked in their
    /// port instead of forwarded, so ownership balances before the
    /// transition completes.
    pub(crate) fn release(
        &mut self,
        index: PortIndex,
        hdr: BufferHeader,
        parking: bool,
        out: &mut Vec<Outbound>,
    ) -> Result<(), IlError> {
        let port = self.port_mut(index)?;
        port.unclaim()?;

        if parking {
            port.park(hdr);
            return Ok(());
        }

        if port.is_flushing() || port.is_disabling() {
            Self::to_origin(port, hdr, out);
            return Ok(());
        }

        match &port.tunnel {
            Some(t) => {
                let (peer, peer_port) = (t.peer.clone(), t.peer_port);
                match port.direction() {
                    // Filled buffers travel downstream.
                    PortDirection::Output => out.push(Outbound::Deliver {
                        from: index,
                        peer,
                        port: peer_port,
                        hdr,
                    }),
                    // Emptied buffers travel back upstream.
                    PortDirection::Input => {
                        let mut hdr = hdr;
                        hdr.reset();
                        out.push(Outbound::Return {
                            from: index,
                            peer,
                            port: peer_port,
                            hdr,
                        });
                    }
                }
            }
            None => out.push(Outbound::Event(Event::BufferReturned {
                port: index,
                buffer: hdr,
            })),
        }

        Ok(())
    }

    /// Routes a buffer to the supplier side without processing.
    fn to_origin(port: &mut Port, mut hdr: BufferHeader, out: &mut Vec<Outbound>) {
        if port.is_supplier() {
            // Supplier port: the buffer is home.
            hdr.reset();
            port.park(hdr);
        } else if let Some(t) = port.tunnel.clone() {
            out.push(Outbound::GiveBack {
                peer: t.peer,
                port: t.peer_port,
                hdr,
            });
        } else {
            // Client pool: return upward.
            out.push(Outbound::Event(Event::BufferReturned {
                port: port.index(),
                buffer: hdr,
            }));
        }
    }

    /// Accepts a cancellation-path return from the peer (the counterpart of
    /// [`Outbound::GiveBack`]). The buffer is parked home regardless of the
    /// port's flush/disable state.
    pub(crate) fn take_back(&mut self, index: PortIndex, mut hdr: BufferHeader) -> Result<(), IlError> {
        let port = self.port_mut(index)?;
        hdr.reset();
        port.park(hdr);
        Ok(())
    }

    // ---- port protocols ----

    /// Starts flushing the selected ports: parked buffers go back to the
    /// supplier side immediately; completion waits for claimed buffers to
    /// be released.
    pub(crate) fn flush(&mut self, sel: PortSelector, out: &mut Vec<Outbound>) {
        for index in self.selected(sel) {
            let port = &mut self.ports[index.0 as usize];

            port.set_flushing(true);
            port.pending = Some(PortPending::Flush);

            let parked = port.drain();
            for hdr in parked {
                Self::to_origin(port, hdr, out);
            }
        }
    }

    /// Starts disabling the selected ports. Already-disabled ports complete
    /// immediately with success.
    pub(crate) fn disable(&mut self, sel: PortSelector, out: &mut Vec<Outbound>) {
        for index in self.selected(sel) {
            let port = &mut self.ports[index.0 as usize];

            if !port.is_enabled() {
                out.push(Outbound::Event(Event::CmdComplete {
                    cmd: CompletedCommand::PortDisable(index),
                    error: None,
                }));
                continue;
            }

            port.set_disabling(true);
            port.pending = Some(PortPending::Disable);

            if !port.is_supplier() {
                // Foreign buffers go back to their supplier. A supplier
                // port instead waits for its own pool to come home.
                let parked = port.drain();
                for hdr in parked {
                    Self::to_origin(port, hdr, out);
                }
            } else if port.queued() > 0 {
                // Give the processor a chance to drain what's parked
                // before the pool is reclaimed.
                out.push(Outbound::SelfNudge);
            }
        }
    }

    /// Enables the selected ports, reallocating the pool if this side is
    /// the supplier and the component already holds buffers (`populate_now`
    /// is set for Idle and above).
    pub(crate) fn enable(
        &mut self,
        sel: PortSelector,
        populate_now: bool,
        out: &mut Vec<Outbound>,
    ) {
        for index in self.selected(sel) {
            let was_enabled = {
                let port = &mut self.ports[index.0 as usize];
                if port.is_enabled() {
                    true
                } else {
                    port.set_enabled(true);
                    port.set_disabling(false);
                    port.set_flushing(false);
                    false
                }
            };

            if was_enabled {
                out.push(Outbound::Event(Event::CmdComplete {
                    cmd: CompletedCommand::PortEnable(index),
                    error: None,
                }));
                continue;
            }

            if populate_now && self.ports[index.0 as usize].is_supplier() {
                self.allocate_pool(index, out);
            }

            // Completion goes out before the peer notification: the
            // notification can cascade all the way to an EOS report, and
            // the graph must observe the enable first.
            out.push(Outbound::Event(Event::CmdComplete {
                cmd: CompletedCommand::PortEnable(index),
                error: None,
            }));

            if let Some(t) = &self.ports[index.0 as usize].tunnel {
                out.push(Outbound::NotifyEnabled {
                    peer: t.peer.clone(),
                    port: t.peer_port,
                });
            }
        }
    }

    /// Reacts to the peer end of a tunnel becoming enabled: an input
    /// supplier pushes any stranded empties back upstream.
    pub(crate) fn peer_port_enabled(&mut self, index: PortIndex, out: &mut Vec<Outbound>) {
        let Ok(port) = self.port_mut(index) else {
            return;
        };

        if !port.is_enabled()
            || !port.is_supplier()
            || port.direction() != PortDirection::Input
        {
            return;
        }

        let t = port.tunnel.clone().expect("supplier port has a tunnel");
        while let Some(mut hdr) = port.take_front() {
            hdr.reset();
            out.push(Outbound::Return {
                from: index,
                peer: t.peer.clone(),
                port: t.peer_port,
                hdr,
            });
        }
    }

    /// Re-checks deferred flush/disable completions. Call after any buffer
    /// movement.
    pub(crate) fn settle_port_commands(&mut self, out: &mut Vec<Outbound>) {
        for port in &mut self.ports {
            match port.pending {
                Some(PortPending::Flush) if port.claimed() == 0 => {
                    port.set_flushing(false);
                    port.pending = None;
                    out.push(Outbound::Event(Event::CmdComplete {
                        cmd: CompletedCommand::Flush(port.index()),
                        error: None,
                    }));
                }
                Some(PortPending::Disable) => {
                    let done = if port.is_supplier() {
                        port.claimed() == 0 && port.queued() == port.allocated()
                    } else if port.is_tunneled() {
                        port.owned() == 0
                    } else {
                        // Client port: wait for the client to free its pool.
                        port.owned() == 0 && port.allocated() == 0
                    };

                    if done {
                        if port.is_supplier() {
                            port.drop_pool();
                        }
                        port.set_enabled(false);
                        port.set_disabling(false);
                        port.pending = None;
                        out.push(Outbound::Event(Event::CmdComplete {
                            cmd: CompletedCommand::PortDisable(port.index()),
                            error: None,
                        }));
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::il::buffer::BufferFlags;

    fn kernel() -> Kernel {
        Kernel::new(
            ComponentId(7),
            vec![PortConfig::audio_input(2, 8), PortConfig::audio_output(2, 8)],
        )
    }

    fn hdr(n: u8) -> BufferHeader {
        let mut h = BufferHeader::new(
            8,
            AllocatorTag {
                component: ComponentId(0),
                port: PortIndex(0),
            },
        );
        h.space_mut()[0] = n;
        h.set_region(0, 1).unwrap();
        h
    }

    #[test]
    fn client_flush_returns_everything_upward() {
        let mut k = kernel();
        let mut out = Vec::new();

        k.deliver(PortIndex(0), hdr(1)).unwrap();
        k.deliver(PortIndex(0), hdr(2)).unwrap();
        let claimed = k.claim(PortIndex(0)).unwrap().unwrap();
        assert_eq!(claimed.payload(), &[1]);

        k.flush(PortSelector::One(PortIndex(0)), &mut out);

        // The parked buffer is returned in arrival order; the claimed one
        // is still out, so the flush is not complete yet.
        assert_matches!(
            out.as_slice(),
            [Outbound::Event(Event::BufferReturned { .. })]
        );
        k.settle_port_commands(&mut out);
        assert_eq!(out.len(), 1);

        // Releasing the claimed buffer while flushing routes it to origin,
        // then the flush completes with no buffer left out at the
        // processor.
        k.release(PortIndex(0), claimed, false, &mut out).unwrap();
        k.settle_port_commands(&mut out);

        assert_matches!(
            out.last(),
            Some(Outbound::Event(Event::CmdComplete {
                cmd: CompletedCommand::Flush(p),
                error: None,
            })) if *p == PortIndex(0)
        );
        assert_eq!(k.port(PortIndex(0)).unwrap().claimed(), 0);
        assert_eq!(k.port(PortIndex(0)).unwrap().owned(), 0);
    }

    #[test]
    fn disabling_an_already_disabled_port_completes_immediately() {
        let mut k = kernel();
        let mut out = Vec::new();

        k.port_mut(PortIndex(0)).unwrap().set_enabled(false);
        k.disable(PortSelector::One(PortIndex(0)), &mut out);

        assert_matches!(
            out.as_slice(),
            [Outbound::Event(Event::CmdComplete {
                cmd: CompletedCommand::PortDisable(p),
                error: None,
            })] if *p == PortIndex(0)
        );
    }

    #[test]
    fn deliver_to_disabled_port_hands_the_buffer_back() {
        let mut k = kernel();
        k.port_mut(PortIndex(0)).unwrap().set_enabled(false);

        let rejected = k.deliver(PortIndex(0), hdr(9)).unwrap_err();
        assert_eq!(rejected.buffer.payload(), &[9]);
        assert_matches!(rejected.error, IlError::IncorrectStateOperation(_));
    }

    #[test]
    fn release_without_tunnel_returns_upward() {
        let mut k = kernel();
        let mut out = Vec::new();

        k.deliver(PortIndex(0), hdr(3)).unwrap();
        let b = k.claim(PortIndex(0)).unwrap().unwrap();
        k.release(PortIndex(0), b, false, &mut out).unwrap();

        assert_matches!(
            out.as_slice(),
            [Outbound::Event(Event::BufferReturned { port, .. })] if *port == PortIndex(0)
        );
    }

    #[test]
    fn parking_keeps_the_port_populated() {
        let mut k = kernel();
        let mut out = Vec::new();

        let mut b = hdr(4);
        b.flags = BufferFlags::EOS;
        k.deliver(PortIndex(0), b).unwrap();
        let b = k.claim(PortIndex(0)).unwrap().unwrap();

        k.release(PortIndex(0), b, true, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(k.port(PortIndex(0)).unwrap().owned(), 1);
        assert!(k.quiesced());
    }

    #[test]
    fn client_population_is_registration_driven() {
        let mut k = kernel();
        assert!(!k.all_populated());
        assert_eq!(k.first_unpopulated(), Some(PortIndex(0)));

        k.port_mut(PortIndex(0)).unwrap().note_allocated(2);
        k.port_mut(PortIndex(1)).unwrap().note_allocated(2);
        assert!(k.all_populated());
        assert!(!k.all_depopulated());
    }
}
