//! The port: a typed, directional endpoint holding buffers and format
//! parameters.
//!
//! A port never talks to its tunnel peer directly. The kernel is the single
//! entity that moves headers in and out; the port tracks custody (queued vs.
//! claimed), its enable/flush/disable state, and the tunnel bookkeeping.

use std::collections::VecDeque;

use super::buffer::BufferHeader;
use super::component::ComponentHandle;
use super::error::IlError;
use super::format::{Domain, Encoding, PcmFormat};
use super::{ComponentId, PortIndex};

/// The direction data flows across a port.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortDirection {
    /// Consumes buffers delivered by a peer or client.
    Input,
    /// Produces buffers toward a peer or client.
    Output,
}

/// The static description and format parameters of a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// Data direction.
    pub direction: PortDirection,
    /// Data domain.
    pub domain: Domain,
    /// Stream encoding crossing the port.
    pub encoding: Encoding,
    /// PCM parameters, meaningful when `encoding` is raw audio (and used as
    /// the negotiated format hint otherwise).
    pub pcm: PcmFormat,
    /// Minimum number of buffers the port needs to operate.
    pub buffer_count: usize,
    /// Minimum payload size of each buffer, in bytes.
    pub buffer_size: usize,
}

impl PortConfig {
    /// An audio input port with the given contract.
    pub fn audio_input(buffer_count: usize, buffer_size: usize) -> Self {
        Self {
            direction: PortDirection::Input,
            domain: Domain::Audio,
            encoding: Encoding::Unknown,
            pcm: PcmFormat::default(),
            buffer_count,
            buffer_size,
        }
    }

    /// An audio output port with the given contract.
    pub fn audio_output(buffer_count: usize, buffer_size: usize) -> Self {
        Self {
            direction: PortDirection::Output,
            domain: Domain::Audio,
            encoding: Encoding::Unknown,
            pcm: PcmFormat::default(),
            buffer_count,
            buffer_size,
        }
    }
}

/// Identifies a parameter on a component.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParamId {
    /// The content URI (sources only). Settable while Loaded.
    ContentUri,
    /// The full definition of a port.
    PortDefinition(PortIndex),
    /// The PCM format of a port.
    Pcm(PortIndex),
}

/// A parameter value, paired with what it identifies.
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    /// The content URI (sources only).
    ContentUri(String),
    /// The full definition of a port.
    PortDefinition(PortIndex, PortConfig),
    /// The PCM format of a port.
    Pcm(PortIndex, PcmFormat),
}

/// Identifies a config value on a component. Unlike parameters, configs may
/// change while the component is Executing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigId {
    /// Rendering volume, 0..=100.
    Volume,
    /// Rendering mute.
    Mute,
    /// Bytes rendered since the component entered Executing. Read-only.
    Position,
}

/// A config value, paired with what it identifies.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    /// Rendering volume, 0..=100.
    Volume(u32),
    /// Rendering mute.
    Mute(bool),
    /// Bytes rendered since the component entered Executing.
    Position(u64),
}

impl ConfigValue {
    /// The identifier for this value.
    pub fn id(&self) -> ConfigId {
        match self {
            ConfigValue::Volume(_) => ConfigId::Volume,
            ConfigValue::Mute(_) => ConfigId::Mute,
            ConfigValue::Position(_) => ConfigId::Position,
        }
    }
}

/// One end of a tunnel, as recorded on a port.
#[derive(Clone)]
pub(crate) struct TunnelEnd {
    /// The peer component's public handle, used for deliveries and returns.
    pub(crate) peer: ComponentHandle,
    pub(crate) peer_component: ComponentId,
    pub(crate) peer_port: PortIndex,
    /// Whether *this* port allocates and ultimately owns the tunnel's
    /// buffer pool.
    pub(crate) supplier: bool,
    /// Negotiated buffer count.
    pub(crate) count: usize,
    /// Negotiated buffer payload size.
    pub(crate) size: usize,
}

impl std::fmt::Debug for TunnelEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEnd")
            .field("peer", &self.peer_component)
            .field("peer_port", &self.peer_port)
            .field("supplier", &self.supplier)
            .field("count", &self.count)
            .field("size", &self.size)
            .finish()
    }
}

/// A port command whose completion is pending on buffer movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PortPending {
    Flush,
    Disable,
}

/// A typed endpoint on a component.
#[derive(Debug)]
pub(crate) struct Port {
    index: PortIndex,
    config: PortConfig,
    enabled: bool,
    flushing: bool,
    disabling: bool,
    pub(crate) pending: Option<PortPending>,
    pub(crate) tunnel: Option<TunnelEnd>,
    queue: VecDeque<BufferHeader>,
    claimed: usize,
    /// Headers created by this port (tunnel supplier) or registered by the
    /// client (`use_buffer`/`allocate_buffer`).
    allocated: usize,
}

impl Port {
    pub(crate) fn new(index: PortIndex, config: PortConfig) -> Self {
        Self {
            index,
            config,
            enabled: true,
            flushing: false,
            disabling: false,
            pending: None,
            tunnel: None,
            queue: VecDeque::new(),
            claimed: 0,
            allocated: 0,
        }
    }

    pub(crate) fn index(&self) -> PortIndex {
        self.index
    }

    pub(crate) fn config(&self) -> &PortConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut PortConfig {
        &mut self.config
    }

    pub(crate) fn direction(&self) -> PortDirection {
        self.config.direction
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn is_flushing(&self) -> bool {
        self.flushing
    }

    pub(crate) fn set_flushing(&mut self, flushing: bool) {
        self.flushing = flushing;
    }

    pub(crate) fn is_disabling(&self) -> bool {
        self.disabling
    }

    pub(crate) fn set_disabling(&mut self, disabling: bool) {
        self.disabling = disabling;
    }

    pub(crate) fn is_tunneled(&self) -> bool {
        self.tunnel.is_some()
    }

    /// Whether this port allocates the buffer pool. Client ports report
    /// false: the client owns its pool.
    pub(crate) fn is_supplier(&self) -> bool {
        self.tunnel.as_ref().map(|t| t.supplier).unwrap_or(false)
    }

    /// The number of headers this port currently holds, parked or claimed.
    pub(crate) fn owned(&self) -> usize {
        self.queue.len() + self.claimed
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn claimed(&self) -> usize {
        self.claimed
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated
    }

    pub(crate) fn note_allocated(&mut self, n: usize) {
        self.allocated += n;
    }

    pub(crate) fn note_freed(&mut self) -> Result<(), IlError> {
        if self.allocated == 0 {
            return Err(IlError::BadParameter(format!(
                "port {} has no buffers registered",
                self.index
            )));
        }
        self.allocated -= 1;
        Ok(())
    }

    pub(crate) fn drop_pool(&mut self) {
        self.queue.clear();
        self.allocated = 0;
    }

    /// The buffer count this port must reach to be populated.
    pub(crate) fn contract_count(&self) -> usize {
        self.tunnel
            .as_ref()
            .map(|t| t.count)
            .unwrap_or(self.config.buffer_count)
    }

    /// The negotiated payload size for the pool.
    pub(crate) fn contract_size(&self) -> usize {
        self.tunnel
            .as_ref()
            .map(|t| t.size)
            .unwrap_or(self.config.buffer_size)
    }

    /// Whether the port holds (or has registered) the full negotiated pool.
    ///
    /// A disabled port is trivially populated: it takes no part in buffer
    /// exchange.
    pub(crate) fn is_populated(&self) -> bool {
        if !self.enabled {
            return true;
        }

        match &self.tunnel {
            // Supplier: the pool has been allocated.
            Some(t) if t.supplier => self.allocated >= t.count,
            // Non-supplier: the peer's empties have arrived.
            Some(t) => self.owned() >= t.count,
            // Client port: the client registered the full pool.
            None => self.allocated >= self.config.buffer_count,
        }
    }

    /// Whether the port owns no buffers at all.
    pub(crate) fn is_depopulated(&self) -> bool {
        match &self.tunnel {
            Some(t) if t.supplier => self.allocated == 0 && self.owned() == 0,
            Some(_) => self.owned() == 0,
            None => self.allocated == 0 && self.owned() == 0,
        }
    }

    /// Dequeues the head buffer for the processor, if the port is in a
    /// state to hand one out.
    ///
    /// A *disabling* port still hands data buffers out: disable is a
    /// graceful drain, and the releases route home as the processor
    /// finishes each one. Empties are already home and stay parked, which
    /// is also what keeps the drain from re-claiming what it just
    /// returned. Flush is the discarding path and blocks the claim
    /// entirely.
    pub(crate) fn claim(&mut self) -> Option<BufferHeader> {
        if !self.enabled || self.flushing {
            return None;
        }

        if self.disabling && self.queue.front().map(|h| h.filled() == 0).unwrap_or(true) {
            return None;
        }

        let hdr = self.queue.pop_front()?;
        self.claimed += 1;
        Some(hdr)
    }

    /// Accepts a header back from the processor.
    pub(crate) fn unclaim(&mut self) -> Result<(), IlError> {
        if self.claimed == 0 {
            return Err(IlError::BadParameter(format!(
                "port {} released a buffer it never claimed",
                self.index
            )));
        }
        self.claimed -= 1;
        Ok(())
    }

    /// Parks a header at the back of the queue.
    pub(crate) fn park(&mut self, mut hdr: BufferHeader) {
        hdr.port = self.index;
        self.queue.push_back(hdr);
    }

    /// Parks a header at the front of the queue, preserving arrival order
    /// after a rejected forward.
    pub(crate) fn park_front(&mut self, mut hdr: BufferHeader) {
        hdr.port = self.index;
        self.queue.push_front(hdr);
    }

    /// Accepts a delivery from a peer or client, in arrival order.
    pub(crate) fn deliver(&mut self, hdr: BufferHeader) -> Result<(), RejectedBuffer> {
        if !self.enabled || self.disabling {
            return Err(RejectedBuffer {
                error: IlError::IncorrectStateOperation(format!(
                    "port {} is disabled",
                    self.index
                )),
                buffer: hdr,
            });
        }

        // Flush wins the race with a fresh delivery: the buffer goes back
        // unconsumed.
        if self.flushing {
            return Err(RejectedBuffer {
                error: IlError::IncorrectStateOperation(format!(
                    "port {} is flushing",
                    self.index
                )),
                buffer: hdr,
            });
        }

        self.park(hdr);
        Ok(())
    }

    /// Removes every parked header, in arrival order.
    pub(crate) fn drain(&mut self) -> Vec<BufferHeader> {
        self.queue.drain(..).collect()
    }

    /// Takes one parked header from the front, bypassing the claim
    /// bookkeeping. Used by the kernel's redistribution paths.
    pub(crate) fn take_front(&mut self) -> Option<BufferHeader> {
        self.queue.pop_front()
    }
}

/// A buffer handed back to the caller because the target port could not
/// accept it. Ownership of the header returns with the error.
#[derive(Debug)]
pub struct RejectedBuffer {
    /// Why the delivery was refused.
    pub error: IlError,
    /// The refused header, returned unconsumed.
    pub buffer: BufferHeader,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::buffer::AllocatorTag;

    fn hdr(n: u8) -> BufferHeader {
        let mut h = BufferHeader::new(4, AllocatorTag {
            component: ComponentId(0),
            port: PortIndex(0),
        });
        h.space_mut()[0] = n;
        h.set_region(0, 1).unwrap();
        h
    }

    fn port() -> Port {
        Port::new(PortIndex(0), PortConfig::audio_input(2, 4))
    }

    #[test]
    fn claims_follow_arrival_order() {
        let mut p = port();
        p.deliver(hdr(1)).unwrap();
        p.deliver(hdr(2)).unwrap();
        p.deliver(hdr(3)).unwrap();

        assert_eq!(p.claim().unwrap().payload(), &[1]);
        assert_eq!(p.claim().unwrap().payload(), &[2]);
        assert_eq!(p.claim().unwrap().payload(), &[3]);
        assert!(p.claim().is_none());
        assert_eq!(p.claimed(), 3);
    }

    #[test]
    fn disabled_port_rejects_deliveries() {
        let mut p = port();
        p.set_enabled(false);

        let rejected = p.deliver(hdr(1)).unwrap_err();
        assert_eq!(rejected.buffer.payload(), &[1]);
        assert_eq!(p.owned(), 0);
    }

    #[test]
    fn flush_wins_the_race_with_a_fresh_delivery() {
        let mut p = port();
        p.deliver(hdr(1)).unwrap();
        p.set_flushing(true);

        // The late buffer comes straight back, unconsumed.
        let rejected = p.deliver(hdr(2)).unwrap_err();
        assert_eq!(rejected.buffer.payload(), &[2]);

        // And nothing can be claimed while flushing.
        assert!(p.claim().is_none());
    }

    #[test]
    fn client_port_population_tracks_registrations() {
        let mut p = port();
        assert!(!p.is_populated());
        p.note_allocated(1);
        assert!(!p.is_populated());
        p.note_allocated(1);
        assert!(p.is_populated());

        p.note_freed().unwrap();
        p.note_freed().unwrap();
        assert!(p.note_freed().is_err());
        assert!(p.is_depopulated());
    }
}
