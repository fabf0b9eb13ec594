//! The writer sink: renders PCM to a blocking byte sink.
//!
//! The sink applies volume and mute between buffers, counts rendered
//! bytes for the position surface, and reports `EOS` upward once the
//! buffer that carried it has been consumed. Sinks backed by a file
//! descriptor register writable-interest with the graph reactor and are
//! nudged from there; a `WouldBlock` mid-buffer parks the buffer at the
//! head of its port until the next nudge.

use std::io::{self, Write};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::graph::ReactorHandle;
use crate::il::{
    BufferFlags, ComponentDef, Event, IlError, PcmFormat, PortConfig, PortIndex, ProcContext,
    ProcessorOps,
};

const IN: PortIndex = PortIndex(0);

/// The component definition for the writer sink.
pub fn definition() -> ComponentDef {
    ComponentDef {
        name: "adagio.audio_renderer.writer".into(),
        role: "audio_renderer.pcm".into(),
        ports: vec![PortConfig::audio_input(4, 8192)],
    }
}

/// Where rendered samples go.
///
/// `write` may return `WouldBlock`; fd-backed implementations should also
/// return their fd so the reactor can deliver readiness.
pub trait SampleSink: Send + 'static {
    /// Called when the stream format is (re)negotiated, before any
    /// samples in that format are written.
    fn configure(&mut self, pcm: &PcmFormat) -> io::Result<()> {
        let _ = pcm;
        Ok(())
    }

    /// Writes rendered bytes. Returns the number accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// The fd to poll for writability, for sinks that have one.
    fn writable_fd(&self) -> Option<RawFd> {
        None
    }
}

/// A sink that collects samples into shared memory. Used by tests and
/// useful as a capture device.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes rendered so far.
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    /// The number of bytes rendered so far.
    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    /// Whether nothing has been rendered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SampleSink for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Wraps an inner writer and paces writes to real time, so a pipeline
/// plays a stream over its natural duration instead of as fast as the
/// disk allows.
pub struct PacedSink<W> {
    inner: W,
    byte_rate: u64,
    started: Option<Instant>,
    written: u64,
}

impl<W> std::fmt::Debug for PacedSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacedSink")
            .field("byte_rate", &self.byte_rate)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl<W: Write + Send + 'static> PacedSink<W> {
    /// Creates a paced sink over `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            byte_rate: 0,
            started: None,
            written: 0,
        }
    }
}

impl<W: Write + Send + 'static> SampleSink for PacedSink<W> {
    fn configure(&mut self, pcm: &PcmFormat) -> io::Result<()> {
        self.byte_rate = pcm.byte_rate();
        self.started = None;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let started = *self.started.get_or_insert_with(Instant::now);

        if self.byte_rate > 0 {
            let due = Duration::from_secs_f64(self.written as f64 / self.byte_rate as f64);
            let elapsed = started.elapsed();
            if due > elapsed {
                std::thread::sleep(due - elapsed);
            }
        }

        // Bounded chunks keep the pacing granular.
        let n = buf.len().min(4096);
        self.inner.write_all(&buf[..n])?;
        self.written += n as u64;
        Ok(n)
    }
}

/// Processor ops for the writer sink.
pub struct WriterSinkOps {
    sink: Box<dyn SampleSink>,
    reactor: Option<ReactorHandle>,
    registered_fd: Option<RawFd>,
    scratch: Vec<u8>,
}

impl std::fmt::Debug for WriterSinkOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterSinkOps")
            .field("registered_fd", &self.registered_fd)
            .finish_non_exhaustive()
    }
}

impl WriterSinkOps {
    /// Creates the ops around a sample sink. With a reactor handle, an
    /// fd-backed sink gets readiness nudges instead of busy retries.
    pub fn new(sink: Box<dyn SampleSink>, reactor: Option<ReactorHandle>) -> Self {
        Self {
            sink,
            reactor,
            registered_fd: None,
            scratch: Vec::new(),
        }
    }

    /// Scales a chunk into the scratch buffer per the current volume and
    /// mute settings.
    fn prepare_chunk(&mut self, payload: &[u8], volume: u32, muted: bool, pcm: &PcmFormat) {
        self.scratch.clear();
        self.scratch.extend_from_slice(payload);

        if muted {
            self.scratch.fill(0);
            return;
        }

        if volume == 100 {
            return;
        }

        match pcm.bits_per_sample {
            16 => {
                for chunk in self.scratch.chunks_exact_mut(2) {
                    let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                    let scaled = (sample as i32 * volume as i32 / 100) as i16;
                    chunk.copy_from_slice(&scaled.to_le_bytes());
                }
            }
            32 => {
                for chunk in self.scratch.chunks_exact_mut(4) {
                    let sample = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let scaled = (sample as i64 * volume as i64 / 100) as i32;
                    chunk.copy_from_slice(&scaled.to_le_bytes());
                }
            }
            // 8 and 24 bit streams pass through unscaled.
            _ => {}
        }
    }
}

impl ProcessorOps for WriterSinkOps {
    fn prepare_to_transfer(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        let pcm = ctx.port_config(IN)?.pcm;
        self.sink
            .configure(&pcm)
            .map_err(|e| IlError::InsufficientResources(format!("configuring sink: {e}")))?;
        ctx.reset_position();

        if let (Some(reactor), Some(fd)) = (&self.reactor, self.sink.writable_fd()) {
            if self.registered_fd != Some(fd) {
                reactor.register_writable(fd, ctx.self_handle(), IN)?;
                self.registered_fd = Some(fd);
            }
        }

        Ok(())
    }

    fn stop_and_return(&mut self, _ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        if let (Some(reactor), Some(fd)) = (&self.reactor, self.registered_fd.take()) {
            let _ = reactor.deregister(fd);
        }
        Ok(())
    }

    fn port_enable(&mut self, ctx: &mut ProcContext<'_>, port: PortIndex) -> Result<(), IlError> {
        if port == IN {
            // The tunnel cycled with new parameters.
            let pcm = ctx.port_config(IN)?.pcm;
            self.sink
                .configure(&pcm)
                .map_err(|e| IlError::InsufficientResources(format!("reconfiguring sink: {e}")))?;
        }
        Ok(())
    }

    fn buffers_ready(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        loop {
            let mut hdr = match ctx.claim(IN)? {
                Some(hdr) => hdr,
                None => return Ok(()),
            };

            let flags = hdr.flags;
            let volume = ctx.volume();
            let muted = ctx.muted();
            let pcm = ctx.port_config(IN)?.pcm;

            while hdr.filled() > 0 {
                // Scale into the scratch buffer so a partial write never
                // double-scales the remainder.
                self.prepare_chunk(hdr.payload(), volume, muted, &pcm);

                match self.sink.write(&self.scratch) {
                    Ok(0) => {
                        ctx.defer(IN, hdr)?;
                        return Err(IlError::NotReady);
                    }
                    Ok(n) => {
                        hdr.consume(n);
                        ctx.add_position(n as u64);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        ctx.defer(IN, hdr)?;
                        return Err(IlError::NotReady);
                    }
                    Err(e) => {
                        log::error!("sink write failed: {e}");
                        ctx.defer(IN, hdr)?;
                        return Err(IlError::PortError(IN));
                    }
                }
            }

            if flags.contains(BufferFlags::EOS) {
                log::debug!("sink consumed EOS");
                ctx.emit(Event::BufferFlag { port: IN, flags });
            }

            hdr.reset();
            ctx.release(IN, hdr)?;
        }
    }
}
