//! The WAV/PCM decoder: strips container headers and forwards raw PCM.
//!
//! A stream may be several WAV segments back to back. When a later
//! segment declares a different sample format, the decoder updates its
//! output port parameters and raises `PortSettingsChanged`; the graph
//! then cycles the downstream tunnel. The look-ahead store holding the
//! unconsumed tail survives the port disable, so playback resumes from
//! the next byte without sample loss.

use crate::graph::probe;
use crate::il::{
    BufferFlags, ComponentDef, Event, IlError, ParamId, PortConfig, PortIndex, ProcContext,
    ProcessorOps,
};

const IN: PortIndex = PortIndex(0);
const OUT: PortIndex = PortIndex(1);

/// Ingestion backpressure bound for the look-ahead store, in bytes.
const HIGH_WATER: usize = 256 * 1024;

/// The component definition for the WAV decoder.
pub fn definition() -> ComponentDef {
    ComponentDef {
        name: "adagio.audio_decoder.wav".into(),
        role: "audio_decoder.pcm".into(),
        ports: vec![
            PortConfig::audio_input(4, 8192),
            PortConfig::audio_output(4, 8192),
        ],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Accumulating bytes until a full RIFF header parses.
    AwaitHeader,
    /// Forwarding sample data.
    Streaming,
}

/// Processor ops for the WAV decoder.
#[derive(Debug)]
pub struct WavDecoderOps {
    /// Bytes ingested but not yet emitted. Survives port disable.
    lookahead: Vec<u8>,
    state: DecodeState,
    /// Sample bytes left in the current segment, when the header said.
    remaining: Option<u64>,
    /// Input EOS seen; flush the store then propagate.
    eos_in: bool,
    eos_out: bool,
    /// A format change was announced; output holds until the port cycles.
    awaiting_reconfigure: bool,
    /// Whether a first segment has already configured the output.
    streamed_any: bool,
}

impl WavDecoderOps {
    /// Creates the ops in their pre-transfer state.
    pub fn new() -> Self {
        Self {
            lookahead: Vec::new(),
            state: DecodeState::AwaitHeader,
            remaining: None,
            eos_in: false,
            eos_out: false,
            awaiting_reconfigure: false,
            streamed_any: false,
        }
    }

    fn reset_stream(&mut self) {
        self.lookahead.clear();
        self.state = DecodeState::AwaitHeader;
        self.remaining = None;
        self.eos_in = false;
        self.eos_out = false;
        self.awaiting_reconfigure = false;
        self.streamed_any = false;
    }

    /// Pulls input into the look-ahead store, up to the high-water mark.
    fn ingest(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        while self.lookahead.len() < HIGH_WATER && !self.eos_in {
            let mut hdr = match ctx.claim(IN)? {
                Some(hdr) => hdr,
                None => break,
            };

            if hdr.flags.contains(BufferFlags::EOS) {
                self.eos_in = true;
            }

            if hdr.filled() > 0 {
                self.lookahead.extend_from_slice(hdr.payload());
                hdr.reset();
            }

            ctx.release(IN, hdr)?;
        }

        Ok(())
    }

    /// Parses the segment header at the front of the store. Returns false
    /// when more bytes are needed.
    fn parse_header(&mut self, ctx: &mut ProcContext<'_>) -> Result<bool, IlError> {
        let info = match probe::parse_wav(&self.lookahead) {
            Ok(Some(info)) => info,
            Ok(None) => {
                if self.eos_in && !self.lookahead.is_empty() {
                    return Err(IlError::StreamCorrupt(
                        "stream ended inside a WAV header".into(),
                    ));
                }
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        self.lookahead.drain(..info.data_offset);
        self.remaining = info.data_len;
        self.state = DecodeState::Streaming;

        let current = ctx.port_config(OUT)?.pcm;
        if self.streamed_any && info.pcm != current {
            log::info!(
                "mid-stream format change: {}Hz -> {}Hz",
                current.sample_rate,
                info.pcm.sample_rate
            );
            self.awaiting_reconfigure = true;
            ctx.set_port_pcm(OUT, info.pcm)?;
            ctx.emit(Event::PortSettingsChanged {
                port: OUT,
                param: ParamId::Pcm(OUT),
            });
        }

        self.streamed_any = true;
        Ok(true)
    }

    /// Emits sample bytes from the store. Returns false when output ran
    /// dry (no empty buffer available).
    fn emit_samples(&mut self, ctx: &mut ProcContext<'_>) -> Result<bool, IlError> {
        loop {
            let segment_left = self
                .remaining
                .map(|r| r.min(self.lookahead.len() as u64) as usize)
                .unwrap_or(self.lookahead.len());

            if segment_left == 0 {
                return Ok(true);
            }

            let mut hdr = match ctx.claim(OUT)? {
                Some(hdr) => hdr,
                None => return Ok(false),
            };

            let n = segment_left.min(hdr.capacity());
            hdr.space_mut()[..n].copy_from_slice(&self.lookahead[..n]);
            if let Err(err) = hdr.set_region(0, n) {
                ctx.defer(OUT, hdr)?;
                return Err(err);
            }

            self.lookahead.drain(..n);
            if let Some(r) = self.remaining.as_mut() {
                *r -= n as u64;
            }

            ctx.release(OUT, hdr)?;
        }
    }

    fn emit_eos(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        let Some(mut hdr) = ctx.claim(OUT)? else {
            return Ok(());
        };

        hdr.set_region(0, 0)?;
        hdr.flags = BufferFlags::EOS;
        self.eos_out = true;
        log::debug!("decoder propagating EOS");
        ctx.release(OUT, hdr)
    }
}

impl Default for WavDecoderOps {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorOps for WavDecoderOps {
    fn prepare_to_transfer(&mut self, _ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        self.reset_stream();
        Ok(())
    }

    fn deallocate_resources(&mut self, _ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        self.reset_stream();
        Ok(())
    }

    fn port_enable(&mut self, _ctx: &mut ProcContext<'_>, port: PortIndex) -> Result<(), IlError> {
        if port == OUT && self.awaiting_reconfigure {
            log::debug!("output port cycled, draining look-ahead store");
            self.awaiting_reconfigure = false;
        }
        Ok(())
    }

    fn buffers_ready(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        if self.eos_out {
            return Ok(());
        }

        loop {
            self.ingest(ctx)?;

            if self.awaiting_reconfigure {
                // Output is frozen until the tunnel cycles; ingestion
                // above still fills the store up to the high-water mark.
                return Ok(());
            }

            match self.state {
                DecodeState::AwaitHeader => {
                    if self.lookahead.is_empty() && self.eos_in {
                        return self.emit_eos(ctx);
                    }

                    if !self.parse_header(ctx)? {
                        // Need more input.
                        return Ok(());
                    }
                }
                DecodeState::Streaming => {
                    if !self.emit_samples(ctx)? {
                        // No empty output buffer; wait for the next nudge.
                        return Ok(());
                    }

                    let segment_done = self.remaining == Some(0);
                    let store_empty = self.lookahead.is_empty();

                    if segment_done && !(store_empty && self.eos_in) {
                        self.state = DecodeState::AwaitHeader;
                        self.remaining = None;
                        continue;
                    }

                    if store_empty {
                        if self.eos_in {
                            return self.emit_eos(ctx);
                        }
                        // Drained the store; wait for more input.
                        return Ok(());
                    }

                    // More data than the segment declared; go look for
                    // the next header.
                    if segment_done {
                        self.state = DecodeState::AwaitHeader;
                        self.remaining = None;
                    }
                    continue;
                }
            }
        }
    }
}
