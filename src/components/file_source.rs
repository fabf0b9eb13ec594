//! The file source: reads a local URI and pushes its bytes downstream.
//!
//! In auto-detection mode (output encoding set to
//! [`Encoding::Autodetect`]), the source sniffs the head of the stream
//! while its output port is still disabled, publishes the detected
//! encoding with a `PortSettingsChanged` event, and later replays the
//! sniffed bytes as the start of the stream.

use std::fs::File;
use std::io::{BufReader, Read};

use crate::graph::probe;
use crate::il::{
    BufferFlags, ComponentDef, Encoding, Event, IlError, ParamId, PortConfig, PortIndex,
    ProcContext, ProcessorOps,
};

const OUT: PortIndex = PortIndex(0);

/// How much of the stream head is sniffed for auto-detection.
const SNIFF_BYTES: usize = 32 * 1024;

/// The component definition for the file source.
pub fn definition() -> ComponentDef {
    ComponentDef {
        name: "adagio.audio_source.file".into(),
        role: "audio_source.file".into(),
        ports: vec![PortConfig::audio_output(4, 8192)],
    }
}

/// Processor ops for the file source.
#[derive(Debug)]
pub struct FileSourceOps {
    reader: Option<BufReader<File>>,
    /// Sniffed head bytes, replayed before the reader.
    stash: Vec<u8>,
    stash_pos: usize,
    eos_sent: bool,
}

impl FileSourceOps {
    /// Creates the ops in their pre-transfer state.
    pub fn new() -> Self {
        Self {
            reader: None,
            stash: Vec::new(),
            stash_pos: 0,
            eos_sent: false,
        }
    }

    fn next_chunk(&mut self, buf: &mut [u8]) -> Result<usize, IlError> {
        // Drain the sniffed head first.
        if self.stash_pos < self.stash.len() {
            let n = (self.stash.len() - self.stash_pos).min(buf.len());
            buf[..n].copy_from_slice(&self.stash[self.stash_pos..self.stash_pos + n]);
            self.stash_pos += n;
            return Ok(n);
        }

        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };

        reader
            .read(buf)
            .map_err(|e| IlError::StreamCorrupt(format!("reading source: {e}")))
    }
}

impl Default for FileSourceOps {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorOps for FileSourceOps {
    fn prepare_to_transfer(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        let uri = ctx
            .uri()
            .ok_or_else(|| IlError::BadParameter("no content uri set".into()))?
            .to_string();
        let path = uri.strip_prefix("file://").unwrap_or(&uri);

        let file = File::open(path)
            .map_err(|e| IlError::StreamCorrupt(format!("opening {path}: {e}")))?;
        let mut reader = BufReader::new(file);

        self.stash.clear();
        self.stash_pos = 0;
        self.eos_sent = false;

        if ctx.port_config(OUT)?.encoding == Encoding::Autodetect {
            // Sniff the head while the port is still disabled, then
            // publish what the stream turned out to be.
            let mut head = vec![0u8; SNIFF_BYTES];
            let mut got = 0;
            while got < head.len() {
                let n = reader
                    .read(&mut head[got..])
                    .map_err(|e| IlError::StreamCorrupt(format!("sniffing {path}: {e}")))?;
                if n == 0 {
                    break;
                }
                got += n;
            }
            head.truncate(got);

            let encoding = probe::sniff_encoding(&head).map_err(|e| {
                // There is no more data coming from a file; "not yet
                // recognizable" means "never will be".
                if e.is_retriable() {
                    IlError::StreamCorrupt(format!("{path} is too short to identify"))
                } else {
                    e
                }
            })?;
            log::info!("detected {encoding:?} on {path}");
            ctx.set_port_encoding(OUT, encoding)?;
            self.stash = head;

            ctx.emit(Event::PortSettingsChanged {
                port: OUT,
                param: ParamId::PortDefinition(OUT),
            });
        }

        self.reader = Some(reader);
        Ok(())
    }

    fn deallocate_resources(&mut self, _ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        self.reader = None;
        self.stash.clear();
        self.stash_pos = 0;
        self.eos_sent = false;
        Ok(())
    }

    fn buffers_ready(&mut self, ctx: &mut ProcContext<'_>) -> Result<(), IlError> {
        while !self.eos_sent {
            let mut hdr = match ctx.claim(OUT)? {
                Some(hdr) => hdr,
                None => break,
            };

            let n = {
                let space = hdr.space_mut();
                self.next_chunk(space)
            };

            // Never drop a claimed header: on failure it parks back at its
            // port before the error surfaces.
            let n = match n {
                Ok(n) => n,
                Err(err) => {
                    ctx.defer(OUT, hdr)?;
                    return Err(err);
                }
            };

            if n == 0 {
                hdr.set_region(0, 0)?;
                hdr.flags = BufferFlags::EOS;
                self.eos_sent = true;
                log::debug!("source reached EOF, sending EOS");
            } else {
                hdr.set_region(0, n)?;
            }

            ctx.release(OUT, hdr)?;
        }

        Ok(())
    }
}
