//! The in-tree components: a file source, a WAV-parsing PCM decoder, and
//! a writer sink, plus the builder that wires them into a pipeline.
//!
//! These exist to make the runtime usable and testable end to end. Codec
//! sophistication is deliberately out of scope: the decoder is exactly
//! deep enough to exercise probing, end-of-stream, and the mid-stream
//! format-change protocol.

pub mod file_source;
pub mod pcm_decoder;
pub mod writer_sink;

use std::sync::Arc;

use crate::graph::{GraphBuilder, ProbeResult, ReactorHandle};
use crate::il::{
    ComponentHandle, ComponentId, Encoding, EventSink, IlError, ParamId, Parameter, PortIndex,
};

pub use writer_sink::{MemorySink, PacedSink, SampleSink};

/// Builds `file-source → wav-decoder → writer-sink` pipelines for PCM/WAV
/// content.
pub struct PcmGraphBuilder {
    sink_factory: Box<dyn Fn() -> Box<dyn SampleSink> + Send + Sync>,
}

impl std::fmt::Debug for PcmGraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmGraphBuilder").finish_non_exhaustive()
    }
}

impl PcmGraphBuilder {
    /// Creates a builder whose sinks come from `sink_factory` (one sink
    /// per pipeline bring-up).
    pub fn new(
        sink_factory: impl Fn() -> Box<dyn SampleSink> + Send + Sync + 'static,
    ) -> Self {
        Self {
            sink_factory: Box::new(sink_factory),
        }
    }
}

impl GraphBuilder for PcmGraphBuilder {
    fn name(&self) -> &str {
        "wav"
    }

    fn handles(&self, encoding: Encoding) -> bool {
        encoding == Encoding::Pcm
    }

    fn build_source(
        &self,
        id: ComponentId,
        events: Arc<dyn EventSink>,
    ) -> Result<ComponentHandle, IlError> {
        ComponentHandle::spawn(
            file_source::definition(),
            id,
            events,
            Box::new(file_source::FileSourceOps::new()),
        )
    }

    fn build_rest(
        &self,
        _probe: &ProbeResult,
        first_id: u32,
        events: Arc<dyn EventSink>,
        reactor: &ReactorHandle,
    ) -> Result<Vec<ComponentHandle>, IlError> {
        let decoder = ComponentHandle::spawn(
            pcm_decoder::definition(),
            ComponentId(first_id),
            events.clone(),
            Box::new(pcm_decoder::WavDecoderOps::new()),
        )?;

        let sink = ComponentHandle::spawn(
            writer_sink::definition(),
            ComponentId(first_id + 1),
            events,
            Box::new(writer_sink::WriterSinkOps::new(
                (self.sink_factory)(),
                Some(reactor.clone()),
            )),
        )?;

        Ok(vec![decoder, sink])
    }

    fn configure(
        &self,
        components: &[ComponentHandle],
        probe: &ProbeResult,
    ) -> Result<(), IlError> {
        let [_, decoder, sink] = components else {
            return Err(IlError::BadParameter(format!(
                "wav pipeline expects 3 components, got {}",
                components.len()
            )));
        };

        // Decoder input carries the container bytes; everything after it
        // carries raw PCM at the probed rate.
        let Parameter::PortDefinition(_, mut def) =
            decoder.get_parameter(ParamId::PortDefinition(PortIndex(0)))?
        else {
            unreachable!()
        };
        def.encoding = probe.encoding;
        def.pcm = probe.pcm;
        decoder.set_parameter(Parameter::PortDefinition(PortIndex(0), def))?;

        decoder.set_parameter(Parameter::Pcm(PortIndex(1), probe.pcm))?;
        sink.set_parameter(Parameter::Pcm(PortIndex(0), probe.pcm))?;
        Ok(())
    }
}
