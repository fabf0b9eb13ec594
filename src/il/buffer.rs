//! The buffer header: the value that travels the pipeline.

use bitflags::bitflags;

use super::error::IlError;
use super::{ComponentId, PortIndex};

bitflags! {
    /// Flags carried by a buffer header.
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// The buffer is the last one of the stream.
        const EOS = 0x0000_0001;
        /// The payload begins at a frame boundary.
        const START_OF_FRAME = 0x0000_0002;
        /// The payload should be decoded but not rendered.
        const DECODE_ONLY = 0x0000_0004;
        /// The payload is codec configuration, not media data.
        const CODEC_CONFIG = 0x0000_0080;
    }
}

/// Identifies the port that allocated a buffer header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocatorTag {
    /// The component the supplier port belongs to.
    pub component: ComponentId,
    /// The supplier port.
    pub port: PortIndex,
}

/// One unit of data in flight.
///
/// A header owns its payload allocation. There is no sharing: a header is
/// *moved* between port queues, processor claims, and tunnel deliveries, so
/// at every observable instant exactly one place holds it. That move is the
/// ownership token the tunnel contract talks about.
#[derive(Debug)]
pub struct BufferHeader {
    data: Box<[u8]>,
    filled: usize,
    offset: usize,
    /// Flag set for this buffer.
    pub flags: BufferFlags,
    /// Presentation timestamp, in microseconds from stream start.
    pub timestamp: Option<u64>,
    /// The port currently responsible for the header. Updated on delivery.
    pub port: PortIndex,
    tag: AllocatorTag,
}

impl BufferHeader {
    /// Allocates a header with a zeroed payload of `capacity` bytes.
    pub fn new(capacity: usize, tag: AllocatorTag) -> Self {
        Self::with_payload(vec![0; capacity], tag)
    }

    /// Wraps a caller-provided payload allocation (`use_buffer`).
    pub fn with_payload(data: Vec<u8>, tag: AllocatorTag) -> Self {
        Self {
            data: data.into_boxed_slice(),
            filled: 0,
            offset: 0,
            flags: BufferFlags::empty(),
            timestamp: None,
            port: tag.port,
            tag,
        }
    }

    /// The payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The number of valid payload bytes, starting at the offset.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// The offset of the first valid payload byte.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The port that allocated this header.
    pub fn allocator(&self) -> AllocatorTag {
        self.tag
    }

    /// The valid payload region.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.filled]
    }

    /// The whole payload allocation, for a producer to write into.
    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Sets the valid region. Enforces `offset + filled <= capacity`.
    pub fn set_region(&mut self, offset: usize, filled: usize) -> Result<(), IlError> {
        if offset + filled > self.data.len() {
            return Err(IlError::BadParameter(format!(
                "buffer region {}+{} exceeds capacity {}",
                offset,
                filled,
                self.data.len()
            )));
        }

        self.offset = offset;
        self.filled = filled;
        Ok(())
    }

    /// Consumes `n` bytes from the front of the valid region.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.filled);
        self.offset += n;
        self.filled -= n;
    }

    /// Resets the header to an empty, flagless state, keeping the payload
    /// allocation.
    pub fn reset(&mut self) {
        self.filled = 0;
        self.offset = 0;
        self.flags = BufferFlags::empty();
        self.timestamp = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag() -> AllocatorTag {
        AllocatorTag {
            component: ComponentId(0),
            port: PortIndex(0),
        }
    }

    #[test]
    fn region_is_bounded_by_capacity() {
        let mut hdr = BufferHeader::new(16, tag());
        assert!(hdr.set_region(0, 16).is_ok());
        assert!(hdr.set_region(8, 8).is_ok());
        assert!(hdr.set_region(8, 9).is_err());
        assert!(hdr.set_region(17, 0).is_err());
    }

    #[test]
    fn consume_advances_the_region() {
        let mut hdr = BufferHeader::new(8, tag());
        hdr.space_mut().copy_from_slice(b"abcdefgh");
        hdr.set_region(0, 8).unwrap();

        hdr.consume(3);
        assert_eq!(hdr.payload(), b"defgh");
        hdr.consume(100);
        assert_eq!(hdr.filled(), 0);
    }

    #[test]
    fn reset_clears_flags_and_region() {
        let mut hdr = BufferHeader::new(8, tag());
        hdr.set_region(2, 4).unwrap();
        hdr.flags = BufferFlags::EOS;
        hdr.timestamp = Some(123);

        hdr.reset();
        assert_eq!(hdr.filled(), 0);
        assert_eq!(hdr.offset(), 0);
        assert!(hdr.flags.is_empty());
        assert_eq!(hdr.timestamp, None);
        assert_eq!(hdr.capacity(), 8);
    }
}
