//! Packet framing: bounded byte windows and the descriptors matched against them.

pub mod buffer;
pub mod descriptor;

pub use buffer::FramingBuffer;
pub use descriptor::{DescriptorError, DescriptorKind, PacketDescriptor, PacketEvaluator};

/// A descriptor paired with the window of bytes it is matched against.
#[derive(Debug, Clone)]
pub struct PacketMatcher {
    descriptor: PacketDescriptor,
    buffer: FramingBuffer,
}

impl PacketMatcher {
    pub fn new(descriptor: PacketDescriptor) -> Self {
        let buffer = FramingBuffer::new(descriptor.maximum_packet_length());
        Self { descriptor, buffer }
    }

    pub fn descriptor(&self) -> &PacketDescriptor {
        &self.descriptor
    }

    /// Feed one byte. Returns the completed packet when the trailing bytes
    /// form one; the window is then emptied.
    pub fn feed(&mut self, byte: u8) -> Option<Vec<u8>> {
        self.buffer.push(byte);
        let packet = self
            .descriptor
            .match_trailing(self.buffer.as_slice())
            .map(<[u8]>::to_vec)?;
        self.buffer.clear();
        Some(packet)
    }

    /// Feed a chunk, collecting every packet completed along the way.
    pub fn feed_all(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|byte| self.feed(*byte)).collect()
    }

    pub fn buffered(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
