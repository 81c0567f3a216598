use std::fmt::{Debug, Formatter};
use bytes::Bytes;

/// A view `(array, offset, length)` into a shared byte region, queued for transmission.
///
/// Cloning or splitting a segment never copies the underlying bytes.
#[derive(Clone, Eq, PartialEq)]
pub struct Segment {
    data: Bytes,
}

impl Segment {
    /// create a segment covering `array[offset..offset+len]`
    pub fn new(array: &Bytes, offset: usize, len: usize) -> Segment {
        Segment {
            data: array.slice(offset..offset + len),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// drops the first `n` bytes, returning the remaining part of the segment
    pub fn remainder_after(&self, n: usize) -> Segment {
        Segment {
            data: self.data.slice(n..),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl From<Bytes> for Segment {
    fn from(data: Bytes) -> Self {
        Segment { data }
    }
}

impl AsRef<[u8]> for Segment {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Debug for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Segment{{len:{}}}", self.data.len())
    }
}
