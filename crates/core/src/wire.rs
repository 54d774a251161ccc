use std::sync::Arc;

/// Reference-counted handle to module wire bytes.
///
/// Cloning is cheap; background workers keep their clone alive for as long
/// as they may read from it, independently of the original owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireBytes(Arc<[u8]>);

impl WireBytes {
    /// Wrap a byte buffer.
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    /// The underlying bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A sub-slice, or `None` if the range is out of bounds.
    pub fn get(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.0.get(offset..offset.checked_add(len)?)
    }
}

impl From<Vec<u8>> for WireBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl From<&[u8]> for WireBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}
