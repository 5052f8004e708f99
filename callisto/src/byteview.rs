//! Provides an immutable view on a cached byte sequence.
//!
//! Cache values are arbitrary bytes (strings, serialized documents, images, ...). As the same
//! value is handed out to many concurrent callers and also kept in the cache itself, it must be
//! impossible to observe a mutation through any of these handles. A [ByteView](ByteView) is
//! therefore backed by a shared immutable buffer: cloning a view is cheap (it only bumps a
//! reference counter) and every accessor which yields an owned, mutable representation returns
//! a fresh copy.
//!
//! # Examples
//!
//! ```
//! # use callisto::byteview::ByteView;
//! let view = ByteView::from("Hello World");
//!
//! assert_eq!(view.len(), 11);
//! assert_eq!(view.to_string(), "Hello World");
//!
//! // byte_slice() returns a copy which can be freely mutated...
//! let mut copy = view.byte_slice();
//! copy[0] = b'J';
//!
//! // ...without affecting the view itself.
//! assert_eq!(view.to_string(), "Hello World");
//! ```
use std::fmt::{Display, Formatter};

use bytes::Bytes;

use crate::lru::ByteSize;

/// Provides an immutable view on the bytes of a cache value.
///
/// Views are created from owned data (which is the defensive copy: once the buffer is handed
/// over, nobody else can reach it) or by explicitly copying a borrowed slice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteView {
    data: Bytes,
}

impl ByteView {
    /// Creates a view by copying the given slice.
    pub fn copy_from(data: &[u8]) -> Self {
        ByteView {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Returns the length of the underlying data in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a mutable copy of the underlying data.
    ///
    /// The returned buffer is entirely owned by the caller, mutating it has no effect on the
    /// view or any of its clones.
    pub fn byte_slice(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl AsRef<[u8]> for ByteView {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(data: Vec<u8>) -> Self {
        ByteView {
            data: Bytes::from(data),
        }
    }
}

impl From<Bytes> for ByteView {
    fn from(data: Bytes) -> Self {
        ByteView { data }
    }
}

impl From<&str> for ByteView {
    fn from(data: &str) -> Self {
        ByteView::copy_from(data.as_bytes())
    }
}

impl Display for ByteView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.data))
    }
}

impl ByteSize for ByteView {
    fn allocated_size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::byteview::ByteView;

    #[test]
    fn mutating_a_returned_slice_leaves_the_view_untouched() {
        let view = ByteView::from("630");

        let mut slice = view.byte_slice();
        slice[0] = b'9';
        slice.push(b'9');

        assert_eq!(view.byte_slice(), b"630".to_vec());
        assert_eq!(view.to_string(), "630");
    }

    #[test]
    fn clones_share_the_same_contents() {
        let view = ByteView::from(vec![1u8, 2, 3]);
        let clone = view.clone();

        assert_eq!(view, clone);
        assert_eq!(clone.len(), 3);
        assert_eq!(clone.is_empty(), false);
    }

    #[test]
    fn non_utf8_data_is_rendered_lossy() {
        let view = ByteView::from(vec![0xff, 0xfe]);
        assert_eq!(view.to_string(), "\u{fffd}\u{fffd}");
    }
}
