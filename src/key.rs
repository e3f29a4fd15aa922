use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// A single component of a [`Key`].
///
/// Integers sort before strings, so keys built from the same prefix order
/// numerically by their indices.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    Int(i64),
    Str(Arc<str>),
}

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Int(value) => write!(f, "{value}"),
            Segment::Str(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for Segment {
    fn from(value: &str) -> Self {
        Segment::Str(value.into())
    }
}

impl From<String> for Segment {
    fn from(value: String) -> Self {
        Segment::Str(value.into())
    }
}

macro_rules! segment_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Segment {
                fn from(value: $ty) -> Self {
                    Segment::Int(value as i64)
                }
            }
        )*
    };
}

segment_from_int!(i8, i16, i32, i64, u8, u16, u32, usize);

/// The stable name of a logical piece of data.
///
/// A `Key` is an immutable sequence of [`Segment`]s. It compares, hashes and
/// orders by its structural content, never by the identity of any particular
/// in-memory copy. Keys are also used as version labels for publications.
///
/// ```rust
/// use weft::{Key, key};
///
/// let a = key!("grid", 3);
/// let b = Key::from("grid").child(3);
/// assert_eq!(a, b);
/// assert_eq!(a.to_string(), "grid/3");
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Arc<[Segment]>);

impl Key {
    pub fn from_segments(segments: impl IntoIterator<Item = Segment>) -> Self {
        Self(segments.into_iter().collect())
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Returns a new key extended by one segment.
    pub fn child(&self, segment: impl Into<Segment>) -> Self {
        let mut segments = self.0.to_vec();
        segments.push(segment.into());
        Self(segments.into())
    }

    /// The key naming element `index` of a collection-typed handle.
    pub fn element(&self, index: usize) -> Self {
        self.child(index)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({self})")
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::from_segments([Segment::from(value)])
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::from_segments([Segment::from(value)])
    }
}

impl From<Segment> for Key {
    fn from(value: Segment) -> Self {
        Key::from_segments([value])
    }
}

impl From<&Key> for Key {
    fn from(value: &Key) -> Self {
        value.clone()
    }
}

/// Builds a [`Key`] from a list of segments.
///
/// Every argument must convert into a [`Segment`] (strings and integers do).
#[macro_export]
macro_rules! key {
    ($($segment:expr),+ $(,)?) => {
        $crate::Key::from_segments([$($crate::Segment::from($segment)),+])
    };
}
