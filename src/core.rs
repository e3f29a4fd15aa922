use std::fmt::{Debug, Display, Formatter};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                Debug::fmt(self, f)
            }
        }
    };
}

id_type!(
    /// Identity of a handle inside the runtime's arena.
    HandleId,
    "h"
);
id_type!(
    /// A single registered access request, as assigned by the backend.
    UseId,
    "u"
);
id_type!(
    /// A version of a handle's data, as assigned by the backend.
    FlowId,
    "f"
);
id_type!(
    /// A spawned unit of work or a rank's top-level context.
    TaskId,
    "t"
);
id_type!(
    /// An if/then/else composition awaiting its runtime outcome.
    CondId,
    "c"
);

/// A 32-byte BLAKE3 digest of a published payload.
///
/// Publications record it at publish time so that every fetch can verify the
/// bytes it receives are the bytes that were made visible.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        use std::fmt::Write;

        let mut acc = String::with_capacity(64);
        for byte in self.0 {
            // Writing into a String cannot fail.
            let _ = write!(acc, "{byte:02x}");
        }
        acc
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}
