//! Canonical byte encoding for signed structures.
//!
//! Every signature in Orbit covers bytes produced by [`Canon`]: fields are
//! written in a fixed order, length-prefixed, under a domain-separation
//! label. Unknown forward-compatible fields are carried as an ordered
//! `(key, bytes)` sequence and folded into the signed image verbatim, so a
//! future field cannot be stripped without invalidating the signature.

/// Ordered bucket of fields this version of the code does not understand.
///
/// Captured on decode and re-serialized verbatim, both on the wire and in
/// the canonical signing image.
pub type ExtraFields = Vec<(String, Vec<u8>)>;

/// Deterministic encoder for signing images.
///
/// ```
/// use orbit_core::Canon;
///
/// let image = Canon::new("orbit-example-v1")
///     .u64(42)
///     .str("passwords")
///     .bytes(b"payload")
///     .finish();
/// assert_eq!(image, Canon::new("orbit-example-v1")
///     .u64(42)
///     .str("passwords")
///     .bytes(b"payload")
///     .finish());
/// ```
#[derive(Debug, Clone)]
pub struct Canon {
    buf: Vec<u8>,
}

impl Canon {
    /// Start an encoding under a domain-separation label.
    ///
    /// The label keeps signatures from one structure type from ever being
    /// valid for another.
    pub fn new(domain: &str) -> Self {
        let mut buf = Vec::with_capacity(128);
        write_len_prefixed(&mut buf, domain.as_bytes());
        Self { buf }
    }

    /// Append a u64 (big-endian, fixed width).
    pub fn u64(mut self, value: u64) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a u32 (big-endian, fixed width).
    pub fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a single flag byte.
    pub fn bool(mut self, value: bool) -> Self {
        self.buf.push(u8::from(value));
        self
    }

    /// Append a length-prefixed byte string.
    pub fn bytes(mut self, value: &[u8]) -> Self {
        write_len_prefixed(&mut self.buf, value);
        self
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn str(self, value: &str) -> Self {
        self.bytes(value.as_bytes())
    }

    /// Append an ordered list of byte strings, with a count prefix.
    pub fn list<I, B>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let items: Vec<B> = items.into_iter().collect();
        self.buf.extend_from_slice(&(items.len() as u64).to_be_bytes());
        for item in items {
            write_len_prefixed(&mut self.buf, item.as_ref());
        }
        self
    }

    /// Append ordered key/value pairs (device info, unknown fields).
    ///
    /// Pairs are written in the order given, not sorted: the order is part
    /// of the signed image and must survive re-serialization.
    pub fn pairs<'a, I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]> + 'a,
        V: AsRef<[u8]> + 'a,
    {
        let pairs: Vec<(K, V)> = pairs.into_iter().collect();
        self.buf.extend_from_slice(&(pairs.len() as u64).to_be_bytes());
        for (k, v) in pairs {
            write_len_prefixed(&mut self.buf, k.as_ref());
            write_len_prefixed(&mut self.buf, v.as_ref());
        }
        self
    }

    /// Fold an [`ExtraFields`] bucket into the image.
    pub fn extra(self, extra: &ExtraFields) -> Self {
        self.pairs(extra.iter().map(|(k, v)| (k.as_bytes(), v.as_slice())))
    }

    /// Consume the encoder and return the canonical bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn write_len_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u64).to_be_bytes());
    buf.extend_from_slice(data);
}

/// Marker trait for structures with a canonical signing image.
pub trait Canonical {
    /// Produce the canonical bytes this structure is signed over.
    fn canonical_bytes(&self) -> Vec<u8>;
}
