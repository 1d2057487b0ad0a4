use std::borrow::Cow;
use std::fmt;

/// A single (name, value) pair of a field section, in wire order.
#[derive(Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Cow<'static, [u8]>,
    pub value: Cow<'static, [u8]>,
}

impl HeaderField {
    pub fn new<N, V>(name: N, value: V) -> Self
    where
        N: Into<Vec<u8>>,
        V: Into<Vec<u8>>,
    {
        Self {
            name: Cow::Owned(name.into()),
            value: Cow::Owned(value.into()),
        }
    }

    /// The size attributed to this field by RFC 9204, section 4.1.1.3.
    pub fn mem_size(&self) -> u64 {
        (self.name.len() + self.value.len() + 32) as u64
    }

    pub fn into_inner(self) -> (Cow<'static, [u8]>, Cow<'static, [u8]>) {
        (self.name, self.value)
    }
}

impl<N, V> From<(N, V)> for HeaderField
where
    N: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    fn from((name, value): (N, V)) -> Self {
        Self::new(name.as_ref(), value.as_ref())
    }
}

impl fmt::Debug for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HeaderField({}: {})",
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.value)
        )
    }
}
