//! Client-side request encoding for the two commands a dump issues.

/// The crawler command that streams metadata for every stored item.
const METADUMP_ALL: &[u8] = b"lru_crawler metadump all\r\n";

/// A request builder for encoding dump commands.
#[derive(Debug, Clone)]
pub enum Request<'a> {
    /// Multi-GET command: `get <key1> <key2> ...\r\n`
    Gets { keys: &'a [&'a [u8]] },
    /// Crawler command: `lru_crawler metadump all\r\n`
    MetadumpAll,
}

impl<'a> Request<'a> {
    /// Create a multi-GET request.
    #[inline]
    pub fn gets(keys: &'a [&'a [u8]]) -> Self {
        Request::Gets { keys }
    }

    /// Create a metadump request covering every slab class.
    #[inline]
    pub fn metadump_all() -> Self {
        Request::MetadumpAll
    }

    /// Number of bytes `encode` will write.
    pub fn encoded_len(&self) -> usize {
        match self {
            Request::Gets { keys } if keys.is_empty() => 0,
            Request::Gets { keys } => {
                // "get" + (" " + key)* + "\r\n"
                3 + keys.iter().map(|k| k.len() + 1).sum::<usize>() + 2
            }
            Request::MetadumpAll => METADUMP_ALL.len(),
        }
    }

    /// Encode this request into a buffer.
    ///
    /// Returns the number of bytes written. The buffer must hold at least
    /// `encoded_len()` bytes.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        match self {
            Request::Gets { keys } => encode_gets(buf, keys),
            Request::MetadumpAll => {
                buf[..METADUMP_ALL.len()].copy_from_slice(METADUMP_ALL);
                METADUMP_ALL.len()
            }
        }
    }

    /// Encode this request into a freshly allocated vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        let len = self.encode(&mut buf);
        buf.truncate(len);
        buf
    }
}

/// Encode a multi-GET command: `get <key1> <key2> ...\r\n`
fn encode_gets(buf: &mut [u8], keys: &[&[u8]]) -> usize {
    if keys.is_empty() {
        return 0;
    }

    let mut pos = 0;
    buf[pos..pos + 3].copy_from_slice(b"get");
    pos += 3;

    for key in keys {
        buf[pos] = b' ';
        pos += 1;
        buf[pos..pos + key.len()].copy_from_slice(key);
        pos += key.len();
    }

    buf[pos..pos + 2].copy_from_slice(b"\r\n");
    pos + 2
}
