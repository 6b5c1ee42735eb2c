//! Directory Listing Codec
//!
//! Bulk encoding of a directory's cached children for hand-off to a relay.
//!
//! # Format
//!
//! A sequence of records, each `(i32 len, filename\0)` followed by
//! `(i32 len, dirname\0)`. All integers are little-endian and lengths include
//! the trailing NUL. The directory name is written only on the first record;
//! later records carry a length of 0 and inherit it.
//!
//! ```text
//! missing directory:  [len][dirname\0][-1]
//! empty directory:    [0][len][dirname\0]
//! ```
//!
//! [`encode_records`] writes mixed records from many directories and always
//! spells out the directory name.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

const INITIAL_BUFFER_SIZE: usize = 4096;
const MISSING_DIR_MARKER: i32 = -1;

/// One decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirRecord {
    /// A child of an existing directory
    File { name: String, dir: String },
    /// Directory exists but has no children
    EmptyDirectory { dir: String },
    /// Directory could not be listed
    MissingDirectory { dir: String },
}

/// Encode a directory listing
pub fn encode_listing<'a, I>(dir: &str, exists: bool, children: I) -> Bytes
where
    I: IntoIterator<Item = &'a str>,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);

    if !exists {
        put_name(&mut buf, dir);
        buf.put_i32_le(MISSING_DIR_MARKER);
        return buf.freeze();
    }

    let mut first = true;
    for child in children {
        put_name(&mut buf, child);
        if first {
            put_name(&mut buf, dir);
            first = false;
        } else {
            buf.put_i32_le(0);
        }
    }

    if first {
        buf.put_i32_le(0);
        put_name(&mut buf, dir);
    }

    buf.freeze()
}

/// Encode arbitrary records, one directory name per record
pub fn encode_records<'a, I>(records: I) -> Bytes
where
    I: IntoIterator<Item = &'a DirRecord>,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
    for record in records {
        match record {
            DirRecord::File { name, dir } => {
                put_name(&mut buf, name);
                put_name(&mut buf, dir);
            }
            DirRecord::EmptyDirectory { dir } => {
                buf.put_i32_le(0);
                put_name(&mut buf, dir);
            }
            DirRecord::MissingDirectory { dir } => {
                put_name(&mut buf, dir);
                buf.put_i32_le(MISSING_DIR_MARKER);
            }
        }
    }
    buf.freeze()
}

fn put_name(buf: &mut BytesMut, name: &str) {
    buf.put_i32_le((name.len() + 1) as i32);
    buf.put_slice(name.as_bytes());
    buf.put_u8(0);
}

/// Iterator over the records of an encoded listing
pub struct DirBufferIter<'a> {
    buf: &'a [u8],
    last_dir: Option<String>,
    failed: bool,
}

impl<'a> DirBufferIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            last_dir: None,
            failed: false,
        }
    }

    fn read_len(&mut self) -> Result<i32> {
        if self.buf.remaining() < 4 {
            return Err(truncated());
        }
        Ok(self.buf.get_i32_le())
    }

    fn read_name(&mut self, len: i32) -> Result<String> {
        let len = usize::try_from(len).map_err(|_| truncated())?;
        if len == 0 {
            return Ok(String::new());
        }
        if self.buf.remaining() < len {
            return Err(truncated());
        }
        let raw = &self.buf[..len];
        let raw = raw.strip_suffix(&[0u8]).unwrap_or(raw);
        let name = std::str::from_utf8(raw)
            .map_err(|e| Error::protocol("utf-8 name", e.to_string()))?
            .to_string();
        self.buf.advance(len);
        Ok(name)
    }

    fn next_record(&mut self) -> Result<DirRecord> {
        let name_len = self.read_len()?;
        let name = self.read_name(name_len)?;
        let dir_len = self.read_len()?;

        if dir_len == MISSING_DIR_MARKER {
            return Ok(DirRecord::MissingDirectory { dir: name });
        }

        let dir = if dir_len == 0 {
            self.last_dir
                .clone()
                .ok_or_else(|| Error::protocol("directory name", "record without directory"))?
        } else {
            let dir = self.read_name(dir_len)?;
            self.last_dir = Some(dir.clone());
            dir
        };

        if name.is_empty() {
            Ok(DirRecord::EmptyDirectory { dir })
        } else {
            Ok(DirRecord::File { name, dir })
        }
    }
}

fn truncated() -> Error {
    Error::protocol("directory record", "truncated buffer")
}

impl<'a> Iterator for DirBufferIter<'a> {
    type Item = Result<DirRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || !self.buf.has_remaining() {
            return None;
        }
        let record = self.next_record();
        if record.is_err() {
            self.failed = true;
        }
        Some(record)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(buf: &[u8]) -> Vec<DirRecord> {
        DirBufferIter::new(buf)
            .collect::<Result<Vec<_>>>()
            .expect("decode failed")
    }

    #[test]
    fn test_listing_with_children() {
        let buf = encode_listing("/usr/lib", true, ["a.so", "b.so"]);
        let records = decode(&buf);
        assert_eq!(
            records,
            vec![
                DirRecord::File {
                    name: "a.so".into(),
                    dir: "/usr/lib".into()
                },
                DirRecord::File {
                    name: "b.so".into(),
                    dir: "/usr/lib".into()
                },
            ]
        );
    }

    #[test]
    fn test_directory_name_written_once() {
        let buf = encode_listing("/d", true, ["x", "y", "z"]);
        // 3 names of 2 bytes, one dirname of 3 bytes, 6 length prefixes
        assert_eq!(buf.len(), 3 * 2 + 3 + 6 * 4);
    }

    #[test]
    fn test_missing_directory() {
        let buf = encode_listing("/nonexistent", false, std::iter::empty());
        assert_eq!(
            decode(&buf),
            vec![DirRecord::MissingDirectory {
                dir: "/nonexistent".into()
            }]
        );
    }

    #[test]
    fn test_empty_directory_is_not_missing() {
        let buf = encode_listing("/empty", true, std::iter::empty());
        assert_eq!(
            decode(&buf),
            vec![DirRecord::EmptyDirectory {
                dir: "/empty".into()
            }]
        );
    }

    #[test]
    fn test_truncated_buffer_is_rejected() {
        let buf = encode_listing("/usr/lib", true, ["a.so"]);
        let cut = &buf[..buf.len() - 3];
        let results: Vec<_> = DirBufferIter::new(cut).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::ProtocolViolation { .. })));
    }

    #[test]
    fn test_continuation_without_directory_is_rejected() {
        let mut buf = BytesMut::new();
        put_name(&mut buf, "orphan");
        buf.put_i32_le(0);
        let results: Vec<_> = DirBufferIter::new(&buf).collect();
        assert!(results[0].is_err());
    }

    #[test]
    fn test_mixed_records_keep_their_directories() {
        let records = vec![
            DirRecord::File {
                name: "a.so".into(),
                dir: "/lib".into(),
            },
            DirRecord::MissingDirectory { dir: "/gone".into() },
            DirRecord::EmptyDirectory { dir: "/empty".into() },
            DirRecord::File {
                name: "b.so".into(),
                dir: "/usr/lib".into(),
            },
        ];
        assert_eq!(decode(&encode_records(&records)), records);
        assert!(encode_records(&[]).is_empty());
    }
}
