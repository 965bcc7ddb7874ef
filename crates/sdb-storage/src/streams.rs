//! Streams metadata block.
//!
//! Sits immediately after the text header:
//!
//! ```text
//! ┌─────────────┬─────────────┬──────────────┬───────────┬──────────────────┐
//! │ Tag 0x01    │ Compression │ Data offset  │ Stream    │ N x (tag 0x02,   │
//! │ (1 byte)    │ (1 byte)    │ (4 bytes LE) │ count (1) │     stream kind) │
//! └─────────────┴─────────────┴──────────────┴───────────┴──────────────────┘
//! ```
//!
//! The data offset points at the four-byte magic marker that precedes the
//! first stream record. It is unknown while the metadata is first written
//! (the candle index hasn't been laid out yet), so `write` reserves the four
//! bytes and remembers their position; `write_data_offset` patches them in
//! place once the writer knows the real value.
//!
//! Only compression kind 0 ("none") is defined. Kind 1 (gzip) is reserved:
//! never emitted, rejected on read.

use std::fs::File;
use std::io::{Read, Seek, Write};

use sdb_core::types::StreamType;
use sdb_core::{Error, Result};

use crate::bookmark::with_position;

pub const STREAMS_META_TAG: u8 = 0x01;
pub const STREAM_META_TAG: u8 = 0x02;

/// Stream-data compression kind. Only `None` may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    /// Reserved, not implemented.
    Gzip = 1,
}

/// The set of stream kinds a file carries, plus the beginning-of-data
/// offset.
#[derive(Debug, Clone)]
pub struct StreamsMeta {
    compression: Compression,
    data_offset: u32,
    data_offset_pos: u64,
    streams: Vec<StreamType>,
}

impl StreamsMeta {
    pub fn new(streams: Vec<StreamType>) -> Self {
        Self {
            compression: Compression::None,
            data_offset: 0,
            data_offset_pos: 0,
            streams,
        }
    }

    /// Stream kinds in file order.
    pub fn streams(&self) -> &[StreamType] {
        &self.streams
    }

    /// Absolute file offset of the magic marker (0 until patched/read).
    pub fn data_offset(&self) -> u32 {
        self.data_offset
    }

    /// File position of the data-offset field itself.
    pub fn data_offset_pos(&self) -> u64 {
        self.data_offset_pos
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Write the block at the current position, reserving the data-offset
    /// field and remembering where it lives. Returns the bytes written.
    pub fn write(&mut self, file: &mut File) -> Result<usize> {
        file.write_all(&[STREAMS_META_TAG, self.compression as u8])?;
        self.data_offset_pos = file.stream_position()?;

        let mut buf = Vec::with_capacity(5 + self.streams.len() * 2);
        buf.extend_from_slice(&[0u8; 4]); // data offset, patched later
        buf.push(self.streams.len() as u8);
        for st in &self.streams {
            buf.push(STREAM_META_TAG);
            buf.push(*st as u8);
        }
        file.write_all(&buf)?;
        Ok(2 + buf.len())
    }

    /// Patch the reserved data-offset field, restoring the cursor.
    pub fn write_data_offset(&mut self, file: &mut File, offset: u32) -> Result<()> {
        self.data_offset = offset;
        let pos = self.data_offset_pos;
        with_position(file, pos, |f| {
            f.write_all(&offset.to_le_bytes())?;
            Ok(())
        })
    }

    /// Read the block at the current position (right after the header).
    pub fn read(file: &mut File) -> Result<StreamsMeta> {
        let pos = file.stream_position()?;

        let mut fixed = [0u8; 7];
        file.read_exact(&mut fixed)
            .map_err(|_| Error::Truncated("streams metadata".to_string()))?;

        if fixed[0] != STREAMS_META_TAG {
            return Err(Error::Format(format!(
                "invalid StreamsMeta tag {:#04x} (expected {:#04x})",
                fixed[0], STREAMS_META_TAG
            )));
        }
        let compression = match fixed[1] {
            0 => Compression::None,
            1 => {
                return Err(Error::Unsupported(
                    "gzip-compressed stream data".to_string(),
                ))
            }
            other => {
                return Err(Error::Format(format!(
                    "invalid compression kind {}",
                    other
                )))
            }
        };
        let data_offset = u32::from_le_bytes(fixed[2..6].try_into().expect("4 bytes"));
        let count = fixed[6] as usize;

        let mut entries = vec![0u8; count * 2];
        file.read_exact(&mut entries)
            .map_err(|_| Error::Truncated("stream descriptor list".to_string()))?;

        let mut streams = Vec::with_capacity(count);
        for pair in entries.chunks_exact(2) {
            if pair[0] != STREAM_META_TAG {
                return Err(Error::Format(format!(
                    "invalid StreamMeta tag {:#04x}",
                    pair[0]
                )));
            }
            streams.push(StreamType::try_from(pair[1])?);
        }

        Ok(StreamsMeta {
            compression,
            data_offset,
            data_offset_pos: pos + 2,
            streams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;

    fn open_temp() -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("meta.sdb"))
            .unwrap();
        (dir, file)
    }

    #[test]
    fn test_write_layout() {
        let (_dir, mut file) = open_temp();
        let mut meta = StreamsMeta::new(vec![StreamType::Quotes, StreamType::Trade]);
        let written = meta.write(&mut file).unwrap();
        assert_eq!(written, 11);
        assert_eq!(meta.data_offset_pos(), 2);

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).unwrap();
        assert_eq!(
            bytes,
            vec![0x01, 0x00, 0, 0, 0, 0, 2, 0x02, 1, 0x02, 2]
        );
    }

    #[test]
    fn test_patch_then_read_roundtrip() {
        let (_dir, mut file) = open_temp();
        let mut meta = StreamsMeta::new(vec![StreamType::Quotes, StreamType::Trade]);
        meta.write(&mut file).unwrap();
        let end = file.stream_position().unwrap();

        meta.write_data_offset(&mut file, 0x0000_0220).unwrap();
        assert_eq!(file.stream_position().unwrap(), end);

        file.seek(SeekFrom::Start(0)).unwrap();
        let parsed = StreamsMeta::read(&mut file).unwrap();
        assert_eq!(parsed.data_offset(), 0x220);
        assert_eq!(parsed.data_offset_pos(), 2);
        assert_eq!(parsed.streams(), &[StreamType::Quotes, StreamType::Trade]);
        assert_eq!(parsed.compression(), Compression::None);
        // the read consumed exactly the block
        assert_eq!(file.stream_position().unwrap(), end);
    }

    #[test]
    fn test_read_rejects_wrong_tag() {
        let (_dir, mut file) = open_temp();
        file.write_all(&[0x07, 0, 0, 0, 0, 0, 0]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        assert!(matches!(
            StreamsMeta::read(&mut file),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_read_rejects_gzip() {
        let (_dir, mut file) = open_temp();
        file.write_all(&[0x01, 1, 0, 0, 0, 0, 0]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        assert!(matches!(
            StreamsMeta::read(&mut file),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_read_truncated_descriptor_list() {
        let (_dir, mut file) = open_temp();
        // claims 3 streams but carries only one descriptor
        file.write_all(&[0x01, 0, 0, 0, 0, 0, 3, 0x02, 1]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        assert!(matches!(
            StreamsMeta::read(&mut file),
            Err(Error::Truncated(_))
        ));
    }
}
