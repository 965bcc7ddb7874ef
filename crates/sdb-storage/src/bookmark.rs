//! Scoped file-position save/restore for back-patches.
//!
//! Every back-patch in the format (the StreamsMeta data offset, candle
//! header offsets, candle arrays at close) jumps to an earlier position,
//! performs a bounded write, and must leave the cursor where it was — on
//! success and on failure alike.

use std::fs::File;
use std::io::{Seek, SeekFrom};

use sdb_core::Result;

/// Run `f` with the file positioned at `pos`, restoring the original
/// position on every exit path. A restore failure on an otherwise
/// successful operation is reported; an operation error wins over a restore
/// error.
pub(crate) fn with_position<T>(
    file: &mut File,
    pos: u64,
    f: impl FnOnce(&mut File) -> Result<T>,
) -> Result<T> {
    let saved = file.stream_position()?;
    file.seek(SeekFrom::Start(pos))?;
    let result = f(file);
    let restored = file.seek(SeekFrom::Start(saved));
    match (result, restored) {
        (Ok(value), Ok(_)) => Ok(value),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e.into()),
    }
}
