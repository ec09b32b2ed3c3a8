//! Byte-offset cursor shared by the local and remote tailers
//!
//! The cursor only does bookkeeping: the watcher reports the current size (and inode,
//! when known) of the file, reads the range the cursor asks for, and hands the bytes
//! back. Complete lines come out, a trailing partial line stays buffered.

/// Upper bound for one read so a burst of appended data is consumed over several polls
pub const MAX_READ_BYTES: u64 = 1024 * 1024;

/// Byte range of a file that should be read next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRange {
    pub start: u64,
    pub len: u64,
}

#[derive(Debug, Default)]
pub struct TailCursor {
    /// `None` until the file has been seen once
    offset: Option<u64>,
    inode: Option<u64>,
    pending: Vec<u8>,
}

impl TailCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Reconcile the cursor with the file's current state.
    ///
    /// The first sighting positions the cursor at the end of the file. Afterwards a
    /// shrunk file or a new inode (rotation) restarts at offset 0, otherwise reading
    /// continues from the stored offset.
    pub fn resync(&mut self, size: u64, inode: Option<u64>) -> Option<ReadRange> {
        let Some(offset) = self.offset else {
            self.offset = Some(size);
            self.inode = inode;
            return None;
        };

        let rotated = matches!((self.inode, inode), (Some(old), Some(new)) if old != new);
        let start = if rotated || size < offset {
            tracing::debug!(offset, size, rotated, "Log file truncated or rotated, restarting at 0");
            self.pending.clear();
            0
        } else {
            offset
        };

        self.offset = Some(start);
        self.inode = inode;

        (size > start).then(|| ReadRange {
            start,
            len: (size - start).min(MAX_READ_BYTES),
        })
    }

    /// The file is gone. Whatever shows up at the path next is a new file and is read
    /// from its first byte, including on the very first sighting.
    pub fn vanished(&mut self) {
        if self.offset != Some(0) || self.inode.is_some() {
            tracing::debug!(offset = ?self.offset, "Log file missing, next file starts at 0");
        }
        self.offset = Some(0);
        self.inode = None;
        self.pending.clear();
    }

    /// Consume bytes read from the requested range and return every complete line
    pub fn ingest(&mut self, bytes: &[u8]) -> Vec<String> {
        if bytes.is_empty() {
            return Vec::new();
        }

        self.offset = Some(self.offset.unwrap_or(0) + bytes.len() as u64);
        self.pending.extend_from_slice(bytes);

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }
}
