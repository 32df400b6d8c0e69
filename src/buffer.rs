//! Receive buffer for the frame parser

use crate::{
    constants::{BUF_CHUNK, MAX_BUFFER_SIZE},
    error::{EslError, EslResult},
};

/// Growable byte buffer with a read cursor.
///
/// Consumed bytes stay in place until [`compact`](Self::compact) is called so
/// that extracting several frames from one socket read does not shift memory
/// on every frame.
#[derive(Debug)]
pub(crate) struct EslBuffer {
    data: Vec<u8>,
    position: usize,
}

impl EslBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::with_capacity(BUF_CHUNK),
            position: 0,
        }
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        if self.data.capacity() - self.data.len() < bytes.len() {
            self.data
                .reserve(bytes.len().max(BUF_CHUNK));
        }
        self.data
            .extend_from_slice(bytes);
    }

    /// Unconsumed bytes.
    pub(crate) fn remaining(&self) -> &[u8] {
        &self.data[self.position..]
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.position
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn check_size_limits(&self) -> EslResult<()> {
        if self.len() > MAX_BUFFER_SIZE {
            return Err(EslError::framing(format!(
                "receive buffer holds {} bytes, limit is {}",
                self.len(),
                MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Extract the header block up to the first blank line.
    ///
    /// Both `\n\n` and `\r\n\r\n` terminate the block. The returned bytes
    /// exclude the terminator, which is consumed.
    pub(crate) fn extract_header_block(&mut self) -> Option<Vec<u8>> {
        let (end, terminator_len) = find_blank_line(self.remaining())?;
        let start = self.position;
        let block = self.data[start..start + end].to_vec();
        self.position += end + terminator_len;
        Some(block)
    }

    /// Extract exactly `count` bytes, or nothing if not yet buffered.
    pub(crate) fn extract_bytes(&mut self, count: usize) -> Option<Vec<u8>> {
        if self.len() < count {
            return None;
        }
        let start = self.position;
        self.position += count;
        Some(self.data[start..start + count].to_vec())
    }

    /// Drop consumed bytes from the front of the buffer.
    pub(crate) fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        if self.position == self.data.len() {
            self.data.clear();
        } else {
            self.data
                .drain(..self.position);
        }
        self.position = 0;
    }
}

/// Locate the first empty line. Returns (offset of block end, terminator length).
pub(crate) fn find_blank_line(bytes: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            match bytes.get(i + 1) {
                Some(b'\n') => return Some((i, 2)),
                Some(b'\r') if bytes.get(i + 2) == Some(&b'\n') => {
                    let end = if i > 0 && bytes[i - 1] == b'\r' {
                        i - 1
                    } else {
                        i
                    };
                    return Some((end, i + 3 - end));
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}
