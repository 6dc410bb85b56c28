use std::io;

// Growth happens in whole increments so repeated small appends do not
// reallocate on every call.
const BUF_SIZE_INCREMENT: usize = 2048;

/// A dynamically sized byte buffer with separate data length (`len`) and
/// capacity (`size`). Data is appended at the tail and consumed from the
/// head; consuming compacts the remaining bytes back to offset zero, so the
/// valid region is always `[0, len)`.
pub struct Buffer {
    data: Vec<u8>,
    len: usize,
    ceiling: usize,
}

impl Buffer {
    /// Creates a buffer with `size` bytes of initial capacity and a hard
    /// growth ceiling. The ceiling is rounded up to at least `size`.
    #[inline]
    pub fn new(size: usize, ceiling: usize) -> Buffer {
        Buffer {
            data: vec![0; size],
            len: 0,
            ceiling: ceiling.max(size),
        }
    }

    /// The number of valid bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Current capacity.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer holds no data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remaining free capacity before the next growth step.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.len() - self.len
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Slice containing free capacity to be written. Call `move_tail` with
    /// the number of bytes actually written.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Marks `count` bytes of the write slice as valid data.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        debug_assert!(self.len + count <= self.data.len());
        self.len += count;
    }

    /// Borrow up to `count` bytes from the head without consuming them.
    #[inline]
    pub fn peek(&self, count: usize) -> &[u8] {
        &self.data[..count.min(self.len)]
    }

    /// Drops the `count`-byte prefix and compacts the remainder to offset
    /// zero. Consuming more than `len` bytes is a programming error.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len, "consume({}) exceeds len {}", count, self.len);

        if count == 0 {
            return;
        }

        self.data.copy_within(count..self.len, 0);
        self.len -= count;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Ensures capacity for at least `required` bytes of data, growing in
    /// increments up to the ceiling. Returns false if the ceiling would be
    /// exceeded.
    pub fn grow_to(&mut self, required: usize) -> bool {
        if required <= self.data.len() {
            return true;
        }

        if required > self.ceiling {
            return false;
        }

        let mut target = self.data.len().max(BUF_SIZE_INCREMENT);
        while target < required {
            target *= 2;
        }

        self.data.resize(target.min(self.ceiling), 0);
        true
    }

    /// Appends bytes at the tail, growing capacity as needed. Returns false
    /// if the growth ceiling would be exceeded; the buffer is unchanged in
    /// that case.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if !self.grow_to(self.len + bytes.len()) {
            return false;
        }

        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    /// Read in data from the supplied reader until it blocks, the source is
    /// exhausted, or the ceiling is reached. The caller derives the byte
    /// count from the change in `len`. An end-of-stream read is reported as
    /// `UnexpectedEof` once all prior data has been banked.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let orig_len = self.len;

        loop {
            if self.free_capacity() == 0 {
                let target = (self.len + BUF_SIZE_INCREMENT).min(self.ceiling);

                if target == self.len || !self.grow_to(target) {
                    // Ceiling reached. Hand back what was read; backpressure
                    // is the caller's job.
                    return Ok(self.len - orig_len);
                }
            }

            let read_count = reader.read(&mut self.data[self.len..])?;

            if read_count == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            self.len += read_count;
        }
    }

    /// Write the contents of the buffer to the supplied writer, consuming
    /// the written prefix. Blocking or failing mid-way still consumes
    /// whatever the writer accepted.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut written = 0;

        let result = loop {
            if written == self.len {
                break Ok(());
            }

            match writer.write(&self.data[written..self.len]) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(count) => written += count,
                Err(err) => break Err(err),
            }
        };

        self.consume(written);
        result.map(|_| written)
    }
}
