//! Stream adapters shared by the backends.

use crate::traits::ObjectRead;
use depot_core::ThrottlerSelection;
use metrics::Counter;
use std::io::{self, Read, Seek, SeekFrom};

/// Several object streams exposed as one seekable stream, in order.
///
/// Part sizes are taken from the streams themselves, not from the advisory
/// `bytes_size` of the objects they were opened for.
pub struct ConcatReader {
    parts: Vec<Box<dyn ObjectRead>>,
    /// Offset of each part within the concatenated stream.
    offsets: Vec<u64>,
    total: u64,
    current: usize,
    position: u64,
}

impl ConcatReader {
    pub fn new(mut parts: Vec<Box<dyn ObjectRead>>) -> io::Result<Self> {
        let mut offsets = Vec::with_capacity(parts.len());
        let mut total = 0u64;
        for part in parts.iter_mut() {
            offsets.push(total);
            total += part.object_size()?;
            part.seek(SeekFrom::Start(0))?;
        }
        Ok(Self {
            parts,
            offsets,
            total,
            current: 0,
            position: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn part_end(&self, index: usize) -> u64 {
        self.offsets.get(index + 1).copied().unwrap_or(self.total)
    }
}

impl Read for ConcatReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current < self.parts.len() {
            if self.position >= self.part_end(self.current) {
                self.current += 1;
                if let Some(next) = self.parts.get_mut(self.current) {
                    next.seek(SeekFrom::Start(0))?;
                }
                continue;
            }
            let n = self.parts[self.current].read(buf)?;
            if n == 0 {
                // The part ended before its measured size; treat it as exhausted.
                self.position = self.part_end(self.current);
                continue;
            }
            self.position += n as u64;
            return Ok(n);
        }
        Ok(0)
    }
}

impl Seek for ConcatReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.total.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;

        // Index of the last part starting at or before `target`.
        let index = self.offsets.partition_point(|&offset| offset <= target);
        self.current = index.saturating_sub(1);
        if let Some(part) = self.parts.get_mut(self.current) {
            let within = target.saturating_sub(self.offsets[self.current]);
            part.seek(SeekFrom::Start(within))?;
        }
        self.position = target;
        Ok(target)
    }
}

impl ObjectRead for ConcatReader {
    fn object_size(&mut self) -> io::Result<u64> {
        Ok(self.total)
    }
}

/// Feeds every chunk read through the selected throttler and a bytes counter.
pub struct ThrottledReader<R> {
    inner: R,
    throttler: ThrottlerSelection,
    bytes_read: Counter,
}

impl<R> ThrottledReader<R> {
    pub fn new(inner: R, throttler: ThrottlerSelection, bytes_read: Counter) -> Self {
        Self {
            inner,
            throttler,
            bytes_read,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.throttler.throttle(n as u64);
            self.bytes_read.increment(n as u64);
        }
        Ok(n)
    }
}

impl<R: Seek> Seek for ThrottledReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl<R: Read + Seek + Send> ObjectRead for ThrottledReader<R> {}
