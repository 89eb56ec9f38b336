//! Pooled byte buffers and the segmented writer built on top of them.
//!
//! A [`BufferPool`] is an explicit, bounded free list of `BytesMut` segments.
//! Each connection pool owns one and hands clones to its sessions; nothing
//! here is process-global.
//!
//! [`SegmentWriter`] streams bytes into a chain of pooled segments, rotating
//! to a fresh segment whenever the current one cannot fit the next write.
//! Segments go back to the pool when they are flushed or discarded.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::CodecError;

/// Default number of idle segments a pool keeps.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Default segment size: two default-sized packets.
pub const DEFAULT_SEGMENT_SIZE: usize = 8192;

/// A bounded pool of reusable byte buffers.
///
/// Cloning is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
    capacity: usize,
    segment_size: usize,
    rented: AtomicUsize,
    returned: AtomicUsize,
    allocated: AtomicUsize,
    discarded: AtomicUsize,
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers handed out by [`BufferPool::rent`].
    pub rented: usize,
    /// Buffers handed back (kept or discarded).
    pub returned: usize,
    /// Fresh allocations made because no free buffer fit.
    pub allocated: usize,
    /// Returned buffers dropped because the free list was full.
    pub discarded: usize,
    /// Buffers currently idle in the free list.
    pub free: usize,
}

impl BufferPool {
    /// Create a pool that keeps at most `capacity` idle buffers and allocates
    /// new ones with at least `segment_size` bytes.
    #[must_use]
    pub fn new(capacity: usize, segment_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
                segment_size,
                rented: AtomicUsize::new(0),
                returned: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
            }),
        }
    }

    /// Minimum size of freshly allocated buffers.
    #[must_use]
    pub fn segment_size(&self) -> usize {
        self.inner.segment_size
    }

    /// Maximum number of idle buffers retained.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Take a buffer with room for at least `min_size` bytes.
    ///
    /// The buffer is always empty. It returns to the pool when dropped.
    #[must_use]
    pub fn rent(&self, min_size: usize) -> PooledBuffer {
        self.inner.rented.fetch_add(1, Ordering::Relaxed);

        let reused = {
            let mut free = self.inner.free.lock();
            let idx = free.iter().rposition(|buf| buf.capacity() >= min_size);
            idx.map(|idx| free.swap_remove(idx))
        };

        let buf = reused.unwrap_or_else(|| {
            self.inner.allocated.fetch_add(1, Ordering::Relaxed);
            BytesMut::with_capacity(min_size.max(self.inner.segment_size))
        });

        PooledBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.inner.rented.load(Ordering::Relaxed),
            returned: self.inner.returned.load(Ordering::Relaxed),
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            free: self.inner.free.lock().len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_SEGMENT_SIZE)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.inner.capacity)
            .field("segment_size", &self.inner.segment_size)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolInner {
    fn give_back(&self, mut buf: BytesMut) {
        if buf.capacity() == 0 {
            return;
        }
        buf.clear();
        self.returned.fetch_add(1, Ordering::Relaxed);

        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
///
/// Dereferences to `BytesMut`. Dropping it (or calling [`release`]) clears
/// the contents and hands it back; ownership rules out use after release.
///
/// [`release`]: PooledBuffer::release
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Return the buffer to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.give_back(buf);
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}

/// Streaming writer over a chain of pooled segments.
///
/// Positions are absolute stream offsets: they keep growing across flushes,
/// so a position taken before a flush can be recognized as stale.
pub struct SegmentWriter {
    pool: BufferPool,
    sealed: Vec<PooledBuffer>,
    current: PooledBuffer,
    /// Bytes exposed by the last `get_writable_region` and not yet committed.
    open: usize,
    /// Absolute offset of the first pending byte.
    flushed: usize,
    /// Bytes of the first pending segment already written by an
    /// interrupted flush.
    head: usize,
}

impl SegmentWriter {
    /// Create a writer drawing segments from `pool`.
    #[must_use]
    pub fn new(pool: BufferPool) -> Self {
        let current = pool.rent(pool.segment_size());
        Self {
            pool,
            sealed: Vec::new(),
            current,
            open: 0,
            flushed: 0,
            head: 0,
        }
    }

    /// Pool this writer draws from.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Expose exactly `size_hint` contiguous writable bytes.
    ///
    /// Rotates to a new segment if the current one cannot fit the region.
    /// Bytes become part of the stream only once [`advance`] commits them; a
    /// second call before `advance` abandons the previous region.
    ///
    /// [`advance`]: SegmentWriter::advance
    pub fn get_writable_region(&mut self, size_hint: usize) -> &mut [u8] {
        self.close_region();
        if size_hint == 0 {
            return &mut [];
        }

        if self.current.capacity() - self.current.len() < size_hint {
            self.rotate(size_hint);
        }

        let start = self.current.len();
        self.current.resize(start + size_hint, 0);
        self.open = size_hint;
        &mut self.current[start..]
    }

    /// Commit `n` bytes of the region returned by the last
    /// [`get_writable_region`](SegmentWriter::get_writable_region).
    pub fn advance(&mut self, n: usize) -> Result<(), CodecError> {
        if n > self.open {
            return Err(CodecError::AdvanceOutOfRange {
                requested: n,
                available: self.open,
            });
        }
        let len = self.current.len();
        self.current.truncate(len - (self.open - n));
        self.open = 0;
        Ok(())
    }

    /// Append `data`, rotating segments as needed.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        let region = self.get_writable_region(data.len());
        region.copy_from_slice(data);
        self.open = 0;
    }

    /// Append `n` zero bytes guaranteed to sit in one segment, returning
    /// their position for a later [`patch`](SegmentWriter::patch).
    pub fn reserve_contiguous(&mut self, n: usize) -> usize {
        let position = self.position();
        let _ = self.get_writable_region(n);
        self.open = 0;
        position
    }

    /// Overwrite already committed, not yet flushed bytes at `position`.
    pub fn patch(&mut self, position: usize, bytes: &[u8]) -> Result<(), CodecError> {
        self.close_region();
        let start = self.flushed;
        let end = self.position();
        if position < start || position + bytes.len() > end {
            return Err(CodecError::PatchOutOfRange {
                position,
                len: bytes.len(),
                start,
                end,
            });
        }

        let mut seg_start = start - self.head;
        let mut rest = bytes;
        let mut at = position;
        for seg in self.sealed.iter_mut().chain(std::iter::once(&mut self.current)) {
            let seg_end = seg_start + seg.len();
            if at < seg_end && !rest.is_empty() {
                let offset = at - seg_start;
                let take = rest.len().min(seg_end - at);
                seg[offset..offset + take].copy_from_slice(&rest[..take]);
                rest = &rest[take..];
                at += take;
            }
            seg_start = seg_end;
        }
        Ok(())
    }

    /// Drop committed bytes from `position` onwards.
    pub fn truncate(&mut self, position: usize) -> Result<(), CodecError> {
        self.close_region();
        let start = self.flushed;
        let end = self.position();
        if position < start || position > end {
            return Err(CodecError::PatchOutOfRange {
                position,
                len: 0,
                start,
                end,
            });
        }

        let mut keep = position - start + self.head;
        let mut idx = 0;
        while idx < self.sealed.len() && keep >= self.sealed[idx].len() {
            keep -= self.sealed[idx].len();
            idx += 1;
        }

        if idx < self.sealed.len() {
            let mut tail = self.sealed.drain(idx..);
            if let Some(mut cut) = tail.next() {
                cut.truncate(keep);
                // the rest of the tail and the old current go back to the pool
                drop(tail);
                self.current = cut;
            }
        } else {
            self.current.truncate(keep);
        }
        Ok(())
    }

    /// Absolute offset where the next committed byte will land.
    #[must_use]
    pub fn position(&self) -> usize {
        self.flushed + self.pending_len()
    }

    /// Committed bytes not yet flushed.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        let sealed: usize = self.sealed.iter().map(|seg| seg.len()).sum();
        sealed + self.current.len() - self.open - self.head
    }

    /// Number of segments currently holding pending bytes.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.sealed.len() + usize::from(self.current.len() > self.open)
    }

    /// Pending bytes, segment by segment.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        let committed = self.current.len() - self.open;
        let head = self.head;
        self.sealed
            .iter()
            .map(|seg| &seg[..])
            .chain(std::iter::once(&self.current[..committed]))
            .enumerate()
            .map(move |(idx, chunk)| if idx == 0 { &chunk[head..] } else { chunk })
            .filter(|chunk| !chunk.is_empty())
    }

    /// Write every pending byte to `io` and flush it.
    ///
    /// Progress is recorded after every write, so dropping the future part
    /// way leaves only the unsent bytes pending and the next call picks up
    /// where this one stopped. Written segments go back to the pool. If this
    /// fails part of the data may already be on the wire, so the transport
    /// has to be discarded.
    pub async fn flush_to<W>(&mut self, io: &mut W) -> Result<usize, CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.close_region();

        let mut written = 0;
        loop {
            let chunk = match self.sealed.first() {
                Some(seg) => &seg[self.head..],
                None if self.current.len() > self.head => &self.current[self.head..],
                None => break,
            };
            let remaining = chunk.len();
            let n = io.write(chunk).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }

            self.flushed += n;
            written += n;
            if n < remaining {
                self.head += n;
                continue;
            }
            self.head = 0;
            if self.sealed.is_empty() {
                self.current.clear();
            } else {
                // back to the pool
                drop(self.sealed.remove(0));
            }
        }
        io.flush().await?;

        tracing::trace!(bytes = written, "flushed pending segments");
        Ok(written)
    }

    /// Drop every pending byte without writing it.
    ///
    /// Positions taken before the discard stay stale.
    pub fn discard(&mut self) {
        self.close_region();
        self.flushed += self.pending_len();
        self.head = 0;
        self.sealed.clear();
        self.current.clear();
    }

    fn close_region(&mut self) {
        if self.open > 0 {
            let len = self.current.len();
            self.current.truncate(len - self.open);
            self.open = 0;
        }
    }

    fn rotate(&mut self, min_size: usize) {
        let fresh = self.pool.rent(min_size.max(self.pool.segment_size()));
        let old = std::mem::replace(&mut self.current, fresh);
        if !old.is_empty() {
            self.sealed.push(old);
        }
    }
}

impl fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("position", &self.position())
            .field("pending", &self.pending_len())
            .field("segments", &self.segment_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures_util::FutureExt;

    use super::*;

    fn collect(writer: &SegmentWriter) -> Vec<u8> {
        writer.chunks().flatten().copied().collect()
    }

    #[test]
    fn test_returned_buffer_is_cleared_and_reused() {
        let pool = BufferPool::new(4, 64);

        let mut buf = pool.rent(16);
        buf.extend_from_slice(b"previous command");
        buf.release();

        let buf = pool.rent(16);
        assert!(buf.is_empty());

        let stats = pool.stats();
        assert_eq!(stats.rented, 2);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.returned, 1);
    }

    #[test]
    fn test_free_list_is_bounded() {
        let pool = BufferPool::new(2, 32);
        let buffers: Vec<_> = (0..3).map(|_| pool.rent(8)).collect();
        drop(buffers);

        let stats = pool.stats();
        assert_eq!(stats.free, 2);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.returned, 3);
    }

    #[test]
    fn test_rent_skips_buffers_that_are_too_small() {
        let pool = BufferPool::new(4, 16);
        pool.rent(16).release();

        let big = pool.rent(1024);
        assert!(big.capacity() >= 1024);
        assert_eq!(pool.stats().allocated, 2);
        assert_eq!(pool.stats().free, 1);
    }

    #[test]
    fn test_writer_rotates_segments() {
        let pool = BufferPool::new(8, 16);
        let mut writer = SegmentWriter::new(pool);

        let data: Vec<u8> = (0..40).collect();
        for chunk in data.chunks(10) {
            let region = writer.get_writable_region(chunk.len());
            region.copy_from_slice(chunk);
            writer.advance(chunk.len()).unwrap();
        }

        assert!(writer.segment_count() > 1);
        assert_eq!(writer.pending_len(), 40);
        assert_eq!(collect(&writer), data);
    }

    #[test]
    fn test_partial_advance_and_abandoned_region() {
        let mut writer = SegmentWriter::new(BufferPool::new(2, 64));

        let region = writer.get_writable_region(8);
        region[..3].copy_from_slice(b"abc");
        writer.advance(3).unwrap();

        // never committed
        writer.get_writable_region(5).fill(b'x');
        writer.extend_from_slice(b"de");

        assert_eq!(collect(&writer), b"abcde");
        assert!(matches!(
            writer.advance(1),
            Err(CodecError::AdvanceOutOfRange { requested: 1, available: 0 })
        ));
    }

    #[test]
    fn test_patch_reserved_slot() {
        let mut writer = SegmentWriter::new(BufferPool::new(2, 64));
        writer.extend_from_slice(b"--");
        let pos = writer.reserve_contiguous(4);
        writer.extend_from_slice(b"tail");

        writer.patch(pos, b"HEAD").unwrap();
        assert_eq!(collect(&writer), b"--HEADtail");
        assert!(writer.patch(writer.position(), b"x").is_err());
    }

    #[tokio::test]
    async fn test_flush_returns_segments_and_keeps_positions() {
        let pool = BufferPool::new(8, 16);
        let mut writer = SegmentWriter::new(pool.clone());
        let pos = writer.reserve_contiguous(2);
        writer.extend_from_slice(&[7u8; 30]);

        let mut sink: Vec<u8> = Vec::new();
        let written = writer.flush_to(&mut sink).await.unwrap();
        assert_eq!(written, 32);
        assert_eq!(sink.len(), 32);
        assert_eq!(writer.pending_len(), 0);
        assert_eq!(writer.position(), 32);
        assert!(pool.stats().returned >= 1);

        // stale position
        assert!(matches!(
            writer.patch(pos, b"xx"),
            Err(CodecError::PatchOutOfRange { .. })
        ));
    }

    #[test]
    fn test_discard() {
        let mut writer = SegmentWriter::new(BufferPool::new(2, 8));
        writer.extend_from_slice(&[1u8; 20]);
        writer.discard();
        assert_eq!(writer.pending_len(), 0);
        assert_eq!(writer.chunks().count(), 0);
    }

    #[test]
    fn test_discard_makes_earlier_positions_stale() {
        let mut writer = SegmentWriter::new(BufferPool::new(2, 64));
        let pos = writer.reserve_contiguous(4);
        writer.extend_from_slice(b"body");
        writer.discard();
        assert_eq!(writer.position(), 8);

        writer.extend_from_slice(b"0123456789");
        assert!(matches!(
            writer.patch(pos, b"HEAD"),
            Err(CodecError::PatchOutOfRange { start: 8, .. })
        ));
    }

    /// Accepts at most `step` bytes per call until `budget` runs out, then
    /// stays pending.
    struct Stalling {
        out: Vec<u8>,
        budget: usize,
        step: usize,
    }

    impl AsyncWrite for Stalling {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let n = buf.len().min(self.budget).min(self.step);
            if n == 0 {
                return Poll::Pending;
            }
            self.budget -= n;
            self.out.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_dropped_flush_resumes_without_resending() {
        let mut writer = SegmentWriter::new(BufferPool::new(8, 16));
        let data: Vec<u8> = (0..40).collect();
        for chunk in data.chunks(10) {
            writer.extend_from_slice(chunk);
        }
        assert_eq!(writer.segment_count(), 4);

        let mut io = Stalling {
            out: Vec::new(),
            budget: 15,
            step: 4,
        };
        assert!(writer.flush_to(&mut io).now_or_never().is_none());
        assert_eq!(io.out, &data[..15]);
        assert_eq!(writer.pending_len(), 25);
        assert_eq!(writer.position(), 40);
        assert_eq!(collect(&writer), &data[15..]);

        // sent bytes can no longer be patched
        assert!(writer.patch(14, &[14]).is_err());
        writer.patch(15, &[15]).unwrap();

        io.budget = usize::MAX;
        let written = writer.flush_to(&mut io).now_or_never().unwrap().unwrap();
        assert_eq!(written, 25);
        assert_eq!(io.out, data);
        assert_eq!(writer.pending_len(), 0);
    }
}
