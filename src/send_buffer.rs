//! Outbound byte rings.
//!
//! Connections never write to their socket directly. Everything is queued into a
//! [`SendBuffer`], a ring of [`SEND_BUFFER_SIZE`] bytes borrowed from a shared
//! [`SendBufferPool`] while the connection has output, and drained by the event loop when the
//! socket is writable. One byte of each ring stays unused so that `head == tail` always means
//! empty and `(head + 1) % size == tail` always means full.
//!
//! A ring can also be attached to a file, in which case the event loop refills it from the file
//! as it drains.
//!
//! [`SendBuffer::queue`] is all or nothing. Response writers that must not drop bytes use
//! [`SendBuffer::enqueue`], which parks whatever does not fit in a spill area that is moved into
//! the ring as it drains. The spill area is capped by the caller, so a peer that stops reading
//! holds at most one ring plus the cap.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::{SEND_BUFFER_POOL_SIZE, SEND_BUFFER_SIZE};
use crate::fs::FileHandle;

/// Returned when data does not fit in a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueueFull;

/// Fixed set of ring buffers, allocated once.
#[derive(Debug)]
pub struct SendBufferPool {
    slots: Vec<Option<Box<[u8]>>>,
    in_use: u8,
}

impl SendBufferPool {
    /// [`SEND_BUFFER_POOL_SIZE`] rings of [`SEND_BUFFER_SIZE`] bytes.
    pub fn new() -> Self {
        Self::with_capacity(SEND_BUFFER_POOL_SIZE, SEND_BUFFER_SIZE)
    }

    /// `count` rings of `size` bytes. `count` is capped at eight.
    pub fn with_capacity(count: usize, size: usize) -> Self {
        let count = count.min(8);
        SendBufferPool {
            slots: (0..count)
                .map(|_| Some(vec![0u8; size].into_boxed_slice()))
                .collect(),
            in_use: 0,
        }
    }

    /// Number of rings handed out.
    pub fn in_use(&self) -> u32 {
        self.in_use.count_ones()
    }

    /// Number of rings available.
    pub fn available(&self) -> u32 {
        self.slots.len() as u32 - self.in_use()
    }

    fn take(&mut self) -> Option<(u8, Box<[u8]>)> {
        let free = !self.in_use;
        if free == 0 {
            return None;
        }

        let idx = free.trailing_zeros() as usize;
        let buf = self.slots.get_mut(idx)?.take()?;
        self.in_use |= 1 << idx;
        Some((idx as u8, buf))
    }

    fn give_back(&mut self, idx: u8, buf: Box<[u8]>) {
        if let Some(slot) = self.slots.get_mut(idx as usize) {
            *slot = Some(buf);
            self.in_use &= !(1 << idx);
        }
    }
}

impl Default for SendBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A file being streamed through a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStream {
    /// Open file.
    pub handle: FileHandle,
    /// Bytes still to read.
    pub remaining: u32,
}

/// One connection's outbound ring.
#[derive(Debug)]
pub struct SendBuffer {
    buf: Option<Box<[u8]>>,
    slot: u8,
    head: usize,
    tail: usize,
    file: Option<FileStream>,
    spill: Vec<u8>,
    spill_pos: usize,
}

impl SendBuffer {
    /// A buffer with no ring attached.
    pub const fn new() -> Self {
        SendBuffer {
            buf: None,
            slot: 0,
            head: 0,
            tail: 0,
            file: None,
            spill: Vec::new(),
            spill_pos: 0,
        }
    }

    /// Whether a ring is attached.
    pub fn is_allocated(&self) -> bool {
        self.buf.is_some()
    }

    /// Attach a ring from `pool`. Succeeds immediately if one is already attached.
    pub fn alloc(&mut self, pool: &mut SendBufferPool) -> Result<(), QueueFull> {
        if self.buf.is_some() {
            return Ok(());
        }

        let (slot, buf) = pool.take().ok_or(QueueFull)?;
        self.buf = Some(buf);
        self.slot = slot;
        self.head = 0;
        self.tail = 0;
        Ok(())
    }

    /// Return the ring to `pool` and forget any queued data. An attached file is handed back
    /// for the caller to close.
    pub fn free(&mut self, pool: &mut SendBufferPool) -> Option<FileHandle> {
        if let Some(buf) = self.buf.take() {
            pool.give_back(self.slot, buf);
        }
        self.head = 0;
        self.tail = 0;
        self.spill = Vec::new();
        self.spill_pos = 0;
        self.stop_file()
    }

    /// Index of the attached ring within its pool.
    pub fn slot(&self) -> Option<u8> {
        self.buf.as_ref().map(|_| self.slot)
    }

    /// Ring size, or 0 when no ring is attached.
    pub fn size(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    /// Bytes queued in the ring.
    pub fn pending(&self) -> usize {
        let size = self.size();
        if size == 0 {
            return 0;
        }
        (self.head + size - self.tail) % size
    }

    /// Free bytes in the ring.
    pub fn space(&self) -> usize {
        self.size().saturating_sub(1 + self.pending())
    }

    /// Whether the ring holds no data.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Whether the ring cannot take another byte.
    pub fn is_full(&self) -> bool {
        let size = self.size();
        size == 0 || (self.head + 1) % size == self.tail
    }

    /// Whether anything (ring or spill) is waiting to go out.
    pub fn has_data(&self) -> bool {
        !self.is_empty() || self.spill_pos < self.spill.len()
    }

    /// Copy all of `data` into the ring, or nothing at all.
    pub fn queue(&mut self, data: &[u8]) -> Result<usize, QueueFull> {
        if data.len() > self.space() {
            return Err(QueueFull);
        }
        let Some(buf) = self.buf.as_deref_mut() else {
            return Err(QueueFull);
        };

        let size = buf.len();
        let first = data.len().min(size - self.head);
        buf[self.head..self.head + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            buf[..rest].copy_from_slice(&data[first..]);
        }

        self.head = (self.head + data.len()) % size;
        Ok(data.len())
    }

    /// Copy every slice of `parts` into the ring, or nothing at all. Refused while spilled
    /// bytes are waiting, so queued data never overtakes them.
    pub fn queue_parts(&mut self, parts: &[&[u8]]) -> Result<usize, QueueFull> {
        let total = parts.iter().map(|p| p.len()).sum::<usize>();
        if total > self.space() || !self.is_allocated() || self.spill_pos < self.spill.len() {
            return Err(QueueFull);
        }

        for part in parts {
            self.queue(part)?;
        }
        Ok(total)
    }

    /// Bytes still waiting in the spill area.
    pub fn spilled(&self) -> usize {
        self.spill.len() - self.spill_pos
    }

    /// How many more bytes [`SendBuffer::enqueue`] accepts with a spill cap of `max_spill`.
    pub fn room(&self, max_spill: usize) -> usize {
        if !self.is_allocated() {
            return 0;
        }
        match self.spilled() {
            0 => self.space() + max_spill,
            spilled => max_spill.saturating_sub(spilled),
        }
    }

    /// Queue `data`, parking what does not fit in the spill area. Nothing is queued when the
    /// spill area would grow past `max_spill` bytes or cannot be allocated.
    pub fn enqueue(&mut self, data: &[u8], max_spill: usize) -> Result<(), QueueFull> {
        self.enqueue_parts(&[data], max_spill)
    }

    /// [`SendBuffer::enqueue`] for the concatenation of `parts`, all or nothing.
    pub fn enqueue_parts(&mut self, parts: &[&[u8]], max_spill: usize) -> Result<(), QueueFull> {
        let total = parts.iter().map(|p| p.len()).sum::<usize>();
        if total > self.room(max_spill) {
            return Err(QueueFull);
        }

        let overflow = if self.spilled() == 0 {
            total.saturating_sub(self.space())
        } else {
            total
        };
        if overflow > 0 {
            if self.spill_pos > 0 {
                self.spill.drain(..self.spill_pos);
                self.spill_pos = 0;
            }
            self.spill.try_reserve(overflow).map_err(|_| QueueFull)?;
        }

        for part in parts {
            let mut data = *part;
            if self.spilled() == 0 {
                let fits = data.len().min(self.space());
                self.queue(&data[..fits])?;
                data = &data[fits..];
            }
            self.spill.extend_from_slice(data);
        }
        Ok(())
    }

    /// Move spilled bytes into the ring as space allows.
    pub fn refill_from_spill(&mut self) {
        while self.spill_pos < self.spill.len() {
            let (head, tail) = (self.head, self.tail);
            let Some(buf) = self.buf.as_deref_mut() else {
                return;
            };
            let span = writable(buf, head, tail);
            if span.is_empty() {
                return;
            }

            let n = span.len().min(self.spill.len() - self.spill_pos);
            span[..n].copy_from_slice(&self.spill[self.spill_pos..self.spill_pos + n]);
            self.spill_pos += n;
            self.commit(n);
        }

        if !self.spill.is_empty() {
            self.spill = Vec::new();
            self.spill_pos = 0;
        }
    }

    /// The longest contiguous run of queued bytes.
    pub fn peek(&self) -> &[u8] {
        let Some(buf) = self.buf.as_deref() else {
            return &[];
        };

        if self.head >= self.tail {
            &buf[self.tail..self.head]
        } else {
            &buf[self.tail..]
        }
    }

    /// Drop `n` bytes from the front of the ring. An emptied ring rewinds to offset 0.
    pub fn consume(&mut self, n: usize) {
        let size = self.size();
        if size == 0 {
            return;
        }

        let n = n.min(self.pending());
        self.tail = (self.tail + n) % size;
        if self.tail == self.head {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// The longest contiguous writable run, for producers that write in place. Follow with
    /// [`SendBuffer::commit`].
    pub fn write_ptr(&mut self) -> &mut [u8] {
        let (head, tail) = (self.head, self.tail);
        match self.buf.as_deref_mut() {
            Some(buf) => writable(buf, head, tail),
            None => &mut [],
        }
    }

    /// Publish `n` bytes written through [`SendBuffer::write_ptr`].
    pub fn commit(&mut self, n: usize) {
        let size = self.size();
        if size == 0 {
            return;
        }
        self.head = (self.head + n.min(self.space())) % size;
    }

    /// Stream `size` bytes of `handle` through this ring. A previously attached file is handed
    /// back for the caller to close.
    pub fn start_file(&mut self, handle: FileHandle, size: u32) -> Option<FileHandle> {
        let previous = self.stop_file();
        self.file = Some(FileStream {
            handle,
            remaining: size,
        });
        previous
    }

    /// Detach the streamed file, handing it back for the caller to close.
    pub fn stop_file(&mut self) -> Option<FileHandle> {
        self.file.take().map(|f| f.handle)
    }

    /// Whether a file is attached.
    pub fn is_streaming(&self) -> bool {
        self.file.is_some()
    }

    /// The attached file.
    pub fn file(&self) -> Option<FileStream> {
        self.file
    }

    /// Record that `n` bytes of the attached file were committed to the ring.
    pub fn file_consumed(&mut self, n: u32) {
        if let Some(file) = self.file.as_mut() {
            file.remaining = file.remaining.saturating_sub(n);
        }
    }
}

fn writable(buf: &mut [u8], head: usize, tail: usize) -> &mut [u8] {
    let size = buf.len();
    let end = if head >= tail {
        if tail == 0 { size - 1 } else { size }
    } else {
        tail - 1
    };
    &mut buf[head..end]
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}
