//! Decoded pixel storage and its hand-off between network and render side.
//!
//! A [`FramebufferSource`] keeps two buffers. The receive loop writes into
//! the back buffer through a [`FramebufferReference`], one writer at a time,
//! and calls [`FramebufferSource::publish`] once an update is complete. That
//! copies the damaged regions into the front buffer, which render threads
//! read through [`FramebufferSnapshot`]s.
//!
//! Snapshots are read-only and never resize anything. Rectangle writes do
//! not wait for them; only replacing the back buffer with one of a new size
//! waits until every snapshot has been dropped. A snapshot still held while
//! the front is republished keeps its own copy, so readers never observe a
//! half-applied update.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{DecodeError, LifecycleError, RfbError};
use crate::types::{BYTES_PER_PIXEL, FrameSize, Rect};

/// Upper bound on how long an async waiter sleeps before re-checking.
const ACQUIRE_POLL: Duration = Duration::from_millis(50);

/// Past this many damaged rectangles a publish copies the whole buffer.
const MAX_DAMAGE_RECTS: usize = 256;

// ── Damage ───────────────────────────────────────────────────────

/// Regions written since the last publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Damage {
    #[default]
    Clean,
    Rects(Vec<Rect>),
    Full,
}

impl Damage {
    fn add(&mut self, rect: Rect) {
        let overflow = match self {
            Damage::Full => return,
            Damage::Clean => {
                *self = Damage::Rects(vec![rect]);
                return;
            }
            Damage::Rects(rects) => {
                rects.push(rect);
                rects.len() > MAX_DAMAGE_RECTS
            }
        };
        if overflow {
            *self = Damage::Full;
        }
    }
}

// ── Framebuffer ──────────────────────────────────────────────────

/// BGRA 8:8:8:8 pixel buffer, row-major, stride `width * 4`.
#[derive(Debug, Default)]
pub struct Framebuffer {
    size: FrameSize,
    generation: u64,
    pixels: Vec<u8>,
    damage: Damage,
}

impl Framebuffer {
    fn new(size: FrameSize, generation: u64) -> Self {
        Self {
            size,
            generation,
            pixels: vec![0; size.byte_len()],
            damage: Damage::Full,
        }
    }

    pub fn size(&self) -> FrameSize {
        self.size
    }

    /// Allocation counter; a resize always produces a new generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.size.width as usize * BYTES_PER_PIXEL
    }

    pub fn data(&self) -> &[u8] {
        &self.pixels
    }

    /// Raw pixel access. Marks the whole buffer as changed.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.damage = Damage::Full;
        &mut self.pixels
    }

    /// One full row, or `None` past the bottom edge.
    pub fn row(&self, y: u16) -> Option<&[u8]> {
        if y >= self.size.height {
            return None;
        }
        let start = y as usize * self.stride();
        self.pixels.get(start..start + self.stride())
    }

    /// BGRA value at `(x, y)`.
    pub fn pixel(&self, x: u16, y: u16) -> Option<[u8; 4]> {
        if x >= self.size.width || y >= self.size.height {
            return None;
        }
        let i = self.offset(x, y);
        let p = self.pixels.get(i..i + BYTES_PER_PIXEL)?;
        Some([p[0], p[1], p[2], p[3]])
    }

    /// Copy out the BGRA bytes of `rect`, tightly packed.
    pub fn read_rect(&self, rect: Rect) -> Result<Vec<u8>, DecodeError> {
        self.check(rect)?;
        let row_len = rect.width as usize * BYTES_PER_PIXEL;
        let mut out = Vec::with_capacity(rect.area() * BYTES_PER_PIXEL);
        for y in rect.y..rect.y + rect.height {
            let start = self.offset(rect.x, y);
            out.extend_from_slice(&self.pixels[start..start + row_len]);
        }
        Ok(out)
    }

    /// Fill `rect` with one colour.
    pub fn fill_rect(&mut self, rect: Rect, bgra: [u8; 4]) -> Result<(), DecodeError> {
        self.check(rect)?;
        let row_len = rect.width as usize * BYTES_PER_PIXEL;
        for y in rect.y..rect.y + rect.height {
            let start = self.offset(rect.x, y);
            for px in self.pixels[start..start + row_len].chunks_exact_mut(BYTES_PER_PIXEL) {
                px.copy_from_slice(&bgra);
            }
        }
        self.damage.add(rect);
        Ok(())
    }

    /// Write tightly packed BGRA rows into `rect`.
    pub fn put_pixels(&mut self, rect: Rect, src: &[u8]) -> Result<(), DecodeError> {
        self.check(rect)?;
        let row_len = rect.width as usize * BYTES_PER_PIXEL;
        if src.len() < row_len * rect.height as usize {
            return Err(DecodeError::Truncated("pixel data"));
        }
        if row_len == 0 {
            return Ok(());
        }
        for (dy, row) in src.chunks_exact(row_len).take(rect.height as usize).enumerate() {
            let start = self.offset(rect.x, rect.y + dy as u16);
            self.pixels[start..start + row_len].copy_from_slice(row);
        }
        self.damage.add(rect);
        Ok(())
    }

    /// Copy the `dst`-sized region whose top-left is `(src_x, src_y)` to `dst`.
    ///
    /// Overlapping source and destination behave as if the source were
    /// read completely before writing.
    pub fn copy_rect(&mut self, src_x: u16, src_y: u16, dst: Rect) -> Result<(), DecodeError> {
        let src = Rect::new(src_x, src_y, dst.width, dst.height);
        self.check(src)?;
        self.check(dst)?;
        let row_len = dst.width as usize * BYTES_PER_PIXEL;
        let rows: Box<dyn Iterator<Item = u16>> = if dst.y > src.y {
            Box::new((0..dst.height).rev())
        } else {
            Box::new(0..dst.height)
        };
        for dy in rows {
            let from = self.offset(src.x, src.y + dy);
            let to = self.offset(dst.x, dst.y + dy);
            self.pixels.copy_within(from..from + row_len, to);
        }
        self.damage.add(dst);
        Ok(())
    }

    /// Same pixels, no pending damage.
    fn duplicate(&self) -> Framebuffer {
        Framebuffer {
            size: self.size,
            generation: self.generation,
            pixels: self.pixels.clone(),
            damage: Damage::Clean,
        }
    }

    /// Bring `front`, a buffer of the same generation, up to date.
    fn copy_damage(&self, damage: &Damage, front: &mut Framebuffer) {
        match damage {
            Damage::Clean => {}
            Damage::Full => front.pixels.copy_from_slice(&self.pixels),
            Damage::Rects(rects) => {
                for rect in rects {
                    let row_len = rect.width as usize * BYTES_PER_PIXEL;
                    for y in rect.y..rect.y + rect.height {
                        let start = self.offset(rect.x, y);
                        front.pixels[start..start + row_len]
                            .copy_from_slice(&self.pixels[start..start + row_len]);
                    }
                }
            }
        }
    }

    fn offset(&self, x: u16, y: u16) -> usize {
        y as usize * self.stride() + x as usize * BYTES_PER_PIXEL
    }

    fn check(&self, rect: Rect) -> Result<(), DecodeError> {
        if self.size.contains(&rect) {
            Ok(())
        } else {
            Err(DecodeError::OutOfBounds(rect))
        }
    }
}

// ── Shared slot ──────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Slot {
    /// Writer side; `None` while checked out or before the first allocation.
    back: Option<Framebuffer>,
    writing: bool,
    /// Last published state, shared with every live snapshot.
    front: Option<Arc<Framebuffer>>,
    readers: usize,
    last_generation: u64,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    slot: Mutex<Slot>,
    changed: Condvar,
    changed_async: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.changed.notify_all();
        self.changed_async.notify_waiters();
    }

    /// Check the back buffer out at `size` if no other writer holds it.
    ///
    /// A size change allocates a new generation, but only once no snapshot
    /// is alive; until then the caller has to wait.
    fn try_take(slot: &mut Slot, size: FrameSize) -> Result<Option<Framebuffer>, LifecycleError> {
        if slot.closed {
            return Err(LifecycleError::Disposed("framebuffer source"));
        }
        if slot.writing {
            return Ok(None);
        }
        let buffer = match slot.back.take() {
            Some(fb) if fb.size == size => fb,
            Some(fb) if slot.readers > 0 => {
                trace!(readers = slot.readers, "resize waits for readers");
                slot.back = Some(fb);
                return Ok(None);
            }
            old => {
                slot.last_generation += 1;
                debug!(
                    size = %size,
                    generation = slot.last_generation,
                    previous = ?old.as_ref().map(|fb| fb.generation),
                    "allocating framebuffer"
                );
                Framebuffer::new(size, slot.last_generation)
            }
        };
        slot.writing = true;
        Ok(Some(buffer))
    }

    fn give_back(&self, buffer: Framebuffer) {
        {
            let mut slot = self.lock();
            trace!(generation = buffer.generation, "framebuffer released");
            slot.back = Some(buffer);
            slot.writing = false;
        }
        self.wake();
    }

    fn release_reader(&self) {
        self.lock().readers -= 1;
        self.wake();
    }
}

// ── FramebufferSource ────────────────────────────────────────────

/// Owner of the connection's pixel buffers.
///
/// Cloning yields another handle to the same buffers.
#[derive(Debug, Clone, Default)]
pub struct FramebufferSource {
    shared: Arc<Shared>,
}

impl FramebufferSource {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Writer side ──

    /// Async acquisition for the receive loop.
    ///
    /// Allocates a new generation when no buffer exists or its size differs
    /// from `frame_size`. Waits while another writer holds the buffer, or
    /// while snapshots are alive and a resize is pending, and returns
    /// [`RfbError::Cancelled`] as soon as `cancel` fires.
    pub async fn acquire(
        &self,
        frame_size: FrameSize,
        cancel: &CancellationToken,
    ) -> Result<FramebufferReference, RfbError> {
        loop {
            let notified = self.shared.changed_async.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut slot = self.shared.lock();
                if let Some(buffer) = Shared::try_take(&mut slot, frame_size)? {
                    return Ok(self.reference(buffer));
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RfbError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep(ACQUIRE_POLL) => {}
            }
        }
    }

    /// Blocking form of [`acquire`](Self::acquire) for writers outside the
    /// runtime.
    pub fn acquire_blocking(&self, frame_size: FrameSize) -> Result<FramebufferReference, RfbError> {
        let mut slot = self.shared.lock();
        loop {
            if let Some(buffer) = Shared::try_take(&mut slot, frame_size)? {
                return Ok(self.reference(buffer));
            }
            slot = self
                .shared
                .changed
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Make everything written since the last publish visible to readers.
    ///
    /// Updates the front buffer in place when nobody is reading it,
    /// otherwise replaces it with a fresh copy. Returns the published
    /// generation, or `None` when the back buffer is checked out or was
    /// never allocated.
    pub fn publish(&self) -> Option<u64> {
        let mut guard = self.shared.lock();
        let slot = &mut *guard;
        let back = slot.back.as_mut()?;
        let damage = std::mem::take(&mut back.damage);
        let in_place = slot
            .front
            .as_mut()
            .and_then(Arc::get_mut)
            .filter(|front| front.generation == back.generation);
        if let Some(front) = in_place {
            back.copy_damage(&damage, front);
        } else {
            slot.front = Some(Arc::new(back.duplicate()));
        }
        let generation = back.generation;
        drop(guard);
        trace!(generation, "framebuffer published");
        self.shared.wake();
        Some(generation)
    }

    /// Whether a writer holds the back buffer.
    pub fn is_checked_out(&self) -> bool {
        self.shared.lock().writing
    }

    /// Generation of the most recent allocation (0 before the first).
    pub fn latest_generation(&self) -> u64 {
        self.shared.lock().last_generation
    }

    // ── Render side ──

    /// Block until something has been published, then take a read-only
    /// snapshot of it.
    ///
    /// Never allocates or resizes. When `frame_size` is out of date the
    /// snapshot has the published size, which callers read from
    /// [`Framebuffer::size`].
    pub fn grab_framebuffer_reference(
        &self,
        frame_size: FrameSize,
    ) -> Result<FramebufferSnapshot, RfbError> {
        let mut slot = self.shared.lock();
        loop {
            if slot.closed {
                return Err(LifecycleError::Disposed("framebuffer source").into());
            }
            if let Some(snapshot) = self.snapshot(&mut slot) {
                if snapshot.size != frame_size {
                    debug!(
                        requested = %frame_size,
                        published = %snapshot.size,
                        "render size is stale"
                    );
                }
                return Ok(snapshot);
            }
            slot = self
                .shared
                .changed
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Snapshot of the published buffer without waiting.
    ///
    /// `None` before the first publish or once the source is closed.
    pub fn try_current(&self) -> Option<FramebufferSnapshot> {
        let mut slot = self.shared.lock();
        if slot.closed {
            return None;
        }
        self.snapshot(&mut slot)
    }

    /// Size of the published buffer, if any.
    pub fn current_size(&self) -> Option<FrameSize> {
        self.shared.lock().front.as_ref().map(|fb| fb.size)
    }

    /// Number of live snapshots.
    pub fn readers(&self) -> usize {
        self.shared.lock().readers
    }

    // ── Lifecycle ──

    /// Refuse further acquisitions and wake every waiter.
    ///
    /// Outstanding references and snapshots stay valid until dropped.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    fn reference(&self, buffer: Framebuffer) -> FramebufferReference {
        FramebufferReference {
            shared: Arc::clone(&self.shared),
            buffer,
        }
    }

    fn snapshot(&self, slot: &mut Slot) -> Option<FramebufferSnapshot> {
        let buffer = Arc::clone(slot.front.as_ref()?);
        slot.readers += 1;
        Some(FramebufferSnapshot {
            shared: Arc::clone(&self.shared),
            buffer,
        })
    }
}

// ── FramebufferReference ─────────────────────────────────────────

/// Exclusive write access to the back buffer. Dropping releases it.
#[derive(Debug)]
pub struct FramebufferReference {
    shared: Arc<Shared>,
    buffer: Framebuffer,
}

impl Deref for FramebufferReference {
    type Target = Framebuffer;

    fn deref(&self) -> &Framebuffer {
        &self.buffer
    }
}

impl DerefMut for FramebufferReference {
    fn deref_mut(&mut self) -> &mut Framebuffer {
        &mut self.buffer
    }
}

impl Drop for FramebufferReference {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.shared.give_back(buffer);
    }
}

// ── FramebufferSnapshot ──────────────────────────────────────────

/// Read-only view of a published buffer for one paint.
#[derive(Debug)]
pub struct FramebufferSnapshot {
    shared: Arc<Shared>,
    buffer: Arc<Framebuffer>,
}

impl Deref for FramebufferSnapshot {
    type Target = Framebuffer;

    fn deref(&self) -> &Framebuffer {
        &self.buffer
    }
}

impl Drop for FramebufferSnapshot {
    fn drop(&mut self) {
        self.shared.release_reader();
    }
}
