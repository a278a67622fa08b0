//! Backpressured byte pipes
//!
//! A pipe has exactly one [ByteWriter] and one [ByteReader]. Ownership of an
//! end is the lock on it: moving an end into a task, a process, or
//! [pipe_to()] hands over the only way to touch that side of the stream.

use crate::{
    errors::{StreamError, VFSError},
    protocol::DirEntry,
};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::Notify;

/// Default buffering limit for pipes, in bytes
pub const DEFAULT_HIGH_WATER_MARK: usize = 65535;

/// Lazy sequence of directory entries
pub type EntryStream = BoxStream<'static, Result<DirEntry, VFSError>>;

/// Directory listing that yields a fixed set of entries
pub fn entries<I>(items: I) -> EntryStream
where
    I: IntoIterator<Item = DirEntry>,
    I::IntoIter: Send + 'static,
{
    stream::iter(items.into_iter().map(Ok)).boxed()
}

#[derive(Default)]
struct State {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    closed: bool,
    aborted: Option<String>,
    canceled: Option<String>,
}

struct Shared {
    high_water_mark: usize,
    state: Mutex<State>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Writing end of a pipe
pub struct ByteWriter {
    shared: Arc<Shared>,
}

/// Reading end of a pipe
pub struct ByteReader {
    shared: Arc<Shared>,
}

impl fmt::Debug for ByteWriter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ByteWriter")
            .field("buffered", &state.buffered)
            .field("canceled", &state.canceled)
            .finish()
    }
}

impl fmt::Debug for ByteReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ByteReader")
            .field("buffered", &state.buffered)
            .field("closed", &state.closed)
            .field("aborted", &state.aborted)
            .finish()
    }
}

/// Create a connected pair of pipe ends
///
/// The writer is only ready while fewer than `high_water_mark` bytes are
/// buffered and unread. A limit of zero still admits one chunk at a time.
pub fn pipe(high_water_mark: usize) -> (ByteWriter, ByteReader) {
    let shared = Arc::new(Shared {
        high_water_mark: high_water_mark.max(1),
        state: Mutex::new(State::default()),
        changed: Notify::new(),
    });
    (
        ByteWriter {
            shared: shared.clone(),
        },
        ByteReader { shared },
    )
}

impl ByteWriter {
    /// Wait until the reader has room for more bytes
    pub async fn ready(&self) -> Result<(), StreamError> {
        loop {
            let changed = self.shared.changed.notified();
            {
                let state = self.shared.lock();
                if let Some(reason) = &state.canceled {
                    return Err(StreamError::Canceled(reason.clone()));
                }
                if let Some(reason) = &state.aborted {
                    return Err(StreamError::Aborted(reason.clone()));
                }
                if state.closed {
                    return Err(StreamError::Closed);
                }
                if state.buffered < self.shared.high_water_mark {
                    return Ok(());
                }
            }
            changed.await;
        }
    }

    /// Queue one chunk, after waiting for readiness
    pub async fn write<B: Into<Bytes>>(&mut self, chunk: B) -> Result<(), StreamError> {
        let chunk = chunk.into();
        self.ready().await?;
        if !chunk.is_empty() {
            let mut state = self.shared.lock();
            state.buffered += chunk.len();
            state.chunks.push_back(chunk);
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    /// Queue a whole buffer, split so no single chunk exceeds the high water mark
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        for piece in data.chunks(self.shared.high_water_mark) {
            self.write(Bytes::copy_from_slice(piece)).await?;
        }
        Ok(())
    }

    /// Resolves with the reason once the reader has canceled
    pub async fn canceled(&self) -> String {
        loop {
            let changed = self.shared.changed.notified();
            if let Some(reason) = &self.shared.lock().canceled {
                return reason.clone();
            }
            changed.await;
        }
    }

    /// Signal a clean end of stream
    pub fn close(self) {
        drop(self);
    }

    /// Signal that the stream failed; the reader sees an error instead of EOF
    pub fn abort<S: Into<String>>(self, reason: S) {
        {
            let mut state = self.shared.lock();
            if !state.closed {
                state.aborted = Some(reason.into());
            }
        }
        self.shared.changed.notify_waiters();
    }
}

impl Drop for ByteWriter {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            if state.aborted.is_none() {
                state.closed = true;
            }
        }
        self.shared.changed.notify_waiters();
    }
}

impl ByteReader {
    /// Reader that yields `data` and then reaches end of stream
    pub fn from_bytes<B: Into<Bytes>>(data: B) -> Self {
        let data = data.into();
        let (writer, reader) = pipe(data.len());
        {
            let mut state = writer.shared.lock();
            if !data.is_empty() {
                state.buffered = data.len();
                state.chunks.push_back(data);
            }
        }
        writer.close();
        reader
    }

    /// Reader that is already at end of stream
    pub fn empty() -> Self {
        ByteReader::from_bytes(Bytes::new())
    }

    /// Next chunk, or `None` at end of stream
    pub async fn read(&mut self) -> Result<Option<Bytes>, StreamError> {
        loop {
            let changed = self.shared.changed.notified();
            {
                let mut state = self.shared.lock();
                if let Some(reason) = &state.canceled {
                    return Err(StreamError::Canceled(reason.clone()));
                }
                if let Some(reason) = &state.aborted {
                    return Err(StreamError::Aborted(reason.clone()));
                }
                if let Some(chunk) = state.chunks.pop_front() {
                    state.buffered -= chunk.len();
                    drop(state);
                    self.shared.changed.notify_waiters();
                    return Ok(Some(chunk));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            changed.await;
        }
    }

    /// Collect everything until end of stream
    pub async fn read_to_end(&mut self) -> Result<Bytes, StreamError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.read().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Everything buffered right now, without waiting for more
    pub fn take_buffered(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        {
            let mut state = self.shared.lock();
            for chunk in state.chunks.drain(..) {
                buf.extend_from_slice(&chunk);
            }
            state.buffered = 0;
        }
        self.shared.changed.notify_waiters();
        buf.freeze()
    }

    /// Give up on the stream; the writer's next readiness check fails
    pub fn cancel<S: Into<String>>(self, reason: S) {
        {
            let mut state = self.shared.lock();
            if state.canceled.is_none() {
                state.canceled = Some(reason.into());
            }
            state.chunks.clear();
            state.buffered = 0;
        }
        self.shared.changed.notify_waiters();
    }
}

impl Drop for ByteReader {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            if state.canceled.is_none() {
                state.canceled = Some("reader dropped".to_string());
            }
            state.chunks.clear();
            state.buffered = 0;
        }
        self.shared.changed.notify_waiters();
    }
}

/// Move every byte from `source` into `destination`
///
/// Both ends are consumed. On end of stream the destination is closed. If
/// the source aborts, the destination is aborted with the same reason; if
/// the destination is canceled, the source is canceled likewise. Returns
/// the number of bytes moved once the copy has settled either way.
pub async fn pipe_to(mut source: ByteReader, mut destination: ByteWriter) -> Result<u64, StreamError> {
    let mut total = 0u64;
    loop {
        let next = tokio::select! {
            next = source.read() => Ok(next),
            reason = destination.canceled() => Err(reason),
        };
        let next = match next {
            Ok(next) => next,
            Err(reason) => {
                source.cancel(reason.clone());
                return Err(StreamError::Canceled(reason));
            }
        };
        match next {
            Ok(Some(chunk)) => {
                let len = chunk.len() as u64;
                if let Err(err) = destination.write(chunk).await {
                    source.cancel(err.reason());
                    return Err(err);
                }
                total += len;
            }
            Ok(None) => {
                destination.close();
                return Ok(total);
            }
            Err(err) => {
                destination.abort(err.reason());
                return Err(err);
            }
        }
    }
}
