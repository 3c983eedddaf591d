use super::{Direction, EventLog, HookReply, ReadEvent, ReadHook, Side, StreamHooks, WriteEvent, WriteHook};
use connlab_core::error::{HarnessError, Result};
use connlab_core::net::is_teardown_error;
use futures::future::{BoxFuture, FutureExt};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

enum ReadState {
    Idle,
    Hooked {
        hook: ReadHook,
        future: BoxFuture<'static, Result<HookReply>>,
        original: Vec<u8>,
    },
    Draining {
        data: Vec<u8>,
        position: usize,
    },
}

enum WriteState {
    Idle,
    Hooked {
        hook: WriteHook,
        future: BoxFuture<'static, Result<HookReply>>,
        original: Vec<u8>,
    },
    Flushing {
        data: Vec<u8>,
        position: usize,
        accepted: usize,
    },
}

fn aborted(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        format!("{} aborted by instrumentation", what),
    )
}

fn hook_failed(err: HarnessError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// A transport stream with instrumentation hooks and an event log.
///
/// Transparent when no hook is armed. A read hook runs after the inner read
/// returned bytes and is awaited before the caller sees them.
///
/// A write hook holds on to the buffer of the write that fired it: until its
/// bytes (or their replacement) are on the transport, `poll_write` keeps
/// returning `Pending` and ignores the buffer it is polled with, then
/// reports the length of the original buffer.
pub struct InstrumentedStream<S> {
    inner: S,
    connection_id: u64,
    side: Side,
    hooks: StreamHooks,
    log: EventLog,
    cancel: CancellationToken,
    ignore_errors: bool,
    debug_io: bool,
    read_state: ReadState,
    write_state: WriteState,
    read_position: u64,
    write_position: u64,
    scratch: Vec<u8>,
}

impl<S> InstrumentedStream<S> {
    pub fn new(inner: S, connection_id: u64, side: Side, log: EventLog) -> Self {
        Self {
            inner,
            connection_id,
            side,
            hooks: StreamHooks::default(),
            log,
            cancel: CancellationToken::new(),
            ignore_errors: false,
            debug_io: false,
            read_state: ReadState::Idle,
            write_state: WriteState::Idle,
            read_position: 0,
            write_position: 0,
            scratch: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_debug_io(mut self, debug_io: bool) -> Self {
        self.debug_io = debug_io;
        self
    }

    pub fn hooks(&self) -> &StreamHooks {
        &self.hooks
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn bytes_read(&self) -> u64 {
        self.read_position
    }

    pub fn bytes_written(&self) -> u64 {
        self.write_position
    }

    /// Token handed to hooks; replaced for every exchange on the stream.
    pub fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    /// When set, teardown errors read as EOF and writes as accepted.
    pub fn set_ignore_errors(&mut self, ignore: bool) {
        self.ignore_errors = ignore;
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn record(&self, direction: Direction, bytes: usize, hooked: bool) {
        self.log
            .record(self.connection_id, self.side, direction, bytes, hooked);
        if self.debug_io {
            tracing::debug!(
                "connection {} {:?} {:?} {} bytes{}",
                self.connection_id,
                self.side,
                direction,
                bytes,
                if hooked { " (hooked)" } else { "" }
            );
        }
    }

    fn swallow(&self, err: &io::Error, direction: Direction) -> bool {
        if self.ignore_errors && is_teardown_error(err) {
            tracing::debug!(
                "connection {} {:?}: ignoring {:?} error: {}",
                self.connection_id,
                self.side,
                direction,
                err
            );
            return true;
        }
        false
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for InstrumentedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.read_state, ReadState::Idle) {
                ReadState::Draining { data, mut position } => {
                    let count = (data.len() - position).min(buf.remaining());
                    buf.put_slice(&data[position..position + count]);
                    position += count;
                    if position < data.len() {
                        this.read_state = ReadState::Draining { data, position };
                    }
                    return Poll::Ready(Ok(()));
                }
                ReadState::Hooked {
                    hook,
                    mut future,
                    original,
                } => match future.poll_unpin(cx) {
                    Poll::Pending => {
                        this.read_state = ReadState::Hooked {
                            hook,
                            future,
                            original,
                        };
                        return Poll::Pending;
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(hook_failed(err))),
                    Poll::Ready(Ok(reply)) => {
                        if reply.rearm {
                            this.hooks.rearm_read(hook);
                        }
                        if !reply.proceed {
                            return Poll::Ready(Err(aborted("read")));
                        }
                        let data = reply.buffer.unwrap_or(original);
                        if data.is_empty() {
                            return Poll::Ready(Ok(()));
                        }
                        this.read_state = ReadState::Draining { data, position: 0 };
                    }
                },
                ReadState::Idle => {
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    if !this.hooks.read_armed() {
                        let before = buf.filled().len();
                        match ready!(Pin::new(&mut this.inner).poll_read(cx, buf)) {
                            Ok(()) => {
                                let count = buf.filled().len() - before;
                                this.read_position += count as u64;
                                this.record(Direction::Read, count, false);
                                return Poll::Ready(Ok(()));
                            }
                            Err(err) if this.swallow(&err, Direction::Read) => {
                                return Poll::Ready(Ok(()));
                            }
                            Err(err) => return Poll::Ready(Err(err)),
                        }
                    }

                    let size = buf.remaining();
                    this.scratch.resize(size, 0);
                    let mut scratch = ReadBuf::new(&mut this.scratch[..size]);
                    let result = ready!(Pin::new(&mut this.inner).poll_read(cx, &mut scratch));
                    let original = scratch.filled().to_vec();
                    match result {
                        Ok(()) => {}
                        Err(err) if this.swallow(&err, Direction::Read) => {
                            return Poll::Ready(Ok(()));
                        }
                        Err(err) => return Poll::Ready(Err(err)),
                    }
                    if original.is_empty() {
                        // EOF never fires the hook.
                        this.record(Direction::Read, 0, false);
                        return Poll::Ready(Ok(()));
                    }
                    let offset = this.read_position;
                    this.read_position += original.len() as u64;
                    let Some(hook) = this.hooks.take_read() else {
                        this.record(Direction::Read, original.len(), false);
                        this.read_state = ReadState::Draining {
                            data: original,
                            position: 0,
                        };
                        continue;
                    };
                    this.record(Direction::Read, original.len(), true);
                    let future = hook(ReadEvent {
                        connection_id: this.connection_id,
                        buffer: original.clone(),
                        offset,
                        size,
                        bytes_read: original.len(),
                        cancel: this.cancel.clone(),
                    });
                    this.read_state = ReadState::Hooked {
                        hook,
                        future,
                        original,
                    };
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for InstrumentedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.write_state, WriteState::Idle) {
                WriteState::Hooked {
                    hook,
                    mut future,
                    original,
                } => match future.poll_unpin(cx) {
                    Poll::Pending => {
                        this.write_state = WriteState::Hooked {
                            hook,
                            future,
                            original,
                        };
                        return Poll::Pending;
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(hook_failed(err))),
                    Poll::Ready(Ok(reply)) => {
                        if reply.rearm {
                            this.hooks.rearm_write(hook);
                        }
                        if !reply.proceed {
                            return Poll::Ready(Err(aborted("write")));
                        }
                        let accepted = original.len();
                        let data = reply.buffer.unwrap_or(original);
                        this.write_state = WriteState::Flushing {
                            data,
                            position: 0,
                            accepted,
                        };
                    }
                },
                WriteState::Flushing {
                    data,
                    position,
                    accepted,
                } => {
                    if position >= data.len() {
                        this.write_position += data.len() as u64;
                        this.record(Direction::Write, data.len(), true);
                        return Poll::Ready(Ok(accepted));
                    }
                    match Pin::new(&mut this.inner).poll_write(cx, &data[position..]) {
                        Poll::Pending => {
                            this.write_state = WriteState::Flushing {
                                data,
                                position,
                                accepted,
                            };
                            return Poll::Pending;
                        }
                        Poll::Ready(Ok(0)) => {
                            return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero)));
                        }
                        Poll::Ready(Ok(count)) => {
                            this.write_state = WriteState::Flushing {
                                data,
                                position: position + count,
                                accepted,
                            };
                        }
                        Poll::Ready(Err(err)) if this.swallow(&err, Direction::Write) => {
                            return Poll::Ready(Ok(accepted));
                        }
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    }
                }
                WriteState::Idle => {
                    if let Some(hook) = this.hooks.take_write() {
                        let future = hook(WriteEvent {
                            connection_id: this.connection_id,
                            buffer: buf.to_vec(),
                            offset: this.write_position,
                            cancel: this.cancel.clone(),
                        });
                        this.write_state = WriteState::Hooked {
                            hook,
                            future,
                            original: buf.to_vec(),
                        };
                        continue;
                    }
                    return match ready!(Pin::new(&mut this.inner).poll_write(cx, buf)) {
                        Ok(count) => {
                            this.write_position += count as u64;
                            this.record(Direction::Write, count, false);
                            Poll::Ready(Ok(count))
                        }
                        Err(err) if this.swallow(&err, Direction::Write) => Poll::Ready(Ok(buf.len())),
                        Err(err) => Poll::Ready(Err(err)),
                    };
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_flush(cx)) {
            Err(err) if this.swallow(&err, Direction::Write) => Poll::Ready(Ok(())),
            other => Poll::Ready(other),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_shutdown(cx)) {
            Err(err) if this.swallow(&err, Direction::Write) => Poll::Ready(Ok(())),
            other => Poll::Ready(other),
        }
    }
}
