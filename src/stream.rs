//! Suspending reads and writes on plain file descriptors.
//!
//! A [`Stream`] wraps a descriptor switched to non-blocking mode; short
//! reads/writes retry after parking the fiber on reactor readiness. The
//! readiness wait binds the fiber's cancel signal, so these operations
//! are interruptible in the composable-cancellation style: interruption
//! withdraws the watch and the fiber resumes with `interrupted`.

use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result, RuntimeErrorKind};
use crate::fiber::wait::{expect_unit, park_default, WakeValue};
use crate::reactor::{Interest, Reactor};
use crate::vm::current_vm;

/// Parks the current fiber until `fd` reports the requested readiness.
pub(crate) async fn fd_ready(fd: RawFd, interest: Interest) -> Result<()> {
    let vm = current_vm();
    vm.check_suspend()?;
    let fiber = vm.current_fiber();
    let cancel = vm.current_cancel();

    let watch = {
        let vm = vm.clone();
        Reactor::with_current(move |r| {
            r.add_watch(fd, interest, move |r| {
                vm.set_wake(fiber, Ok(WakeValue::Unit));
                vm.resume(r, fiber);
            })
        })
        .expect("readiness wait outside the reactor loop")
    };

    {
        let vm = vm.clone();
        cancel.bind(Box::new(move || {
            // If the watch already fired, the completion owns the wake.
            let withdrawn = Reactor::with_current(|r| r.cancel_watch(watch)).unwrap_or(false);
            if withdrawn {
                vm.set_wake(fiber, Err(RuntimeErrorKind::Interrupted.into()));
                vm.shared.post_resume(fiber);
            }
        }));
    }

    let wake = park_default(&vm).await;
    cancel.clear();
    expect_unit(wake)
}

pub(crate) async fn fd_readable(fd: RawFd) -> Result<()> {
    fd_ready(fd, Interest::READABLE).await
}

pub(crate) async fn fd_writable(fd: RawFd) -> Result<()> {
    fd_ready(fd, Interest::WRITABLE).await
}

////////////////////////////////////////////////////////////////////////////////
// Stream
////////////////////////////////////////////////////////////////////////////////

/// A non-blocking descriptor with suspending I/O.
pub struct Stream {
    fd: OwnedFd,
}

impl Stream {
    /// Takes ownership of `fd` and switches it to non-blocking mode.
    pub fn new(fd: OwnedFd) -> Result<Self> {
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        if flags == -1 {
            return Err(Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Reads at least one byte, parking while nothing is available.
    ///
    /// Returns 0 at end of stream.
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let n = unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => fd_readable(self.fd.as_raw_fd()).await?,
                Some(libc::EINTR) => continue,
                _ => return Err(Error::IO(err)),
            }
        }
    }

    /// Writes at least one byte, parking while the kernel buffer is full.
    pub async fn write_some(&self, buf: &[u8]) -> Result<usize> {
        loop {
            let n = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => fd_writable(self.fd.as_raw_fd()).await?,
                Some(libc::EINTR) => continue,
                _ => return Err(Error::IO(err)),
            }
        }
    }

    /// Reads until end of stream.
    pub async fn read_to_end(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read_some(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Writes the whole buffer.
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write_some(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for Stream {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

/// An anonymous pipe as a (read, write) stream pair.
pub fn pipe() -> Result<(Stream, Stream)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
        return Err(Error::last_os_error());
    }
    let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((Stream::new(r)?, Stream::new(w)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;

    #[test]
    fn read_parks_until_written() {
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        vm.spawn(async {
            let (rx, tx) = pipe()?;
            let writer = crate::fiber::spawn(async move {
                crate::fiber::yield_now().await?;
                tx.write_all(b"ping").await?;
                Ok(Vec::new())
            })?;
            let mut buf = [0u8; 16];
            let n = rx.read_some(&mut buf).await?;
            assert_eq!(&buf[..n], b"ping");
            writer.join().await?;
            Ok(Vec::new())
        })
        .unwrap();
        reactor.run();
    }

    #[test]
    fn read_to_end_sees_eof() {
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        vm.spawn(async {
            let (rx, tx) = pipe()?;
            tx.write_all(b"tail").await?;
            drop(tx);
            let mut out = Vec::new();
            rx.read_to_end(&mut out).await?;
            assert_eq!(out, b"tail");
            Ok(Vec::new())
        })
        .unwrap();
        reactor.run();
    }
}
