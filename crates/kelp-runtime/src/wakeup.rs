//! Pipe-based wakeup channel.
//!
//! A non-blocking pipe whose read end sits in the event loop's `poll(2)` set.
//! Another thread writes a byte to make the read end readable and wake the
//! loop.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Read and write ends of a non-blocking, close-on-exec pipe
#[derive(Debug)]
pub struct WakeupPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl WakeupPipe {
    /// Create the pipe
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe(2) succeeded, both descriptors are open and ours.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [&read, &write] {
            set_flags(fd.as_raw_fd())?;
        }
        Ok(Self { read, write })
    }

    /// Descriptor to poll for readability
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Wake the reader. A full pipe already guarantees a wakeup, so
    /// `WouldBlock` counts as success.
    pub fn signal(&self) -> io::Result<()> {
        loop {
            match write_byte(self.write.as_raw_fd()) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Write one byte, retrying while the write is interrupted or would block.
    ///
    /// Any other error ends the attempt and is returned.
    pub fn notify(&self) -> io::Result<()> {
        loop {
            match write_byte(self.write.as_raw_fd()) {
                Ok(()) => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    std::thread::yield_now();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume one byte if available. Returns whether a byte was read.
    pub fn consume_one(&self) -> io::Result<bool> {
        let mut byte = 0u8;
        loop {
            // SAFETY: reading at most one byte into a live local.
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    (&mut byte as *mut u8).cast::<libc::c_void>(),
                    1,
                )
            };
            if n == 1 {
                return Ok(true);
            }
            if n == 0 {
                return Ok(false);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    /// Consume every pending byte. Returns how many were read.
    pub fn drain(&self) -> io::Result<usize> {
        let mut total = 0;
        while self.consume_one()? {
            total += 1;
        }
        Ok(total)
    }
}

fn set_flags(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl(2) calls on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn write_byte(fd: RawFd) -> io::Result<()> {
    let byte = 0u8;
    // SAFETY: writing one byte from a live local.
    let n = unsafe { libc::write(fd, (&byte as *const u8).cast::<libc::c_void>(), 1) };
    if n == 1 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Wait until `fd` is readable or `timeout_ms` elapses (`-1` waits forever).
pub fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: polling a single live pollfd.
    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(result > 0 && (pollfd.revents & libc::POLLIN) != 0)
}
