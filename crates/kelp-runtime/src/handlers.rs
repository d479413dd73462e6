//! Per-descriptor read/write readiness handlers.

use std::cell::RefCell;
use std::os::fd::RawFd;

/// Readiness interest of one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    /// Descriptor
    pub fd: RawFd,
    /// A read handler is installed
    pub read: bool,
    /// A write handler is installed
    pub write: bool,
}

#[derive(Debug)]
struct IoHandler<V> {
    fd: RawFd,
    read: Option<V>,
    write: Option<V>,
}

/// Read/write callbacks keyed by file descriptor
#[derive(Debug)]
pub struct IoHandlers<V> {
    handlers: RefCell<Vec<IoHandler<V>>>,
}

impl<V: Clone> IoHandlers<V> {
    /// No handlers
    pub fn new() -> Self {
        Self {
            handlers: RefCell::new(Vec::new()),
        }
    }

    /// Install (`Some`) or remove (`None`) the read handler of `fd`
    pub fn set_read(&self, fd: RawFd, callback: Option<V>) {
        self.update(fd, |h| h.read = callback);
    }

    /// Install (`Some`) or remove (`None`) the write handler of `fd`
    pub fn set_write(&self, fd: RawFd, callback: Option<V>) {
        self.update(fd, |h| h.write = callback);
    }

    fn update(&self, fd: RawFd, apply: impl FnOnce(&mut IoHandler<V>)) {
        let mut handlers = self.handlers.borrow_mut();
        let index = match handlers.iter().position(|h| h.fd == fd) {
            Some(index) => index,
            None => {
                handlers.push(IoHandler {
                    fd,
                    read: None,
                    write: None,
                });
                handlers.len() - 1
            }
        };
        apply(&mut handlers[index]);
        if handlers[index].read.is_none() && handlers[index].write.is_none() {
            handlers.swap_remove(index);
        }
    }

    /// Descriptors with at least one handler
    pub fn interests(&self) -> Vec<Interest> {
        self.handlers
            .borrow()
            .iter()
            .map(|h| Interest {
                fd: h.fd,
                read: h.read.is_some(),
                write: h.write.is_some(),
            })
            .collect()
    }

    /// Current read handler of `fd`
    pub fn read_handler(&self, fd: RawFd) -> Option<V> {
        self.handlers
            .borrow()
            .iter()
            .find(|h| h.fd == fd)
            .and_then(|h| h.read.clone())
    }

    /// Current write handler of `fd`
    pub fn write_handler(&self, fd: RawFd) -> Option<V> {
        self.handlers
            .borrow()
            .iter()
            .find(|h| h.fd == fd)
            .and_then(|h| h.write.clone())
    }

    /// Whether any handler is installed
    pub fn is_empty(&self) -> bool {
        self.handlers.borrow().is_empty()
    }

    /// Every installed callback
    pub fn callbacks(&self) -> Vec<V> {
        self.handlers
            .borrow()
            .iter()
            .flat_map(|h| h.read.iter().chain(h.write.iter()).cloned())
            .collect()
    }

    /// Remove every handler
    pub fn clear(&self) {
        self.handlers.borrow_mut().clear();
    }
}

impl<V: Clone> Default for IoHandlers<V> {
    fn default() -> Self {
        Self::new()
    }
}
