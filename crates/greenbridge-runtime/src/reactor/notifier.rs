//! Cross-thread wakeups for the event loop
//!
//! Other threads never touch loop state directly. They push a message onto
//! a lock-free queue and poke a wake descriptor that the loop polls
//! alongside its readers. Repeated pokes before the loop drains coalesce
//! into one wakeup.

use std::any::Any;
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use super::EventLoop;

pub(crate) type RemoteCall = Box<dyn FnOnce(&EventLoop) + Send + 'static>;

pub(crate) enum RemoteMsg {
    /// Run a closure on the loop thread
    Call(RemoteCall),
    /// Resolve the loop-side future registered under `id`
    Complete { id: u64, value: Box<dyn Any + Send> },
    /// The completer for `id` was dropped unused
    Abandon { id: u64 },
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// eventfd-backed wake descriptor
        pub(crate) struct WakeFd {
            fd: RawFd,
        }

        impl WakeFd {
            pub(crate) fn new() -> io::Result<Self> {
                let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { fd })
            }

            pub(crate) fn read_fd(&self) -> RawFd {
                self.fd
            }

            pub(crate) fn notify(&self) -> io::Result<()> {
                let val: u64 = 1;
                let ret = unsafe {
                    libc::write(
                        self.fd,
                        &val as *const u64 as *const libc::c_void,
                        std::mem::size_of::<u64>(),
                    )
                };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    // Counter saturated: a wakeup is already pending
                    if err.kind() == io::ErrorKind::WouldBlock {
                        return Ok(());
                    }
                    return Err(err);
                }
                Ok(())
            }

            pub(crate) fn drain(&self) {
                let mut val: u64 = 0;
                unsafe {
                    libc::read(
                        self.fd,
                        &mut val as *mut u64 as *mut libc::c_void,
                        std::mem::size_of::<u64>(),
                    );
                }
            }
        }

        impl Drop for WakeFd {
            fn drop(&mut self) {
                unsafe { libc::close(self.fd) };
            }
        }
    } else {
        /// Self-pipe wake descriptor
        pub(crate) struct WakeFd {
            read: RawFd,
            write: RawFd,
        }

        impl WakeFd {
            pub(crate) fn new() -> io::Result<Self> {
                let mut fds = [0 as libc::c_int; 2];
                if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                    return Err(io::Error::last_os_error());
                }
                for fd in fds {
                    unsafe {
                        let flags = libc::fcntl(fd, libc::F_GETFL);
                        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                    }
                }
                Ok(Self { read: fds[0], write: fds[1] })
            }

            pub(crate) fn read_fd(&self) -> RawFd {
                self.read
            }

            pub(crate) fn notify(&self) -> io::Result<()> {
                let byte = 1u8;
                let ret = unsafe { libc::write(self.write, &byte as *const u8 as *const libc::c_void, 1) };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::WouldBlock {
                        return Ok(());
                    }
                    return Err(err);
                }
                Ok(())
            }

            pub(crate) fn drain(&self) {
                let mut buf = [0u8; 64];
                loop {
                    let n = unsafe { libc::read(self.read, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                    if n <= 0 {
                        break;
                    }
                }
            }
        }

        impl Drop for WakeFd {
            fn drop(&mut self) {
                unsafe {
                    libc::close(self.read);
                    libc::close(self.write);
                }
            }
        }
    }
}

pub(crate) struct RemoteShared {
    queue: SegQueue<RemoteMsg>,
    wake: WakeFd,
}

impl RemoteShared {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            queue: SegQueue::new(),
            wake: WakeFd::new()?,
        })
    }

    pub(crate) fn wake_fd(&self) -> RawFd {
        self.wake.read_fd()
    }

    fn push(&self, msg: RemoteMsg) -> io::Result<()> {
        self.queue.push(msg);
        self.wake.notify()
    }

    /// Take everything queued so far (loop thread only)
    pub(crate) fn drain(&self) -> Vec<RemoteMsg> {
        self.wake.drain();
        let mut msgs = Vec::with_capacity(self.queue.len());
        while let Some(msg) = self.queue.pop() {
            msgs.push(msg);
        }
        msgs
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Thread-safe handle for scheduling work onto an [`EventLoop`]
///
/// ```ignore
/// let remote = event_loop.remote();
/// std::thread::spawn(move || remote.call(|lp| lp.stop()));
/// ```
#[derive(Clone)]
pub struct RemoteHandle {
    pub(crate) shared: Arc<RemoteShared>,
}

impl RemoteHandle {
    /// Run `f` on the loop thread during its next turn
    pub fn call<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.shared.push(RemoteMsg::Call(Box::new(f)))
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("wake_fd", &self.shared.wake_fd())
            .finish()
    }
}

/// Send half of a loop-side future created by [`EventLoop::remote_future`]
pub struct RemoteCompleter<T> {
    id: u64,
    shared: Option<Arc<RemoteShared>>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> RemoteCompleter<T> {
    pub(crate) fn new(id: u64, shared: Arc<RemoteShared>) -> Self {
        Self {
            id,
            shared: Some(shared),
            _marker: PhantomData,
        }
    }

    /// Resolve the paired future with `value` on the loop thread
    pub fn complete(mut self, value: T) -> io::Result<()> {
        match self.shared.take() {
            Some(shared) => shared.push(RemoteMsg::Complete {
                id: self.id,
                value: Box::new(value),
            }),
            None => Ok(()),
        }
    }
}

impl<T> Drop for RemoteCompleter<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let _ = shared.push(RemoteMsg::Abandon { id: self.id });
        }
    }
}
