use std::{
    collections::VecDeque,
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use tracing::warn;

use crate::{Condition, Reactor, error::PerformError, reactor::ReactorShared};

struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self { done: Mutex::new(false), cond: Condvar::new() }
    }

    fn notify(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct Item {
    task: Box<dyn FnOnce() + Send>,
    completion: Option<Arc<Completion>>,
}

struct Queue {
    items: VecDeque<Item>,
    /// One pipe byte outstanding at most; wakes are coalesced behind it.
    signaled: bool,
    closed: bool,
    /// Write end of the self-pipe. Dropped by `close`, which delivers EOF
    /// to the registered read end.
    writer: Option<OwnedFd>,
}

struct Shared {
    queue: Mutex<Queue>,
    reactor: Arc<ReactorShared>,
}

fn lock(queue: &Mutex<Queue>) -> MutexGuard<'_, Queue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fire_items(shared: &Shared) {
    // Pop one at a time; tasks run outside the lock.
    loop {
        let item = lock(&shared.queue).items.pop_front();
        let Some(item) = item else { break };
        (item.task)();
        if let Some(completion) = item.completion {
            completion.notify();
        }
    }
}

fn on_wake(shared: &Shared, reactor: &Reactor, read_fd: &OwnedFd) {
    let mut buf = [0u8; 64];
    let mut eof = false;
    loop {
        let n = unsafe { libc::read(read_fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n == 0 {
            eof = true;
            break;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                _ => {
                    warn!(?err, "self-pipe read failed");
                    eof = true;
                    break;
                }
            }
        }
        if (n as usize) < buf.len() {
            break;
        }
    }

    lock(&shared.queue).signaled = false;
    fire_items(shared);

    if eof {
        // The write end is gone (`close` ran); finish the teardown here on
        // the reactor thread. Unregistering drops this handler and with it
        // the read end.
        reactor.unregister_descriptor(read_fd.as_raw_fd(), Condition::Readable);
    }
}

fn new_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let res = unsafe {
        let res = libc::pipe(fds.as_mut_ptr());
        if res == 0 {
            for fd in fds {
                libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        res
    };

    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Hands tasks from arbitrary threads to a reactor thread.
///
/// A mutex-guarded FIFO plus a self-pipe: the read end is registered
/// `Readable` with the reactor, enqueuing writes at most one wake byte, and
/// the reactor drains the queue when the pipe fires. Tasks always execute on
/// the reactor thread, in enqueue order across [`perform`](Self::perform)
/// and [`perform_sync`](Self::perform_sync).
///
/// Two reactor threads synchronously performing onto each other deadlock;
/// keep synchronous hand-offs acyclic.
#[derive(Clone)]
pub struct Performer {
    shared: Arc<Shared>,
}

impl Performer {
    /// Create the self-pipe and register its read end with `reactor`.
    pub fn new(reactor: &Reactor) -> io::Result<Self> {
        let (read_fd, write_fd) = new_pipe()?;
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                signaled: false,
                closed: false,
                writer: Some(write_fd),
            }),
            reactor: reactor.shared().clone(),
        });

        let handler_shared = shared.clone();
        let handler_reactor = reactor.clone();
        let raw = read_fd.as_raw_fd();
        reactor.register_descriptor(raw, Condition::Readable, move || {
            on_wake(&handler_shared, &handler_reactor, &read_fd);
        })?;

        Ok(Self { shared })
    }

    /// Fire-and-forget: run `task` on the reactor thread in some later cycle.
    pub fn perform(&self, task: impl FnOnce() + Send + 'static) -> Result<(), PerformError> {
        self.enqueue(Item { task: Box::new(task), completion: None })
    }

    /// Run `task` on the reactor thread and wait for it to finish. Called on
    /// the reactor thread itself, drains pending items first and then runs
    /// `task` inline, preserving FIFO order.
    pub fn perform_sync(&self, task: impl FnOnce() + Send + 'static) -> Result<(), PerformError> {
        if self.shared.reactor.is_running_on_this_thread() {
            if lock(&self.shared.queue).closed {
                return Err(PerformError::Closed);
            }
            fire_items(&self.shared);
            task();
            return Ok(());
        }

        let completion = Arc::new(Completion::new());
        self.enqueue(Item { task: Box::new(task), completion: Some(completion.clone()) })?;
        completion.wait();
        Ok(())
    }

    fn enqueue(&self, item: Item) -> Result<(), PerformError> {
        let mut queue = lock(&self.shared.queue);
        if queue.closed {
            return Err(PerformError::Closed);
        }
        queue.items.push_back(item);
        if !queue.signaled {
            // The byte goes out while the lock is held: a reactor that sees
            // the pipe readable always finds the item.
            let Some(writer) = queue.writer.as_ref() else {
                queue.items.pop_back();
                return Err(PerformError::Closed);
            };
            let n = unsafe { libc::write(writer.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
            if n == 1 {
                queue.signaled = true;
            } else {
                let err = io::Error::last_os_error();
                queue.items.pop_back();
                return Err(PerformError::Wake(err));
            }
        }
        Ok(())
    }

    /// Run every queued task, then tear the self-pipe down.
    ///
    /// Must be called on the reactor thread (or while the reactor is not
    /// running). `perform` calls made once close has begun are rejected,
    /// including from tasks executed by the final drain.
    pub fn close(&self) {
        assert!(
            !self.shared.reactor.is_running() || self.shared.reactor.is_running_on_this_thread(),
            "Performer::close must run on the reactor thread"
        );
        {
            let mut queue = lock(&self.shared.queue);
            if queue.closed {
                return;
            }
            queue.closed = true;
        }
        fire_items(&self.shared);
        // EOF on the read end makes the wake handler deregister itself.
        lock(&self.shared.queue).writer = None;
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.queue).closed
    }
}
