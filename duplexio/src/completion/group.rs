use super::tcp::AsyncTcpChannel;
use super::{Completer, Transfer};
use crate::error::{Error, Result};
use crate::net::{ReadOutcome, TcpAcceptor, TcpChannel};
use crate::selector::{Interest, Selectable, SelectionKey, Selector, SelectorBuilder};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

/// Builder for configuring an [`AsyncGroup`].
///
/// # Examples
///
/// ```rust,ignore
/// let group = AsyncGroupBuilder::new()
///     .name("io-driver")
///     .event_capacity(128)
///     .build()?;
/// ```
pub struct AsyncGroupBuilder {
    /// Name of the driver thread.
    name: String,

    /// Readiness events collected per driver iteration.
    event_capacity: usize,
}

impl AsyncGroupBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self {
            name: "duplexio-driver".to_owned(),
            event_capacity: 64,
        }
    }

    /// Sets the name of the driver thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the number of readiness events collected per iteration.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn event_capacity(mut self, n: usize) -> Self {
        assert!(n > 0, "event_capacity must be > 0");

        self.event_capacity = n;
        self
    }

    /// Opens the selector and starts the driver thread.
    pub fn build(self) -> Result<AsyncGroup> {
        let selector = SelectorBuilder::new()
            .event_capacity(self.event_capacity)
            .build()?;
        let (commands, receiver) = channel();

        let shared = Arc::new(Shared {
            selector,
            commands,
            next_id: AtomicU64::new(0),
            open: AtomicBool::new(true),
        });

        let driver = Driver {
            shared: shared.clone(),
            receiver,
            entries: HashMap::new(),
            tokens: HashMap::new(),
        };

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || driver.run())?;

        debug!(name = %self.name, "async group started");

        Ok(AsyncGroup {
            shared,
            name: self.name,
            driver: Mutex::new(Some(handle)),
        })
    }
}

impl Default for AsyncGroupBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A driver thread completing asynchronous socket operations.
///
/// Listeners and channels created through a group submit their
/// operations to its driver, which waits for readiness on a private
/// [`Selector`] and delivers each result through a
/// [`Completion`](super::Completion).
///
/// Dropping the group (or calling [`shutdown`](Self::shutdown)) stops the
/// driver: pending operations complete with [`Error::Cancelled`] and
/// sockets still owned by the group are closed.
pub struct AsyncGroup {
    pub(crate) shared: Arc<Shared>,
    name: String,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncGroup {
    /// Starts a group with default settings.
    pub fn new() -> Result<Self> {
        AsyncGroupBuilder::new().build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shutdown(&self) -> bool {
        !self.shared.open.load(Ordering::Acquire)
    }

    /// Stops the driver and waits for it to exit. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.open.swap(false, Ordering::AcqRel) {
            let _ = self.shared.commands.send(Command::Shutdown);
            self.shared.selector.wakeup();
        }

        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(name = %self.name, "driver thread panicked");
            }
            debug!(name = %self.name, "async group stopped");
        }
    }
}

impl Drop for AsyncGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for AsyncGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncGroup")
            .field("name", &self.name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// State shared between the group handle, its sockets and the driver.
pub(crate) struct Shared {
    selector: Selector,
    commands: Sender<Command>,
    next_id: AtomicU64,
    open: AtomicBool,
}

impl Shared {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Hands a command to the driver.
    ///
    /// Once the group is shut down the command is dropped, which cancels
    /// any completer it carries.
    pub(crate) fn submit(&self, command: Command) {
        if !self.open.load(Ordering::Acquire) {
            return;
        }

        if self.commands.send(command).is_ok() {
            self.selector.wakeup();
        }
    }
}

/// A socket owned by the driver.
pub(crate) enum Source {
    Listener(Arc<TcpAcceptor>),
    Channel(Arc<TcpChannel>),
}

impl Source {
    fn selectable(&self) -> &dyn Selectable {
        match self {
            Source::Listener(acceptor) => &**acceptor,
            Source::Channel(channel) => &**channel,
        }
    }

    fn close(&self) {
        match self {
            Source::Listener(acceptor) => acceptor.close(),
            Source::Channel(channel) => channel.close(),
        }
    }
}

pub(crate) enum Op {
    Accept(Completer<AsyncTcpChannel>),
    Connect(Completer<AsyncTcpChannel>),
    Read(Vec<u8>, Completer<Transfer>),
    Write(Vec<u8>, Completer<Transfer>),
}

pub(crate) enum Command {
    Attach { id: u64, source: Source },
    Submit { id: u64, op: Op },
    Detach { id: u64 },
    Shutdown,
}

struct PendingWrite {
    buf: Vec<u8>,
    written: usize,
    completer: Completer<Transfer>,
}

struct Entry {
    source: Source,
    key: Option<SelectionKey>,
    connect: Option<Completer<AsyncTcpChannel>>,
    accepts: VecDeque<Completer<AsyncTcpChannel>>,
    reads: VecDeque<(Vec<u8>, Completer<Transfer>)>,
    writes: VecDeque<PendingWrite>,
}

impl Entry {
    fn new(source: Source) -> Self {
        Self {
            source,
            key: None,
            connect: None,
            accepts: VecDeque::new(),
            reads: VecDeque::new(),
            writes: VecDeque::new(),
        }
    }

    fn interest(&self) -> Interest {
        let mut interest = Interest::NONE;

        if !self.accepts.is_empty() {
            interest |= Interest::ACCEPTABLE;
        }
        if !self.reads.is_empty() {
            interest |= Interest::READABLE;
        }
        if self.connect.is_some() || !self.writes.is_empty() {
            interest |= Interest::WRITABLE;
        }

        interest
    }
}

struct Driver {
    shared: Arc<Shared>,
    receiver: Receiver<Command>,
    entries: HashMap<u64, Entry>,
    tokens: HashMap<u64, u64>,
}

impl Driver {
    fn run(mut self) {
        debug!("driver running");

        loop {
            while let Ok(command) = self.receiver.try_recv() {
                match command {
                    Command::Attach { id, source } => {
                        self.entries.insert(id, Entry::new(source));
                    }
                    Command::Submit { id, op } => self.submit(id, op),
                    Command::Detach { id } => self.detach(id),
                    Command::Shutdown => {
                        self.shutdown();
                        return;
                    }
                }
            }

            if let Err(err) = self.shared.selector.select(None) {
                warn!(%err, "driver select failed");
                self.shutdown();
                return;
            }

            for key in self.shared.selector.selected_keys() {
                if let Some(&id) = self.tokens.get(&key.token()) {
                    self.dispatch(id, key.ready());
                }
            }
        }
    }

    fn submit(&mut self, id: u64, op: Op) {
        let Some(entry) = self.entries.get_mut(&id) else {
            trace!(id, "operation for detached source dropped");
            return;
        };

        match op {
            Op::Accept(completer) => entry.accepts.push_back(completer),
            Op::Connect(completer) => entry.connect = Some(completer),
            Op::Read(buf, completer) => entry.reads.push_back((buf, completer)),
            Op::Write(buf, completer) if buf.is_empty() => {
                completer.succeed(Transfer {
                    buf,
                    outcome: ReadOutcome::Data(0),
                });
            }
            Op::Write(buf, completer) => entry.writes.push_back(PendingWrite {
                buf,
                written: 0,
                completer,
            }),
        }

        self.sync(id);
    }

    fn dispatch(&mut self, id: u64, ready: Interest) {
        if ready.is_acceptable() {
            self.drive_accepts(id);
        }
        if ready.is_writable() {
            self.drive_connect(id);
            self.drive_writes(id);
        }
        if ready.is_readable() {
            self.drive_reads(id);
        }

        self.sync(id);
    }

    fn drive_accepts(&mut self, id: u64) {
        loop {
            let Some(entry) = self.entries.get_mut(&id) else {
                return;
            };
            let Source::Listener(acceptor) = &entry.source else {
                return;
            };

            entry.accepts.retain(|c| !c.is_cancelled());
            if entry.accepts.is_empty() {
                return;
            }

            let accepted = match acceptor.try_accept() {
                Ok(Some((channel, _))) => channel.set_nonblocking(true).map(|()| channel),
                Ok(None) => return,
                Err(err) => Err(err),
            };

            let Some(completer) = entry.accepts.pop_front() else {
                return;
            };

            match accepted {
                Ok(channel) => {
                    let channel = self.adopt(channel);
                    completer.succeed(channel);
                }
                Err(err) => {
                    completer.fail(err);
                }
            }
        }
    }

    /// Attaches an accepted channel to this driver.
    fn adopt(&mut self, channel: TcpChannel) -> AsyncTcpChannel {
        let id = self.shared.next_id();
        let channel = Arc::new(channel);

        self.entries
            .insert(id, Entry::new(Source::Channel(channel.clone())));

        trace!(id, "channel adopted");
        AsyncTcpChannel::new(id, channel, self.shared.clone())
    }

    fn drive_connect(&mut self, id: u64) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let Source::Channel(channel) = &entry.source else {
            return;
        };
        let Some(completer) = entry.connect.take() else {
            return;
        };

        if completer.is_cancelled() {
            self.detach(id);
            return;
        }

        match channel.finish_connect() {
            Ok(()) => {
                let channel = AsyncTcpChannel::new(id, channel.clone(), self.shared.clone());
                debug!(id, "connect completed");
                completer.succeed(channel);
            }
            Err(err) => {
                debug!(id, %err, "connect failed");
                completer.fail(err);
                self.detach(id);
            }
        }
    }

    fn drive_writes(&mut self, id: u64) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let Source::Channel(channel) = &entry.source else {
            return;
        };

        while let Some(pending) = entry.writes.front_mut() {
            if pending.completer.is_cancelled() {
                entry.writes.pop_front();
                continue;
            }

            match channel.write(&pending.buf[pending.written..]) {
                Ok(0) => return,
                Ok(n) => {
                    pending.written += n;
                    if pending.written < pending.buf.len() {
                        continue;
                    }
                }
                Err(err) => {
                    if let Some(pending) = entry.writes.pop_front() {
                        pending.completer.fail(err);
                    }
                    continue;
                }
            }

            if let Some(pending) = entry.writes.pop_front() {
                let outcome = ReadOutcome::Data(pending.written);
                pending.completer.succeed(Transfer {
                    buf: pending.buf,
                    outcome,
                });
            }
        }
    }

    fn drive_reads(&mut self, id: u64) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let Source::Channel(channel) = &entry.source else {
            return;
        };

        while let Some((buf, completer)) = entry.reads.front_mut() {
            if completer.is_cancelled() {
                entry.reads.pop_front();
                continue;
            }

            let result = match channel.read(buf) {
                Ok(ReadOutcome::Data(0)) if !buf.is_empty() => return,
                other => other,
            };

            let Some((buf, completer)) = entry.reads.pop_front() else {
                return;
            };

            match result {
                Ok(outcome) => completer.succeed(Transfer { buf, outcome }),
                Err(err) => completer.fail(err),
            };
        }
    }

    /// Aligns the key of `id` with its pending operations.
    ///
    /// A source with nothing pending holds no key, so hang-up conditions
    /// on idle sockets never wake the driver.
    fn sync(&mut self, id: u64) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };

        let interest = entry.interest();

        let result = match (&entry.key, interest.is_empty()) {
            (None, true) => Ok(()),
            (Some(key), true) => {
                self.tokens.remove(&key.token());
                key.cancel();
                entry.key = None;
                Ok(())
            }
            (Some(key), false) if key.interest() == interest => Ok(()),
            (Some(key), false) => key.set_interest(interest),
            (None, false) => self
                .shared
                .selector
                .register(entry.source.selectable(), interest)
                .map(|key| {
                    self.tokens.insert(key.token(), id);
                    entry.key = Some(key);
                }),
        };

        if let Err(err) = result {
            warn!(id, %err, "registration failed");
            fail_pending(entry, &err);
        }
    }

    fn detach(&mut self, id: u64) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };

        if let Some(key) = &entry.key {
            self.tokens.remove(&key.token());
            key.cancel();
        }

        entry.source.close();

        trace!(id, "source detached");
    }

    fn shutdown(&mut self) {
        let ids: Vec<u64> = self.entries.keys().copied().collect();
        for id in ids {
            self.detach(id);
        }

        while self.receiver.try_recv().is_ok() {}

        self.shared.selector.close();

        debug!("driver stopped");
    }
}

/// Fails every pending operation of `entry` with a copy of `err`.
fn fail_pending(entry: &mut Entry, err: &Error) {
    if let Some(completer) = entry.connect.take() {
        completer.fail(err.duplicate());
    }
    for completer in entry.accepts.drain(..) {
        completer.fail(err.duplicate());
    }
    for (_, completer) in entry.reads.drain(..) {
        completer.fail(err.duplicate());
    }
    for pending in entry.writes.drain(..) {
        pending.completer.fail(err.duplicate());
    }
}
