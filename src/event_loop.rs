//! Single-threaded readiness dispatcher.
//!
//! Callbacks are registered per `(Token, Kind)`. mio reports readiness edges;
//! the loop keeps a sticky ready flag per registration and keeps dispatching it
//! on every iteration until the callback reports [`Outcome::WouldBlock`], which
//! gives callbacks the level-triggered view a `select()` loop would have.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    io,
    rc::Rc,
    time::{Duration, Instant},
};

use mio::{Events, Poll, Registry, Token};
use tracing::{debug, trace};

use crate::{Error, Result};

const EVENTS_CAPACITY: usize = 1024;

/// Readiness kinds a callback can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Readable = 0,
    Writable = 1,
    Error = 2,
}

impl Kind {
    const ALL: [Kind; 3] = [Kind::Readable, Kind::Writable, Kind::Error];

    fn index(self) -> usize {
        self as usize
    }
}

/// What a readiness callback observed about its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The handle has no more work for this kind until the next readiness edge.
    WouldBlock,
    /// The callback made progress and the handle may still be ready.
    Progress,
}

pub type Callback = Rc<dyn Fn() -> Result<Outcome>>;

type Hook = Rc<dyn Fn()>;

struct Timer {
    deadline: Instant,
    callback: Box<dyn FnOnce()>,
}

struct Inner {
    poll: RefCell<Poll>,
    registry: Registry,
    callbacks: RefCell<[BTreeMap<Token, Callback>; 3]>,
    ready: RefCell<BTreeMap<Token, [bool; 3]>>,
    shutdown_hooks: RefCell<BTreeMap<Token, Hook>>,
    timers: RefCell<Vec<Timer>>,
    next_token: Cell<usize>,
    running: Cell<bool>,
    failure: RefCell<Option<Error>>,
}

/// Handle to an event loop. Cloning is cheap and every clone drives the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            inner: Rc::new(Inner {
                poll: RefCell::new(poll),
                registry,
                callbacks: RefCell::new(Default::default()),
                ready: RefCell::new(BTreeMap::new()),
                shutdown_hooks: RefCell::new(BTreeMap::new()),
                timers: RefCell::new(Vec::new()),
                next_token: Cell::new(0),
                running: Cell::new(false),
                failure: RefCell::new(None),
            }),
        })
    }

    /// The mio registry sockets must be registered with before their callbacks fire.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Allocates a token that is never handed out again by this loop.
    pub fn next_token(&self) -> Token {
        let token = self.inner.next_token.get();
        self.inner.next_token.set(token + 1);
        Token(token)
    }

    pub fn register(&self, token: Token, kind: Kind, callback: Callback) {
        self.inner.callbacks.borrow_mut()[kind.index()].insert(token, callback);
    }

    pub fn unregister(&self, token: Token, kind: Kind) {
        self.inner.callbacks.borrow_mut()[kind.index()].remove(&token);
    }

    /// Drops every registration of `token`, shutdown hook included.
    pub fn unregister_all(&self, token: Token) {
        for callbacks in self.inner.callbacks.borrow_mut().iter_mut() {
            callbacks.remove(&token);
        }
        self.inner.ready.borrow_mut().remove(&token);
        self.inner.shutdown_hooks.borrow_mut().remove(&token);
    }

    pub fn is_registered(&self, token: Token, kind: Kind) -> bool {
        self.inner.callbacks.borrow()[kind.index()].contains_key(&token)
    }

    /// Registers `hook` to run once when the loop stops, whatever the reason.
    pub fn on_shutdown(&self, token: Token, hook: impl Fn() + 'static) {
        self.inner
            .shutdown_hooks
            .borrow_mut()
            .insert(token, Rc::new(hook));
    }

    /// Runs `callback` once, after at least `delay` has elapsed.
    pub fn add_timeout(&self, delay: Duration, callback: impl FnOnce() + 'static) {
        self.inner.timers.borrow_mut().push(Timer {
            deadline: Instant::now() + delay,
            callback: Box::new(callback),
        });
    }

    pub fn stop(&self) {
        self.inner.running.set(false);
    }

    /// Stops the loop and makes [`EventLoop::run`] return `err`.
    /// Only the first failure is kept.
    pub fn fail(&self, err: Error) {
        {
            let mut failure = self.inner.failure.borrow_mut();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Dispatches readiness and timers until stopped or out of registrations.
    ///
    /// Shutdown hooks run after the cycle ends, on every exit path.
    pub fn run(&self) -> Result<()> {
        self.inner.running.set(true);
        let result = self.run_cycle();
        self.inner.running.set(false);
        self.shutdown();

        if let Some(err) = self.inner.failure.borrow_mut().take() {
            return Err(err);
        }
        result
    }

    fn run_cycle(&self) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while self.inner.running.get() && self.has_work() {
            let timeout = self.poll_timeout();
            let polled = self.inner.poll.borrow_mut().poll(&mut events, timeout);
            if let Err(err) = polled {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            self.mark_ready(&events);
            self.dispatch()?;
            self.fire_timers();
        }
        Ok(())
    }

    fn has_work(&self) -> bool {
        self.inner
            .callbacks
            .borrow()
            .iter()
            .any(|callbacks| !callbacks.is_empty())
            || !self.inner.timers.borrow().is_empty()
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.pending_ready().is_empty() {
            return Some(Duration::ZERO);
        }
        let now = Instant::now();
        self.inner
            .timers
            .borrow()
            .iter()
            .map(|timer| timer.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    fn mark_ready(&self, events: &Events) {
        let callbacks = self.inner.callbacks.borrow();
        let mut ready = self.inner.ready.borrow_mut();

        for event in events.iter() {
            let token = event.token();
            if !callbacks.iter().any(|c| c.contains_key(&token)) {
                continue;
            }
            trace!(?token, ?event, "ready");
            let flags = ready.entry(token).or_default();
            if event.is_readable() || event.is_read_closed() {
                flags[Kind::Readable.index()] = true;
            }
            if event.is_writable() || event.is_write_closed() {
                flags[Kind::Writable.index()] = true;
            }
            if event.is_error() {
                flags[Kind::Error.index()] = true;
            }
        }
    }

    /// Ready registrations that currently have a callback.
    fn pending_ready(&self) -> Vec<(Token, Kind)> {
        let callbacks = self.inner.callbacks.borrow();
        let ready = self.inner.ready.borrow();

        let mut pending = Vec::new();
        for kind in Kind::ALL {
            for (token, flags) in ready.iter() {
                if flags[kind.index()] && callbacks[kind.index()].contains_key(token) {
                    pending.push((*token, kind));
                }
            }
        }
        pending
    }

    fn dispatch(&self) -> Result<()> {
        for (token, kind) in self.pending_ready() {
            if !self.inner.running.get() {
                break;
            }
            // An earlier callback in this round may have torn the handle down.
            let callback = self.inner.callbacks.borrow()[kind.index()]
                .get(&token)
                .cloned();
            let Some(callback) = callback else {
                continue;
            };

            if callback()? == Outcome::WouldBlock {
                if let Some(flags) = self.inner.ready.borrow_mut().get_mut(&token) {
                    flags[kind.index()] = false;
                }
            }
        }
        Ok(())
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        let mut due = {
            let mut timers = self.inner.timers.borrow_mut();
            let (due, pending): (Vec<_>, Vec<_>) =
                timers.drain(..).partition(|timer| timer.deadline <= now);
            *timers = pending;
            due
        };
        due.sort_by_key(|timer| timer.deadline);
        for timer in due {
            (timer.callback)();
        }
    }

    fn shutdown(&self) {
        let hooks = std::mem::take(&mut *self.inner.shutdown_hooks.borrow_mut());
        debug!(hooks = hooks.len(), "event loop stopped");
        for hook in hooks.into_values() {
            hook();
        }
    }
}
