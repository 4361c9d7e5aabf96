//! Cooperative event loop
//!
//! One loop drives one process. Mailbox handlers, timer callbacks, and
//! transport deliveries all run on the loop task, one at a time, so actor
//! state never needs locking. Other threads and tasks reach the loop only
//! through a [`LoopHandle`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::Result;

/// Identifies a timer for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// One delivery into a mailbox
///
/// The payload is the raw wire text; consumers parse it. Keeping the text
/// form preserves the difference between an empty retained payload and a
/// literal `null`, which the registrar election relies on.
#[derive(Debug, Clone)]
pub struct Mail {
    /// Topic the payload arrived on; internal posts use the mailbox name
    pub topic: String,
    /// Raw payload text
    pub payload: String,
}

impl Mail {
    /// Build a mail item
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Handler invoked for each mail item posted to a mailbox
pub type MailboxHandler = Box<dyn FnMut(Mail) -> Result<()> + Send>;

type LoopTask = Box<dyn FnOnce() + Send>;
type TimerCallback = Box<dyn FnMut() + Send>;

enum Control {
    Post {
        mailbox: String,
        mail: Mail,
    },
    Task(LoopTask),
    AddMailbox {
        name: String,
        handler: MailboxHandler,
    },
    RemoveMailbox(String),
    AddTimer {
        id: TimerId,
        interval: Duration,
        repeat: bool,
        callback: TimerCallback,
    },
    RemoveTimer(TimerId),
    Terminate,
}

struct TimerEntry {
    interval: Duration,
    repeat: bool,
    callback: TimerCallback,
}

/// Cloneable, thread-safe handle onto the loop
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<Control>,
    next_timer_id: Arc<AtomicU64>,
}

impl LoopHandle {
    /// Post a mail item into a named mailbox; safe from any thread
    pub fn post(&self, mailbox: impl Into<String>, mail: Mail) {
        let _ = self.tx.send(Control::Post {
            mailbox: mailbox.into(),
            mail,
        });
    }

    /// Run one closure on the loop task
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Control::Task(Box::new(task)));
    }

    /// Register a mailbox handler; handlers for the same mailbox run in
    /// registration order
    pub fn add_mailbox_handler(
        &self,
        name: impl Into<String>,
        handler: impl FnMut(Mail) -> Result<()> + Send + 'static,
    ) {
        let _ = self.tx.send(Control::AddMailbox {
            name: name.into(),
            handler: Box::new(handler),
        });
    }

    /// Drop every handler registered for a mailbox
    pub fn remove_mailbox(&self, name: impl Into<String>) {
        let _ = self.tx.send(Control::RemoveMailbox(name.into()));
    }

    /// Schedule a callback after `interval`, repeating when `repeat`
    pub fn add_timer(
        &self,
        interval: Duration,
        repeat: bool,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        let id = TimerId(self.next_timer_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.send(Control::AddTimer {
            id,
            interval,
            repeat,
            callback: Box::new(callback),
        });
        id
    }

    /// Cancel a timer; firing already queued is suppressed
    pub fn remove_timer(&self, id: TimerId) {
        let _ = self.tx.send(Control::RemoveTimer(id));
    }

    /// Stop the loop after currently queued work drains
    pub fn terminate(&self) {
        let _ = self.tx.send(Control::Terminate);
    }

    /// Run `work` on a blocking worker thread, then run `complete` with its
    /// result back on the loop
    pub fn run_blocking<T, F, C>(&self, work: F, complete: C)
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        let handle = self.clone();
        tokio::task::spawn_blocking(move || {
            let result = work();
            handle.spawn(move || complete(result));
        });
    }
}

/// The per-process dispatcher; construct once, then [`EventLoop::run`]
pub struct EventLoop {
    rx: mpsc::UnboundedReceiver<Control>,
    handle: LoopHandle,
    mailboxes: HashMap<String, Vec<MailboxHandler>>,
    timers: HashMap<TimerId, TimerEntry>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    deadline_ids: HashMap<u64, TimerId>,
    next_deadline_seq: u64,
}

impl EventLoop {
    /// Create a loop and its handle
    pub fn new() -> (Self, LoopHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = LoopHandle {
            tx,
            next_timer_id: Arc::new(AtomicU64::new(1)),
        };
        let event_loop = Self {
            rx,
            handle: handle.clone(),
            mailboxes: HashMap::new(),
            timers: HashMap::new(),
            deadlines: BinaryHeap::new(),
            deadline_ids: HashMap::new(),
            next_deadline_seq: 0,
        };
        (event_loop, handle)
    }

    /// Handle onto this loop
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Drive the loop until [`LoopHandle::terminate`] is called
    pub async fn run(mut self) {
        enum Wake {
            Control(Option<Control>),
            Timer,
        }
        loop {
            let next_deadline = self.deadlines.peek().copied().map(|Reverse((at, _))| at);
            let wake = match next_deadline {
                Some(at) => {
                    tokio::select! {
                        control = self.rx.recv() => Wake::Control(control),
                        _ = tokio::time::sleep_until(at) => Wake::Timer,
                    }
                }
                None => Wake::Control(self.rx.recv().await),
            };

            match wake {
                Wake::Timer => self.fire_due_timers(),
                // Every handle dropped
                Wake::Control(None) => return,
                Wake::Control(Some(control)) => {
                    if !self.dispatch(control) {
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, control: Control) -> bool {
        match control {
            Control::Post { mailbox, mail } => self.deliver(&mailbox, mail),
            Control::Task(task) => task(),
            Control::AddMailbox { name, handler } => {
                self.mailboxes.entry(name).or_default().push(handler);
            }
            Control::RemoveMailbox(name) => {
                self.mailboxes.remove(&name);
            }
            Control::AddTimer {
                id,
                interval,
                repeat,
                callback,
            } => {
                self.timers.insert(
                    id,
                    TimerEntry {
                        interval,
                        repeat,
                        callback,
                    },
                );
                self.push_deadline(id, Instant::now() + interval);
            }
            Control::RemoveTimer(id) => {
                self.timers.remove(&id);
            }
            Control::Terminate => {
                self.timers.clear();
                self.mailboxes.clear();
                return false;
            }
        }
        true
    }

    fn deliver(&mut self, mailbox: &str, mail: Mail) {
        let Some(handlers) = self.mailboxes.get_mut(mailbox) else {
            tracing::debug!(mailbox, "mail dropped: no handler registered");
            return;
        };
        for handler in handlers.iter_mut() {
            if let Err(error) = handler(mail.clone()) {
                tracing::warn!(mailbox, %error, "mailbox handler failed");
            }
        }
    }

    fn push_deadline(&mut self, id: TimerId, at: Instant) {
        let seq = self.next_deadline_seq;
        self.next_deadline_seq += 1;
        self.deadline_ids.insert(seq, id);
        self.deadlines.push(Reverse((at, seq)));
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((at, seq))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            let Some(id) = self.deadline_ids.remove(&seq) else {
                continue;
            };
            // Cancelled between scheduling and firing
            let Some(entry) = self.timers.get_mut(&id) else {
                continue;
            };
            (entry.callback)();
            if entry.repeat {
                let interval = entry.interval;
                self.push_deadline(id, now + interval);
            } else {
                self.timers.remove(&id);
            }
        }
    }
}
