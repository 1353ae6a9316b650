// The action scheduler's vocabulary and the readiness syscall wrapper.
//
// The loop is single-threaded and level-triggered: every iteration re-arms
// interest on each registered socket according to what currently wants to
// run, waits with a timeout derived from pacing and timer deadlines, then
// dispatches ready actions in registration order. Only the wait suspends.

use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;

use polling::{Event, Events, Poller};

/// Poll keys of the three registered sockets
pub const KEY_UDP0: usize = 0;
pub const KEY_UDP1: usize = 1;
pub const KEY_COORDINATOR: usize = 2;
const SOURCE_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Interval timers that drive periodic actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    Peers,
    OutQueue,
    RayAcks,
    WorkerStats,
    Diagnostics,
    FinishedPaths,
    BenchmarkCheckpoint,
    BenchmarkDone,
}

/// What wakes an action: socket readiness, a ringing timer, or nothing at
/// all (`Always` actions run whenever their guard is true, the rendition
/// of the original design's always-writable sentinel fd).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionSource {
    Udp { iface: usize, direction: Direction },
    Coordinator { direction: Direction },
    Timer(TimerId),
    Always,
}

/// The handler an action dispatches to. Kinds are matched in the worker;
/// keeping them as data sidesteps storing closures over the worker itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    CoordinatorReceive,
    CoordinatorSend,
    UdpReceive(usize),
    UdpSend(usize),
    RayAcks,
    RayQueue,
    OutQueue,
    FinishedQueue,
    Peers,
    Messages,
    NeededTreelets,
    FinishedPaths,
    WorkerStats,
    Diagnostics,
    BenchmarkReceive(usize),
    BenchmarkSend(usize),
    BenchmarkCheckpoint,
    BenchmarkDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    Continue,
    /// Consume the action, abandon the rest of the iteration, and end the
    /// event loop (benchmark completion uses this).
    CancelAll,
}

/// One scheduled action. Deactivated actions stay in place so ids and
/// registration order remain stable.
pub struct Action {
    pub id: u64,
    pub source: ActionSource,
    pub kind: ActionKind,
    pub active: bool,
}

/// Level-triggered readiness over the process's three sockets
pub struct Readiness {
    poller: Poller,
    events: Events,
    readable: [bool; SOURCE_COUNT],
    writable: [bool; SOURCE_COUNT],
}

impl Readiness {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            events: Events::new(),
            readable: [false; SOURCE_COUNT],
            writable: [false; SOURCE_COUNT],
        })
    }

    /// Register a socket under its key with no interest yet
    pub fn register<S: AsRawFd>(&self, source: &S, key: usize) -> io::Result<()> {
        // SAFETY: every registered socket is owned by the worker, which
        // also owns this poller; the fd stays valid for the poller's life.
        unsafe { self.poller.add(source.as_raw_fd(), Event::none(key)) }
    }

    /// Re-arm interest for one socket ahead of the next wait
    pub fn interest<S: AsFd>(
        &self,
        source: &S,
        key: usize,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        let event = match (readable, writable) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        };
        self.poller.modify(source, event)
    }

    /// Block until readiness or timeout; `None` waits indefinitely
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.readable = [false; SOURCE_COUNT];
        self.writable = [false; SOURCE_COUNT];
        self.events.clear();
        self.poller.wait(&mut self.events, timeout)?;

        for event in self.events.iter() {
            if event.key < SOURCE_COUNT {
                self.readable[event.key] |= event.readable;
                self.writable[event.key] |= event.writable;
            }
        }
        Ok(())
    }

    pub fn ready(&self, key: usize, direction: Direction) -> bool {
        match direction {
            Direction::In => self.readable[key],
            Direction::Out => self.writable[key],
        }
    }
}
