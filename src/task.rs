//! Cooperative task scheduler for pipelined client stubs.
//!
//! Operations are modeled as chains of stages; a stage fires only when the
//! previous one completed, and stages run on a small pool of worker
//! threads. The caller keeps a handle to the terminal stage and may block
//! on it whenever it actually needs the result. Stage failures short-circuit
//! the chain and surface at the handle.

use crate::msg::Errno;
use log::debug;
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// One stage of a chain: consumes the previous stage's value, yields its
/// own or an error.
pub type Stage = Box<dyn FnOnce(i32) -> Result<i32, Errno> + Send + 'static>;

#[derive(Debug)]
struct HandleState {
    result: Mutex<Option<Result<i32, Errno>>>,
    cv: Condvar,
}

/// Waitable handle to the terminal stage of a dispatched chain.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    state: Arc<HandleState>,
}

impl TaskHandle {
    fn new() -> TaskHandle {
        TaskHandle {
            state: Arc::new(HandleState {
                result: Mutex::new(None),
                cv: Condvar::new(),
            }),
        }
    }

    fn complete(&self, result: Result<i32, Errno>) {
        let mut slot = self.state.result.lock().unwrap();
        *slot = Some(result);
        self.state.cv.notify_all();
    }

    /// Blocks until the chain has run to completion or failed.
    pub fn wait(&self) -> Result<i32, Errno> {
        let mut slot = self.state.result.lock().unwrap();
        loop {
            if let Some(result) = *slot {
                return result;
            }
            slot = self.state.cv.wait(slot).unwrap();
        }
    }

    /// Non-blocking probe.
    pub fn poll(&self) -> Option<Result<i32, Errno>> {
        *self.state.result.lock().unwrap()
    }
}

/// Worker pool executing dispatched stages.
pub struct Scheduler {
    tx: Sender<Job>,
}

impl Scheduler {
    pub fn new(workers: usize) -> Scheduler {
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            thread::Builder::new()
                .name(format!("task-worker-{i}"))
                .spawn(move || worker_loop(rx))
                .expect("spawn task worker");
        }
        Scheduler { tx }
    }

    /// Dispatches a chain; returns the handle to its terminal stage.
    pub fn dispatch(&self, chain: TaskChain) -> TaskHandle {
        let handle = TaskHandle::new();
        schedule_next(self.tx.clone(), chain.stages, 0, handle.clone());
        handle
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => {
                debug!("task worker: queue closed, exiting");
                return;
            }
        }
    }
}

fn schedule_next(tx: Sender<Job>, mut stages: VecDeque<Stage>, input: i32, handle: TaskHandle) {
    let stage = match stages.pop_front() {
        Some(stage) => stage,
        None => {
            handle.complete(Ok(input));
            return;
        }
    };
    let tx2 = tx.clone();
    let waiter = handle.clone();
    let job: Job = Box::new(move || match stage(input) {
        Ok(value) => schedule_next(tx2, stages, value, handle),
        Err(err) => handle.complete(Err(err)),
    });
    // A closed queue means the scheduler is gone; report it as a failure to
    // allocate rather than hanging the waiter.
    if tx.send(job).is_err() {
        waiter.complete(Err(Errno::Eagain));
    }
}

/// Builder for a chain of dependent stages.
#[derive(Default)]
pub struct TaskChain {
    stages: VecDeque<Stage>,
}

impl TaskChain {
    pub fn new() -> TaskChain {
        TaskChain {
            stages: VecDeque::new(),
        }
    }

    /// Appends a stage fired when the previous one completes.
    pub fn then<F>(mut self, f: F) -> TaskChain
    where
        F: FnOnce(i32) -> Result<i32, Errno> + Send + 'static,
    {
        self.stages.push_back(Box::new(f));
        self
    }
}
