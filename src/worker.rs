use crate::prelude::*;
use crate::util::lock_unpoisoned;
use std::any::Any;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

// Plain OS-thread worker machinery: N threads draining one FIFO queue of
// boxed closures. A job's outcome (value or error) lands in a shared slot
// its submitter can block on; errors never take a worker thread down — even
// a panic inside a job is captured and re-raised from `wait()`.

enum Task {
    Run(Box<dyn FnOnce() + Send>),
    /// Sentinel; the receiving worker exits its loop.
    Finish,
}

struct Slot<T> {
    result: Mutex<Option<Result<T>>>,
    cond: Condvar,
}

/// The submitter's half of a scheduled job. `wait` blocks until the job
/// reaches a terminal state and yields its result, re-raising any captured
/// error.
pub struct JobHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> JobHandle<T> {
    pub fn wait(self) -> Result<T> {
        let mut guard = lock_unpoisoned(&self.slot.result);
        while guard.is_none() {
            guard = self
                .slot
                .cond
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        // unwrap rationale: the loop above only exits once the slot is filled.
        guard.take().unwrap()
    }

    pub fn is_finished(&self) -> bool {
        lock_unpoisoned(&self.slot.result).is_some()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

fn make_job<T, F>(f: F) -> (Task, JobHandle<T>)
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let slot = Arc::new(Slot {
        result: Mutex::new(None),
        cond: Condvar::new(),
    });
    let worker_slot = slot.clone();
    let task = Task::Run(Box::new(move || {
        let result = match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => Err(eyre!("job panicked: {}", panic_message(payload))),
        };
        complete(&worker_slot, result);
    }));
    (task, JobHandle { slot })
}

fn complete<T>(slot: &Slot<T>, result: Result<T>) {
    let mut guard = lock_unpoisoned(&slot.result);
    *guard = Some(result);
    slot.cond.notify_all();
}

fn run_loop(queue: Arc<Mutex<Receiver<Task>>>) {
    loop {
        let task = {
            let rx = lock_unpoisoned(&queue);
            rx.recv()
        };
        match task {
            // Queue sender gone; nothing further will arrive.
            Err(_) => break,
            Ok(Task::Finish) => break,
            Ok(Task::Run(f)) => f(),
        }
    }
    trace!("worker thread exiting");
}

fn submit<T>(tx: &Sender<Task>, task: Task, handle: JobHandle<T>) -> JobHandle<T> {
    if tx.send(task).is_err() {
        // All workers already exited; fail the job instead of letting its
        // submitter wait forever.
        complete(&handle.slot, Err(eyre!("worker queue is shut down")));
    }
    handle
}

/// A single thread with its own queue. Used for dispatched cache scrubbing.
pub struct Worker {
    tx: Sender<Task>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(name: &str) -> Worker {
        let (tx, rx) = channel();
        let queue = Arc::new(Mutex::new(rx));
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run_loop(queue))
            .expect("failed to spawn worker thread");
        Worker {
            tx,
            thread: Some(thread),
        }
    }

    pub fn schedule<T, F>(&self, f: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (task, handle) = make_job(f);
        submit(&self.tx, task, handle)
    }

    pub fn finish(&self) {
        let _ = self.tx.send(Task::Finish);
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.finish();
        self.join();
    }
}

/// N workers sharing one FIFO queue.
pub struct WorkerPool {
    tx: Sender<Task>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> WorkerPool {
        assert!(size > 0);
        let (tx, rx) = channel();
        let queue = Arc::new(Mutex::new(rx));
        let threads = (0..size)
            .map(|i| {
                let queue = queue.clone();
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || run_loop(queue))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        WorkerPool { tx, threads }
    }

    pub fn schedule<T, F>(&self, f: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (task, handle) = make_job(f);
        submit(&self.tx, task, handle)
    }

    /// Run `sink` on the pool with its output readable from the returned
    /// stream. The job writes into the writable end of an OS pipe, so the
    /// reader applies backpressure; dropping the reader early makes the
    /// sink's next write fail with a broken pipe, which counts as a clean
    /// finish.
    pub fn stream<F>(&self, sink: F) -> io::Result<StreamJob>
    where
        F: FnOnce(&mut dyn Write) -> Result<()> + Send + 'static,
    {
        let (reader, writer) = io::pipe()?;
        let job = self.schedule(move || {
            let mut writer = writer;
            match sink(&mut writer) {
                Err(e) if is_broken_pipe(&e) => Ok(()),
                result => result,
            }
        });
        Ok(StreamJob {
            reader: Some(reader),
            job: Some(job),
        })
    }

    /// Enqueue one sentinel per worker.
    pub fn finish(&self) {
        for _ in &self.threads {
            let _ = self.tx.send(Task::Finish);
        }
    }

    pub fn join(&mut self) {
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.finish();
        self.join();
    }
}

fn is_broken_pipe(report: &eyre::Report) -> bool {
    report.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .map_or(false, |e| e.kind() == io::ErrorKind::BrokenPipe)
    })
}

/// Readable stream over a job running on the pool (the pipe adapter).
pub struct StreamJob {
    reader: Option<io::PipeReader>,
    job: Option<JobHandle<()>>,
}

impl StreamJob {
    /// Close the readable end and wait for the job, surfacing its error.
    pub fn finish(mut self) -> Result<()> {
        drop(self.reader.take());
        match self.job.take() {
            Some(job) => job.wait(),
            None => Ok(()),
        }
    }
}

impl Read for StreamJob {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.reader {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for StreamJob {
    fn drop(&mut self) {
        drop(self.reader.take());
        if let Some(job) = self.job.take() {
            let _ = job.wait();
        }
    }
}
