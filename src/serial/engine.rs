//! The serial protocol engine: one worker thread owns the link and the
//! cache write side, everything else talks to it through a FIFO job queue.
//!
//! At most one request is ever in flight. The worker drains stale input,
//! emits the request frame (twice, with a short gap, when the controller
//! has been idle long enough to have gone to sleep), then consumes bytes
//! until a frame answering the request shows up or the response timer
//! expires. Timeouts and corrupt frames are retried with fresh frames;
//! NACKs and contract violations go straight back to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;

use crate::cache::RegisterCache;
use crate::catalog::{RESTART_ADDRESS, RESTART_MAGIC};
use crate::error::{last_error_text, Error, Result};
use crate::proto::frame::{FrameDecoder, FrameError, Request, Response, MAX_READ_BLOCK};
use crate::serial::link::SerialLink;

/// How long the worker blocks on its queue before re-checking the stop flag.
const QUEUE_POLL: Duration = Duration::from_millis(100);

/// Extra completion-wait slack on top of the job budget, covering queueing
/// ahead of the job.
const COMPLETION_SLACK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// Response timer per attempt.
    pub response_timeout: Duration,
    /// Retries after the first attempt.
    pub retries: u32,
    /// Job queue depth; a full queue rejects with `Busy`.
    pub queue_depth: usize,
    /// Idle span after which the controller is assumed asleep.
    pub wake_after: Duration,
    /// Gap between the two wakeup copies of a request frame.
    pub wake_gap: Duration,
    /// Minimum spacing between restart commands.
    pub restart_guard: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            response_timeout: Duration::from_millis(750),
            retries: 2,
            queue_depth: 16,
            wake_after: Duration::from_secs(5),
            wake_gap: Duration::from_millis(20),
            restart_guard: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ReadOne(u16),
    ReadBlock { start: u16, count: u8 },
    WriteOne { addr: u16, value: u16 },
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Value(u16),
    Block(Vec<u16>),
    Ack,
}

struct Job {
    op: Operation,
    deadline: Instant,
    completion: Sender<Result<Outcome>>,
}

#[derive(Debug, Default, Clone, serde_derive::Serialize)]
pub struct SerialCounters {
    pub requests: u64,
    pub completed: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub nacks: u64,
    pub crc_errors: u64,
    pub frame_errors: u64,
    pub busy_rejects: u64,
    pub last_error: String,
}

/// Cheap-to-clone client handle onto the worker's queue.
#[derive(Clone)]
pub struct SerialHandle {
    jobs: Sender<Job>,
    counters: Arc<Mutex<SerialCounters>>,
    job_budget: Duration,
}

impl SerialHandle {
    pub fn read(&self, addr: u16) -> Result<u16> {
        match self.submit(Operation::ReadOne(addr))? {
            Outcome::Value(value) => Ok(value),
            other => unreachable!("read produced {other:?}"),
        }
    }

    pub fn read_block(&self, start: u16, count: u8) -> Result<Vec<u16>> {
        if count == 0 || count as usize > MAX_READ_BLOCK {
            return Err(Error::BlockTooLarge {
                count: count as usize,
                limit: MAX_READ_BLOCK,
            });
        }
        match self.submit(Operation::ReadBlock { start, count })? {
            Outcome::Block(values) => Ok(values),
            other => unreachable!("read_block produced {other:?}"),
        }
    }

    pub fn write(&self, addr: u16, value: u16) -> Result<()> {
        self.submit(Operation::WriteOne { addr, value })?;
        Ok(())
    }

    pub fn restart(&self) -> Result<()> {
        self.submit(Operation::Restart)?;
        Ok(())
    }

    pub fn counters(&self) -> SerialCounters {
        self.counters.lock().clone()
    }

    fn submit(&self, op: Operation) -> Result<Outcome> {
        let (completion, result) = bounded(1);
        let job = Job {
            op,
            deadline: Instant::now() + self.job_budget,
            completion,
        };
        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.counters.lock().busy_rejects += 1;
                return Err(Error::Busy);
            }
            Err(TrySendError::Disconnected(_)) => return Err(Error::LinkClosed),
        }
        match result.recv_timeout(self.job_budget + COMPLETION_SLACK) {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout(self.job_budget.as_millis() as u64)),
        }
    }
}

pub struct SerialEngine;

impl SerialEngine {
    /// Spawns the worker thread that owns `link` and the write side of
    /// `cache`. The returned handle serializes all requests through it.
    pub fn start(
        link: Box<dyn SerialLink>,
        cache: Arc<RegisterCache>,
        settings: SerialSettings,
        stop: Arc<AtomicBool>,
    ) -> (SerialHandle, JoinHandle<()>) {
        let (jobs, job_receiver) = bounded(settings.queue_depth);
        let counters = Arc::new(Mutex::new(SerialCounters::default()));

        // Worst case: every attempt runs its full response timer, plus the
        // wakeup gap and a little link overhead.
        let attempts = u32::from(settings.retries) + 1;
        let job_budget = settings.response_timeout * attempts
            + settings.wake_gap
            + Duration::from_millis(200);

        let worker = Worker {
            link,
            cache,
            settings,
            jobs: job_receiver,
            stop,
            counters: Arc::clone(&counters),
            decoder: FrameDecoder::new(),
            last_activity: None,
            last_restart: None,
        };
        let join_handle = thread::Builder::new()
            .name("serial-worker".into())
            .spawn(move || worker.run())
            .expect("failed to spawn serial worker");

        let handle = SerialHandle {
            jobs,
            counters,
            job_budget,
        };
        (handle, join_handle)
    }
}

struct Worker {
    link: Box<dyn SerialLink>,
    cache: Arc<RegisterCache>,
    settings: SerialSettings,
    jobs: Receiver<Job>,
    stop: Arc<AtomicBool>,
    counters: Arc<Mutex<SerialCounters>>,
    decoder: FrameDecoder,
    /// When the last successful exchange finished; `None` until the first.
    last_activity: Option<Instant>,
    last_restart: Option<Instant>,
}

impl Worker {
    fn run(mut self) {
        log::debug!("serial worker running");
        loop {
            match self.jobs.recv_timeout(QUEUE_POLL) {
                Ok(job) => self.handle_job(job),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
        }
        log::debug!("serial worker stopped");
    }

    fn handle_job(&mut self, job: Job) {
        self.counters.lock().requests += 1;

        let result = if Instant::now() >= job.deadline {
            Err(Error::Timeout(0))
        } else {
            self.execute(&job.op, job.deadline)
        };

        {
            let mut counters = self.counters.lock();
            match &result {
                Ok(_) => counters.completed += 1,
                Err(err) => counters.last_error = last_error_text(err),
            }
        }
        // The caller may have given up; that is its business.
        let _ = job.completion.send(result);
    }

    fn execute(&mut self, op: &Operation, deadline: Instant) -> Result<Outcome> {
        match *op {
            Operation::ReadOne(addr) => {
                let response = self.transact(&Request::ReadOne { addr }, deadline)?;
                match response {
                    Response::ReadOne { value, .. } => {
                        self.cache.store(addr, value);
                        Ok(Outcome::Value(value))
                    }
                    other => Err(unexpected(&other)),
                }
            }
            Operation::ReadBlock { start, count } => {
                let response = self.transact(&Request::ReadBlock { start, count }, deadline)?;
                match response {
                    Response::ReadBlock { values } => {
                        for (offset, &value) in values.iter().enumerate() {
                            self.cache.store(start + offset as u16, value);
                        }
                        Ok(Outcome::Block(values))
                    }
                    other => Err(unexpected(&other)),
                }
            }
            Operation::WriteOne { addr, value } => {
                self.write_and_read_back(addr, value, deadline)?;
                Ok(Outcome::Ack)
            }
            Operation::Restart => {
                if let Some(at) = self.last_restart {
                    if at.elapsed() < self.settings.restart_guard {
                        return Err(Error::Throttled(at.elapsed().as_millis() as u64));
                    }
                }
                self.transact(
                    &Request::WriteOne {
                        addr: RESTART_ADDRESS,
                        value: RESTART_MAGIC,
                    },
                    deadline,
                )?;
                self.last_restart = Some(Instant::now());
                Ok(Outcome::Ack)
            }
        }
    }

    fn write_and_read_back(&mut self, addr: u16, value: u16, deadline: Instant) -> Result<()> {
        self.transact(&Request::WriteOne { addr, value }, deadline)?;

        // Confirm what the controller actually latched. A failed read-back
        // doesn't undo a successful write, so it only costs the cache entry.
        match self.transact(&Request::ReadOne { addr }, deadline) {
            Ok(Response::ReadOne { value: stored, .. }) => {
                if stored != value {
                    log::warn!(
                        "register 0x{addr:04X}: wrote {value}, controller latched {stored}"
                    );
                }
                self.cache.store(addr, stored);
            }
            Ok(other) => log::warn!("read-back of 0x{addr:04X} answered with {other:?}"),
            Err(err) => log::warn!("read-back of 0x{addr:04X} failed: {err}"),
        }
        Ok(())
    }

    /// One request, up to `1 + retries` attempts. Each attempt drains the
    /// link, emits a fresh frame and waits for a response matching the
    /// request's command.
    fn transact(&mut self, request: &Request, deadline: Instant) -> Result<Response> {
        let frame = request.encode();
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.link.drain()?;
            self.decoder.clear();
            self.send_wake_aware(&frame)?;

            match self.await_response(request) {
                Ok(response) => {
                    self.last_activity = Some(Instant::now());
                    return Ok(response);
                }
                Err(err @ (Error::Timeout(_) | Error::Frame(_))) => {
                    if attempt > self.settings.retries || Instant::now() >= deadline {
                        return Err(err);
                    }
                    log::debug!("attempt {attempt} failed ({err}), retrying");
                    self.counters.lock().retries += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes the request frame; twice with a short gap if the controller
    /// has been idle long enough that its UART has gone to sleep and will
    /// eat the first frame.
    fn send_wake_aware(&mut self, frame: &[u8]) -> Result<()> {
        let asleep = self
            .last_activity
            .map_or(true, |at| at.elapsed() >= self.settings.wake_after);
        if asleep {
            self.link.write_frame(frame)?;
            thread::sleep(self.settings.wake_gap);
        }
        self.link.write_frame(frame)
    }

    fn await_response(&mut self, request: &Request) -> Result<Response> {
        let started = Instant::now();
        let mut buf = [0u8; 256];
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(Error::LinkClosed);
            }
            if started.elapsed() >= self.settings.response_timeout {
                self.counters.lock().timeouts += 1;
                return Err(Error::Timeout(
                    self.settings.response_timeout.as_millis() as u64
                ));
            }

            let n = self.link.read_some(&mut buf)?;
            if n > 0 {
                self.decoder.push(&buf[..n]);
            }

            loop {
                match self.decoder.next_frame() {
                    Ok(Some(response)) => {
                        if let Some(result) = self.correlate(request, response) {
                            return result;
                        }
                    }
                    Ok(None) => break,
                    Err(err @ FrameError::CrcMismatch { .. }) => {
                        // A corrupt frame voids the attempt; the retry sends
                        // a fresh request.
                        self.counters.lock().crc_errors += 1;
                        return Err(err.into());
                    }
                    Err(err) => {
                        // Garbage that merely looked like a header; the
                        // decoder has resynced, keep scanning.
                        log::debug!("discarding bytes: {err}");
                        self.counters.lock().frame_errors += 1;
                    }
                }
            }
        }
    }

    /// Decides whether `response` answers `request`. Stale responses from
    /// earlier exchanges are ignored and scanning continues.
    fn correlate(&self, request: &Request, response: Response) -> Option<Result<Response>> {
        if response.answers() != request.command() {
            log::debug!("ignoring stale response {response:?}");
            return None;
        }
        if let (Request::ReadOne { addr }, Response::ReadOne { addr: got, .. }) =
            (request, &response)
        {
            if got != addr {
                log::debug!("ignoring read response for other address 0x{got:04X}");
                return None;
            }
        }
        if let Response::Nack { cmd, code } = response {
            self.counters.lock().nacks += 1;
            return Some(Err(Error::Nack { cmd, code }));
        }
        Some(Ok(response))
    }
}

fn unexpected(response: &Response) -> Error {
    Error::UnexpectedCommand(response.answers())
}
