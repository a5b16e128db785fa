// src/utils/basecall.rs: Basecalling backends and the dispatcher that reconciles their completions
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::stream::{self, Stream};
use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet};
use log::{debug, info, warn};
use tokio::time::{sleep, sleep_until, Instant};

use crate::config::conditions::{BackendKind, CallerSettings};
use crate::config::defs::{
    PipelineError, DEFAULT_IDLE_POLL_MS, TRIM_MIN_ELEMENTS, TRIM_THRESHOLD_FACTOR, TRIM_WINDOW,
};
use crate::utils::signal::{rescale_signal, tail, trim_signal};


/// A chunk of raw signal from one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRead {
    pub channel: u32,
    pub read_number: u32,
    pub read_id: String,
    pub signal: Vec<i16>,
}

/// What a backend hands back: the read id and its call.
#[derive(Debug, Clone, PartialEq)]
pub struct CalledRead {
    pub read_id: String,
    pub sequence: String,
    pub quality: String,
}

/// A completed call reunited with the channel and read number it was submitted with.
#[derive(Debug, Clone, PartialEq)]
pub struct BasecallResult {
    pub channel: u32,
    pub read_number: u32,
    pub read_id: String,
    pub sequence: String,
    pub length: usize,
    pub quality: String,
}


/// Turns rescaled signal into (sequence, quality).
pub trait SignalDecoder: Send + Sync {
    fn decode(&self, signal: &[f32]) -> Result<(String, String), PipelineError>;
}


/// Bins the signal and maps each bin's mean level to a base. No model behind it; it only
/// produces plausible output for exercising the dispatch path.
#[derive(Debug, Clone)]
pub struct QuantizingDecoder {
    pub stride: usize,
}

impl Default for QuantizingDecoder {
    fn default() -> Self {
        QuantizingDecoder { stride: 10 }
    }
}

impl SignalDecoder for QuantizingDecoder {
    fn decode(&self, signal: &[f32]) -> Result<(String, String), PipelineError> {
        if self.stride == 0 {
            return Err(PipelineError::InvalidConfig("decoder stride must be positive".to_string()));
        }
        let mut sequence = String::with_capacity(signal.len() / self.stride);
        let mut quality = String::with_capacity(signal.len() / self.stride);

        for bin in signal.chunks_exact(self.stride) {
            let level = bin.iter().sum::<f32>() / self.stride as f32;
            // quartiles of a standard normal
            let base = match level {
                l if l < -0.674 => 'A',
                l if l < 0.0 => 'C',
                l if l < 0.674 => 'G',
                _ => 'T',
            };
            sequence.push(base);
            let q = (level.abs() * 10.0).min(40.0) as u8;
            quality.push((b'!' + q) as char);
        }
        Ok((sequence, quality))
    }
}


/// Basecalling capability. Submission never blocks on completion.
pub trait BasecallBackend: Send + Sync {
    /// Queues a read. Returns false if the backend refused it.
    fn submit(&self, read: RawRead) -> bool;

    /// Everything completed since the last poll. Never blocks.
    fn poll_completed(&self) -> Vec<CalledRead>;

    /// Stops the backend. Idempotent.
    fn shutdown(&self);
}


/// Drops the leading stall, then decodes the last `signal_chunk` samples.
fn decode_read(decoder: &dyn SignalDecoder, read: &RawRead, signal_chunk: usize) -> CalledRead {
    let start = trim_signal(&read.signal, TRIM_WINDOW, TRIM_THRESHOLD_FACTOR, TRIM_MIN_ELEMENTS);
    let signal = rescale_signal(tail(&read.signal[start..], signal_chunk));
    match decoder.decode(&signal) {
        Ok((sequence, quality)) => CalledRead {
            read_id: read.read_id.clone(),
            sequence,
            quality,
        },
        Err(e) => {
            // still complete the read so the dispatcher is not left waiting
            warn!("Failed to decode read {}: {}", read.read_id, e);
            CalledRead {
                read_id: read.read_id.clone(),
                sequence: String::new(),
                quality: String::new(),
            }
        }
    }
}


/// Fixed-size pool of decoding threads fed through two unbounded queues.
pub struct WorkerPool {
    decoder: Arc<dyn SignalDecoder>,
    workers: usize,
    signal_chunk: usize,
    submit_tx: Mutex<Option<Sender<RawRead>>>,
    submit_rx: Receiver<RawRead>,
    complete_tx: Sender<CalledRead>,
    complete_rx: Receiver<CalledRead>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopping: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Creates the queues. Threads are not started until `start`.
    pub fn new(decoder: Arc<dyn SignalDecoder>, workers: usize, signal_chunk: usize) -> Self {
        let (submit_tx, submit_rx) = unbounded();
        let (complete_tx, complete_rx) = unbounded();
        WorkerPool {
            decoder,
            workers: workers.max(1),
            signal_chunk,
            submit_tx: Mutex::new(Some(submit_tx)),
            submit_rx,
            complete_tx,
            complete_rx,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Spawns the worker threads. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);

        for i in 0..self.workers {
            let rx = self.submit_rx.clone();
            let tx = self.complete_tx.clone();
            let decoder = Arc::clone(&self.decoder);
            let stopping = Arc::clone(&self.stopping);
            let signal_chunk = self.signal_chunk;

            let handle = thread::Builder::new()
                .name(format!("basecall-{}", i))
                .spawn(move || {
                    while let Ok(read) = rx.recv() {
                        if stopping.load(Ordering::SeqCst) {
                            continue;
                        }
                        if tx.send(decode_read(decoder.as_ref(), &read, signal_chunk)).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| PipelineError::IOError(format!("Failed to spawn basecall worker: {}", e)))?;
            handles.push(handle);
        }
        info!("Started {} basecall workers", self.workers);
        Ok(())
    }
}

impl BasecallBackend for WorkerPool {
    fn submit(&self, read: RawRead) -> bool {
        match self.submit_tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx.send(read).is_ok(),
            None => false,
        }
    }

    fn poll_completed(&self) -> Vec<CalledRead> {
        self.complete_rx.try_iter().collect()
    }

    fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        // dropping the only sender lets the workers fall out of recv
        let sender = self.submit_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("A basecall worker panicked");
            }
        }
        debug!("Basecall workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}


/// Decodes on the submitting thread. Completions are queued until polled.
pub struct InlineCaller {
    decoder: Arc<dyn SignalDecoder>,
    signal_chunk: usize,
    completed: Mutex<VecDeque<CalledRead>>,
    closed: AtomicBool,
}

impl InlineCaller {
    pub fn new(decoder: Arc<dyn SignalDecoder>, signal_chunk: usize) -> Self {
        InlineCaller {
            decoder,
            signal_chunk,
            completed: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl BasecallBackend for InlineCaller {
    fn submit(&self, read: RawRead) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let called = decode_read(self.decoder.as_ref(), &read, self.signal_chunk);
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(called);
        true
    }

    fn poll_completed(&self) -> Vec<CalledRead> {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}


/// Backend chosen by `[caller_settings]`.
pub enum Basecaller {
    Pool(WorkerPool),
    Inline(InlineCaller),
}

impl Basecaller {
    /// Builds and starts the configured backend.
    ///
    /// # Arguments
    ///
    /// * `settings` - `[caller_settings]` of the experiment.
    /// * `threads` - Worker count when the settings do not fix one.
    /// * `decoder` - Signal decoder shared by all workers.
    pub fn from_settings(
        settings: &CallerSettings,
        threads: usize,
        decoder: Arc<dyn SignalDecoder>,
    ) -> Result<Self, PipelineError> {
        match settings.backend {
            BackendKind::Pool => {
                let pool = WorkerPool::new(decoder, settings.workers.unwrap_or(threads), settings.signal_chunk);
                pool.start()?;
                Ok(Basecaller::Pool(pool))
            }
            BackendKind::Inline => Ok(Basecaller::Inline(InlineCaller::new(decoder, settings.signal_chunk))),
        }
    }
}

impl BasecallBackend for Basecaller {
    fn submit(&self, read: RawRead) -> bool {
        match self {
            Basecaller::Pool(b) => b.submit(read),
            Basecaller::Inline(b) => b.submit(read),
        }
    }

    fn poll_completed(&self) -> Vec<CalledRead> {
        match self {
            Basecaller::Pool(b) => b.poll_completed(),
            Basecaller::Inline(b) => b.poll_completed(),
        }
    }

    fn shutdown(&self) {
        match self {
            Basecaller::Pool(b) => b.shutdown(),
            Basecaller::Inline(b) => b.shutdown(),
        }
    }
}


/// Stops a dispatcher's backend from another task and abandons any drain in progress.
pub struct ShutdownHandle<B: BasecallBackend> {
    flag: Arc<AtomicBool>,
    backend: Arc<B>,
}

impl<B: BasecallBackend> Clone for ShutdownHandle<B> {
    fn clone(&self) -> Self {
        ShutdownHandle {
            flag: Arc::clone(&self.flag),
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: BasecallBackend> ShutdownHandle<B> {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.backend.shutdown();
    }
}


/// Submits batches to a backend and yields completions tagged with their channel and read number.
///
/// Completions come back in any order; the in-flight table keyed by read id is the only link
/// between a completion and its submission. Reads dropped by an aborted cycle stay in
/// `abandoned` until their late completion turns up.
pub struct BasecallDispatcher<B: BasecallBackend> {
    backend: Arc<B>,
    in_flight: HashMap<String, (u32, u32)>,
    abandoned: HashSet<String>,
    expected: usize,
    throttle: Duration,
    last_submit: Option<Instant>,
    idle: Duration,
    shutdown: Arc<AtomicBool>,
}

impl<B: BasecallBackend> BasecallDispatcher<B> {
    /// # Arguments
    ///
    /// * `backend` - Basecalling backend, already started.
    /// * `throttle` - Minimum delay between two submissions to the backend. Also the sleep
    ///   after an empty poll, where zero falls back to 1 ms.
    pub fn new(backend: B, throttle: Duration) -> Self {
        let idle = if throttle.is_zero() {
            Duration::from_millis(DEFAULT_IDLE_POLL_MS)
        } else {
            throttle
        };
        BasecallDispatcher {
            backend: Arc::new(backend),
            in_flight: HashMap::default(),
            abandoned: HashSet::default(),
            expected: 0,
            throttle,
            last_submit: None,
            idle,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle<B> {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            backend: Arc::clone(&self.backend),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Reads accepted but not yet drained.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Passes a batch to the backend, spacing consecutive submissions by the throttle.
    /// Never waits on completions.
    ///
    /// # Arguments
    ///
    /// * `reads` - Raw reads tagged with channel and read number.
    /// * `decided_reads` - Per channel, the last read id a decision was made for; those are skipped.
    ///
    /// # Returns
    /// Number of reads accepted by the backend.
    pub async fn submit(&mut self, reads: Vec<RawRead>, decided_reads: &HashMap<u32, String>) -> usize {
        if self.shutdown.load(Ordering::SeqCst) {
            warn!("Dispatcher is shut down; dropping {} reads", reads.len());
            return 0;
        }

        let mut accepted = 0;
        for read in reads {
            if decided_reads.get(&read.channel) == Some(&read.read_id) {
                continue;
            }
            if self.in_flight.contains_key(&read.read_id) {
                debug!("Read {} already in flight", read.read_id);
                continue;
            }

            if !self.throttle.is_zero() {
                if let Some(last) = self.last_submit {
                    sleep_until(last + self.throttle).await;
                }
                self.last_submit = Some(Instant::now());
            }

            let read_id = read.read_id.clone();
            self.abandoned.remove(&read_id);
            self.in_flight.insert(read_id.clone(), (read.channel, read.read_number));
            if self.backend.submit(read) {
                accepted += 1;
            } else {
                warn!("Skipping read {}: basecaller rejected it", read_id);
                self.in_flight.remove(&read_id);
            }
        }
        self.expected += accepted;
        accepted
    }

    /// Gives up on every read still in flight. Completions already sitting in the backend are
    /// discarded now; later ones are dropped by `drain`.
    fn abandon(&mut self) {
        self.abandoned.extend(self.in_flight.drain().map(|(read_id, _)| read_id));
        self.expected = 0;
        for called in self.backend.poll_completed() {
            if !self.abandoned.remove(&called.read_id) {
                debug!("Discarding unexpected completion {}", called.read_id);
            }
        }
    }

    /// Reads abandoned by an aborted cycle whose completion has not arrived yet.
    pub fn abandoned(&self) -> usize {
        self.abandoned.len()
    }

    /// Lazily yields one result per accepted read.
    ///
    /// Ends after the last expected completion, on the first unknown read id (after yielding the
    /// error), or silently when the dispatcher is shut down.
    pub fn drain(&mut self) -> impl Stream<Item = Result<BasecallResult, PipelineError>> + '_ {
        stream::unfold(
            (self, VecDeque::<CalledRead>::new()),
            |(dispatcher, mut pending)| async move {
                loop {
                    if dispatcher.shutdown.load(Ordering::SeqCst) {
                        if dispatcher.expected > 0 {
                            debug!("Abandoning {} outstanding reads", dispatcher.expected);
                        }
                        dispatcher.abandon();
                        return None;
                    }
                    if dispatcher.expected == 0 {
                        return None;
                    }

                    if let Some(called) = pending.pop_front() {
                        if !dispatcher.in_flight.contains_key(&called.read_id)
                            && dispatcher.abandoned.remove(&called.read_id)
                        {
                            debug!("Dropping late completion of abandoned read {}", called.read_id);
                            continue;
                        }
                        let item = match dispatcher.in_flight.remove(&called.read_id) {
                            Some((channel, read_number)) => {
                                dispatcher.expected -= 1;
                                Ok(BasecallResult {
                                    channel,
                                    read_number,
                                    length: called.sequence.len(),
                                    read_id: called.read_id,
                                    sequence: called.sequence,
                                    quality: called.quality,
                                })
                            }
                            None => {
                                // already completed, so never expected again
                                for done in pending.drain(..) {
                                    if dispatcher.in_flight.remove(&done.read_id).is_none() {
                                        dispatcher.abandoned.remove(&done.read_id);
                                    }
                                }
                                dispatcher.abandon();
                                Err(PipelineError::UnknownReadId(called.read_id))
                            }
                        };
                        return Some((item, (dispatcher, pending)));
                    }

                    let batch = dispatcher.backend.poll_completed();
                    if batch.is_empty() {
                        sleep(dispatcher.idle).await;
                    } else {
                        pending.extend(batch);
                    }
                }
            },
        )
    }

    pub fn shutdown(&self) {
        self.shutdown_handle().shutdown();
    }
}
