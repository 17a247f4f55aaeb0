//! Async executor: a fixed worker pool pulling SQL jobs from a bounded
//! FIFO queue, running each on a connection from a fixed-size pool.
//!
//! The connection pool is a channel used as a counting semaphore: a
//! worker receives a connection, runs the job to completion, and sends
//! the connection back. Write statements contend on the database's
//! single-writer token and are retried with bounded exponential backoff
//! (`Busy` after the last attempt). A job cancelled before it acquires a
//! connection reports `Cancelled`; once a connection is held the job runs
//! to its next statement boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, warn};

use crate::connection::Connection;
use crate::error::{KuraError, Result};
use crate::sql::vm::QueryResult;
use crate::Database;

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub workers: usize,
    /// Bounded job queue depth; a full queue rejects with `Busy`.
    pub queue_depth: usize,
    pub pool_size: usize,
    /// Retries for statements that hit writer contention.
    pub busy_retries: u32,
    pub busy_base_delay_ms: u64,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions {
            workers: 4,
            queue_depth: 1000,
            pool_size: 4,
            busy_retries: 5,
            busy_base_delay_ms: 1,
        }
    }
}

struct Job {
    statements: Vec<String>,
    cancel: Arc<AtomicBool>,
    reply: Sender<Result<Vec<QueryResult>>>,
}

/// Handle to a submitted job.
pub struct JobHandle {
    cancel: Arc<AtomicBool>,
    reply: Receiver<Result<Vec<QueryResult>>>,
}

impl JobHandle {
    /// Block until the job finishes; returns the last statement's result.
    pub fn wait(self) -> Result<QueryResult> {
        let mut results = self.wait_all()?;
        results
            .pop()
            .ok_or_else(|| KuraError::Internal("job produced no result".into()))
    }

    /// Block until the job finishes; returns every statement's result.
    pub fn wait_all(self) -> Result<Vec<QueryResult>> {
        self.reply
            .recv()
            .map_err(|_| KuraError::Internal("executor dropped the job".into()))?
    }

    /// Request cancellation. Effective until a connection is acquired, and
    /// between statements of a batch afterwards.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

pub struct Executor {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Executor {
    pub fn new(db: &Database, options: ExecutorOptions) -> Executor {
        let workers = options.workers.max(1);
        let pool_size = options.pool_size.max(1);

        let (jobs_tx, jobs_rx) = bounded::<Job>(options.queue_depth.max(1));
        let (pool_tx, pool_rx) = bounded::<Connection>(pool_size);
        for _ in 0..pool_size {
            pool_tx.send(db.connect()).expect("pool channel fits");
        }

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let jobs_rx = jobs_rx.clone();
            let pool_rx = pool_rx.clone();
            let pool_tx = pool_tx.clone();
            let retries = options.busy_retries;
            let base_delay = options.busy_base_delay_ms;
            let handle = std::thread::Builder::new()
                .name(format!("kuradb-worker-{}", worker_id))
                .spawn(move || {
                    worker_loop(&jobs_rx, &pool_rx, &pool_tx, retries, base_delay);
                })
                .expect("spawn worker thread");
            handles.push(handle);
        }

        Executor {
            jobs: Some(jobs_tx),
            workers: handles,
        }
    }

    /// Enqueue a single statement. Fails fast with `Busy` when the queue
    /// is full.
    pub fn submit(&self, sql: impl Into<String>) -> Result<JobHandle> {
        self.submit_batch(vec![sql.into()])
    }

    /// Enqueue several statements to run on one connection inside one
    /// transaction.
    pub fn submit_batch(&self, statements: Vec<String>) -> Result<JobHandle> {
        if statements.is_empty() {
            return Err(KuraError::Misuse("empty statement batch".into()));
        }
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| KuraError::Misuse("executor is shut down".into()))?;

        let cancel = Arc::new(AtomicBool::new(false));
        let (reply_tx, reply_rx) = bounded(1);
        let job = Job {
            statements,
            cancel: cancel.clone(),
            reply: reply_tx,
        };
        match jobs.try_send(job) {
            Ok(()) => Ok(JobHandle {
                cancel,
                reply: reply_rx,
            }),
            Err(TrySendError::Full(_)) => {
                Err(KuraError::Busy("executor queue is full".into()))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(KuraError::Misuse("executor is shut down".into()))
            }
        }
    }

    /// Drain the queue and join every worker.
    pub fn shutdown(mut self) {
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("executor worker panicked during shutdown");
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.jobs.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    jobs: &Receiver<Job>,
    pool_rx: &Receiver<Connection>,
    pool_tx: &Sender<Connection>,
    retries: u32,
    base_delay: u64,
) {
    while let Ok(job) = jobs.recv() {
        // Cancellation point: before a connection is acquired.
        if job.cancel.load(Ordering::SeqCst) {
            let _ = job
                .reply
                .send(Err(KuraError::Cancelled("cancelled before dispatch".into())));
            continue;
        }

        let Ok(mut conn) = pool_rx.recv() else {
            break;
        };
        let result = run_job(&mut conn, &job, retries, base_delay);
        let _ = pool_tx.send(conn);
        let _ = job.reply.send(result);
    }
    debug!("executor worker exiting");
}

fn run_job(
    conn: &mut Connection,
    job: &Job,
    retries: u32,
    base_delay: u64,
) -> Result<Vec<QueryResult>> {
    let batch = job.statements.len() > 1;
    if batch {
        execute_with_retry(conn, "BEGIN", retries, base_delay)?;
    }

    let mut results = Vec::with_capacity(job.statements.len());
    for (i, sql) in job.statements.iter().enumerate() {
        // Statement-boundary cancellation point for batches.
        if i > 0 && job.cancel.load(Ordering::SeqCst) {
            let _ = conn.execute("ROLLBACK");
            return Err(KuraError::Cancelled(
                "cancelled at statement boundary".into(),
            ));
        }
        match execute_with_retry(conn, sql, retries, base_delay) {
            Ok(result) => results.push(result),
            Err(e) => {
                if batch && conn.in_transaction() {
                    let _ = conn.execute("ROLLBACK");
                }
                return Err(e);
            }
        }
    }

    if batch {
        execute_with_retry(conn, "COMMIT", retries, base_delay)?;
    }
    // A job must hand its connection back clean; a stray BEGIN without a
    // matching COMMIT in the same job does not leak into the next one.
    if conn.in_transaction() {
        warn!("job left a transaction open; rolling back");
        let _ = conn.execute("ROLLBACK");
    }
    Ok(results)
}

fn execute_with_retry(
    conn: &mut Connection,
    sql: &str,
    retries: u32,
    base_delay: u64,
) -> Result<QueryResult> {
    let mut delay = base_delay;
    let mut attempt = 0;
    loop {
        match conn.execute(sql) {
            Err(KuraError::Busy(msg)) if attempt < retries => {
                debug!("busy (attempt {}): {}", attempt + 1, msg);
                std::thread::sleep(std::time::Duration::from_millis(delay));
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            other => return other,
        }
    }
}
