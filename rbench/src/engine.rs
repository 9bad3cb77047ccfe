//! Load engine.
//!
//! Fans out one worker task per connection, all sharing a single
//! [`Progress`], and joins them once the target number of requests is
//! completed or the run is aborted.

use core::{
    future::Future,
    num::NonZero,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use std::{sync::Arc, time::Instant};

use bytes::Bytes;

pub use self::worker::Exit;
use self::{
    runtime::TaskPool,
    worker::{Worker, WorkerConfig},
};
use crate::{
    cfg::Config,
    codec::HttpCodec,
    dial::{self, Conn, Connector},
    OneProduce, WorkerStat,
};

mod runtime;
mod worker;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The very first dial of a worker failed, while dial errors are not
    /// ignored.
    #[error("failed to start connection #{worker}: {source}")]
    Dial {
        worker: usize,
        #[source]
        source: dial::Error,
    },
    #[error(transparent)]
    Transport(#[from] dial::Error),
}

/// Source of new connections to the target.
pub trait Connect {
    fn connect(&self) -> impl Future<Output = Result<Conn, dial::Error>> + Send;
}

impl Connect for Connector {
    #[inline]
    fn connect(&self) -> impl Future<Output = Result<Conn, dial::Error>> + Send {
        Connector::connect(self)
    }
}

/// Progress shared between all workers of a single run.
#[derive(Debug)]
pub struct Progress {
    /// Target number of completed requests.
    total: u64,
    completed: AtomicU64,
    failures: AtomicU64,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            completed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Counts a completed request, unless the target is already reached.
    ///
    /// Returns the new number of completed requests, or `None` if the
    /// request was not counted.
    #[inline]
    pub fn on_complete(&self) -> Option<u64> {
        self.completed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| (v < self.total).then_some(v + 1))
            .ok()
            .map(|v| v + 1)
    }

    /// Counts a failure, returning the new number of failures.
    #[inline]
    pub fn on_failure(&self) -> u64 {
        self.failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns `true` if the target number of requests is completed.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.completed() >= self.total
    }

    /// Returns `true` if failures have exhausted the request budget.
    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.failures() >= self.total
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[inline]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }
}

/// Outcome of a single run.
#[derive(Debug)]
pub struct Run {
    /// Per-worker statistics, in order of worker indices.
    pub stats: Vec<WorkerStat>,
    /// Number of workers spawned.
    pub connections: usize,
    /// Number of workers that terminated normally.
    pub num_done: usize,
    /// Number of workers that gave up before completion.
    pub num_aborted: usize,
    /// Number of requests completed.
    pub completed: u64,
    /// Number of failures observed.
    pub failures: u64,
    /// Wall-clock time of the whole fan-out.
    pub elapsed: Duration,
}

impl Run {
    /// Returns `true` if some workers terminated before completion.
    #[inline]
    pub fn is_partial(&self) -> bool {
        self.num_done < self.connections
    }
}

#[derive(Debug)]
pub struct Engine {
    cfg: Config,
    connector: Arc<Connector>,
}

impl Engine {
    /// Prepares the engine, setting up the transport for the whole run.
    pub fn new(cfg: Config) -> Result<Self, Error> {
        let connector = Connector::new(cfg.target.clone(), &cfg.proxy, cfg.socket, cfg.timeout)?;

        let m = Self { cfg, connector: Arc::new(connector) };

        Ok(m)
    }

    #[inline]
    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    /// Runs the benchmark until completion or abort.
    pub async fn run(&self) -> Result<Run, Error> {
        let cfg = &self.cfg;
        log::info!(
            "running {} requests @ {} by {} connections",
            cfg.requests,
            cfg.target,
            cfg.connections
        );
        log::debug!("request as following format:\n\n{}", String::from_utf8_lossy(&cfg.request));

        let worker_cfg = WorkerConfig {
            timeout: cfg.timeout,
            ignore_err: cfg.ignore_err,
            requests_per_socket: cfg.requests_per_socket(),
        };

        let (outputs, elapsed, progress) =
            run_workers(self.connector.clone(), cfg.request.clone(), cfg.requests, cfg.connections, worker_cfg).await?;

        let connections = cfg.connections.get();
        let mut stats = Vec::with_capacity(connections);
        let mut num_done = 0;
        for (exit, stat) in outputs {
            if exit == Exit::Done {
                num_done += 1;
            }
            stats.push(stat);
        }

        let run = Run {
            stats,
            connections,
            num_done,
            num_aborted: connections - num_done,
            completed: progress.completed(),
            failures: progress.failures(),
            elapsed,
        };

        if run.is_partial() {
            log::warn!(
                "only {} successful connections, with {} failure. Try increasing the timeout using flag `-t`.",
                run.num_done,
                run.num_aborted
            );
        }

        Ok(run)
    }
}

/// Spawns the workers and waits for all of them.
async fn run_workers<C>(
    connector: Arc<C>,
    request: Bytes,
    requests: NonZero<u64>,
    connections: NonZero<usize>,
    cfg: WorkerConfig,
) -> Result<(Vec<(Exit, WorkerStat)>, Duration, Arc<Progress>), Error>
where
    C: Connect + Send + Sync + 'static,
{
    let data = Arc::new(OneProduce::new(request));
    let progress = Arc::new(Progress::new(requests.get()));

    let pool = TaskPool::new(connections, |idx: usize| {
        let worker = Worker::new(
            idx,
            connector.clone(),
            HttpCodec::new(data.clone()),
            progress.clone(),
            cfg.clone(),
        );

        worker.run()
    });

    let now = Instant::now();
    let outputs = pool.run().await?;
    let elapsed = now.elapsed();

    Ok((outputs, elapsed, progress))
}
