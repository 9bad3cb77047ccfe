use core::time::Duration;
use std::{io, sync::Arc, time::Instant};

use super::{Connect, Error, Progress};
use crate::{codec::Codec, dial, dial::Conn, WorkerStat};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Per-operation timeout.
    pub timeout: Duration,
    /// Whether a failed first dial is tolerated.
    pub ignore_err: bool,
    /// The number of requests after which the connection will be recreated.
    pub requests_per_socket: u64,
}

/// How a worker terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The target number of requests was reached.
    Done,
    /// The worker gave up before completion.
    Aborted,
}

#[derive(Debug)]
enum Failure {
    Dial(dial::Error),
    Io(io::Error),
}

enum State {
    Idle,
    Dialing,
    Sending(Conn),
    /// Waiting for the response of the request started at the given instant.
    Receiving(Conn, Instant),
    Failed(Failure),
    Done,
}

/// Drives a single logical connection.
#[derive(Debug)]
pub struct Worker<C, K> {
    idx: usize,
    connector: Arc<C>,
    codec: K,
    progress: Arc<Progress>,
    cfg: WorkerConfig,
    stat: WorkerStat,
    /// Set once the first dial attempt has finished.
    has_dialed: bool,
    /// Number of requests done for the currently active connection.
    ///
    /// Must be reset to zero when a new connection is created.
    requests_per_sock_done: u64,
}

impl<C, K> Worker<C, K>
where
    C: Connect,
    K: Codec,
{
    pub fn new(idx: usize, connector: Arc<C>, codec: K, progress: Arc<Progress>, cfg: WorkerConfig) -> Self {
        Self {
            idx,
            connector,
            codec,
            progress,
            cfg,
            stat: WorkerStat::default(),
            has_dialed: false,
            requests_per_sock_done: 0,
        }
    }

    /// Runs this worker until the shared target is reached or the run is
    /// aborted.
    pub async fn run(mut self) -> Result<(Exit, WorkerStat), Error> {
        let mut state = State::Idle;

        let exit = loop {
            state = match state {
                State::Idle => State::Dialing,
                State::Dialing => self.on_dialing().await,
                State::Sending(conn) => self.on_sending(conn).await,
                State::Receiving(conn, now) => self.on_receiving(conn, now).await,
                State::Failed(failure) => match self.on_failed(failure)? {
                    Some(exit) => break exit,
                    None => State::Dialing,
                },
                State::Done => break Exit::Done,
            };
        };

        log::trace!("worker #{} finished: {:?}", self.idx, exit);

        Ok((exit, self.stat))
    }

    async fn on_dialing(&mut self) -> State {
        if self.progress.is_complete() {
            return State::Done;
        }

        match self.connector.connect().await {
            Ok(conn) => {
                self.has_dialed = true;
                self.requests_per_sock_done = 0;
                self.stat.on_sock_created();
                State::Sending(conn)
            }
            Err(err) => State::Failed(Failure::Dial(err)),
        }
    }

    async fn on_sending(&mut self, mut conn: Conn) -> State {
        if self.progress.is_complete() {
            return State::Done;
        }

        let now = Instant::now();
        match timeout(self.cfg.timeout, self.codec.write(&mut conn)).await {
            Ok(n) => {
                self.stat.on_send(n as u64);
                State::Receiving(conn, now)
            }
            Err(err) => State::Failed(Failure::Io(err)),
        }
    }

    async fn on_receiving(&mut self, mut conn: Conn, now: Instant) -> State {
        let n = match timeout(self.cfg.timeout, self.codec.read(&mut conn)).await {
            Ok(n) => n,
            Err(err) => return State::Failed(Failure::Io(err)),
        };
        self.stat.on_recv(n as u64);

        // Responses past the target are neither counted nor sampled.
        let completed = match self.progress.on_complete() {
            Some(completed) => completed,
            None => return State::Done,
        };
        self.stat.on_response(&now);
        if completed >= self.progress.total() {
            return State::Done;
        }

        self.requests_per_sock_done += 1;
        if self.requests_per_sock_done < self.cfg.requests_per_socket {
            State::Sending(conn)
        } else {
            State::Dialing
        }
    }

    /// Accounts the failure, returning the exit if the worker must stop.
    fn on_failed(&mut self, failure: Failure) -> Result<Option<Exit>, Error> {
        match failure {
            Failure::Dial(err) if !self.has_dialed => {
                if !self.cfg.ignore_err {
                    return Err(Error::Dial { worker: self.idx, source: err });
                }

                log::warn!("failed to start connection #{}: {}", self.idx, err);
                self.stat.on_error();
                self.progress.on_failure();
                return Ok(Some(Exit::Aborted));
            }
            Failure::Dial(err) => {
                log::debug!("worker #{} failed to dial: {}", self.idx, err);
                self.stat.on_error();
            }
            Failure::Io(err) if is_benign(&err) => {
                log::trace!("worker #{} connection closed by peer: {}", self.idx, err);
            }
            Failure::Io(err) => {
                log::debug!("worker #{} I/O error: {}", self.idx, err);
                self.stat.on_error();
            }
        }

        self.progress.on_failure();

        if self.progress.is_complete() {
            return Ok(Some(Exit::Done));
        }
        if self.progress.is_aborted() {
            return Ok(Some(Exit::Aborted));
        }

        Ok(None)
    }
}

/// Runs the I/O operation under the timeout, converting its expiration into
/// an I/O error.
async fn timeout<F, T>(timeout: Duration, f: F) -> Result<T, io::Error>
where
    F: core::future::Future<Output = Result<T, io::Error>>,
{
    match tokio::time::timeout(timeout, f).await {
        Ok(rc) => rc,
        Err(..) => Err(io::ErrorKind::TimedOut.into()),
    }
}

/// Returns `true` if the error means the peer closed the connection, which
/// is expected when the server drops idle or keep-alive connections.
#[inline]
fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod test {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::{codec::HttpCodec, OneProduce};

    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789";
    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: test\r\n\r\n";

    /// How the fake server behaves on each connection.
    #[derive(Clone, Copy)]
    enum Serve {
        /// Answers every request.
        KeepAlive,
        /// Answers a single request, then closes.
        Once,
        /// Never answers.
        Silent,
    }

    struct FakeConnector {
        serve: Serve,
        /// Number of initial dials that fail.
        fail_dials: usize,
        dials: AtomicUsize,
    }

    impl FakeConnector {
        fn new(serve: Serve) -> Self {
            Self { serve, fail_dials: 0, dials: AtomicUsize::new(0) }
        }
    }

    impl Connect for FakeConnector {
        async fn connect(&self) -> Result<Conn, dial::Error> {
            if self.dials.fetch_add(1, Ordering::SeqCst) < self.fail_dials {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
            }

            let (client, server) = tokio::io::duplex(4096);
            tokio::spawn(serve(server, self.serve));

            Ok(Box::new(client))
        }
    }

    async fn serve(mut server: DuplexStream, serve: Serve) {
        let mut buf = [0; REQUEST.len()];
        loop {
            if server.read_exact(&mut buf).await.is_err() {
                return;
            }
            match serve {
                Serve::KeepAlive => {
                    if server.write_all(RESPONSE).await.is_err() {
                        return;
                    }
                }
                Serve::Once => {
                    let _ = server.write_all(RESPONSE).await;
                    return;
                }
                Serve::Silent => {
                    let _ = server.read(&mut buf).await;
                    return;
                }
            }
        }
    }

    fn worker(
        connector: FakeConnector,
        total: u64,
        cfg: WorkerConfig,
    ) -> (Worker<FakeConnector, HttpCodec<Arc<OneProduce<Bytes>>>>, Arc<Progress>) {
        let progress = Arc::new(Progress::new(total));
        let codec = HttpCodec::new(Arc::new(OneProduce::new(Bytes::from_static(REQUEST))));
        let worker = Worker::new(0, Arc::new(connector), codec, progress.clone(), cfg);

        (worker, progress)
    }

    fn cfg() -> WorkerConfig {
        WorkerConfig {
            timeout: Duration::from_secs(1),
            ignore_err: false,
            requests_per_socket: u64::MAX,
        }
    }

    #[tokio::test]
    async fn test_keep_alive() {
        let (worker, progress) = worker(FakeConnector::new(Serve::KeepAlive), 50, cfg());

        let (exit, stat) = worker.run().await.unwrap();
        assert_eq!(Exit::Done, exit);
        assert_eq!(50, progress.completed());
        assert_eq!(0, progress.failures());
        assert_eq!(1, stat.num_sock_created());
        assert_eq!(50, stat.num_requests());
        assert_eq!(50, stat.num_responses());
        assert_eq!(50 * REQUEST.len() as u64, stat.bytes_tx());
        assert_eq!(50 * RESPONSE.len() as u64, stat.bytes_rx());
        assert_eq!(50, stat.timings().len());
        assert_eq!(0, stat.num_errors());
    }

    #[tokio::test]
    async fn test_peer_close_is_benign() {
        let (worker, progress) = worker(FakeConnector::new(Serve::Once), 10, cfg());

        let (exit, stat) = worker.run().await.unwrap();
        assert_eq!(Exit::Done, exit);
        assert_eq!(10, progress.completed());
        assert_eq!(10, stat.num_sock_created());
        assert_eq!(0, stat.num_errors());
    }

    #[tokio::test]
    async fn test_requests_per_socket() {
        let cfg = WorkerConfig { requests_per_socket: 3, ..cfg() };
        let (worker, _progress) = worker(FakeConnector::new(Serve::KeepAlive), 10, cfg);

        let (exit, stat) = worker.run().await.unwrap();
        assert_eq!(Exit::Done, exit);
        // 3 + 3 + 3 + 1.
        assert_eq!(4, stat.num_sock_created());
        assert_eq!(0, stat.num_errors());
    }

    #[tokio::test]
    async fn test_first_dial_failure_is_fatal() {
        let connector = FakeConnector { fail_dials: 1, ..FakeConnector::new(Serve::KeepAlive) };
        let (worker, _progress) = worker(connector, 10, cfg());

        match worker.run().await {
            Err(Error::Dial { worker, .. }) => assert_eq!(0, worker),
            rc => panic!("unexpected result: {rc:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_dial_failure_ignored() {
        let connector = FakeConnector { fail_dials: 1, ..FakeConnector::new(Serve::KeepAlive) };
        let cfg = WorkerConfig { ignore_err: true, ..cfg() };
        let (worker, progress) = worker(connector, 10, cfg);

        let (exit, stat) = worker.run().await.unwrap();
        assert_eq!(Exit::Aborted, exit);
        assert_eq!(1, progress.failures());
        assert_eq!(1, stat.num_errors());
        assert_eq!(0, stat.num_responses());
    }

    #[tokio::test]
    async fn test_timeouts_abort_run() {
        let cfg = WorkerConfig { timeout: Duration::from_millis(10), ..cfg() };
        let (worker, progress) = worker(FakeConnector::new(Serve::Silent), 3, cfg);

        let (exit, stat) = worker.run().await.unwrap();
        assert_eq!(Exit::Aborted, exit);
        assert_eq!(3, progress.failures());
        assert_eq!(0, progress.completed());
        assert_eq!(3, stat.num_errors());
        assert_eq!(3, stat.num_sock_created());
    }

    #[tokio::test]
    async fn test_stops_when_others_completed() {
        let (worker, progress) = worker(FakeConnector::new(Serve::KeepAlive), 5, cfg());
        for _ in 0..5 {
            progress.on_complete();
        }

        let (exit, stat) = worker.run().await.unwrap();
        assert_eq!(Exit::Done, exit);
        assert_eq!(0, stat.num_requests());
        assert_eq!(0, stat.num_sock_created());
    }

    #[test]
    fn test_is_benign() {
        assert!(is_benign(&io::ErrorKind::ConnectionReset.into()));
        assert!(is_benign(&io::ErrorKind::UnexpectedEof.into()));
        assert!(is_benign(&io::ErrorKind::BrokenPipe.into()));
        assert!(!is_benign(&io::ErrorKind::TimedOut.into()));
        assert!(!is_benign(&io::ErrorKind::ConnectionRefused.into()));
    }
}
