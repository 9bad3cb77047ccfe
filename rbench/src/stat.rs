use std::time::Instant;

/// Per-worker statistics.
///
/// Owned by a single worker while it runs, handed over to the engine when the
/// worker terminates and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStat {
    /// Number of requests written.
    num_requests: u64,
    /// Number of complete responses received and counted.
    num_responses: u64,
    /// Number of visible errors.
    num_errors: u64,
    /// Number of connections established.
    num_sock_created: u64,
    /// Number of bytes transmitted.
    bytes_tx: u64,
    /// Number of bytes received.
    bytes_rx: u64,
    /// Response times in milliseconds, in order of arrival.
    timings: Vec<u64>,
}

impl WorkerStat {
    /// Should be called after each successful request transmitted.
    #[inline]
    pub fn on_send(&mut self, n: u64) {
        self.num_requests += 1;
        self.bytes_tx += n;
    }

    #[inline]
    pub fn on_recv(&mut self, n: u64) {
        self.bytes_rx += n;
    }

    /// Records a counted response, sampling the time elapsed since the
    /// request start.
    #[inline]
    pub fn on_response(&mut self, now: &Instant) {
        self.num_responses += 1;
        self.timings.push(now.elapsed().as_millis() as u64);
    }

    #[inline]
    pub fn on_error(&mut self) {
        self.num_errors += 1;
    }

    #[inline]
    pub fn on_sock_created(&mut self) {
        self.num_sock_created += 1;
    }

    #[inline]
    pub fn num_requests(&self) -> u64 {
        self.num_requests
    }

    #[inline]
    pub fn num_responses(&self) -> u64 {
        self.num_responses
    }

    #[inline]
    pub fn num_errors(&self) -> u64 {
        self.num_errors
    }

    #[inline]
    pub fn num_sock_created(&self) -> u64 {
        self.num_sock_created
    }

    #[inline]
    pub fn bytes_tx(&self) -> u64 {
        self.bytes_tx
    }

    #[inline]
    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx
    }

    #[inline]
    pub fn timings(&self) -> &[u64] {
        &self.timings
    }
}
