//! Stream multiplexing over a shared session.
//!
//! The pool keeps one underlying session and issues up to `cap` streams
//! over it. Every `cap + 1`-th caller rolls the session over by dialing a new
//! one, so that exactly one caller dials at a time while the others wait.

use core::{
    fmt::{self, Debug, Formatter},
    future::Future,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use tokio::sync::RwLock;

pub mod quic;

/// Established multiplexed session.
pub trait Session: Clone + Send + Sync + 'static {
    type Stream: Send;
    type Error: Send;

    /// Opens a new stream over this session.
    fn open(&self) -> impl Future<Output = Result<Self::Stream, Self::Error>> + Send;
}

/// Session factory.
pub trait Establish: Send + Sync {
    type Session: Session;

    fn establish(&self) -> impl Future<Output = Result<Self::Session, <Self::Session as Session>::Error>> + Send;
}

type StreamOf<E> = <<E as Establish>::Session as Session>::Stream;
type ErrorOf<E> = <<E as Establish>::Session as Session>::Error;

/// Pool issuing streams over a lazily established, shared session.
pub struct MuxPool<E: Establish> {
    establish: E,
    /// Maximum number of streams issued per session.
    cap: u32,
    /// Number of streams issued over the current session, including callers
    /// that are still waiting for it.
    issued: AtomicU32,
    /// Number of finished dial attempts, either successful or not.
    dials: AtomicU64,
    /// Current session, tagged with its ordinal number.
    session: RwLock<Option<(u64, E::Session)>>,
    num_sessions: AtomicU64,
}

impl<E: Establish> MuxPool<E> {
    pub fn new(establish: E, cap: u32) -> Self {
        assert!(cap > 0, "cap must be positive");

        Self {
            establish,
            cap,
            issued: AtomicU32::new(0),
            dials: AtomicU64::new(0),
            session: RwLock::new(None),
            num_sessions: AtomicU64::new(0),
        }
    }

    /// Returns the number of sessions successfully established so far.
    #[inline]
    pub fn num_sessions(&self) -> u64 {
        self.num_sessions.load(Ordering::Relaxed)
    }

    /// Opens a new stream, establishing the session if required.
    pub async fn open(&self) -> Result<StreamOf<E>, ErrorOf<E>> {
        loop {
            let epoch = self.dials.load(Ordering::Acquire);
            let n = self.issued.fetch_add(1, Ordering::AcqRel).wrapping_add(1);

            if n == 1 || n == self.cap + 1 {
                let (id, session) = self.redial().await?;
                return self.open_on(id, &session).await;
            }

            if n <= self.cap {
                // Blocks while the elected caller is dialing. The session may
                // still be absent if that caller has not taken the lock yet.
                loop {
                    let dialed = self.dials.load(Ordering::Acquire) != epoch;
                    let session = self.session.read().await.clone();
                    if let Some((id, session)) = session {
                        return self.open_on(id, &session).await;
                    }
                    if dialed {
                        // The elected caller failed.
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                continue;
            }

            // Wait for the session to roll over.
            while self.issued.load(Ordering::Acquire) > self.cap {
                tokio::task::yield_now().await;
            }
        }
    }

    async fn redial(&self) -> Result<(u64, E::Session), ErrorOf<E>> {
        let mut guard = DialGuard {
            issued: &self.issued,
            dials: &self.dials,
            succeeded: false,
        };

        let mut current = self.session.write().await;
        // The previous session is exhausted or broken.
        *current = None;
        let session = self.establish.establish().await?;
        let id = self.num_sessions.fetch_add(1, Ordering::AcqRel) + 1;
        *current = Some((id, session.clone()));
        self.issued.store(1, Ordering::Release);
        guard.succeeded = true;

        log::debug!("established multiplexed session #{id}");

        Ok((id, session))
    }

    async fn open_on(&self, id: u64, session: &E::Session) -> Result<StreamOf<E>, ErrorOf<E>> {
        match session.open().await {
            Ok(stream) => Ok(stream),
            Err(err) => {
                // Broken session, force the next caller to redial. A failure
                // on an already replaced session must not touch its successor.
                if self.num_sessions.load(Ordering::Acquire) == id {
                    self.issued.store(0, Ordering::Release);
                }
                Err(err)
            }
        }
    }
}

impl<E> Debug for MuxPool<E>
where
    E: Establish + Debug,
{
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("MuxPool")
            .field("establish", &self.establish)
            .field("cap", &self.cap)
            .field("issued", &self.issued.load(Ordering::Relaxed))
            .field("num_sessions", &self.num_sessions())
            .finish_non_exhaustive()
    }
}

/// Resets the issue counter unless the dial succeeded, including when the
/// dialing future is dropped midway.
struct DialGuard<'a> {
    issued: &'a AtomicU32,
    dials: &'a AtomicU64,
    succeeded: bool,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        if !self.succeeded {
            self.issued.store(0, Ordering::Release);
        }
        self.dials.fetch_add(1, Ordering::Release);
    }
}
