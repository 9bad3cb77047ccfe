use core::{future::Future, num::NonZero};

use tokio::task::JoinSet;

/// Set of tasks running in parallel on the multi-threaded runtime.
///
/// Each task is created by the factory from its index.
#[derive(Debug)]
pub struct TaskPool<F> {
    num_tasks: NonZero<usize>,
    factory: F,
}

impl<F> TaskPool<F> {
    pub fn new(num_tasks: NonZero<usize>, factory: F) -> Self {
        Self { num_tasks, factory }
    }
}

impl<F, T, U, E> TaskPool<F>
where
    F: FnMut(usize) -> T,
    T: Future<Output = Result<U, E>> + Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
{
    /// Runs this [`TaskPool`] by spawning tasks and waiting for them to
    /// complete.
    ///
    /// Outputs are returned in the order of task indices. The first task
    /// that fails aborts all others, and its error is returned.
    pub async fn run(mut self) -> Result<Vec<U>, E> {
        let num_tasks = self.num_tasks.get();
        let mut set = JoinSet::new();

        for idx in 0..num_tasks {
            let task = (self.factory)(idx);
            set.spawn(async move { (idx, task.await) });
        }

        let mut outputs: Vec<Option<U>> = (0..num_tasks).map(|_| None).collect();
        while let Some(rc) = set.join_next().await {
            let (idx, rc) = match rc {
                Ok(v) => v,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(..) => continue,
            };

            match rc {
                Ok(v) => outputs[idx] = Some(v),
                Err(err) => {
                    set.shutdown().await;
                    return Err(err);
                }
            }
        }

        Ok(outputs.into_iter().flatten().collect())
    }
}
