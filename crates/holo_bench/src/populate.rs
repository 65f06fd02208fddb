//! Fan-out/fan-in runner for population tasks.

use std::any::Any;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::thread;

use anyhow::Context;

/// Failure of one population worker.
#[derive(Debug)]
pub struct WorkerError {
    pub worker: usize,
    pub thread: String,
    pub error: anyhow::Error,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (worker {}): {:#}", self.thread, self.worker, self.error)
    }
}

/// Run `task(i)` for `i in 0..threads`, each on a thread named
/// `{name_prefix}{i}`, and wait for all of them.
///
/// Worker errors and panics never stop sibling workers; they are logged and
/// returned sorted by worker index. Only a failure to spawn a thread is
/// returned as `Err`.
pub fn run_parallel<F>(task: F, threads: usize, name_prefix: &str) -> anyhow::Result<Vec<WorkerError>>
where
    F: Fn(usize) -> anyhow::Result<()> + Sync,
{
    let errors = Mutex::new(Vec::with_capacity(threads));

    thread::scope(|scope| -> anyhow::Result<()> {
        let task = &task;
        let errors = &errors;
        let mut handles = Vec::with_capacity(threads);
        for worker in 0..threads {
            let name = format!("{name_prefix}{worker}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn_scoped(scope, move || {
                    if let Err(error) = task(worker) {
                        tracing::error!(worker, thread = %name, error = ?error, "worker failed");
                        errors
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(WorkerError {
                                worker,
                                thread: name,
                                error,
                            });
                    }
                })
                .with_context(|| format!("spawn {name_prefix}{worker}"))?;
            handles.push((worker, handle));
        }

        for (worker, handle) in handles {
            if let Err(payload) = handle.join() {
                let message = panic_message(payload.as_ref());
                tracing::error!(worker, panic = %message, "worker panicked");
                errors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(WorkerError {
                        worker,
                        thread: format!("{name_prefix}{worker}"),
                        error: anyhow::anyhow!("worker panicked: {message}"),
                    });
            }
        }
        Ok(())
    })?;

    let mut errors = errors.into_inner().unwrap_or_else(PoisonError::into_inner);
    errors.sort_by_key(|e| e.worker);
    Ok(errors)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
