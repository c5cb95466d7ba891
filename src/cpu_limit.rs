//! Limits on concurrent CPU-heavy subprocesses.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// One permit per core, shared by every `pdftocairo` and `gs` invocation in
/// this process.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// Page rendering fans out across pages, and each renderer process will
/// happily take a whole core. Wrap external processes in this, not in-process
/// work (use [`crate::async_utils::spawn_blocking_propagating_panics`] for
/// that).
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    let result = f().await;
    drop(permit);
    result
}

/// How many subprocesses may run at once.
pub fn cpu_permits() -> usize {
    num_cpus::get()
}
