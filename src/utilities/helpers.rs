use crate::utilities::enums::Kernel;

/// Work length below which the rayon dispatch overhead outweighs the loop itself.
pub const PARALLEL_THRESHOLD: usize = 2048;

/// Whether the pool the caller runs in (global or `ThreadPool::install`ed) has more than one thread.
#[inline(always)]
fn pool_is_parallel() -> bool {
    rayon::current_num_threads() > 1
}

/// Resolves `Kernel::Auto` for a loop over `work_len` independent units.
#[inline(always)]
pub fn detect_best_kernel(work_len: usize) -> Kernel {
    if pool_is_parallel() && work_len >= PARALLEL_THRESHOLD {
        Kernel::Parallel
    } else {
        Kernel::Scalar
    }
}

#[inline(always)]
pub fn resolve_kernel(kernel: Kernel, work_len: usize) -> Kernel {
    let chosen = match kernel {
        Kernel::Auto => detect_best_kernel(work_len),
        other => other,
    };
    tracing::debug!(?kernel, ?chosen, work_len, "kernel selected");
    chosen
}
