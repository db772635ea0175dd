/// Mark the enclosed path as `#[cold]`, so the optimiser keeps it out of the
/// way of the hot path that called it.
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
