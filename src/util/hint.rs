/// Run `f` on a path the optimizer should treat as unlikely (failures,
/// exhaustion, fatal errors)
#[cold]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
