use std::cell::Cell;

thread_local! {
  // Plain flag with no destructor, so it stays readable during thread
  // teardown when the allocator may still call back into the tracker.
  static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// Scoped acquisition of the per-thread `in_tracker` flag.
///
/// Construction remembers the previous value and sets the flag; dropping the
/// guard restores the previous value, so guards nest correctly.
pub struct RecursionGuard {
  previous: bool,
}

impl RecursionGuard {
  #[must_use = "the flag is restored when the guard is dropped"]
  pub fn acquire() -> Self {
    let previous = IN_TRACKER
      .try_with(|flag| flag.replace(true))
      .unwrap_or(true);

    Self { previous }
  }

  /// Whether the calling thread is already inside the tracker. Threads whose
  /// local storage is no longer accessible report `true`, which keeps every
  /// entry point inert during teardown.
  #[must_use]
  pub fn is_set() -> bool {
    IN_TRACKER.try_with(Cell::get).unwrap_or(true)
  }

  /// Force the flag for the calling thread. Used by the fork handlers and by
  /// the sampler thread, which marks itself for its entire lifetime.
  pub fn set_thread_flag(value: bool) {
    let _ = IN_TRACKER.try_with(|flag| flag.set(value));
  }
}

impl Drop for RecursionGuard {
  fn drop(&mut self) {
    let _ = IN_TRACKER.try_with(|flag| flag.set(self.previous));
  }
}
