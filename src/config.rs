/// Controls what the tracker records and how it behaves across forks.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
  /// Whether to unwind native frames on each allocation and attach a
  /// deduplicated trace index to the record.
  pub native_traces: bool,
  /// Period of the background resident-set-size sampler, in milliseconds.
  pub memory_interval_ms: u32,
  /// Whether child processes that inherit an active tracker should clone the
  /// output sink and keep tracking.
  pub follow_fork: bool,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      native_traces: false,
      memory_interval_ms: 10,
      follow_fork: false,
    }
  }
}

impl TrackerConfig {
  /// Builder-style helper to toggle tracking across forks.
  #[must_use]
  pub fn with_follow_fork(mut self, follow_fork: bool) -> Self {
    self.follow_fork = follow_fork;
    self
  }

  /// Builder-style helper to adjust the RSS sampling period.
  #[must_use]
  pub fn with_memory_interval_ms(mut self, interval_ms: u32) -> Self {
    self.memory_interval_ms = interval_ms;
    self
  }

  /// Builder-style helper to enable or disable native unwinding.
  #[must_use]
  pub fn with_native_traces(mut self, native_traces: bool) -> Self {
    self.native_traces = native_traces;
    self
  }
}
