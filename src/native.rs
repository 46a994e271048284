use {
  nohash_hasher::BuildNoHashHasher,
  smallvec::SmallVec,
  std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
  },
};

/// Maximum number of native frames captured per allocation.
pub const MAX_NATIVE_FRAMES: usize = 64;

const INLINE_TRACE_DEPTH: usize = 32;

/// An ordered list of native instruction pointers, innermost first.
#[derive(Debug, Clone, Default)]
pub struct NativeTrace {
  ips: SmallVec<[u64; INLINE_TRACE_DEPTH]>,
}

impl NativeTrace {
  /// Walk the machine stack, skipping the `skip` innermost frames.
  #[must_use]
  pub fn capture(skip: usize) -> Self {
    let mut ips = SmallVec::new();
    let mut remaining_skip = skip;

    backtrace::trace(|frame| {
      if remaining_skip > 0 {
        remaining_skip -= 1;
        return true;
      }

      if ips.len() >= MAX_NATIVE_FRAMES {
        return false;
      }

      ips.push(frame.ip() as usize as u64);

      true
    });

    Self { ips }
  }

  #[must_use]
  pub fn from_ips(ips: impl IntoIterator<Item = u64>) -> Self {
    Self {
      ips: ips.into_iter().collect(),
    }
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.ips.is_empty()
  }

  /// Instruction pointers, innermost first.
  #[must_use]
  pub fn ips(&self) -> &[u64] {
    &self.ips
  }
}

type ChildMap = HashMap<u64, u32, BuildNoHashHasher<u64>>;

#[derive(Debug, Default)]
struct TraceTreeInner {
  // One child map per node; position is the node's index, position 0 is the
  // synthetic root shared by every trace.
  children: Vec<ChildMap>,
}

/// Deduplicates native traces into compact indices.
///
/// Traces that share an outer stack share tree nodes, so the stream carries
/// each `(ip, parent)` edge exactly once. A reader reconstructs the tree by
/// appending nodes in arrival order: the n-th emitted node has index n + 1.
#[derive(Debug)]
pub struct TraceTree {
  inner: Mutex<TraceTreeInner>,
}

impl Default for TraceTree {
  fn default() -> Self {
    Self::new()
  }
}

impl TraceTree {
  #[must_use]
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(TraceTreeInner {
        children: vec![ChildMap::default()],
      }),
    }
  }

  /// Intern `trace` and return its index; 0 means "no trace".
  ///
  /// `emit` is invoked once per newly interned node with `(ip, parent_index)`
  /// and reports whether the node was persisted; if it reports failure the
  /// walk stops and 0 is returned, leaving the tree untouched by the failed
  /// node so the trace is re-attempted on a later event.
  pub fn get_trace_index<F>(&self, trace: &NativeTrace, mut emit: F) -> u32
  where
    F: FnMut(u64, u32) -> bool,
  {
    let mut inner = self.lock_inner();
    let mut current: u32 = 0;

    for &ip in trace.ips().iter().rev() {
      if let Some(&child) = inner.children[current as usize].get(&ip) {
        current = child;
        continue;
      }

      let index = inner.children.len() as u32;

      if !emit(ip, current) {
        return 0;
      }

      inner.children.push(ChildMap::default());
      inner.children[current as usize].insert(ip, index);

      current = index;
    }

    current
  }

  fn lock_inner(&self) -> MutexGuard<'_, TraceTreeInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }
}
