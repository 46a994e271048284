use std::{
  fs::File,
  io,
  ptr,
  sync::{
    Arc, Once,
    atomic::{AtomicBool, AtomicPtr, Ordering},
  },
  time::Duration,
};

use crate::config::TrackerConfig;
use crate::frames::{FrameRegistry, RawFrame};
use crate::guard::RecursionGuard;
use crate::modules;
use crate::native::{NativeTrace, TraceTree};
use crate::python_stack;
use crate::records::{
  AllocationRecord, AllocatorKind, FramePopRecord, FramePushRecord,
  NativeFrameRecord, Record, ThreadRecord,
};
use crate::sampler::BackgroundSampler;
use crate::writer::RecordWriter;

// Hooks that only need to know whether tracking is on read this flag and
// never load the instance pointer.
static ACTIVE: AtomicBool = AtomicBool::new(false);

// Observer pointer for hooks. Published before any hook can fire, cleared
// after teardown.
static INSTANCE: AtomicPtr<Tracker> = AtomicPtr::new(ptr::null_mut());

// Owning pointer. Kept out of any mutex so the fork handler can abandon it
// without taking a lock.
static OWNER: AtomicPtr<Tracker> = AtomicPtr::new(ptr::null_mut());

static PROCESS_INIT: Once = Once::new();

/// Process-wide allocation tracker.
///
/// Owns the record writer, the frame registry, the native-trace tree, and
/// the background RSS sampler. The instance is genuinely global: the
/// allocator entry points it serves have no user-data channel.
pub struct Tracker {
  writer: Arc<RecordWriter>,
  frames: FrameRegistry,
  trace_tree: TraceTree,
  config: TrackerConfig,
  sampler: Option<BackgroundSampler>,
}

impl Tracker {
  /// Install the process-wide tracker around `writer`, replacing any
  /// previous instance.
  ///
  /// The caller must hold the host's global lock so singleton mutation is
  /// serialised against itself, and installs its interpreter hook and
  /// allocator interposer once this returns.
  ///
  /// # Errors
  ///
  /// Returns an error if the RSS source cannot be opened or the initial
  /// header or module map cannot be written. The caller sees no tracker.
  pub fn create(
    writer: RecordWriter,
    config: TrackerConfig,
  ) -> io::Result<()> {
    Self::destroy();

    let _guard = RecursionGuard::acquire();

    PROCESS_INIT.call_once(|| {
      // SAFETY: the handlers only touch atomics and thread-local flags, plus
      // the child-side rebuild which runs single-threaded.
      unsafe {
        libc::pthread_atfork(
          Some(prepare_fork),
          Some(parent_fork),
          Some(child_fork),
        );
      }
    });

    let statm = File::open("/proc/self/statm")?;

    let interval = Duration::from_millis(u64::from(config.memory_interval_ms));
    let native_traces = config.native_traces;

    let mut tracker = Box::new(Self {
      writer: Arc::new(writer),
      frames: FrameRegistry::new(),
      trace_tree: TraceTree::new(),
      config,
      sampler: None,
    });

    if let Err(err) = tracker.writer.write_header(false) {
      return Err(io::Error::other(format!(
        "failed to write output header: {err}"
      )));
    }

    if native_traces {
      // Prime the unwinder's lazily allocated state before the hot path
      // needs it.
      let _ = NativeTrace::capture(0);

      if let Err(err) = modules::write_module_map(&tracker.writer) {
        return Err(io::Error::other(format!(
          "failed to write module map: {err}"
        )));
      }
    }

    tracker.sampler = Some(BackgroundSampler::start(
      Arc::clone(&tracker.writer),
      statm,
      interval,
    ));

    let raw = Box::into_raw(tracker);

    // Publish the observer before the caller installs any hook, and only
    // then let the hot path through.
    INSTANCE.store(raw, Ordering::Release);
    OWNER.store(raw, Ordering::Release);
    ACTIVE.store(true, Ordering::Release);

    Ok(())
  }

  /// Tear down the tracker installed by [`Tracker::create`], writing the
  /// terminal header. The caller must hold the host's global lock and have
  /// uninstalled its hooks.
  pub fn destroy() {
    let raw = OWNER.swap(ptr::null_mut(), Ordering::AcqRel);

    if raw.is_null() {
      return;
    }

    // SAFETY: OWNER held the sole owning pointer, created from a Box in
    // `create`.
    drop(unsafe { Box::from_raw(raw) });

    // Cleared last: entry points that won the active-flag race during
    // teardown must still observe a valid instance.
    INSTANCE.store(ptr::null_mut(), Ordering::Release);
  }

  /// Observer accessor for hooks. Never touches the owner.
  #[must_use]
  pub fn get() -> Option<&'static Self> {
    // SAFETY: the pointer is published before hooks are installed and
    // cleared after they are gone; in between the pointee is owned by OWNER.
    unsafe { INSTANCE.load(Ordering::Acquire).as_ref() }
  }

  #[must_use]
  pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Acquire)
  }

  /// Cooperatively stop tracking: every entry point short-circuits once the
  /// flag is clear. Called on any write failure.
  pub fn deactivate() {
    ACTIVE.store(false, Ordering::Release);
  }

  /// Record an intercepted allocation.
  pub fn track_allocation(
    address: usize,
    size: usize,
    allocator: AllocatorKind,
  ) {
    if RecursionGuard::is_set() || !Self::is_active() {
      return;
    }

    let _guard = RecursionGuard::acquire();

    let Some(tracker) = Self::get() else {
      return;
    };

    tracker.record_event(address, size, allocator, true);
  }

  /// Record an intercepted release. Deallocations never carry a native
  /// trace, but still flush stack deltas so the push run preceding a later
  /// allocation stays minimal.
  pub fn track_deallocation(
    address: usize,
    size: usize,
    allocator: AllocatorKind,
  ) {
    if RecursionGuard::is_set() || !Self::is_active() {
      return;
    }

    let _guard = RecursionGuard::acquire();

    let Some(tracker) = Self::get() else {
      return;
    };

    tracker.record_event(address, size, allocator, false);
  }

  /// Re-snapshot the loaded-module set after the interposer reports that it
  /// may have changed.
  pub fn invalidate_module_cache() {
    if RecursionGuard::is_set() || !Self::is_active() {
      return;
    }

    let _guard = RecursionGuard::acquire();

    let Some(tracker) = Self::get() else {
      return;
    };

    if !tracker.config.native_traces {
      return;
    }

    if modules::write_module_map(&tracker.writer).is_err() {
      eprintln!("memtrace: failed to write output, deactivating tracking");
      Self::deactivate();
    }
  }

  /// Bind a human-readable name to the calling thread in the output stream.
  pub fn register_thread_name(name: &str) {
    if RecursionGuard::is_set() || !Self::is_active() {
      return;
    }

    let _guard = RecursionGuard::acquire();

    let Some(tracker) = Self::get() else {
      return;
    };

    let record = Record::Thread(ThreadRecord {
      thread_id: thread_id(),
      name: name.to_string(),
    });

    if tracker.writer.write_record(&record).is_err() {
      eprintln!("memtrace: failed to write output, deactivating tracking");
      Self::deactivate();
    }
  }

  fn record_event(
    &self,
    address: usize,
    size: usize,
    allocator: AllocatorKind,
    unwind: bool,
  ) {
    let lineno = python_stack::current_line();

    // Pops precede pushes so a reader replaying the stream sees the stack
    // as it stands at this event.
    python_stack::flush_pending_pops();
    python_stack::flush_pending_pushes();

    let mut native_index = 0;

    if unwind && self.config.native_traces {
      // Skip the two innermost frames: the interposer shim and this call.
      let trace = NativeTrace::capture(2);

      if !trace.is_empty() {
        native_index =
          self.trace_tree.get_trace_index(&trace, |ip, parent_index| {
            self
              .writer
              .write_record(&Record::NativeTraceIndex(NativeFrameRecord {
                ip,
                parent_index,
              }))
              .is_ok()
          });
      }
    }

    let record = Record::Allocation(AllocationRecord {
      thread_id: thread_id(),
      address: address as u64,
      size: size as u64,
      allocator: allocator as i32,
      lineno,
      native_index,
    });

    if self.writer.write_record(&record).is_err() {
      eprintln!("memtrace: failed to write output, deactivating tracking");
      Self::deactivate();
    }
  }

  /// Emit a push record for `frame`, interning it first. Reports whether the
  /// caller may mark the frame as emitted.
  pub(crate) fn push_frame(&self, frame: &RawFrame) -> bool {
    let frame_id = match self.frames.get_or_register(frame, &self.writer) {
      Ok(frame_id) => frame_id,
      Err(_) => {
        eprintln!("memtrace: failed to write output, deactivating tracking");
        Self::deactivate();
        return false;
      }
    };

    let record = Record::FramePush(FramePushRecord {
      thread_id: thread_id(),
      frame_id,
    });

    if self.writer.write_record(&record).is_err() {
      eprintln!("memtrace: failed to write output, deactivating tracking");
      Self::deactivate();
      return false;
    }

    true
  }

  /// Emit pop records totalling `count`, capping each record at 255 pops.
  pub(crate) fn pop_frames(&self, mut count: u32) -> bool {
    while count > 0 {
      let to_pop = count.min(255);
      count -= to_pop;

      let record = Record::FramePop(FramePopRecord {
        thread_id: thread_id(),
        count: to_pop,
      });

      if self.writer.write_record(&record).is_err() {
        eprintln!("memtrace: failed to write output, deactivating tracking");
        Self::deactivate();
        return false;
      }
    }

    true
  }
}

impl Drop for Tracker {
  fn drop(&mut self) {
    let _guard = RecursionGuard::acquire();

    Self::deactivate();

    if let Some(sampler) = self.sampler.take() {
      sampler.stop();
    }

    python_stack::reset(None);

    let _ = self.writer.write_header(true);
  }
}

fn thread_id() -> u64 {
  // SAFETY: pthread_self has no preconditions.
  (unsafe { libc::pthread_self() }) as u64
}

extern "C" fn prepare_fork() {
  // Suppress tracking on the forking thread for the duration of the
  // syscall.
  RecursionGuard::set_thread_flag(true);
}

extern "C" fn parent_fork() {
  RecursionGuard::set_thread_flag(false);
}

extern "C" fn child_fork() {
  // Nothing has been written to this process's output yet.
  python_stack::reset_in_child();

  // Intentionally abandon the inherited tracker: its mutexes may be held by
  // threads that no longer exist, its sampler thread did not survive the
  // fork, and its sink may not be safely flushable.
  OWNER.store(ptr::null_mut(), Ordering::Release);

  // SAFETY: the abandoned instance is never freed, so the reference stays
  // valid for the child's lifetime.
  let inherited = unsafe { INSTANCE.load(Ordering::Acquire).as_ref() };

  let follow = inherited
    .filter(|tracker| Tracker::is_active() && tracker.config.follow_fork);

  let Some(old_tracker) = follow else {
    // No tracker, a deactivated tracker, or follow-fork off: continue
    // unprofiled. Inherited hooks may still be installed; they check the
    // active flag before touching the instance.
    INSTANCE.store(ptr::null_mut(), Ordering::Release);
    Tracker::deactivate();
    RecursionGuard::set_thread_flag(false);
    return;
  };

  let Some(writer) = old_tracker.writer.clone_in_child() else {
    INSTANCE.store(ptr::null_mut(), Ordering::Release);
    Tracker::deactivate();
    RecursionGuard::set_thread_flag(false);
    return;
  };

  Tracker::deactivate();

  if Tracker::create(writer, old_tracker.config.clone()).is_err() {
    INSTANCE.store(ptr::null_mut(), Ordering::Release);
  }

  RecursionGuard::set_thread_flag(false);
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
  use super::*;
  use crate::host::{FrameHandle, ProfileEvent, on_profile_event, reset_thread_tracking};
  use crate::records::{decode_stream, HeaderMetadata};
  use crate::writer::{BufferSink, RecordSink};
  use std::sync::{Mutex, MutexGuard};

  // The tracker is a process-wide singleton, so tests touching it must not
  // overlap.
  static SINGLETON_LOCK: Mutex<()> = Mutex::new(());

  fn singleton_lock() -> MutexGuard<'static, ()> {
    match SINGLETON_LOCK.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  fn test_metadata() -> HeaderMetadata {
    HeaderMetadata {
      pid: std::process::id(),
      command_line: "test".to_string(),
      start_time_ms: 0,
      native_traces: false,
    }
  }

  fn quiet_config() -> TrackerConfig {
    // A sampling period long enough that no memory record lands mid-test;
    // stop still wakes the sampler immediately.
    TrackerConfig::default().with_memory_interval_ms(3_600_000)
  }

  fn install(config: TrackerConfig) -> std::sync::Arc<Mutex<Vec<u8>>> {
    python_stack::clear_thread_state();

    let sink = BufferSink::new();
    let buffer = sink.buffer();

    let writer = RecordWriter::with_metadata(Box::new(sink), test_metadata());
    Tracker::create(writer, config).expect("tracker install failed");

    buffer
  }

  fn decoded(buffer: &Mutex<Vec<u8>>) -> Vec<Record> {
    let bytes = buffer.lock().unwrap().clone();
    let records =
      decode_stream(&bytes).expect("capture stream did not decode");

    // Tests on other threads may interleave their own per-thread records;
    // keep this thread's view of the stream.
    let tid = thread_id();

    records
      .into_iter()
      .filter(|record| match record {
        Record::Allocation(allocation) => allocation.thread_id == tid,
        Record::FramePush(push) => push.thread_id == tid,
        Record::FramePop(pops) => pops.thread_id == tid,
        Record::Thread(thread) => thread.thread_id == tid,
        _ => true,
      })
      .collect()
  }

  fn handle(line: usize) -> FrameHandle {
    fn read_line(raw: usize) -> u32 {
      raw as u32
    }

    FrameHandle::new(line, read_line)
  }

  fn call(line: usize, function: &str) -> i32 {
    on_profile_event(
      handle(line),
      ProfileEvent::Call {
        function: Some(function),
        filename: Some("app.py"),
      },
    )
  }

  fn ret() -> i32 {
    on_profile_event(handle(0), ProfileEvent::Return)
  }

  #[test]
  fn single_allocation_without_host_frames() {
    let _lock = singleton_lock();
    let buffer = install(quiet_config());

    Tracker::track_allocation(0xAA, 16, AllocatorKind::Malloc);
    Tracker::destroy();

    let records = decoded(&buffer);

    let Record::Header(first) = &records[0] else {
      panic!("stream must start with a header");
    };
    assert!(!first.terminal);

    let allocations: Vec<_> = records
      .iter()
      .filter_map(|record| match record {
        Record::Allocation(allocation) => Some(allocation),
        _ => None,
      })
      .collect();

    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].address, 0xAA);
    assert_eq!(allocations[0].size, 16);
    assert_eq!(allocations[0].allocator(), AllocatorKind::Malloc);
    assert_eq!(allocations[0].lineno, 0);
    assert_eq!(allocations[0].native_index, 0);

    assert!(!records.iter().any(|record| matches!(
      record,
      Record::FramePush(_) | Record::FramePop(_) | Record::FrameIndex(_)
    )));

    let Record::Header(last) = records.last().unwrap() else {
      panic!("stream must end with the terminal header");
    };
    assert!(last.terminal);
  }

  #[test]
  fn pushes_are_emitted_lazily_and_pops_are_coalesced() {
    let _lock = singleton_lock();
    let buffer = install(quiet_config());

    assert_eq!(call(3, "f1"), 0);
    assert_eq!(call(7, "f2"), 0);
    Tracker::track_allocation(0xBB, 32, AllocatorKind::Malloc);
    assert_eq!(ret(), 0);
    assert_eq!(ret(), 0);
    Tracker::track_allocation(0xCC, 8, AllocatorKind::Malloc);

    Tracker::destroy();

    let records = decoded(&buffer);

    let interesting: Vec<&Record> = records
      .iter()
      .filter(|record| {
        matches!(
          record,
          Record::Allocation(_)
            | Record::FrameIndex(_)
            | Record::FramePush(_)
            | Record::FramePop(_)
        )
      })
      .collect();

    assert_eq!(interesting.len(), 7, "unexpected stream: {interesting:?}");

    let Record::FrameIndex(f1) = interesting[0] else {
      panic!("expected f1's index record first");
    };
    assert_eq!(f1.function, "f1");
    assert_eq!(f1.parent_lineno, 0);

    let Record::FramePush(push1) = interesting[1] else {
      panic!("expected f1's push record");
    };
    assert_eq!(push1.frame_id, f1.frame_id);

    let Record::FrameIndex(f2) = interesting[2] else {
      panic!("expected f2's index record");
    };
    assert_eq!(f2.function, "f2");
    assert_eq!(f2.parent_lineno, 3);

    let Record::FramePush(push2) = interesting[3] else {
      panic!("expected f2's push record");
    };
    assert_eq!(push2.frame_id, f2.frame_id);

    let Record::Allocation(first_alloc) = interesting[4] else {
      panic!("expected the first allocation");
    };
    assert_eq!(first_alloc.address, 0xBB);
    assert_eq!(first_alloc.size, 32);
    assert_eq!(first_alloc.lineno, 7);

    let Record::FramePop(pops) = interesting[5] else {
      panic!("expected a coalesced pop run");
    };
    assert_eq!(pops.count, 2);

    let Record::Allocation(second_alloc) = interesting[6] else {
      panic!("expected the second allocation");
    };
    assert_eq!(second_alloc.address, 0xCC);
    assert_eq!(second_alloc.lineno, 0);
  }

  #[test]
  fn ten_returns_between_allocations_coalesce_into_one_pop_run() {
    let _lock = singleton_lock();
    let buffer = install(quiet_config());

    for depth in 0..10 {
      assert_eq!(call(depth, &format!("f{depth}")), 0);
    }
    Tracker::track_allocation(0xBB, 32, AllocatorKind::Malloc);

    for _ in 0..10 {
      assert_eq!(ret(), 0);
    }
    Tracker::track_allocation(0xCC, 8, AllocatorKind::Malloc);

    Tracker::destroy();

    let records = decoded(&buffer);

    let first_alloc = records
      .iter()
      .position(|record| {
        matches!(record, Record::Allocation(allocation) if allocation.address == 0xBB)
      })
      .expect("first allocation missing");
    let second_alloc = records
      .iter()
      .position(|record| {
        matches!(record, Record::Allocation(allocation) if allocation.address == 0xCC)
      })
      .expect("second allocation missing");

    let mut popped = 0;

    for record in &records[first_alloc + 1..second_alloc] {
      match record {
        Record::FramePop(pops) => {
          assert!(pops.count <= 255);
          popped += pops.count;
        }
        other => panic!("unexpected record between allocations: {other:?}"),
      }
    }

    assert_eq!(popped, 10);
  }

  #[test]
  fn long_pop_runs_are_split_at_255() {
    let _lock = singleton_lock();
    let buffer = install(quiet_config());

    Tracker::get().unwrap().pop_frames(300);
    Tracker::destroy();

    let records = decoded(&buffer);

    let counts: Vec<u32> = records
      .iter()
      .filter_map(|record| match record {
        Record::FramePop(pops) => Some(pops.count),
        _ => None,
      })
      .collect();

    assert_eq!(counts, vec![255, 45]);
  }

  #[test]
  fn reentrant_events_are_dropped() {
    let _lock = singleton_lock();
    let buffer = install(quiet_config());

    {
      let _inner = RecursionGuard::acquire();
      Tracker::track_allocation(0xAA, 16, AllocatorKind::Malloc);
      Tracker::track_deallocation(0xAA, 16, AllocatorKind::Free);
    }

    Tracker::destroy();

    let records = decoded(&buffer);
    assert!(!records
      .iter()
      .any(|record| matches!(record, Record::Allocation(_))));
  }

  #[test]
  fn deactivation_short_circuits_every_entry_point() {
    let _lock = singleton_lock();
    let buffer = install(quiet_config());

    Tracker::deactivate();

    Tracker::track_allocation(0xAA, 16, AllocatorKind::Malloc);
    Tracker::track_deallocation(0xAA, 16, AllocatorKind::Free);
    Tracker::register_thread_name("worker");
    assert_eq!(call(1, "f"), 0);

    Tracker::destroy();

    let records = decoded(&buffer);
    assert!(!records.iter().any(|record| matches!(
      record,
      Record::Allocation(_)
        | Record::Thread(_)
        | Record::FramePush(_)
        | Record::FrameIndex(_)
    )));
  }

  #[test]
  fn write_failure_deactivates_after_one_record() {
    struct FailingSink {
      fail: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl RecordSink for FailingSink {
      fn write_all(&mut self, _buf: &[u8]) -> std::io::Result<()> {
        if self.fail.load(Ordering::Relaxed) {
          Err(std::io::Error::other("sink failed"))
        } else {
          Ok(())
        }
      }

      fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
      }

      fn clone_in_child(&self) -> Option<Box<dyn RecordSink>> {
        None
      }
    }

    let _lock = singleton_lock();
    python_stack::clear_thread_state();

    let fail = std::sync::Arc::new(AtomicBool::new(false));

    let writer = RecordWriter::with_metadata(
      Box::new(FailingSink {
        fail: std::sync::Arc::clone(&fail),
      }),
      test_metadata(),
    );

    Tracker::create(writer, quiet_config()).expect("install failed");
    assert!(Tracker::is_active());

    fail.store(true, Ordering::Relaxed);
    Tracker::track_allocation(0xAA, 16, AllocatorKind::Malloc);

    assert!(!Tracker::is_active());

    Tracker::destroy();
  }

  #[test]
  fn entry_frame_attributes_lines_before_any_push() {
    let _lock = singleton_lock();
    let buffer = install(quiet_config());

    reset_thread_tracking(Some(handle(42)));
    Tracker::track_allocation(0xAA, 16, AllocatorKind::Malloc);

    reset_thread_tracking(None);
    Tracker::destroy();

    let records = decoded(&buffer);

    let allocation = records
      .iter()
      .find_map(|record| match record {
        Record::Allocation(allocation) => Some(allocation),
        _ => None,
      })
      .expect("allocation missing");

    assert_eq!(allocation.lineno, 42);
  }

  #[test]
  fn decode_failures_in_the_hook_report_back_to_the_host() {
    let _lock = singleton_lock();
    let buffer = install(quiet_config());

    let bad_function = on_profile_event(
      handle(1),
      ProfileEvent::Call {
        function: None,
        filename: Some("app.py"),
      },
    );
    assert_eq!(bad_function, -1);

    let bad_filename = on_profile_event(
      handle(1),
      ProfileEvent::Call {
        function: Some("f"),
        filename: None,
      },
    );
    assert_eq!(bad_filename, -1);

    Tracker::track_allocation(0xAA, 16, AllocatorKind::Malloc);
    Tracker::destroy();

    // Neither failed call left a frame behind.
    let records = decoded(&buffer);
    assert!(!records
      .iter()
      .any(|record| matches!(record, Record::FramePush(_))));
  }

  #[test]
  fn surviving_stack_is_reannounced_after_a_simulated_fork() {
    let _lock = singleton_lock();
    let buffer = install(quiet_config());

    assert_eq!(call(3, "f1"), 0);
    assert_eq!(call(7, "f2"), 0);
    Tracker::track_allocation(0xBB, 32, AllocatorKind::Malloc);

    // What the post-fork child handler does to this thread's state.
    python_stack::reset_in_child();

    Tracker::track_allocation(0xCC, 8, AllocatorKind::Malloc);

    ret();
    ret();
    Tracker::destroy();

    let records = decoded(&buffer);

    let second_alloc = records
      .iter()
      .position(|record| {
        matches!(record, Record::Allocation(allocation) if allocation.address == 0xCC)
      })
      .expect("post-fork allocation missing");

    let pushes_before_second: Vec<_> = records[..second_alloc]
      .iter()
      .filter_map(|record| match record {
        Record::FramePush(push) => Some(push.frame_id),
        _ => None,
      })
      .collect();

    // f1 and f2 pushed once before the fork and re-announced once after.
    assert_eq!(pushes_before_second.len(), 4);
    assert_eq!(pushes_before_second[0], pushes_before_second[2]);
    assert_eq!(pushes_before_second[1], pushes_before_second[3]);
  }

  #[test]
  fn replayed_stream_reconstructs_the_stack_at_each_allocation() {
    use std::collections::HashMap;

    let _lock = singleton_lock();
    let buffer = install(quiet_config());

    // Drive an irregular interleaving of calls, returns, and allocations,
    // mirroring the shadow stack by hand as the ground truth.
    let mut expected_at_alloc: Vec<Vec<String>> = Vec::new();
    let mut mirror: Vec<String> = Vec::new();
    let mut next_address = 0x1000usize;
    let mut frame_counter = 0usize;
    let mut state = 0x9E37_79B9u32;

    for _ in 0..200 {
      state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);

      match state % 4 {
        0 | 1 => {
          let name = format!("f{frame_counter}");
          assert_eq!(call(frame_counter, &name), 0);
          mirror.push(name);
          frame_counter += 1;
        }
        2 => {
          if !mirror.is_empty() {
            assert_eq!(ret(), 0);
            mirror.pop();
          }
        }
        _ => {
          Tracker::track_allocation(next_address, 8, AllocatorKind::Malloc);
          expected_at_alloc.push(mirror.clone());
          next_address += 0x10;
        }
      }
    }

    Tracker::destroy();

    // Replay this thread's push/pop records and compare the reconstructed
    // stack against the mirror at every allocation.
    let records = decoded(&buffer);

    let mut names: HashMap<u32, String> = HashMap::new();
    let mut replayed: Vec<String> = Vec::new();
    let mut allocations_seen = 0usize;

    for record in &records {
      match record {
        Record::FrameIndex(index) => {
          names.insert(index.frame_id, index.function.clone());
        }
        Record::FramePush(push) => {
          replayed.push(names[&push.frame_id].clone());
        }
        Record::FramePop(pops) => {
          for _ in 0..pops.count {
            replayed.pop();
          }
        }
        Record::Allocation(allocation) => {
          assert_eq!(
            replayed, expected_at_alloc[allocations_seen],
            "stack mismatch at allocation {allocations_seen}"
          );
          allocations_seen += 1;
        }
        _ => {}
      }
    }

    assert_eq!(allocations_seen, expected_at_alloc.len());
  }

  #[test]
  fn thread_names_are_recorded() {
    let _lock = singleton_lock();
    let buffer = install(quiet_config());

    Tracker::register_thread_name("worker-1");
    Tracker::destroy();

    let records = decoded(&buffer);

    let thread = records
      .iter()
      .find_map(|record| match record {
        Record::Thread(thread) => Some(thread),
        _ => None,
      })
      .expect("thread record missing");

    assert_eq!(thread.name, "worker-1");
    assert_eq!(thread.thread_id, thread_id());
  }

  #[test]
  fn native_unwinding_attaches_trace_indices() {
    let _lock = singleton_lock();
    let buffer = install(quiet_config().with_native_traces(true));

    Tracker::track_allocation(0xAA, 16, AllocatorKind::Malloc);
    Tracker::track_deallocation(0xAA, 16, AllocatorKind::Free);
    Tracker::destroy();

    let records = decoded(&buffer);

    // The stream opens with header + module map when unwinding is on.
    assert!(matches!(records[0], Record::Header(_)));
    assert!(records
      .iter()
      .any(|record| matches!(record, Record::MemoryMapStart)));

    let allocations: Vec<_> = records
      .iter()
      .filter_map(|record| match record {
        Record::Allocation(allocation) => Some(allocation),
        _ => None,
      })
      .collect();

    assert_eq!(allocations.len(), 2);

    // The allocation unwound; its index points at an emitted trace node.
    let allocation = allocations[0];
    assert!(allocation.native_index > 0);

    let emitted_nodes = records
      .iter()
      .filter(|record| matches!(record, Record::NativeTraceIndex(_)))
      .count() as u32;
    assert!(allocation.native_index <= emitted_nodes);

    // The deallocation never unwinds.
    assert_eq!(allocations[1].native_index, 0);
  }

  #[test]
  fn create_replaces_a_previous_tracker() {
    let _lock = singleton_lock();

    let first_buffer = install(quiet_config());
    let second_buffer = install(quiet_config());

    Tracker::track_allocation(0xAA, 16, AllocatorKind::Malloc);
    Tracker::destroy();

    let first_records = decoded(&first_buffer);

    // The replaced tracker was torn down: terminal header, no allocation.
    let Record::Header(last) = first_records.last().unwrap() else {
      panic!("expected terminal header in replaced tracker's stream");
    };
    assert!(last.terminal);
    assert!(!first_records
      .iter()
      .any(|record| matches!(record, Record::Allocation(_))));

    let second_records = decoded(&second_buffer);
    assert!(second_records
      .iter()
      .any(|record| matches!(record, Record::Allocation(_))));
  }
}
