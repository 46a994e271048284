//! CPython bridge for the memtrace core.
//!
//! Interposes the three `PyMem` allocator domains so every interpreter
//! allocation flows through the tracker, and registers the per-thread
//! profile hook that keeps the core's shadow stack in sync with the Python
//! call stack.

#![allow(unsafe_op_in_unsafe_fn)]

use {
  memtrace::{
    AllocatorKind, FileSink, FrameHandle, ProfileEvent, RecordWriter,
    RecursionGuard, Tracker, TrackerConfig, on_profile_event,
    reset_thread_tracking,
  },
  pyo3::{
    Bound,
    exceptions::{PyOSError, PyRuntimeError},
    ffi,
    ffi::PyMemAllocatorDomain::{
      PYMEM_DOMAIN_MEM, PYMEM_DOMAIN_OBJ, PYMEM_DOMAIN_RAW,
    },
    prelude::*,
  },
  std::{
    cell::Cell,
    mem::MaybeUninit,
    os::raw::{c_int, c_void},
    path::PathBuf,
    ptr,
    sync::RwLock,
  },
};

static STATE: RwLock<Option<Box<ShimState>>> = RwLock::new(None);

thread_local! {
  static HOOK_INSTALLED: Cell<bool> = const { Cell::new(false) };
}

/// Start tracking into a capture file at `path`.
#[pyfunction]
#[pyo3(signature = (
  path,
  native_traces = false,
  memory_interval_ms = 10,
  follow_fork = false
))]
fn start(
  py: Python<'_>,
  path: PathBuf,
  native_traces: bool,
  memory_interval_ms: u32,
  follow_fork: bool,
) -> PyResult<()> {
  let mut guard = STATE
    .write()
    .map_err(|_| PyRuntimeError::new_err("tracker state poisoned"))?;

  if guard.is_some() {
    return Err(PyRuntimeError::new_err("tracking is already active"));
  }

  let sink = FileSink::create(&path)
    .map_err(|err| PyOSError::new_err(err.to_string()))?;

  let writer = RecordWriter::new(Box::new(sink), native_traces);

  let config = TrackerConfig::default()
    .with_native_traces(native_traces)
    .with_memory_interval_ms(memory_interval_ms)
    .with_follow_fork(follow_fork);

  // The GIL we hold serialises tracker creation against itself.
  Tracker::create(writer, config)
    .map_err(|err| PyOSError::new_err(err.to_string()))?;

  let mut state = Box::new(ShimState::new());

  // SAFETY: the boxed state lives in STATE until `stop`, outliving the
  // allocator contexts that point into it.
  unsafe {
    state.install()?;
  }

  install_thread_hook(py);

  *guard = Some(state);

  Ok(())
}

/// Stop tracking: restore the interpreter's allocators, uninstall the
/// calling thread's profile hook, and write the terminal header.
#[pyfunction]
fn stop(_py: Python<'_>) -> PyResult<()> {
  let mut guard = STATE
    .write()
    .map_err(|_| PyRuntimeError::new_err("tracker state poisoned"))?;

  if let Some(state) = guard.take() {
    // SAFETY: restoring swaps back the allocator table captured at install.
    unsafe {
      state.restore();
    }

    uninstall_thread_hook();
    Tracker::destroy();
  }

  Ok(())
}

#[pyfunction]
fn is_tracing() -> bool {
  Tracker::is_active()
}

/// Bind a human-readable name to the calling thread in the capture stream.
#[pyfunction]
fn register_thread_name(name: &str) -> PyResult<()> {
  Tracker::register_thread_name(name);
  Ok(())
}

/// Install the profile hook on the calling thread. Python glue calls this
/// from `threading.setprofile` so worker threads are tracked too.
#[pyfunction]
fn track_this_thread(py: Python<'_>) -> PyResult<()> {
  install_thread_hook(py);
  Ok(())
}

fn install_thread_hook(_py: Python<'_>) {
  HOOK_INSTALLED.with(|installed| {
    // Idempotent per thread: re-registering would clobber the entry frame
    // and lose line attribution for frames below the entry point.
    if installed.get() {
      return;
    }

    let _guard = RecursionGuard::acquire();

    // SAFETY: we hold the GIL (a Python token is in every caller).
    unsafe {
      ffi::PyEval_SetProfile(Some(profile_hook), ptr::null_mut());
    }

    // SAFETY: PyEval_GetFrame returns a borrowed reference to the frame
    // currently executing on this thread, valid while it stays on the stack.
    let entry = unsafe { ffi::PyEval_GetFrame() };

    let entry_handle = (!entry.is_null())
      .then(|| FrameHandle::new(entry as usize, frame_line_number));

    reset_thread_tracking(entry_handle);

    installed.set(true);
  });
}

fn uninstall_thread_hook() {
  HOOK_INSTALLED.with(|installed| {
    if !installed.get() {
      return;
    }

    let _guard = RecursionGuard::acquire();

    // SAFETY: callers hold the GIL.
    unsafe {
      ffi::PyEval_SetProfile(None, ptr::null_mut());
    }

    reset_thread_tracking(None);

    installed.set(false);
  });
}

/// Line-number accessor baked into every [`FrameHandle`] this bridge hands
/// to the core.
fn frame_line_number(raw: usize) -> u32 {
  // SAFETY: the core only holds handles between a call event and its
  // matching return, while the interpreter keeps the frame alive.
  let line = unsafe {
    ffi::PyFrame_GetLineNumber(raw as *mut ffi::PyFrameObject)
  };

  u32::try_from(line).unwrap_or(0)
}

extern "C" fn profile_hook(
  _obj: *mut ffi::PyObject,
  frame: *mut ffi::PyFrameObject,
  what: c_int,
  _arg: *mut ffi::PyObject,
) -> c_int {
  let _guard = RecursionGuard::acquire();

  if !Tracker::is_active() {
    return 0;
  }

  let handle = FrameHandle::new(frame as usize, frame_line_number);

  match what {
    ffi::PyTrace_CALL => {
      let (function, filename) = decode_frame_names(frame);

      on_profile_event(
        handle,
        ProfileEvent::Call {
          function: function.as_deref(),
          filename: filename.as_deref(),
        },
      )
    }
    ffi::PyTrace_RETURN => on_profile_event(handle, ProfileEvent::Return),
    _ => on_profile_event(handle, ProfileEvent::Other),
  }
}

/// Decode the function and file names from a frame's code object. `None`
/// marks a decode failure, which the hook reports back to the interpreter.
fn decode_frame_names(
  frame: *mut ffi::PyFrameObject,
) -> (Option<String>, Option<String>) {
  // SAFETY: the interpreter invoked us with a live frame and the GIL held.
  Python::with_gil(|py| unsafe {
    let code = ffi::PyFrame_GetCode(frame);

    if code.is_null() {
      return (None, None);
    }

    let code_obj: Bound<'_, PyAny> =
      Bound::from_owned_ptr(py, code.cast::<ffi::PyObject>());

    let function = code_obj
      .getattr("co_name")
      .ok()
      .and_then(|name| name.extract::<String>().ok());

    let filename = code_obj
      .getattr("co_filename")
      .ok()
      .and_then(|name| name.extract::<String>().ok());

    (function, filename)
  })
}

struct ShimState {
  contexts: [AllocatorContext; 3],
}

// SAFETY: the raw allocator tables inside are only mutated under the GIL.
unsafe impl Send for ShimState {}
unsafe impl Sync for ShimState {}

impl ShimState {
  fn new() -> Self {
    Self {
      contexts: [
        AllocatorContext::new(PYMEM_DOMAIN_RAW),
        AllocatorContext::new(PYMEM_DOMAIN_MEM),
        AllocatorContext::new(PYMEM_DOMAIN_OBJ),
      ],
    }
  }

  unsafe fn install(&mut self) -> PyResult<()> {
    for context in &mut self.contexts {
      context.install();
    }

    Ok(())
  }

  unsafe fn restore(&self) {
    for context in &self.contexts {
      context.restore();
    }
  }
}

struct AllocatorContext {
  domain: ffi::PyMemAllocatorDomain,
  original: Option<ffi::PyMemAllocatorEx>,
}

impl AllocatorContext {
  const fn new(domain: ffi::PyMemAllocatorDomain) -> Self {
    Self {
      domain,
      original: None,
    }
  }

  unsafe fn install(&mut self) {
    let mut original = MaybeUninit::<ffi::PyMemAllocatorEx>::uninit();

    ffi::PyMem_GetAllocator(self.domain, original.as_mut_ptr());

    self.original = Some(original.assume_init());

    let mut shim = ffi::PyMemAllocatorEx {
      ctx: (self as *mut Self).cast::<c_void>(),
      malloc: Some(shim_malloc),
      calloc: Some(shim_calloc),
      realloc: Some(shim_realloc),
      free: Some(shim_free),
    };

    ffi::PyMem_SetAllocator(self.domain, &mut shim);
  }

  unsafe fn restore(&self) {
    if let Some(original) = &self.original {
      let mut allocator = *original;
      ffi::PyMem_SetAllocator(self.domain, &mut allocator);
    }
  }

  fn original(&self) -> Option<&ffi::PyMemAllocatorEx> {
    self.original.as_ref()
  }
}

extern "C" fn shim_malloc(ctx: *mut c_void, size: usize) -> *mut c_void {
  unsafe {
    let context = &*ctx.cast::<AllocatorContext>();

    let Some(original) = context.original() else {
      return ptr::null_mut();
    };

    let Some(func) = original.malloc else {
      return ptr::null_mut();
    };

    let ptr = func(original.ctx, size);

    if !ptr.is_null() {
      Tracker::track_allocation(ptr as usize, size, AllocatorKind::PyMalloc);
    }

    ptr
  }
}

extern "C" fn shim_calloc(
  ctx: *mut c_void,
  nelem: usize,
  elsize: usize,
) -> *mut c_void {
  unsafe {
    let context = &*ctx.cast::<AllocatorContext>();

    let Some(original) = context.original() else {
      return ptr::null_mut();
    };

    let Some(func) = original.calloc else {
      return ptr::null_mut();
    };

    let ptr = func(original.ctx, nelem, elsize);

    if !ptr.is_null() {
      let total = nelem.saturating_mul(elsize);
      Tracker::track_allocation(ptr as usize, total, AllocatorKind::PyCalloc);
    }

    ptr
  }
}

extern "C" fn shim_realloc(
  ctx: *mut c_void,
  ptr_in: *mut c_void,
  new_size: usize,
) -> *mut c_void {
  unsafe {
    let context = &*ctx.cast::<AllocatorContext>();

    let Some(original) = context.original() else {
      return ptr::null_mut();
    };

    let Some(func) = original.realloc else {
      return ptr::null_mut();
    };

    let result = func(original.ctx, ptr_in, new_size);

    if result.is_null() {
      return result;
    }

    if !ptr_in.is_null() {
      Tracker::track_deallocation(ptr_in as usize, 0, AllocatorKind::PyFree);
    }

    Tracker::track_allocation(
      result as usize,
      new_size,
      AllocatorKind::PyRealloc,
    );

    result
  }
}

extern "C" fn shim_free(ctx: *mut c_void, ptr_in: *mut c_void) {
  if ptr_in.is_null() {
    return;
  }

  unsafe {
    let context = &*ctx.cast::<AllocatorContext>();

    let Some(original) = context.original() else {
      return;
    };

    if let Some(func) = original.free {
      Tracker::track_deallocation(ptr_in as usize, 0, AllocatorKind::PyFree);
      func(original.ctx, ptr_in);
    }
  }
}

#[pymodule]
fn memtrace_py(module: &Bound<'_, PyModule>) -> PyResult<()> {
  module.add_function(wrap_pyfunction!(start, module)?)?;
  module.add_function(wrap_pyfunction!(stop, module)?)?;
  module.add_function(wrap_pyfunction!(is_tracing, module)?)?;
  module.add_function(wrap_pyfunction!(register_thread_name, module)?)?;
  module.add_function(wrap_pyfunction!(track_this_thread, module)?)?;

  Ok(())
}
