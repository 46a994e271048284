//! Snapshot of the loaded shared objects and their loadable segments,
//! written as one contiguous run so a reader can resolve native instruction
//! pointers against a consistent view of the address space.

use crate::records::{
  Record, SegmentHeaderRecord, SegmentRecord, StreamError,
};
use crate::writer::RecordWriter;

struct LoadedModule {
  path: String,
  load_bias: u64,
  segments: Vec<SegmentRecord>,
}

/// Write a `MEMORY_MAP_START` marker followed by one header and one segment
/// record per loadable segment of every shared object, holding the writer's
/// exclusive lock for the whole snapshot.
///
/// # Errors
///
/// Returns an error if any record cannot be written.
pub(crate) fn write_module_map(
  writer: &RecordWriter,
) -> Result<(), StreamError> {
  let modules = collect_modules();

  let mut locked = writer.lock();

  locked.write_record(&Record::MemoryMapStart)?;

  for module in modules {
    locked.write_record(&Record::SegmentHeader(SegmentHeaderRecord {
      filename: module.path,
      num_segments: module.segments.len() as u32,
      load_bias: module.load_bias,
    }))?;

    for segment in module.segments {
      locked.write_record(&Record::Segment(segment))?;
    }
  }

  Ok(())
}

#[cfg(target_os = "linux")]
fn collect_modules() -> Vec<LoadedModule> {
  use std::ffi::CStr;

  unsafe extern "C" fn phdr_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
  ) -> libc::c_int {
    // SAFETY: `data` is the Vec passed to dl_iterate_phdr below, and `info`
    // is valid for the duration of this callback.
    let modules = unsafe { &mut *data.cast::<Vec<LoadedModule>>() };
    let info = unsafe { &*info };

    let path = if info.dlpi_name.is_null() {
      String::new()
    } else {
      // SAFETY: dlpi_name is a NUL-terminated string owned by the loader.
      unsafe { CStr::from_ptr(info.dlpi_name) }
        .to_string_lossy()
        .into_owned()
    };

    // The virtual DSO cannot be symbolised, so don't record it.
    if path.starts_with("linux-vdso.so") {
      return 0;
    }

    // The main executable reports an empty path; relabel it.
    let path = if path.is_empty() {
      executable_path()
    } else {
      path
    };

    // SAFETY: the loader guarantees dlpi_phnum entries behind dlpi_phdr.
    let headers = unsafe {
      std::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum))
    };

    let segments = headers
      .iter()
      .filter(|header| header.p_type == libc::PT_LOAD)
      .map(|header| SegmentRecord {
        vaddr: u64::from(header.p_vaddr),
        memsz: u64::from(header.p_memsz),
      })
      .collect();

    modules.push(LoadedModule {
      path,
      load_bias: u64::from(info.dlpi_addr),
      segments,
    });

    0
  }

  let mut modules: Vec<LoadedModule> = Vec::new();

  // SAFETY: the callback only touches the Vec it is handed and returns 0 to
  // keep iterating.
  unsafe {
    libc::dl_iterate_phdr(
      Some(phdr_callback),
      std::ptr::addr_of_mut!(modules).cast(),
    );
  }

  modules
}

#[cfg(target_os = "linux")]
fn executable_path() -> String {
  std::fs::read_link("/proc/self/exe")
    .map(|path| path.to_string_lossy().into_owned())
    .unwrap_or_default()
}

#[cfg(not(target_os = "linux"))]
fn collect_modules() -> Vec<LoadedModule> {
  // No program-header iteration off Linux; the snapshot still writes its
  // start marker so the stream shape stays stable.
  Vec::new()
}
