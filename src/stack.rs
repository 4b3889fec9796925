//! Stack resolution: turn a captured stack of return addresses, or a set of
//! already-symbolic lines, into `(binary, function, filename)` triples
//! suitable for an error's `stacktrace` and `culprit` (the wire format only
//! carries `function`/`filename`; `binary` is kept alongside to default
//! `culprit` to the topmost frame's binary, per the source's
//! `get_function_location_from_stack`).
//!
//! Two paths are supported, matching the two ways `catch_error` can be
//! invoked (see [`crate::engine::Engine::catch_error`]):
//! - **Supplied symbols**: the caller already has `"function (file:line)"`
//!   style lines (e.g. forwarded from a language runtime); parsed with
//!   [`parse_backtrace_symbol`].
//! - **Captured at the call site**: [`capture_backtrace`] walks the stack
//!   with the `backtrace` crate and resolves each return address by
//!   preferring [`resolve_address`]'s `addr2line` DWARF lookup against the
//!   running binary's own debug info (located via `/proc/self/maps`),
//!   falling back to the `backtrace` crate's own symbol table lookup when
//!   no DWARF info is available for that address (a stripped binary, or a
//!   module with no debug info).
//!
//! [`parse_backtrace_symbol`] assumes glibc's `backtrace_symbols(3)`
//! format (`binary(function+offset) [address]`); musl's `backtrace_symbols`
//! output differs and would need its own parser behind this same function
//! signature.

use crate::error::AgentError;
use crate::model::StackFrame;

/// Bound on frames captured from the current call site. The crash handler
/// uses the same bound for its own capture (see [`crate::crash`]).
pub const MAX_FRAMES: usize = 32;

/// Capture a backtrace at the current call site, skipping `skip` of the
/// innermost frames (conventionally 2: one for this function, one for the
/// `catch_error` frame that called it) and resolving each return address to
/// a function name and, when DWARF info is available, a file:line.
pub fn capture_backtrace(skip: usize) -> Vec<StackFrame> {
    let mut frames = Vec::with_capacity(MAX_FRAMES);
    let mut index = 0usize;

    backtrace::trace(|frame| {
        index += 1;
        if index <= skip {
            return true;
        }
        if frames.len() >= MAX_FRAMES {
            return false;
        }

        frames.push(resolve_frame(frame));

        frames.len() < MAX_FRAMES
    });

    frames
}

/// Resolve one captured frame, preferring [`resolve_address`]'s DWARF
/// lookup and falling back to the `backtrace` crate's own symbol table
/// resolution when the address isn't covered by any loaded module's debug
/// info.
fn resolve_frame(frame: &backtrace::Frame) -> StackFrame {
    let ip = frame.ip();
    if let Some(resolved) = resolve_address(ip as u64) {
        return resolved;
    }

    let binary = owning_module(ip as u64).unwrap_or_default();
    let mut symbol_frame = None;
    backtrace::resolve(ip, |symbol| {
        let function = symbol
            .name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("{ip:?}"));
        let filename = symbol
            .filename()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        symbol_frame = Some(StackFrame {
            function,
            filename,
            binary: binary.clone(),
        });
    });

    symbol_frame.unwrap_or_else(|| StackFrame {
        function: format!("{ip:?}"),
        filename: String::new(),
        binary,
    })
}

/// Parse a single glibc `backtrace_symbols(3)`-format line:
/// `binary(function+0x1a) [0x55d3a1b2c3d4]`. Returns `None` for any line
/// that doesn't contain the `(function` delimiter this format guarantees —
/// the caller discards unparseable lines rather than failing the whole
/// capture. This format carries no file:line information, so `filename` is
/// always empty; the binary path goes in `binary` instead.
pub fn parse_backtrace_symbol(line: &str) -> Option<StackFrame> {
    let open = line.find('(')?;
    let (binary, rest) = line.split_at(open);
    let rest = &rest[1..]; // drop '('

    let close = rest.find(')')?;
    let inner = &rest[..close];

    let function = inner.split('+').next().unwrap_or(inner);
    if function.is_empty() {
        return None;
    }

    Some(StackFrame {
        function: function.to_string(),
        filename: String::new(),
        binary: binary.trim().to_string(),
    })
}

/// Resolve a raw return address against the process's own loaded modules
/// by consulting `/proc/self/maps` for the owning binary and an
/// `addr2line` context built from it. Falls back to an empty filename
/// when the module can't be identified or carries no DWARF info (e.g. it
/// was stripped) — this is a best-effort lookup, matching the source's
/// "instrumentation failures never interrupt the host" policy.
pub fn resolve_address(address: u64) -> Option<StackFrame> {
    let module_path = owning_module(address)?;
    let file = std::fs::File::open(&module_path).ok()?;
    let map = unsafe { memmap2::Mmap::map(&file).ok()? };
    let object = object::File::parse(&*map).ok()?;
    let context = addr2line::Context::new(&object).ok()?;

    let mut frames = context.find_frames(address).ok()?;
    let frame = frames.next().ok().flatten();

    let function = frame
        .as_ref()
        .and_then(|f| f.function.as_ref())
        .and_then(|f| f.demangle().ok().map(|s| s.to_string()))
        .unwrap_or_else(|| format!("{address:#x}"));

    let filename = frame
        .and_then(|f| f.location)
        .and_then(|loc| loc.file.map(|f| f.to_string()))
        .unwrap_or_default();

    Some(StackFrame {
        function,
        filename,
        binary: module_path,
    })
}

/// Find the binary or shared object that maps `address`, by scanning
/// `/proc/self/maps`. An actual read failure (as opposed to simply not
/// finding a mapping for `address`) is logged as an
/// [`AgentError::OsReadFailed`].
fn owning_module(address: u64) -> Option<String> {
    let maps = std::fs::read_to_string("/proc/self/maps")
        .map_err(|e| {
            let err = AgentError::OsReadFailed(format!("/proc/self/maps: {e}"));
            tracing::warn!(error = %err, "{err}");
            err
        })
        .ok()?;
    for line in maps.lines() {
        let mut parts = line.splitn(6, ' ');
        let range = parts.next()?;
        let path = parts.nth(4)?.trim();
        if path.is_empty() || path.starts_with('[') {
            continue;
        }
        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        if address >= start && address < end {
            return Some(path.to_string());
        }
    }
    None
}
