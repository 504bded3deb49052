use std::path::{Path, PathBuf};

use backtrace::Backtrace;

use crate::stack::{Caller, DUNNO, StackWalker};

/// Symbol the standard library places right below the panic runtime. Frames
/// above it belong to the hook and the unwinder, not to the code that panicked.
const END_SHORT_BACKTRACE: &str = "__rust_end_short_backtrace";

/// Panic entry points that can sit between the marker and the panicking code.
const PANIC_ENTRY_POINTS: &[&str] = &[
    "rust_begin_unwind",
    "std::panicking::",
    "core::panicking::",
    "std::panic::panic_any",
    "std::panic::resume_unwind",
];

/// A resolved call stack, walkable by the stack formatter.
///
/// Inlined functions are listed as separate frames sharing one address.
#[derive(Debug, Clone, Default)]
pub struct CapturedStack {
    callers: Vec<Caller>,
}

impl CapturedStack {
    /// Captures and resolves the current thread's stack.
    pub fn here() -> Self {
        Self::resolve(Backtrace::new_unresolved())
    }

    pub fn resolve(mut trace: Backtrace) -> Self {
        trace.resolve();

        let mut callers = Vec::with_capacity(trace.frames().len());
        for frame in trace.frames() {
            let address = frame.ip() as usize;
            let symbols = frame.symbols();
            if symbols.is_empty() {
                callers.push(Caller::unknown(address));
                continue;
            }

            for symbol in symbols {
                callers.push(Caller {
                    address,
                    file: symbol
                        .filename()
                        .map_or_else(|| PathBuf::from(DUNNO), Path::to_path_buf),
                    line: symbol.lineno().unwrap_or(0),
                    // alternate form drops the symbol hash
                    symbol: symbol.name().map(|name| format!("{name:#}")),
                });
            }
        }

        Self {
            callers: trim_panic_runtime(callers),
        }
    }

    pub fn len(&self) -> usize {
        self.callers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }
}

impl From<Vec<Caller>> for CapturedStack {
    fn from(callers: Vec<Caller>) -> Self {
        Self {
            callers: trim_panic_runtime(callers),
        }
    }
}

impl StackWalker for CapturedStack {
    fn caller(&self, depth: usize) -> Option<Caller> {
        self.callers.get(depth).cloned()
    }
}

fn trim_panic_runtime(mut callers: Vec<Caller>) -> Vec<Caller> {
    let marker = callers.iter().rposition(|caller| {
        caller
            .symbol
            .as_deref()
            .is_some_and(|name| name.contains(END_SHORT_BACKTRACE))
    });

    let Some(marker) = marker else {
        return callers;
    };

    let entry = callers[marker + 1..]
        .iter()
        .take_while(|caller| caller.symbol.as_deref().is_some_and(is_panic_entry_point))
        .count();
    callers.drain(..=marker + entry);
    callers
}

fn is_panic_entry_point(name: &str) -> bool {
    PANIC_ENTRY_POINTS
        .iter()
        .any(|prefix| name.starts_with(prefix))
}
