use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Placeholder for a function name or source line that could not be resolved.
pub const DUNNO: &str = "???";

const CENTER_DOT: char = '·';
const DOT: char = '.';
const SLASH: char = '/';
const PATH_SEPARATOR: &str = "::";

/// One raw entry of a stack walk, before any source lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub address: usize,
    pub file: PathBuf,
    pub line: u32,
    /// Symbol resolved for `address`, if any.
    pub symbol: Option<String>,
}

impl Caller {
    pub fn unknown(address: usize) -> Self {
        Self {
            address,
            file: PathBuf::from(DUNNO),
            line: 0,
            symbol: None,
        }
    }
}

/// Platform capability for walking a call stack.
///
/// `caller(depth)` returns `None` once `depth` is past the end of the stack,
/// which is the only thing that terminates a render.
pub trait StackWalker {
    fn caller(&self, depth: usize) -> Option<Caller>;
}

impl<W: StackWalker + ?Sized> StackWalker for &W {
    fn caller(&self, depth: usize) -> Option<Caller> {
        (**self).caller(depth)
    }
}

impl StackWalker for [Caller] {
    fn caller(&self, depth: usize) -> Option<Caller> {
        self.get(depth).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub file: PathBuf,
    pub line: u32,
    pub address: usize,
    pub function: String,
    /// `None` when the frame's file could not be read and the source line is omitted.
    pub source: Option<String>,
}

impl Display for StackFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}:{} ({:#x})",
            self.file.display(),
            self.line,
            self.address
        )?;
        if let Some(source) = &self.source {
            writeln!(f, "\t{}: {}", self.function, source)?;
        }
        Ok(())
    }
}

/// Lines of the most recently loaded source file. Holds one file at a time.
#[derive(Debug, Default)]
pub struct FileLineCache {
    path: Option<PathBuf>,
    lines: Vec<String>,
}

impl FileLineCache {
    /// Returns the lines of `file`, loading it if it is not the cached file.
    ///
    /// A failed load keeps whatever was cached before.
    pub fn lines_for(&mut self, file: &Path) -> Option<&[String]> {
        if self.path.as_deref() != Some(file) {
            let data = std::fs::read(file).ok()?;
            self.lines = String::from_utf8_lossy(&data)
                .split('\n')
                .map(str::to_owned)
                .collect();
            self.path = Some(file.to_path_buf());
        }
        Some(&self.lines)
    }

    pub fn cached_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Stack rendering options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Render {
    /// Write `\t<function>: ???` for frames whose file cannot be read instead
    /// of leaving the line out.
    pub sentinel_on_missing_source: bool,
}

impl Render {
    pub fn frames<W: StackWalker + ?Sized>(&self, walker: &W, skip: usize) -> Vec<StackFrame> {
        let mut cache = FileLineCache::default();
        let mut frames = Vec::new();
        let mut depth = skip;

        while let Some(caller) = walker.caller(depth) {
            let source = match cache.lines_for(&caller.file) {
                Some(lines) => Some(source_line(lines, caller.line).to_owned()),
                None if self.sentinel_on_missing_source => Some(DUNNO.to_owned()),
                None => None,
            };

            frames.push(StackFrame {
                function: function_name(caller.symbol.as_deref()).into_owned(),
                file: caller.file,
                line: caller.line,
                address: caller.address,
                source,
            });

            depth = match depth.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }

        frames
    }

    pub fn render<W: StackWalker + ?Sized>(&self, walker: &W, skip: usize) -> Vec<u8> {
        write_frames(&self.frames(walker, skip))
    }
}

/// Renders the stack seen by `walker`, starting `skip` frames in.
pub fn render<W: StackWalker + ?Sized>(walker: &W, skip: usize) -> Vec<u8> {
    Render::default().render(walker, skip)
}

pub fn write_frames(frames: &[StackFrame]) -> Vec<u8> {
    let mut buf = Vec::new();
    for frame in frames {
        // writing into a Vec cannot fail
        let _ = write!(buf, "{frame}");
    }
    buf
}

/// Shortens a symbol name for display, or returns [`DUNNO`] when there is none.
///
/// The package path is already visible through the file name, so everything
/// up to the last `/` and then up to the first `.` is dropped. Center dots
/// separating a receiver from its method become periods:
/// `pkg/sub.(*T)·Method` turns into `(*T).Method`. Rust `::` paths skip the
/// `.` step.
pub fn function_name(symbol: Option<&str>) -> Cow<'_, str> {
    let Some(mut name) = symbol else {
        return Cow::Borrowed(DUNNO);
    };

    if let Some(slash) = name.rfind(SLASH) {
        name = &name[slash + SLASH.len_utf8()..];
    }
    // a dot inside a `::` path is part of the name, as in `{{vtable.shim}}`
    let qualified = name.contains(PATH_SEPARATOR);
    if let Some(period) = name.find(DOT).filter(|_| !qualified) {
        name = &name[period + DOT.len_utf8()..];
    }

    if name.contains(CENTER_DOT) {
        Cow::Owned(name.replace(CENTER_DOT, "."))
    } else {
        Cow::Borrowed(name)
    }
}

/// Returns the whitespace-trimmed 1-indexed `line`, or [`DUNNO`] when it is out of range.
pub fn source_line(lines: &[String], line: u32) -> &str {
    let Some(index) = (line as usize).checked_sub(1) else {
        return DUNNO;
    };
    lines.get(index).map_or(DUNNO, |l| l.trim())
}
