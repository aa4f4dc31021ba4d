//! The `fuzzilli(...)` intrinsics: a deliberate crash for exercising the
//! fuzzer's crash detection, and a print that goes back to the fuzzer.
//!
//! Both operations hide behind one callable and are selected by an exact
//! string match on the first argument, so generated code does not hit them
//! by accident. Anything else is a silent no-op.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::FromRawFd;
use std::rc::Rc;

use crate::runner::channel::REPRL_DWFD;

/// Global names the intrinsic is installed under.
pub const INTRINSIC_BINDINGS: [&str; 2] = ["fuzzilli", "__fuzzilli"];
pub const CRASH_SELECTOR: &str = "FUZZILLI_CRASH";
pub const PRINT_SELECTOR: &str = "FUZZILLI_PRINT";

const PRINT_CHUNK: usize = 4096;
const ESCAPED_NUL: &[u8] = b"\\u0000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    Crash,
    Print,
}

impl Intrinsic {
    pub fn select(selector: &str) -> Option<Self> {
        match selector {
            CRASH_SELECTOR => Some(Intrinsic::Crash),
            PRINT_SELECTOR => Some(Intrinsic::Print),
            _ => None,
        }
    }
}

/// What the intrinsic needs from the engine that calls it.
pub trait IntrinsicHost {
    type Value;
    type Error;

    /// The selector string, if `value` is a string at all.
    fn selector<'v>(&self, value: &'v Self::Value) -> Option<&'v str>;
    fn crash_variant(&mut self, value: Option<&Self::Value>) -> i64;
    /// String conversion as the language defines it; may run script code.
    fn to_display(&mut self, value: &Self::Value) -> Result<String, Self::Error>;
}

/// Entry point shared by every binding in [`INTRINSIC_BINDINGS`].
pub fn dispatch<H: IntrinsicHost>(
    host: &mut H,
    output: &FuzzOutput,
    args: &[H::Value],
) -> Result<(), H::Error> {
    let Some(intrinsic) = args.first().and_then(|v| host.selector(v)).and_then(Intrinsic::select)
    else {
        return Ok(());
    };

    match intrinsic {
        Intrinsic::Crash => {
            let variant = host.crash_variant(args.get(1));
            crash(variant)
        }
        Intrinsic::Print => {
            let mut line = output.line();
            for arg in &args[1..] {
                let text = host.to_display(arg)?;
                if let Err(err) = line.push_arg(&text) {
                    eprintln!("[REPRL] failed to write fuzzer output: {err}");
                    return Ok(());
                }
            }
            if let Err(err) = line.finish() {
                eprintln!("[REPRL] failed to write fuzzer output: {err}");
            }
            Ok(())
        }
    }
}

/// Terminate the process through a fault the fuzzer will classify as a crash.
pub fn crash(variant: i64) -> ! {
    if variant == 0 {
        // byte-sized so the store has no alignment requirement
        unsafe { std::ptr::write_volatile(0x4141_4141usize as *mut u8, 0x37) };
    }
    // Any other variant, or an address that happened to be mapped.
    std::process::abort()
}

/// Where printed script output goes: descriptor 103 under REPRL, stdout when
/// running standalone.
#[derive(Clone)]
pub struct FuzzOutput {
    sink: Rc<RefCell<Box<dyn Write>>>,
}

impl FuzzOutput {
    pub fn new<W: Write + 'static>(sink: W) -> Self {
        Self {
            sink: Rc::new(RefCell::new(Box::new(sink))),
        }
    }

    /// # Safety
    /// Descriptor 103 must be open and owned by nobody else.
    pub unsafe fn reprl() -> Self {
        Self::new(unsafe { File::from_raw_fd(REPRL_DWFD) })
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Start one space-separated, newline-terminated line.
    pub fn line(&self) -> PrintLine<'_> {
        PrintLine {
            output: self,
            buf: [0; PRINT_CHUNK],
            len: 0,
            args: 0,
        }
    }
}

/// Buffers a printed line in fixed chunks. Chunks end on character
/// boundaries, and whatever is buffered is flushed on drop.
pub struct PrintLine<'a> {
    output: &'a FuzzOutput,
    buf: [u8; PRINT_CHUNK],
    len: usize,
    args: usize,
}

impl PrintLine<'_> {
    pub fn push_arg(&mut self, text: &str) -> io::Result<()> {
        if self.args > 0 {
            self.push_bytes(b" ")?;
        }
        self.args += 1;

        let mut segments = text.split('\0');
        if let Some(first) = segments.next() {
            self.push_text(first)?;
        }
        for segment in segments {
            self.push_bytes(ESCAPED_NUL)?;
            self.push_text(segment)?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.push_bytes(b"\n")?;
        self.flush_chunk()
    }

    fn push_text(&mut self, mut text: &str) -> io::Result<()> {
        while !text.is_empty() {
            let room = PRINT_CHUNK - self.len;
            let mut take = room.min(text.len());
            while !text.is_char_boundary(take) {
                take -= 1;
            }
            if take == 0 {
                self.flush_chunk()?;
                continue;
            }
            self.buf[self.len..self.len + take].copy_from_slice(&text.as_bytes()[..take]);
            self.len += take;
            text = &text[take..];
        }
        Ok(())
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.len + bytes.len() > PRINT_CHUNK {
            self.flush_chunk()?;
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    fn flush_chunk(&mut self) -> io::Result<()> {
        let mut sink = self.output.sink.borrow_mut();
        if self.len > 0 {
            sink.write_all(&self.buf[..self.len])?;
            self.len = 0;
        }
        sink.flush()
    }
}

impl Drop for PrintLine<'_> {
    fn drop(&mut self) {
        let _ = self.flush_chunk();
    }
}
