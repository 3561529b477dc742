//! Line-oriented Server-Sent Events framing.
//!
//! Only the `data` field matters to the search endpoints: each frame carries
//! one JSON object. `event`, `id` and `retry` fields are accepted and dropped,
//! comment lines (leading `:`) are skipped.

use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct SseParser {
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (without its terminator) and returns a completed frame
    /// payload when the line closes one.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" | "id" | "retry" => {}
            other => log::trace!("Ignoring unknown SSE field {:?}", other),
        }
        None
    }

    /// Flushes a frame left open when the stream ends without a blank line.
    pub fn finish(&mut self) -> Option<String> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        Some(payload)
    }
}

/// Whether a read error only means nothing arrived within the transport's
/// poll interval. The read can be retried.
pub fn is_idle(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Reads every frame payload from `reader`, handing each to `sink` as soon as
/// it is complete. Stops early when `sink` returns `false` or once `closed`
/// is set; a quiet body notices the flag on its next idle read.
///
/// A partial line survives idle reads, so a body that times out mid-line
/// loses nothing.
pub fn read_frames<R, F>(mut reader: R, closed: &AtomicBool, mut sink: F) -> io::Result<()>
where
    R: BufRead,
    F: FnMut(String) -> bool,
{
    let mut parser = SseParser::new();
    let mut line = Vec::new();
    loop {
        if closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let at_end = match reader.read_until(b'\n', &mut line) {
            Ok(0) => true,
            // `read_until` only stops short of a newline at end of stream.
            Ok(_) => !line.ends_with(b"\n"),
            Err(e) if is_idle(&e) => continue,
            Err(e) => return Err(e),
        };
        if !line.is_empty() {
            let frame = {
                let text = String::from_utf8_lossy(&line);
                parser.push_line(text.strip_suffix('\n').unwrap_or(&*text))
            };
            line.clear();
            if let Some(payload) = frame {
                if !sink(payload) {
                    return Ok(());
                }
            }
        }
        if at_end {
            break;
        }
    }
    if let Some(payload) = parser.finish() {
        sink(payload);
    }
    Ok(())
}
