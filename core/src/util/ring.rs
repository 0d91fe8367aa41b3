use std::sync::Mutex;

/// Bounded in-memory capture of child output.
///
/// Lines are appended until the byte cap is reached; past that point the
/// stream readers keep draining the pipes but nothing more is retained.
pub struct OutputCapture {
    inner: Mutex<String>,
    cap: usize,
}

impl OutputCapture {
    pub fn new(cap: usize) -> Self {
        OutputCapture {
            inner: Mutex::new(String::new()),
            cap,
        }
    }

    pub fn push_line(&self, line: &str) {
        let mut buf = self.inner.lock().unwrap();
        if buf.len() < self.cap {
            buf.push_str(line);
            buf.push('\n');
        }
    }

    pub fn snapshot(&self) -> String {
        self.inner.lock().unwrap().clone()
    }
}

/// Returns the last `n` lines of `s`, or all of it when shorter.
///
/// A trailing newline counts as one more (empty) line, matching the tail
/// rendering of earlier releases.
pub fn tail_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.split('\n').collect();
    if lines.len() <= n {
        return s.to_string();
    }
    lines[lines.len() - n..].join("\n")
}
