//! Logcat Capture
//!
//! Background capture of a device's logcat output while it is leased.
//! Output is retained in memory, capped at a configurable size by
//! dropping the oldest lines.

use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;

/// Line buffer capped by total byte size
struct LineBuffer {
    lines: VecDeque<String>,
    bytes: u64,
    max_bytes: u64,
}

impl LineBuffer {
    fn new(max_bytes: u64) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes,
        }
    }

    fn push(&mut self, line: String) {
        self.bytes += line.len() as u64 + 1;
        self.lines.push_back(line);
        while self.bytes > self.max_bytes {
            match self.lines.pop_front() {
                Some(dropped) => self.bytes -= dropped.len() as u64 + 1,
                None => break,
            }
        }
    }

    fn contents(&self) -> String {
        let mut output = String::new();
        for line in &self.lines {
            output.push_str(line);
            output.push('\n');
        }
        output
    }
}

/// A running background logcat capture for one device.
pub struct LogcatCapture {
    child: Child,
    reader_task: JoinHandle<()>,
    buffer: Arc<Mutex<LineBuffer>>,
}

impl LogcatCapture {
    /// Spawn `adb -s <serial> logcat -v threadtime` and start consuming
    /// its output.
    pub fn start(adb_path: &str, serial: &str, max_data_size: u64) -> Result<Self> {
        debug!("Starting logcat capture for {}", serial);
        let mut child = Command::new(adb_path)
            .args(["-s", serial, "logcat", "-v", "threadtime"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let buffer = Arc::new(Mutex::new(LineBuffer::new(max_data_size)));
        let reader_buffer = buffer.clone();
        let stdout = child.stdout.take();
        let reader_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    reader_buffer.lock().push(line);
                }
            }
        });

        Ok(Self {
            child,
            reader_task,
            buffer,
        })
    }

    /// Snapshot of the retained output
    pub fn contents(&self) -> String {
        self.buffer.lock().contents()
    }

    /// Kill the logcat child and stop consuming output
    pub fn stop(mut self) {
        let _ = self.child.start_kill();
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    /// Stand-in for adb: ignores its arguments and emits fixed lines.
    fn fake_adb(dir: &tempfile::TempDir, script: &str) -> String {
        let path = dir.path().join("fake-adb");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", script).unwrap();
        file.set_permissions(std::fs::Permissions::from_mode(0o755))
            .unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_capture_collects_lines() {
        let dir = tempfile::tempdir().unwrap();
        let adb = fake_adb(&dir, "echo line-one; echo line-two; sleep 10");

        let capture = LogcatCapture::start(&adb, "A1B2", 1024 * 1024).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let contents = capture.contents();
        assert!(contents.contains("line-one"));
        assert!(contents.contains("line-two"));
        capture.stop();
    }

    #[tokio::test]
    async fn test_capture_caps_retained_size() {
        let dir = tempfile::tempdir().unwrap();
        let adb = fake_adb(&dir, "i=0; while [ $i -lt 100 ]; do echo entry-$i; i=$((i+1)); done; sleep 10");

        // room for only a handful of lines
        let capture = LogcatCapture::start(&adb, "A1B2", 64).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let contents = capture.contents();
        assert!((contents.len() as u64) <= 64 + "entry-99".len() as u64 + 1);
        assert!(!contents.contains("entry-0\n"));
        assert!(contents.contains("entry-99"));
        capture.stop();
    }
}
