//! Owned PTY + subprocess resource.
//! One `PtyProcess` encapsulates the master file handle and the child; output
//! is bridged from a blocking reader thread into a tokio channel, writes are
//! serialized behind a mutex, and `shutdown()` kills then reaps the child so
//! no zombie is left behind on any exit path.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use portable_pty::{native_pty_system, Child, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::assistant::build_command;

/// Size of one PTY read; also the granularity of broadcast and timing records.
pub const READ_BUF_BYTES: usize = 4096;

pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
}

/// Spawn `argv` in `cwd` on a fresh PTY of the given size. Returns the owned
/// handle plus the receiver the output pump drains.
pub fn spawn(
    argv: &[String],
    cwd: &Path,
    rows: u16,
    cols: u16,
) -> anyhow::Result<(PtyProcess, mpsc::Receiver<Vec<u8>>)> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("open pty")?;

    let cmd = build_command(argv, cwd);
    let child = pair.slave.spawn_command(cmd).context("spawn command")?;
    drop(pair.slave);

    let mut reader = pair.master.try_clone_reader().context("clone pty reader")?;
    let writer = pair.master.take_writer().context("take pty writer")?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);

    // Blocking thread: read PTY output and hand chunks to the async side.
    // Ends on EOF (child gone) or read error; either way the pump observes a
    // closed channel and drives the exit state machine.
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_BUF_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("pty read ended: {}", e);
                    break;
                }
            }
        }
    });

    let process = PtyProcess {
        master: pair.master,
        writer: Arc::new(Mutex::new(writer)),
        child: Arc::new(Mutex::new(child)),
    };
    Ok((process, rx))
}

impl PtyProcess {
    /// Write input bytes to the subprocess. Serialized by the writer mutex;
    /// callers already serialize through the session lock.
    pub fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("pty writer mutex poisoned"))?;
        writer.write_all(bytes)?;
        writer.flush()
    }

    /// Resize the PTY. The emulator is resized separately under the screen
    /// lock by the session.
    pub fn resize(&self, rows: u16, cols: u16) {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        if let Err(e) = self.master.resize(size) {
            warn!("pty resize to {}x{} failed: {}", rows, cols, e);
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        self.child.lock().ok().and_then(|c| c.process_id())
    }

    /// Kill (if still alive) and reap the child, returning its exit code.
    /// Blocking; run under `spawn_blocking` from async contexts. Consumes the
    /// handle so the file descriptor closes with it.
    pub fn shutdown(self) -> i32 {
        let mut child = match self.child.lock() {
            Ok(c) => c,
            Err(_) => return 0,
        };
        match child.try_wait() {
            Ok(Some(status)) => return status.exit_code() as i32,
            Ok(None) => {
                // Still alive after the PTY stream ended (transient I/O
                // failure); kill explicitly so the wait below cannot hang.
                if let Err(e) = child.kill() {
                    debug!("pty child kill: {}", e);
                }
            }
            Err(e) => debug!("pty child try_wait: {}", e),
        }
        match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_echo_and_reap() {
        let tmp = tempfile::tempdir().unwrap();
        let argv = vec!["echo".to_string(), "ready".to_string()];
        // PTY spawning needs a terminal-capable environment; tolerate absence.
        let Ok((process, mut rx)) = spawn(&argv, tmp.path(), 24, 80) else {
            return;
        };
        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        let code = tokio::task::spawn_blocking(move || process.shutdown())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(String::from_utf8_lossy(&collected).contains("ready"));
    }
}
