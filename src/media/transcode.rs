use log::{info, warn};
use std::{
    io::{ErrorKind, Read, Write},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{
        Mutex, PoisonError, TryLockError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use super::StreamFormat;
use crate::config::ProcessConfig;
use crate::error::{ProxyError, Result};

const EXIT_GRACE: Duration = Duration::from_secs(2);

/// One external converter process per rover: raw frames in, stream bytes out.
///
/// The input pipe has a single writer (the feed loop) and the output pipe a
/// single reader (the broadcast loop); each sits behind its own lock so
/// `close` can drop the input while a read is in flight. `close` never waits
/// on a stalled write: it kills the process instead, which fails the write.
pub struct TranscodePipeline {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<ChildStdout>,
    closed: AtomicBool,
}

impl TranscodePipeline {
    pub fn spawn(cfg: &ProcessConfig, format: StreamFormat) -> Result<Self> {
        let mut child = Command::new(&cfg.program)
            .args(cfg.render_args(&format.placeholders()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Process("failed to capture transcoder stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Process("failed to capture transcoder stdout".into()))?;
        info!(
            "transcoder: spawned {} {}x{}@{} (pid={})",
            cfg.program,
            format.width,
            format.height,
            format.framerate,
            child.id()
        );
        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(stdout),
            closed: AtomicBool::new(false),
        })
    }

    /// Write one raw frame; returns once the pipe accepted all of it.
    pub fn submit(&self, raw: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::SessionClosed);
        }
        let stdin = guard.as_mut().ok_or(ProxyError::SessionClosed)?;
        stdin.write_all(raw)?;
        stdin.flush()?;
        Ok(())
    }

    /// Blocking read of up to `max` bytes. An empty chunk means the process
    /// closed its output.
    pub fn next_chunk(&self, max: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let mut stdout = self.stdout.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match stdout.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close the input and wait for the process to exit, killing it if it
    /// lingers. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let deadline = Instant::now() + EXIT_GRACE;
        let writer_stuck = !self.release_input(deadline);
        if writer_stuck {
            warn!("transcoder: input write stalled at close; killing");
        }

        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("transcoder: exited with {status}");
                    return;
                }
                Ok(None) if !writer_stuck && Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(20));
                }
                Ok(None) => {
                    if !writer_stuck {
                        warn!("transcoder: did not exit after input closed; killing");
                    }
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }
                Err(e) => {
                    warn!("transcoder: wait failed: {e}");
                    return;
                }
            }
        }
    }

    /// Drop the input pipe, waiting for an in-flight write no later than
    /// `deadline`. `false` if the writer still holds it.
    fn release_input(&self, deadline: Instant) -> bool {
        loop {
            match self.stdin.try_lock() {
                Ok(mut guard) => {
                    drop(guard.take());
                    return true;
                }
                Err(TryLockError::Poisoned(p)) => {
                    drop(p.into_inner().take());
                    return true;
                }
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(TryLockError::WouldBlock) => return false,
            }
        }
    }
}

impl Drop for TranscodePipeline {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat() -> TranscodePipeline {
        let cfg = ProcessConfig {
            program: "cat".into(),
            args: vec![],
        };
        let format = StreamFormat {
            width: 4,
            height: 4,
            framerate: 10,
        };
        TranscodePipeline::spawn(&cfg, format).unwrap()
    }

    #[test]
    fn bytes_flow_through_and_eof_follows_close() {
        let t = cat();
        t.submit(b"hello frame").unwrap();

        let mut got = Vec::new();
        while got.len() < 11 {
            let chunk = t.next_chunk(4).unwrap();
            assert!(!chunk.is_empty());
            assert!(chunk.len() <= 4);
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, b"hello frame");

        t.close();
        assert!(t.next_chunk(4).unwrap().is_empty());
    }

    #[test]
    fn submit_after_close_fails() {
        let t = cat();
        t.close();
        assert!(matches!(t.submit(b"x"), Err(ProxyError::SessionClosed)));
        t.close();
    }

    #[test]
    fn close_kills_a_stalled_converter_mid_write() {
        let cfg = ProcessConfig {
            program: "sleep".into(),
            args: vec!["1000".into()],
        };
        let format = StreamFormat {
            width: 640,
            height: 480,
            framerate: 10,
        };
        let t = std::sync::Arc::new(TranscodePipeline::spawn(&cfg, format).unwrap());

        let writer = {
            let t = t.clone();
            thread::spawn(move || t.submit(&vec![0u8; 640 * 480 * 3]))
        };
        thread::sleep(Duration::from_millis(200));

        let (tx, rx) = std::sync::mpsc::channel();
        {
            let t = t.clone();
            thread::spawn(move || {
                t.close();
                let _ = tx.send(());
            });
        }
        rx.recv_timeout(EXIT_GRACE * 4)
            .expect("close blocked behind the stalled write");
        assert!(writer.join().unwrap().is_err());
        assert!(matches!(t.submit(b"x"), Err(ProxyError::SessionClosed)));
    }
}
