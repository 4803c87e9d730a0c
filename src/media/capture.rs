use log::{debug, info, warn};
use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, Stdio},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use super::StreamFormat;
use crate::config::ProcessConfig;
use crate::error::{ProxyError, Result};
use crate::frame::{Frame, FrameBuffer};

const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Opaque producer of raw frames. `grab` may block until a frame is ready;
/// `shutdown` must unblock a pending `grab` from another thread.
pub trait FrameSource: Send + Sync {
    fn grab(&self) -> Result<Frame>;
    fn shutdown(&self) {}
}

/// Decodes the rover's stream with an external program emitting packed BGR24
/// on stdout. The process is (re)spawned lazily, so a source that dies is
/// retried on the next grab.
pub struct FfmpegSource {
    cfg: ProcessConfig,
    format: StreamFormat,
    conf: PathBuf,
    child: Mutex<Option<Child>>,
    stdout: Mutex<Option<ChildStdout>>,
    stopped: AtomicBool,
}

impl FfmpegSource {
    pub fn new(cfg: ProcessConfig, format: StreamFormat, conf: &Path) -> Self {
        Self {
            cfg,
            format,
            conf: conf.to_path_buf(),
            child: Mutex::new(None),
            stdout: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    fn spawn(&self) -> Result<ChildStdout> {
        let mut vars = self.format.placeholders();
        vars.push(("conf", self.conf.display().to_string()));
        let mut child = Command::new(&self.cfg.program)
            .args(self.cfg.render_args(&vars))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Process("failed to capture source stdout".into()))?;
        info!(
            "capture: spawned {} for {} (pid={})",
            self.cfg.program,
            self.conf.display(),
            child.id()
        );
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
        Ok(stdout)
    }

    fn reap(&self) {
        if let Some(mut child) = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl FrameSource for FfmpegSource {
    fn grab(&self) -> Result<Frame> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ProxyError::SessionClosed);
        }
        let mut guard = self.stdout.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.spawn()?);
            // shutdown may have raced the spawn
            if self.stopped.load(Ordering::Acquire) {
                *guard = None;
                drop(guard);
                self.reap();
                return Err(ProxyError::SessionClosed);
            }
        }
        let Some(stdout) = guard.as_mut() else {
            return Err(ProxyError::Process("capture source unavailable".into()));
        };

        let mut frame = Frame::blank(self.format.width, self.format.height);
        if let Err(e) = stdout.read_exact(&mut frame.data) {
            *guard = None;
            drop(guard);
            self.reap();
            return Err(ProxyError::Process(format!("capture source ended: {e}")));
        }
        Ok(frame)
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.reap();
    }
}

pub struct CapturePump {
    running: Arc<AtomicBool>,
    source: Arc<dyn FrameSource>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CapturePump {
    pub fn interval(framerate: u32) -> Duration {
        // 1.2x the nominal rate, not 1/1.2: the buffer should rarely be
        // empty when the feed loop polls it
        Duration::from_secs_f64(1.0 / (f64::from(framerate.max(1)) * 1.2))
    }

    pub fn start(
        rover_id: &str,
        source: Arc<dyn FrameSource>,
        buffer: Arc<FrameBuffer>,
        framerate: u32,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let interval = Self::interval(framerate);
        let handle = {
            let running = running.clone();
            let source = source.clone();
            let rover = rover_id.to_string();
            thread::Builder::new()
                .name(format!("capture-{rover}"))
                .spawn(move || pump_loop(&rover, &running, source.as_ref(), &buffer, interval))?
        };
        Ok(Self {
            running,
            source,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.source.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for CapturePump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump_loop(
    rover: &str,
    running: &AtomicBool,
    source: &dyn FrameSource,
    buffer: &FrameBuffer,
    interval: Duration,
) {
    debug!("capture[{rover}]: pump started, interval {interval:?}");
    let mut failures: u32 = 0;
    while running.load(Ordering::Acquire) {
        let started = Instant::now();
        let wait = match source.grab() {
            Ok(frame) => {
                failures = 0;
                buffer.write(frame);
                interval.saturating_sub(started.elapsed())
            }
            Err(e) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                failures = failures.saturating_add(1);
                warn!("capture[{rover}]: grab failed ({failures}x): {e}");
                (interval * 2u32.saturating_pow(failures.min(8))).min(MAX_BACKOFF)
            }
        };
        thread::sleep(wait);
    }
    debug!("capture[{rover}]: pump stopped");
}
