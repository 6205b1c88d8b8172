//! Supervision of a locally spawned detector server.

use std::{
    io::{self, BufRead, BufReader, Read},
    process::{Child, Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::pipeline::telemetry;

/// Restarts tolerated before the detector is declared dead.
pub const MAX_RESTARTS: u32 = 3;
pub const RESTART_PAUSE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const STDERR_TAIL_BYTES: usize = 4096;

/// Handle to the supervised detector process.
///
/// When the process exits it is restarted after a pause. Once it has been
/// restarted more than [`MAX_RESTARTS`] times the supervisor gives up, marks
/// itself failed and requests pipeline shutdown.
pub struct DetectorProcess {
    child: Arc<Mutex<Option<Child>>>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    supervisor: Option<thread::JoinHandle<()>>,
}

impl DetectorProcess {
    pub fn spawn(argv: Vec<String>, shutdown: Arc<AtomicBool>) -> io::Result<Self> {
        Self::spawn_with_pause(argv, shutdown, RESTART_PAUSE)
    }

    pub fn spawn_with_pause(
        argv: Vec<String>,
        shutdown: Arc<AtomicBool>,
        pause: Duration,
    ) -> io::Result<Self> {
        if argv.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "detector command is empty",
            ));
        }
        let child = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let supervisor = {
            let child = Arc::clone(&child);
            let stop = Arc::clone(&stop);
            let failed = Arc::clone(&failed);
            telemetry::spawn_thread("detector-supervisor", move || {
                supervise(&argv, &child, &stop, &failed, &shutdown, pause)
            })?
        };

        Ok(Self {
            child,
            stop,
            failed,
            supervisor: Some(supervisor),
        })
    }

    /// The detector exceeded its restart budget.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Kill the child and stop supervising it.
    pub fn kill(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.child.lock() {
            if let Some(child) = guard.as_mut() {
                info!("Stopping detector process (pid {})", child.id());
                let _ = child.kill();
            }
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DetectorProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn supervise(
    argv: &[String],
    slot: &Mutex<Option<Child>>,
    stop: &AtomicBool,
    failed: &AtomicBool,
    shutdown: &AtomicBool,
    pause: Duration,
) {
    let halted = || stop.load(Ordering::SeqCst) || shutdown.load(Ordering::SeqCst);
    let mut restarts = 0u32;

    while !halted() {
        if restarts > MAX_RESTARTS {
            error!("Detector process failed {MAX_RESTARTS} times, giving up");
            failed.store(true, Ordering::SeqCst);
            shutdown.store(true, Ordering::SeqCst);
            return;
        }

        info!("Starting detector process: {}", argv.join(" "));
        match Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(mut child) => {
                let stdout = child.stdout.take();
                let stderr = child.stderr.take();
                if let Some(stdout) = stdout {
                    let _ = telemetry::spawn_thread("detector-stdout", move || {
                        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                            debug!("detector: {}", line.trim_end());
                        }
                    });
                }
                let stderr_tail = Arc::new(Mutex::new(Vec::new()));
                if let Some(stderr) = stderr {
                    let tail = Arc::clone(&stderr_tail);
                    let _ = telemetry::spawn_thread("detector-stderr", move || {
                        collect_tail(stderr, &tail)
                    });
                }
                if let Ok(mut guard) = slot.lock() {
                    *guard = Some(child);
                }

                let status = wait_for_exit(slot, &halted);
                let stderr = stderr_tail
                    .lock()
                    .map(|tail| String::from_utf8_lossy(&tail).into_owned())
                    .unwrap_or_default();
                match status {
                    Ok(Some(status)) if status.success() => {
                        info!("Detector process exited, restarting")
                    }
                    Ok(Some(status)) => {
                        error!("Detector process failed ({status}): {}", stderr.trim())
                    }
                    Ok(None) => {}
                    Err(err) => error!("Failed to wait for detector process: {err}"),
                }
            }
            Err(err) => error!("Failed to start detector process {:?}: {err}", argv[0]),
        }

        if halted() {
            break;
        }
        warn!("Restarting detector process in {}ms", pause.as_millis());
        thread::sleep(pause);
        restarts += 1;
    }
    debug!("Detector supervisor stopped");
}

/// Poll until the child exits. Returns `Ok(None)` when the child was removed.
fn wait_for_exit(
    slot: &Mutex<Option<Child>>,
    halted: &dyn Fn() -> bool,
) -> io::Result<Option<std::process::ExitStatus>> {
    loop {
        {
            let mut guard = slot
                .lock()
                .map_err(|_| io::Error::other("detector child mutex poisoned"))?;
            let Some(child) = guard.as_mut() else {
                return Ok(None);
            };
            if halted() {
                let _ = child.kill();
            }
            if let Some(status) = child.try_wait()? {
                guard.take();
                return Ok(Some(status));
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Keep the last [`STDERR_TAIL_BYTES`] of `stderr` in `tail`.
fn collect_tail(mut stderr: impl Read, tail: &Mutex<Vec<u8>>) {
    let mut buf = [0u8; 1024];
    while let Ok(n) = stderr.read(&mut buf) {
        if n == 0 {
            break;
        }
        let Ok(mut tail) = tail.lock() else {
            break;
        };
        tail.extend_from_slice(&buf[..n]);
        if tail.len() > STDERR_TAIL_BYTES {
            let excess = tail.len() - STDERR_TAIL_BYTES;
            tail.drain(..excess);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn gives_up_after_repeated_failures() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut process =
            DetectorProcess::spawn_with_pause(sh("exit 1"), shutdown.clone(), Duration::from_millis(10))
                .unwrap();
        let deadline = Instant::now() + Duration::from_secs(20);
        while !process.has_failed() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(process.has_failed());
        assert!(shutdown.load(Ordering::SeqCst));
        process.kill();
    }

    #[test]
    fn kill_stops_a_running_detector() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut process =
            DetectorProcess::spawn_with_pause(sh("exec sleep 30"), shutdown.clone(), Duration::from_millis(10))
                .unwrap();
        thread::sleep(Duration::from_millis(300));
        let started = Instant::now();
        process.kill();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!process.has_failed());
        assert!(!shutdown.load(Ordering::SeqCst));
    }

    #[test]
    fn empty_command_is_rejected() {
        let shutdown = Arc::new(AtomicBool::new(false));
        assert!(DetectorProcess::spawn(Vec::new(), shutdown).is_err());
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let data = vec![b'x'; STDERR_TAIL_BYTES * 3];
        let tail = Mutex::new(Vec::new());
        collect_tail(&data[..], &tail);
        assert_eq!(tail.lock().unwrap().len(), STDERR_TAIL_BYTES);
    }
}
