use log::{debug, error, info, warn};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use sysinfo::{Pid, Signal, System};

use crate::error::{Error, Result};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);
// How long to wait for threads after the forced kill before detaching them.
const KILL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

// Threads belonging to one started process. On unix the child leads its own
// process group, so `pid` is also the group id.
struct RunHandle {
    child: Arc<Mutex<Child>>,
    pid: u32,
    waiter: JoinHandle<()>,
    readers: Vec<JoinHandle<()>>,
    abandoned: Arc<AtomicBool>,
}

impl RunHandle {
    fn readers_finished(&self) -> bool {
        self.readers.iter().all(JoinHandle::is_finished)
    }

    fn is_finished(&self) -> bool {
        self.waiter.is_finished() && self.readers_finished()
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        while !self.is_finished() && Instant::now() < deadline {
            thread::sleep(STOP_POLL_INTERVAL);
        }
        self.is_finished()
    }

    fn terminate(&self) {
        // Holding the lock keeps the waiter from reaping, so the pid stays valid.
        let mut child = lock(&self.child);
        let alive = matches!(child.try_wait(), Ok(None));
        if (alive || !self.readers_finished()) && signal_group(self.pid, "TERM") {
            return;
        }
        if alive && !terminate(self.pid) {
            let _ = child.kill();
        }
    }

    fn kill(&self) {
        let mut child = lock(&self.child);
        let alive = matches!(child.try_wait(), Ok(None));
        if alive || !self.readers_finished() {
            signal_group(self.pid, "KILL");
        }
        if alive {
            if let Err(e) = child.kill() {
                warn!("failed to kill core (pid {}): {}", self.pid, e);
            }
        }
    }

    // Joins what has finished; anything still blocked is detached.
    fn finish(self) {
        self.abandoned.store(true, Ordering::SeqCst);
        if self.waiter.is_finished() {
            if self.waiter.join().is_err() {
                warn!("core waiter thread panicked");
            }
        } else {
            warn!("core (pid {}) waiter still running, detaching", self.pid);
        }
        for reader in self.readers {
            let name = reader.thread().name().unwrap_or("reader").to_string();
            if !reader.is_finished() {
                warn!("{} still blocked on an open pipe, detaching", name);
                continue;
            }
            if reader.join().is_err() {
                warn!("{} thread panicked", name);
            }
        }
    }
}

/// Runs one external proxy core and captures its output.
///
/// Each run has three threads: one waiting for the process to exit and one per
/// output stream. Output lines go into a queue drained by [`ProcessSupervisor::get_logs`].
pub struct ProcessSupervisor {
    program: String,
    args: Vec<String>,
    stop_timeout: Duration,
    state: Mutex<SupervisorState>,
    run: Mutex<Option<RunHandle>>,
    stopping: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    log_tx: Sender<String>,
    log_rx: Mutex<Receiver<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessSupervisor {
    /// `command_line[0]` is the program, the rest its arguments.
    pub fn new<I, S>(command_line: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts = command_line.into_iter().map(Into::into);
        let program = parts.next().unwrap_or_default();
        let args = parts.collect();
        let (log_tx, log_rx) = mpsc::channel();
        Self {
            program,
            args,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            state: Mutex::new(SupervisorState::Idle),
            run: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(AtomicBool::new(false)),
            log_tx,
            log_rx: Mutex::new(log_rx),
        }
    }

    /// `<core> -c <config>`
    pub fn for_config(core_path: impl AsRef<Path>, config_path: impl AsRef<Path>) -> Self {
        Self::new([
            core_path.as_ref().to_string_lossy().into_owned(),
            "-c".to_string(),
            config_path.as_ref().to_string_lossy().into_owned(),
        ])
    }

    /// Grace period between the terminate signal and a forced kill.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn command_line(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    pub fn state(&self) -> SupervisorState {
        *lock(&self.state)
    }

    /// True once the current run's process has exited, whether stopped or not.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state() == SupervisorState::Running && !self.has_exited()
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.run).as_ref().map(|r| r.pid)
    }

    /// Spawns the process with piped output. Allowed from `Idle` and `Stopped`.
    pub fn start(&self) -> Result<()> {
        let mut run = lock(&self.run);
        if run.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command.spawn().map_err(|e| {
            error!("failed to start {}: {}", self.program, e);
            Error::Spawn {
                program: self.program.clone(),
                source: e,
            }
        })?;
        let pid = child.id();
        info!("core started, pid: {}", pid);

        self.stopping.store(false, Ordering::SeqCst);
        self.exited.store(false, Ordering::SeqCst);

        let child = Arc::new(Mutex::new(child));
        match self.spawn_threads(child.clone(), pid) {
            Ok(handle) => {
                *run = Some(handle);
                *lock(&self.state) = SupervisorState::Running;
                Ok(())
            }
            Err(e) => {
                error!("failed to start supervisor threads: {}", e);
                let mut child = lock(&child);
                let _ = child.kill();
                let _ = child.wait();
                Err(Error::Spawn {
                    program: self.program.clone(),
                    source: e,
                })
            }
        }
    }

    fn spawn_threads(&self, child: Arc<Mutex<Child>>, pid: u32) -> std::io::Result<RunHandle> {
        let (stdout, stderr) = {
            let mut child = lock(&child);
            (child.stdout.take(), child.stderr.take())
        };
        let abandoned = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            readers.push(self.spawn_reader(stdout, Stream::Stdout, abandoned.clone())?);
        }
        if let Some(stderr) = stderr {
            readers.push(self.spawn_reader(stderr, Stream::Stderr, abandoned.clone())?);
        }
        let waiter = self.spawn_waiter(child.clone(), pid)?;
        Ok(RunHandle {
            child,
            pid,
            waiter,
            readers,
            abandoned,
        })
    }

    // Readers drain their stream to EOF so nothing written before termination is
    // lost; signalling the process group closes the pipes and ends them. A reader
    // detached by `stop` drops whatever it reads afterwards.
    fn spawn_reader<R>(
        &self,
        stream: R,
        source: Stream,
        abandoned: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>>
    where
        R: Read + Send + 'static,
    {
        let tx = self.log_tx.clone();
        thread::Builder::new()
            .name(format!("core-{}", source.as_str()))
            .spawn(move || {
                let mut reader = BufReader::new(stream);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf) {
                        Ok(0) => break,
                        Ok(_) if abandoned.load(Ordering::SeqCst) => break,
                        Ok(_) => {
                            let line = String::from_utf8_lossy(&buf).trim().to_string();
                            match source {
                                Stream::Stdout => info!("[core] {}", line),
                                Stream::Stderr => warn!("[core] {}", line),
                            }
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("{} reader stopped: {}", source.as_str(), e);
                            break;
                        }
                    }
                }
                debug!("{} reader finished", source.as_str());
            })
    }

    fn spawn_waiter(&self, child: Arc<Mutex<Child>>, pid: u32) -> std::io::Result<JoinHandle<()>> {
        let stopping = self.stopping.clone();
        let exited = self.exited.clone();
        thread::Builder::new()
            .name("core-waiter".to_string())
            .spawn(move || loop {
                let status = lock(&child).try_wait();
                match status {
                    Ok(Some(status)) => {
                        if stopping.load(Ordering::SeqCst) {
                            info!("core (pid {}) exited: {}", pid, status);
                        } else {
                            error!("core (pid {}) exited unexpectedly: {}", pid, status);
                        }
                        exited.store(true, Ordering::SeqCst);
                        break;
                    }
                    Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                    Err(e) => {
                        error!("failed to wait for core (pid {}): {}", pid, e);
                        exited.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            })
    }

    /// Terminates the process (and anything it spawned) and joins all three threads.
    ///
    /// Escalates to a forced kill after the stop timeout; threads still blocked after
    /// that are detached, so this never waits much longer than the timeout. A no-op
    /// when nothing runs; always ends in `Stopped`.
    pub fn stop(&self) {
        let Some(run) = lock(&self.run).take() else {
            debug!("stop requested but no core is running");
            *lock(&self.state) = SupervisorState::Stopped;
            return;
        };
        *lock(&self.state) = SupervisorState::Stopping;
        self.stopping.store(true, Ordering::SeqCst);
        info!("stopping core (pid: {})...", run.pid);

        run.terminate();
        if !run.wait_until(Instant::now() + self.stop_timeout) {
            warn!(
                "core (pid {}) still running {:?} after terminate, killing",
                run.pid, self.stop_timeout
            );
            run.kill();
            run.wait_until(Instant::now() + KILL_GRACE);
        }
        run.finish();
        *lock(&self.state) = SupervisorState::Stopped;
        info!("core stopped");
    }

    /// Every line queued so far, without blocking. Call again for later lines.
    pub fn get_logs(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::from_fn(move || lock(&self.log_rx).try_recv().ok())
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Signals every process in the group led by `pgid`. False if that failed.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: &str) -> bool {
    let status = Command::new("kill")
        .args([format!("-{}", signal), "--".to_string(), format!("-{}", pgid)])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("kill -{} -{} failed: {}", signal, pgid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: &str) -> bool {
    false
}

/// Sends SIGTERM (or the platform's closest equivalent). False if unsupported.
fn terminate(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return false;
    }
    sys.process(pid)
        .and_then(|p| p.kill_with(Signal::Term))
        .unwrap_or(false)
}
