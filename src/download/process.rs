//! Supervision of one external downloader process
//!
//! stdout and stderr are drained by two independent background tasks, so the
//! child can never block on a full pipe while the job is busy elsewhere. The
//! job pulls complete lines from the supervisor without waiting.

use super::error::DownloadError;
use super::options::CommandSpec;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Observed state of the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exit code; a negative value is the signal that killed the process
    Exited(i32),
}

pub struct ProcessSupervisor {
    child: Child,
    pid: Option<u32>,
    program: String,
    stdout_rx: mpsc::UnboundedReceiver<String>,
    stderr_rx: mpsc::UnboundedReceiver<String>,
    readers: Vec<JoinHandle<()>>,
    exit_code: Option<i32>,
    terminated: bool,
    group_signalled: bool,
}

impl ProcessSupervisor {
    /// Start the process with piped stdout/stderr
    ///
    /// On unix the child leads its own process group so that
    /// [`ProcessSupervisor::terminate`] also reaches helpers it spawned.
    pub fn spawn(spec: &CommandSpec) -> Result<Self, DownloadError> {
        let program = spec.display_name();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(|source| DownloadError::Spawn {
            program: program.clone(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(DownloadError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(DownloadError::MissingPipe("stderr"))?;

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let readers = vec![
            spawn_line_reader(stdout, stdout_tx, "stdout"),
            spawn_line_reader(stderr, stderr_tx, "stderr"),
        ];

        let pid = child.id();
        tracing::debug!("Spawned {} (pid {:?})", program, pid);

        Ok(Self {
            child,
            pid,
            program,
            stdout_rx,
            stderr_rx,
            readers,
            exit_code: None,
            terminated: false,
            group_signalled: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next complete stdout line, if one is buffered
    pub fn read_stdout_line(&mut self) -> Option<String> {
        self.stdout_rx.try_recv().ok()
    }

    /// Next complete stderr line, if one is buffered
    pub fn read_stderr_line(&mut self) -> Option<String> {
        self.stderr_rx.try_recv().ok()
    }

    pub fn poll(&mut self) -> ProcessState {
        if let Some(code) = self.exit_code {
            return ProcessState::Exited(code);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let code = exit_code(status);
                self.exit_code = Some(code);
                tracing::debug!("{} exited with {}", self.program, code);
                ProcessState::Exited(code)
            }
            Ok(None) => ProcessState::Running,
            Err(e) => {
                tracing::warn!("Failed to query {} status: {}", self.program, e);
                self.exit_code = Some(-1);
                ProcessState::Exited(-1)
            }
        }
    }

    /// Kill the process and everything in its group
    ///
    /// The group is signalled even when the leader has already exited, since
    /// helpers it started (muxers, post-processors) may still be running.
    /// Safe to call repeatedly.
    pub fn terminate(&mut self) {
        if !self.group_signalled {
            self.group_signalled = true;
            if let Some(pid) = self.pid {
                kill_tree(pid);
            }
        }

        if self.terminated || self.poll() != ProcessState::Running {
            return;
        }
        self.terminated = true;
        if let Err(e) = self.child.start_kill() {
            tracing::trace!("start_kill on {}: {}", self.program, e);
        }
        tracing::debug!("Terminated {} (pid {:?})", self.program, self.pid);
    }

    /// True once [`ProcessSupervisor::terminate`] signalled a running leader
    pub fn was_terminated(&self) -> bool {
        self.terminated
    }

    /// Wait for the child to exit and return its code
    pub async fn wait(&mut self) -> i32 {
        if let Some(code) = self.exit_code {
            return code;
        }
        let code = match self.child.wait().await {
            Ok(status) => exit_code(status),
            Err(e) => {
                tracing::warn!("Failed to wait for {}: {}", self.program, e);
                -1
            }
        };
        self.exit_code = Some(code);
        code
    }

    /// Wait (bounded) for both readers to hit EOF and return unread lines
    pub async fn drain_remaining(&mut self, timeout: Duration) -> (Vec<String>, Vec<String>) {
        let readers = std::mem::take(&mut self.readers);
        let abort_handles: Vec<_> = readers.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(timeout, futures_util::future::join_all(readers))
            .await
            .is_err()
        {
            tracing::debug!("Output of {} still open after {:?}", self.program, timeout);
            for handle in abort_handles {
                handle.abort();
            }
        }

        let mut stdout = Vec::new();
        while let Ok(line) = self.stdout_rx.try_recv() {
            stdout.push(line);
        }
        let mut stderr = Vec::new();
        while let Ok(line) = self.stderr_rx.try_recv() {
            stderr.push(line);
        }
        (stdout, stderr)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            self.terminate();
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn spawn_line_reader<R>(
    stream: R,
    tx: mpsc::UnboundedSender<String>,
    name: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Reading {} failed: {}", name, e);
                    break;
                }
            }
        }
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

#[cfg(unix)]
fn kill_tree(pid: u32) {
    // SAFETY: killpg only sends a signal; the group was created at spawn
    let ret = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if ret != 0 {
        tracing::trace!(
            "killpg({}) failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(windows)]
fn kill_tree(pid: u32) {
    let result = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(e) = result {
        tracing::trace!("taskkill for {} failed: {}", pid, e);
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_tree(_pid: u32) {}
