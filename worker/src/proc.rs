use buildfarm_common::errors::*;
use futures_util::FutureExt;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::select;
use tokio::time;

const SIGKILL_DELAY: u64 = 10;
/// How long to sleep between checks when there's no deadline to watch
const IDLE_WAKEUP: u64 = 3600;

#[derive(Debug, Default)]
pub struct Options {
    pub timeout: Option<Duration>,
    pub size_limit: Option<usize>,
    pub envs: HashMap<String, String>,
}

#[derive(Debug)]
pub struct Output {
    pub success: bool,
    pub timed_out: bool,
    pub log: Vec<u8>,
}

impl Output {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.log)
    }
}

struct Capture {
    log: Vec<u8>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    size_limit: Option<usize>,
    sigterm_sent: Option<Instant>,
    truncated: bool,
    timed_out: bool,
}

impl Capture {
    fn new(opts: &Options) -> Capture {
        Capture {
            log: Vec::new(),
            // a deadline beyond what Instant can represent is no deadline at all
            deadline: opts.timeout.and_then(|timeout| Instant::now().checked_add(timeout)),
            timeout: opts.timeout,
            size_limit: opts.size_limit,
            sigterm_sent: None,
            truncated: false,
            timed_out: false,
        }
    }

    fn push_bytes(&mut self, mut slice: &[u8]) {
        if self.truncated {
            return;
        }

        if let Some(size_limit) = self.size_limit {
            let n = size_limit.saturating_sub(self.log.len()).min(slice.len());
            if n < slice.len() {
                warn!("Exceeding output limit: output={}, slice={}, limit={}", self.log.len(), slice.len(), size_limit);
                self.log.extend(&slice[..n]);
                self.log.extend(format!("\n\nTRUNCATED DUE TO SIZE LIMIT: {} bytes\n\n", size_limit).as_bytes());
                self.truncated = true;
                return;
            }
            slice = &slice[..n];
        }

        self.log.extend(slice);
    }

    fn kill(pid: u32, signal: Signal) -> Result<()> {
        // negative pid addresses the whole process group, grand-children included
        let pid = -(pid as i32);
        info!("Sending {} to child(pid={})", signal, pid);
        signal::kill(Pid::from_raw(pid), signal)?;
        Ok(())
    }

    /// Enforce the deadline and return how long we may sleep until the next check
    fn next_wakeup(&mut self, child: &Child) -> Result<Duration> {
        if let Some(sigterm_sent) = self.sigterm_sent {
            if sigterm_sent.elapsed() > Duration::from_secs(SIGKILL_DELAY) {
                if let Some(pid) = child.id() {
                    warn!("child(pid={}) didn't terminate {}s after SIGTERM, sending SIGKILL", pid, SIGKILL_DELAY);
                    Self::kill(pid, Signal::SIGKILL)?;
                }
            }
            return Ok(Duration::from_secs(1));
        }

        let Some(deadline) = self.deadline else {
            return Ok(Duration::from_secs(IDLE_WAKEUP));
        };

        if let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            return Ok(remaining.min(Duration::from_secs(IDLE_WAKEUP)));
        }

        warn!("child timed out, killing...");
        if let Some(pid) = child.id() {
            Self::kill(pid, Signal::SIGTERM)?;
        }
        self.sigterm_sent = Some(Instant::now());
        self.timed_out = true;
        let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
        self.log.extend(format!("\n\nTRUNCATED DUE TO TIMEOUT: {} seconds\n\n", secs).as_bytes());
        Ok(Duration::from_secs(1))
    }
}

/// Run an external command, capturing stdout and stderr into one log.
///
/// The child gets its own process group so a timeout takes down everything it spawned.
pub async fn run<I, S>(bin: &Path, args: I, opts: Options) -> Result<Output>
    where I: IntoIterator<Item = S> + fmt::Debug,
    S: AsRef<OsStr>,
{
    info!("Running {:?} {:?}", bin, args);
    let mut cmd = Command::new(bin);
    cmd
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .envs(&opts.envs);

    unsafe {
        cmd.pre_exec(|| {
            let pid = nix::unistd::getpid();
            if let Err(err) = nix::unistd::setpgid(pid, Pid::from_raw(0)) {
                warn!("Failed to create new process group: {:#?}", err);
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()
        .with_context(|| anyhow!("Failed to execute {:?}", bin))?;

    let mut child_stdout = child.stdout.take()
        .ok_or_else(|| format_err!("Failed to capture stdout of child"))?;
    let mut child_stderr = child.stderr.take()
        .ok_or_else(|| format_err!("Failed to capture stderr of child"))?;

    let mut buf_stdout = [0u8; 4096];
    let mut buf_stderr = [0u8; 4096];

    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut cap = Capture::new(&opts);
    let success = loop {
        let remaining = cap.next_wakeup(&child)?;

        if stdout_open || stderr_open {
            select! {
                n = child_stdout.read(&mut buf_stdout).fuse(), if stdout_open => {
                    let n = n?;
                    trace!("read stdout: {}", n);
                    if n == 0 {
                        stdout_open = false;
                    } else {
                        cap.push_bytes(&buf_stdout[..n]);
                    }
                },
                n = child_stderr.read(&mut buf_stderr).fuse(), if stderr_open => {
                    let n = n?;
                    trace!("read stderr: {}", n);
                    if n == 0 {
                        stderr_open = false;
                    } else {
                        cap.push_bytes(&buf_stderr[..n]);
                    }
                },
                _ = time::sleep(remaining).fuse() => continue,
            }
        } else {
            select! {
                status = child.wait().fuse() => {
                    let status = status?;
                    info!("{:?} exited with exit={}, captured {} bytes", bin, status, cap.log.len());
                    break status.success();
                }
                _ = time::sleep(remaining).fuse() => continue,
            }
        }
    };

    Ok(Output {
        success: success && !cap.timed_out,
        timed_out: cap.timed_out,
        log: cap.log,
    })
}
