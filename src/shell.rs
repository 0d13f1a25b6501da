use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom},
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capture { Stdout, Both }

/// Anonymous, already-unlinked capture file plus the handle given to the child.
fn capture_file(what: &str) -> Result<(File, Stdio)> {
    let f = tempfile::tempfile().with_context(|| format!("create {what} capture file"))?;
    let child = f.try_clone().with_context(|| format!("clone {what} capture file"))?;
    Ok((f, Stdio::from(child)))
}

fn drain(file: &mut Option<File>, into: &mut String) {
    if let Some(f) = file {
        let mut buf = Vec::new();
        if f.seek(SeekFrom::Start(0)).is_ok() {
            let _ = f.read_to_end(&mut buf);
        }
        into.push_str(&String::from_utf8_lossy(&buf));
    }
}

/// Run a command (argument vector, no shell) with a timeout.
///
/// Notes:
/// - Uses temp files for stdout/stderr capture to avoid deadlocks with large outputs.
/// - On timeout, kills the process and returns an error.
pub fn run_timeout(cmd: &str, args: &[&str], capture: Capture, timeout: Duration) -> Result<(i32, String)> {
    info!("exec: {} {}", cmd, args.join(" "));

    let mut c = Command::new(cmd);
    c.args(args).stdin(Stdio::null());

    let (out, child_out) = capture_file("stdout")?;
    c.stdout(child_out);
    let mut stdout_file = Some(out);
    let mut stderr_file = None;
    match capture {
        Capture::Stdout => {
            c.stderr(Stdio::null());
        }
        Capture::Both => {
            let (err, child_err) = capture_file("stderr")?;
            c.stderr(child_err);
            stderr_file = Some(err);
        }
    }

    let mut child = c.spawn().map_err(|e| anyhow!("failed to spawn {cmd}: {e}"))?;
    let start = Instant::now();

    loop {
        if let Some(st) = child.try_wait().map_err(|e| anyhow!("failed to wait {cmd}: {e}"))? {
            let code = st.code().unwrap_or(-1);
            let mut s = String::new();
            drain(&mut stdout_file, &mut s);
            drain(&mut stderr_file, &mut s);
            debug!("exit={code} output_len={}", s.len());
            return Ok((code, s));
        }

        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();

            let mut s = String::new();
            drain(&mut stdout_file, &mut s);
            drain(&mut stderr_file, &mut s);

            return Err(anyhow!(
                "command timeout after {:?}: {cmd} {}\n{}",
                timeout,
                args.join(" "),
                s
            ));
        }

        thread::sleep(Duration::from_millis(20));
    }
}

/// Spawn a long-running program detached from our session.
///
/// stdin is null, stdout and stderr are appended to `log_path`.
pub fn spawn_detached(program: &str, args: &[&str], log_path: &Path) -> Result<u32> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
    }
    let logf = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open log {}", log_path.display()))?;
    let logf_err = logf.try_clone().with_context(|| "clone log file")?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(logf))
        .stderr(Stdio::from(logf_err));

    unsafe {
        cmd.pre_exec(|| {
            let _ = libc::setsid();
            Ok(())
        });
    }

    let child = cmd.spawn().with_context(|| format!("spawn {program}"))?;
    info!("spawned {} pid={} log={}", program, child.id(), log_path.display());
    Ok(child.id())
}

/// Spawn a foreground helper whose stdout we read line by line.
pub fn spawn_piped(program: &str, args: &[&str]) -> Result<Child> {
    info!("exec(piped): {} {}", program, args.join(" "));
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawn {program}"))
}

pub fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).is_dir()
}

/// Send a signal; returns false if the process does not exist.
pub fn signal(pid: u32, sig: libc::c_int) -> bool {
    if pid <= 1 {
        return false;
    }
    unsafe { libc::kill(pid as libc::pid_t, sig) == 0 }
}
