use std::{io, process::Command};

/// Sends a termination signal to `pid`. `graceful` maps to SIGTERM / plain taskkill,
/// otherwise SIGKILL / taskkill /F.
#[cfg(unix)]
pub fn signal_pid(pid: u32, graceful: bool) -> io::Result<()> {
    let sig = if graceful { "-TERM" } else { "-9" };
    let status = Command::new("kill").args([sig, &pid.to_string()]).status()?;
    if !status.success() {
        return Err(io::Error::other(format!("kill {sig} {pid} exit={status}")));
    }
    Ok(())
}

#[cfg(windows)]
pub fn signal_pid(pid: u32, graceful: bool) -> io::Result<()> {
    let pid_s = pid.to_string();
    let mut args = vec!["/PID", pid_s.as_str(), "/T"];
    if !graceful {
        args.push("/F");
    }
    let status = Command::new("taskkill").args(&args).status()?;
    if !status.success() {
        return Err(io::Error::other(format!("taskkill {pid} exit={status}")));
    }
    Ok(())
}
