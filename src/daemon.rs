//! Detaching from the controlling terminal.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::sys::stat::{Mode, umask};
use nix::unistd::{ForkResult, chdir, fork, setsid};

use crate::error::Result;

/// Classic double-step daemonization: fork and exit the parent, start a
/// new session, move to `/`, and point the standard descriptors at
/// `/dev/null`.
pub fn daemonize() -> Result<()> {
    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    umask(Mode::empty());
    setsid().map_err(io::Error::from)?;
    chdir("/").map_err(io::Error::from)?;

    let devnull = File::options().read(true).write(true).open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    for std_fd in 0..3 {
        if unsafe { libc::dup2(fd, std_fd) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Record the daemon's PID, to be read by service managers.
pub fn write_pidfile(path: &Path) -> Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_holds_our_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ndproxyd.pid");
        write_pidfile(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim(), std::process::id().to_string());
    }
}
