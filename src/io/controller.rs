//! Platform process-group control
//!
//! The supervisor never signals a bare pid: every server is started as the
//! leader of its own group so that helpers it forks (npx, uvx, shells) are
//! stopped with it. How a group is created and signalled is platform specific
//! and lives behind [`ProcessController`].

use std::fmt;
use std::io;
use tokio::process::Command;

/// Handle used to signal a whole process subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    /// Process group id on POSIX, process tree root pid on Windows
    pub id: u32,
}

/// OS primitives needed to supervise a process subtree
pub trait ProcessController: Send + Sync + fmt::Debug {
    /// Prepare a command so the child starts in its own group
    fn configure(&self, command: &mut Command);

    /// Build the group handle for a freshly spawned child
    fn attach(&self, pid: u32) -> io::Result<ProcessGroup>;

    /// Ask every process in the group to stop
    fn signal_graceful(&self, group: &ProcessGroup) -> io::Result<()>;

    /// Kill every process in the group
    fn kill_forcefully(&self, group: &ProcessGroup) -> io::Result<()>;
}

/// Controller for the platform this binary was built for
pub fn default_controller() -> Box<dyn ProcessController> {
    #[cfg(unix)]
    {
        Box::new(posix::PosixController)
    }
    #[cfg(windows)]
    {
        Box::new(windows::WindowsController)
    }
}

// ============================================================================
// POSIX
// ============================================================================

#[cfg(unix)]
mod posix {
    use super::{ProcessController, ProcessGroup};
    use std::io;
    use tokio::process::Command;
    use tracing::trace;

    /// Process groups plus `killpg`
    #[derive(Debug, Default)]
    pub struct PosixController;

    impl PosixController {
        fn signal_group(group: &ProcessGroup, signal: libc::c_int) -> io::Result<()> {
            let pgid = libc::pid_t::try_from(group.id)
                .map_err(|_| io::Error::other("process group id out of range"))?;

            // SAFETY: killpg only delivers a signal; pgid names a group we created
            let rc = unsafe { libc::killpg(pgid, signal) };
            if rc == 0 {
                trace!("Sent signal {} to process group {}", signal, pgid);
                return Ok(());
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                // Group already gone
                Ok(())
            } else {
                Err(err)
            }
        }
    }

    impl ProcessController for PosixController {
        fn configure(&self, command: &mut Command) {
            command.process_group(0);
        }

        fn attach(&self, pid: u32) -> io::Result<ProcessGroup> {
            // process_group(0) makes the child the leader: pgid == pid
            Ok(ProcessGroup { id: pid })
        }

        fn signal_graceful(&self, group: &ProcessGroup) -> io::Result<()> {
            Self::signal_group(group, libc::SIGTERM)
        }

        fn kill_forcefully(&self, group: &ProcessGroup) -> io::Result<()> {
            Self::signal_group(group, libc::SIGKILL)
        }
    }
}

// ============================================================================
// Windows
// ============================================================================

#[cfg(windows)]
mod windows {
    use super::{ProcessController, ProcessGroup};
    use std::io;
    use std::process::Stdio;
    use tokio::process::Command;
    use tracing::trace;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    /// New process groups plus `taskkill /T` over the process tree
    #[derive(Debug, Default)]
    pub struct WindowsController;

    impl WindowsController {
        fn taskkill(group: &ProcessGroup, force: bool) -> io::Result<()> {
            let pid = group.id.to_string();
            let mut args = vec!["/PID", pid.as_str(), "/T"];
            if force {
                args.push("/F");
            }

            let status = std::process::Command::new("taskkill")
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()?;
            trace!("taskkill {:?} exited with {}", args, status);

            // 128: process not found, already exited
            match status.code() {
                Some(0) | Some(128) => Ok(()),
                _ if !force => Ok(()),
                _ => Err(io::Error::other(format!("taskkill failed: {status}"))),
            }
        }
    }

    impl ProcessController for WindowsController {
        fn configure(&self, command: &mut Command) {
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        fn attach(&self, pid: u32) -> io::Result<ProcessGroup> {
            Ok(ProcessGroup { id: pid })
        }

        fn signal_graceful(&self, group: &ProcessGroup) -> io::Result<()> {
            Self::taskkill(group, false)
        }

        fn kill_forcefully(&self, group: &ProcessGroup) -> io::Result<()> {
            Self::taskkill(group, true)
        }
    }
}
