//! systemd-backed implementation of the job-control seam.
//!
//! The scheduled jobs feeding the tick tree are systemd units (timers
//! and services). `is-active` exits zero iff the unit is active, which
//! is all the liveness query needs; `stop` surfaces systemd's own
//! diagnostic on failure.

use std::process::Command;

use ptgate_core::meta::{JobControl, JobControlError};

/// Job control through `systemctl`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemdJobControl {
    /// Talk to the per-user manager (`systemctl --user`).
    pub user: bool,
}

impl SystemdJobControl {
    fn command(&self) -> Command {
        let mut cmd = Command::new("systemctl");
        if self.user {
            cmd.arg("--user");
        }
        cmd
    }
}

impl JobControl for SystemdJobControl {
    fn is_alive(&self, job: &str) -> Result<bool, JobControlError> {
        let output = self
            .command()
            .args(["is-active", "--quiet", job])
            .output()
            .map_err(|e| JobControlError::Query {
                job: job.to_string(),
                detail: format!("cannot run systemctl: {e}"),
            })?;
        Ok(output.status.success())
    }

    fn stop(&self, job: &str) -> Result<(), JobControlError> {
        let output = self
            .command()
            .args(["stop", job])
            .output()
            .map_err(|e| JobControlError::Stop {
                job: job.to_string(),
                detail: format!("cannot run systemctl: {e}"),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(JobControlError::Stop {
                job: job.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
