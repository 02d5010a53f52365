//! open-iscsi initiator driven through `iscsiadm`

use super::exec::{run, CommandOutput};
use super::target::TargetDescriptor;
use crate::domain::ports::IscsiInitiator;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

const ISCSIADM: &str = "iscsiadm";

/// Session or record already exists
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
/// No session or record matched
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

pub const DEVICE_WAIT_TRIES: u32 = 10;
pub const DEVICE_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Check whether a device node matching `path` exists
pub fn device_present(path: &str) -> bool {
    match glob::glob(path) {
        Ok(mut paths) => paths.any(|p| p.is_ok()),
        Err(e) => {
            warn!("Invalid device pattern {}: {}", path, e);
            false
        }
    }
}

fn node_args(target: &TargetDescriptor) -> Vec<String> {
    vec![
        "-m".into(),
        "node".into(),
        "-p".into(),
        target.portal_address(),
        "-T".into(),
        target.target.clone(),
    ]
}

fn with_args(target: &TargetDescriptor, extra: &[&str]) -> Vec<String> {
    let mut args = node_args(target);
    args.extend(extra.iter().map(|a| a.to_string()));
    args
}

/// [`IscsiInitiator`] backed by the host's open-iscsi tools
#[derive(Debug, Clone)]
pub struct IscsiAdm {
    device_wait_tries: u32,
    device_wait_interval: Duration,
}

impl Default for IscsiAdm {
    fn default() -> Self {
        Self {
            device_wait_tries: DEVICE_WAIT_TRIES,
            device_wait_interval: DEVICE_WAIT_INTERVAL,
        }
    }
}

impl IscsiAdm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device_wait(tries: u32, interval: Duration) -> Self {
        Self {
            device_wait_tries: tries.max(1),
            device_wait_interval: interval,
        }
    }

    /// Run iscsiadm, treating the listed exit codes as success
    async fn iscsiadm(&self, args: &[String], tolerated: &[i32]) -> Result<CommandOutput> {
        let out = run(ISCSIADM, args).await?;
        match out.code {
            Some(code) if code != 0 && tolerated.contains(&code) => {
                debug!("iscsiadm exit code {} tolerated", code);
                Ok(out)
            }
            _ => out.check(ISCSIADM),
        }
    }

    async fn update(&self, target: &TargetDescriptor, name: &str, value: &str) -> Result<()> {
        let args = with_args(target, &["-o", "update", "-n", name, "-v", value]);
        self.iscsiadm(&args, &[]).await.map(|_| ())
    }

    /// Poll until the device of `target` shows up
    pub async fn wait_for_device(&self, target: &TargetDescriptor) -> Result<()> {
        for attempt in 1..=self.device_wait_tries {
            if device_present(&target.device_path) {
                debug!("Device {} present after {} checks", target.device_path, attempt);
                return Ok(());
            }
            tokio::time::sleep(self.device_wait_interval).await;
        }
        Err(Error::Internal(format!(
            "device {} did not appear after {} checks",
            target.device_path, self.device_wait_tries
        )))
    }

    async fn login(&self, target: &TargetDescriptor) -> Result<()> {
        self.iscsiadm(&with_args(target, &["-o", "new"]), &[ISCSI_ERR_SESS_EXISTS])
            .await?;
        self.update(target, "node.session.auth.authmethod", "CHAP")
            .await?;
        self.update(target, "node.session.auth.username", &target.chap_user)
            .await?;
        self.update(target, "node.session.auth.password", &target.chap_pass)
            .await?;
        self.iscsiadm(&with_args(target, &["--login"]), &[ISCSI_ERR_SESS_EXISTS])
            .await?;
        self.wait_for_device(target).await
    }

    async fn logout(&self, target: &TargetDescriptor) -> Result<()> {
        self.iscsiadm(&with_args(target, &["--logout"]), &[ISCSI_ERR_NO_OBJS_FOUND])
            .await?;
        self.iscsiadm(
            &with_args(target, &["-o", "delete"]),
            &[ISCSI_ERR_NO_OBJS_FOUND],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IscsiInitiator for IscsiAdm {
    async fn attach(&self, target: &TargetDescriptor) -> Result<()> {
        match self.login(target).await {
            Ok(()) => {
                info!("Attached {} as {}", target.target, target.device_path);
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = self.logout(target).await {
                    warn!("Cleanup of session {} failed: {}", target.target, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn detach(&self, target: &TargetDescriptor) -> Result<()> {
        self.logout(target).await?;
        info!("Detached {}", target.target);
        Ok(())
    }
}
