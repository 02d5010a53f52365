//! Filesystem formatting and mounting with the host tools

use super::exec::run;
use crate::domain::ports::Mounter;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info, warn};

const PROC_MOUNTS: &str = "/proc/mounts";

/// blkid exit code when no filesystem signature is found
const BLKID_NOTHING_FOUND: i32 = 2;

/// Check whether `target` is a mount point in a `/proc/mounts` table
pub fn mounts_contain(table: &str, target: &str) -> bool {
    let target = target.trim_end_matches('/');
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| mount_point == target)
}

/// Arguments of `mount` for one device
pub fn mount_args(device: &str, target: &str, fs_type: &str, flags: &[String]) -> Vec<String> {
    let mut args = vec!["-t".to_string(), fs_type.to_string()];
    if !flags.is_empty() {
        args.push("-o".into());
        args.push(flags.join(","));
    }
    args.push(device.to_string());
    args.push(target.to_string());
    args
}

/// [`Mounter`] using blkid, mkfs, mount and umount
#[derive(Debug, Clone, Default)]
pub struct SystemMounter;

impl SystemMounter {
    pub fn new() -> Self {
        Self
    }

    async fn is_mounted(&self, target: &str) -> Result<bool> {
        let table = tokio::fs::read_to_string(PROC_MOUNTS).await?;
        Ok(mounts_contain(&table, target))
    }

    /// Filesystem on `device`, `None` for a blank device
    async fn detect_fs(&self, device: &str) -> Result<Option<String>> {
        let out = run("blkid", &["-p", "-s", "TYPE", "-o", "value", device]).await?;
        match out.code {
            Some(0) => Ok(Some(out.stdout.trim().to_string()).filter(|fs| !fs.is_empty())),
            Some(BLKID_NOTHING_FOUND) => Ok(None),
            _ => out.check("blkid").map(|_| None),
        }
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        let mkfs = format!("mkfs.{}", fs_type);
        let force = if fs_type.starts_with("ext") { "-F" } else { "-f" };
        run(&mkfs, &[force, device]).await?.check(&mkfs)?;
        info!("Created {} filesystem on {}", fs_type, device);
        Ok(())
    }
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        flags: &[String],
    ) -> Result<()> {
        if fs_type.is_empty() {
            return Err(Error::InvalidArgument("filesystem type is missing".into()));
        }
        if self.is_mounted(target).await? {
            debug!("{} is already mounted", target);
            return Ok(());
        }

        let fs = match self.detect_fs(device).await? {
            Some(existing) => {
                if existing != fs_type {
                    warn!(
                        "{} carries {} instead of {}, mounting as is",
                        device, existing, fs_type
                    );
                }
                existing
            }
            None => {
                self.format(device, fs_type).await?;
                fs_type.to_string()
            }
        };

        tokio::fs::create_dir_all(target).await?;
        run("mount", &mount_args(device, target, &fs, flags))
            .await?
            .check("mount")?;
        info!("Mounted {} at {}", device, target);
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<()> {
        if !Path::new(target).exists() || !self.is_mounted(target).await? {
            debug!("{} is not mounted", target);
            return Ok(());
        }
        run("umount", &[target]).await?.check("umount")?;
        info!("Unmounted {}", target);
        Ok(())
    }
}
