//! Mount-point management, grounded on `original_source/lib/mount_lib.py`.

use anyhow::{Context, Result};

use super::run_cmd::{run_cmd, run_cmd_result};

/// Whether `mount_path` appears as a mount point in `/proc/mounts`.
pub async fn is_mount(mount_path: &str) -> Result<bool> {
    let contents = tokio::fs::read_to_string("/proc/mounts")
        .await
        .context("read /proc/mounts")?;
    Ok(contents.lines().any(|line| line.split_whitespace().nth(1) == Some(mount_path)))
}

pub async fn mount(dev_path: &str, mount_path: &str) -> Result<(), String> {
    let result = run_cmd_result(&format!("mount {dev_path} {mount_path} ")).await;
    if result.ret_code == 0 {
        Ok(())
    } else {
        Err(result.stderr)
    }
}

/// Kills anything holding `mount_path` open before unmounting it, matching
/// the original's `fuser -km` then `umount` sequence. A no-op if the path
/// isn't currently mounted.
pub async fn umount(mount_path: &str) -> Result<(), String> {
    let mounted = is_mount(mount_path).await.map_err(|e| e.to_string())?;
    if !mounted {
        return Ok(());
    }
    let _ = run_cmd(&format!("fuser -km {mount_path}")).await;
    let result = run_cmd_result(&format!("umount {mount_path}")).await;
    if result.ret_code == 0 {
        Ok(())
    } else {
        Err(result.stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn root_is_always_mounted() {
        assert!(is_mount("/").await.unwrap());
    }

    #[tokio::test]
    async fn nonexistent_mount_point_is_reported_absent() {
        assert!(!is_mount("/no/such/clup-agent-test-mount-point").await.unwrap());
    }
}
