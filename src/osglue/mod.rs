//! Thin OS glue: mounts, virtual IPs, and shell-command execution, grounded
//! on `original_source/lib/mount_lib.py` and `original_source/lib/run_lib.py`.

pub mod mount;
pub mod run_cmd;
pub mod vip;
