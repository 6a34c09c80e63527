//! PostgreSQL WAL helper (C8), grounded on
//! `original_source/lib/pg_mgr.py`.

use std::io::Read;
use std::net::SocketAddr;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tarpc::context;
use tracing::{error, info};

use crate::rpc::client::AgentClient;
use crate::rpc::types::RpcOutcome;

/// `wal_file_size` must be a power of two, and the LSN derived from bytes
/// `[8..16)` must encode the filename's trailing 16 hex chars.
pub fn is_valid_wal(wal_file_name: &str, data: &[u8]) -> bool {
    if wal_file_name.len() < 24 || data.len() < 512 {
        return false;
    }
    let only_file_name = &wal_file_name[wal_file_name.len() - 24..];

    let wal_file_size = u32::from_le_bytes(data[32..36].try_into().unwrap());
    if wal_file_size == 0 || (wal_file_size - 1) & wal_file_size != 0 {
        return false;
    }

    let lsn = u64::from_le_bytes(data[8..16].try_into().unwrap());
    let log_id = lsn >> 32;
    let seg_id = (lsn & 0xFFFF_FFFF) / wal_file_size as u64;
    let target = format!("{log_id:08X}{seg_id:08X}");

    only_file_name[8..24] == *target
}

fn wal_dir(pgdata: &Path) -> Result<PathBuf> {
    let pg_wal = pgdata.join("pg_wal");
    if pg_wal.exists() {
        return Ok(pg_wal);
    }
    let pg_xlog = pgdata.join("pg_xlog");
    if pg_xlog.exists() {
        return Ok(pg_xlog);
    }
    anyhow::bail!("wal path({}) not exist!", pg_wal.display())
}

fn is_wal_name(name: &str) -> bool {
    name.len() == 24 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

fn list_wal_files(pgdata: &Path) -> Result<Vec<PathBuf>> {
    let dir = wal_dir(pgdata)?;
    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
        .with_context(|| format!("read_dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(is_wal_name))
        .collect();
    files.sort();
    Ok(files)
}

fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut f = std::fs::File::open(path)?;
    let mut buf = vec![0u8; 512];
    let n = f.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

/// `get_last_valid_wal_file`: the lexicographically-last segment passing
/// the validity predicate.
pub fn get_last_valid_wal_file(pgdata: &Path) -> Result<Option<PathBuf>> {
    let files = list_wal_files(pgdata)?;
    let mut last = None;
    for file in files {
        let name = file.file_name().unwrap().to_string_lossy().to_string();
        match read_header(&file) {
            Ok(data) if is_valid_wal(&name, &data) => last = Some(file),
            Ok(_) => {}
            Err(e) => error!("open or read file {} error: {e}", file.display()),
        }
    }
    Ok(last)
}

/// `get_valid_wal_list_le_pt`: despite the name, returns valid segments
/// whose trailing-16-hex is at-or-*after* `pt`, kept as the public name
/// for wire compatibility; the real semantics are `valid_wal_segments_from`.
pub fn valid_wal_segments_from(pgdata: &Path, pt: &str) -> Result<Vec<PathBuf>> {
    let files = list_wal_files(pgdata)?;
    let mut out = Vec::new();
    for file in files {
        let name = file.file_name().unwrap().to_string_lossy().to_string();
        if name.len() < 16 {
            continue;
        }
        let tail16 = &name[name.len() - 16..];
        if tail16 < pt {
            continue;
        }
        let data = read_header(&file).with_context(|| format!("open or read file {}", file.display()))?;
        if is_valid_wal(&name, &data) {
            out.push(file);
        }
    }
    Ok(out)
}

/// Stops the local database (via `pg_ctl stop`, external to this module),
/// finds the standby's last valid segment, asks the primary for every
/// valid segment at-or-after that point, and copies each in full —
/// iterating to completion rather than returning after the first segment
/// (the original returns inside the copy loop, a known bug fixed here).
pub async fn cp_delayed_wal_from_pri(
    pri_addr: SocketAddr,
    secret: &str,
    pri_pgdata: &str,
    stb_pgdata: &Path,
) -> Result<()> {
    let wal_path = wal_dir(stb_pgdata)?;
    let owner = std::fs::metadata(stb_pgdata)?;
    let (uid, gid) = (owner.uid(), owner.gid());

    let last_wal = get_last_valid_wal_file(stb_pgdata)?
        .ok_or_else(|| anyhow::anyhow!("Can not find last wal in local"))?;
    let last_wal_name = last_wal.file_name().unwrap().to_string_lossy().to_string();
    let pt = last_wal_name[last_wal_name.len() - 16..].to_string();

    let client = AgentClient::connect(pri_addr, secret).await?;
    let pri_wal_list = match client
        .inner
        .pg_get_valid_wal_list_le_pt(context::current(), pri_pgdata.to_string(), pt)
        .await?
    {
        RpcOutcome::Ok(list) => list,
        RpcOutcome::Domain(_, msg) | RpcOutcome::Transient(msg) => anyhow::bail!(msg),
    };

    let mut pri_wal_list = pri_wal_list;
    pri_wal_list.sort();

    for pri_wal_file in pri_wal_list {
        let tail24 = &pri_wal_file[pri_wal_file.len() - 24..];
        let dst_wal_file = wal_path.join(tail24);
        info!("copy {pri_wal_file} from {pri_addr} to {}...", dst_wal_file.display());

        use std::os::unix::fs::OpenOptionsExt;
        let mut dst = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(&dst_wal_file)
            .with_context(|| format!("open {}", dst_wal_file.display()))?;

        let mut offset: u64 = 0;
        loop {
            let data = match client
                .inner
                .os_read_file(context::current(), pri_wal_file.clone(), offset, 4 * 1024 * 1024)
                .await?
            {
                RpcOutcome::Ok(data) => data,
                RpcOutcome::Domain(_, msg) | RpcOutcome::Transient(msg) => anyhow::bail!(msg),
            };
            if data.is_empty() {
                break;
            }
            use std::io::Write;
            dst.write_all(&data)?;
            offset += data.len() as u64;
        }
        nix::unistd::chown(&dst_wal_file, Some(nix::unistd::Uid::from_raw(uid)), Some(nix::unistd::Gid::from_raw(gid)))
            .with_context(|| format!("chown {}", dst_wal_file.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_header(segsize: u32, lsn: u64) -> Vec<u8> {
        let mut data = vec![0u8; 512];
        data[32..36].copy_from_slice(&segsize.to_le_bytes());
        data[8..16].copy_from_slice(&lsn.to_le_bytes());
        data
    }

    #[test]
    fn valid_header_matches_filename() {
        // segsize=16MiB, LSN=0x2CC000000.
        let segsize = 16 * 1024 * 1024u32;
        let lsn = 0x2_CC00_0000u64;
        let data = build_header(segsize, lsn);
        assert!(is_valid_wal("0000000100000002000000CC", &data));
    }

    #[test]
    fn mismatched_lsn_is_invalid() {
        let segsize = 16 * 1024 * 1024u32;
        let lsn = 0x2_CD00_0000u64;
        let data = build_header(segsize, lsn);
        assert!(!is_valid_wal("0000000100000002000000CC", &data));
    }

    #[test]
    fn non_power_of_two_segsize_is_invalid() {
        let data = build_header(3 * 1024 * 1024, 0x2_CC00_0000u64);
        assert!(!is_valid_wal("0000000100000002000000CC", &data));
    }

    #[test]
    fn short_filename_is_invalid() {
        let data = build_header(16 * 1024 * 1024, 0);
        assert!(!is_valid_wal("short", &data));
    }
}
