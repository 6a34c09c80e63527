//! Structured config-file mutation (C9).
//!
//! Grounded on `original_source/lib/set_cfg_lib.py`: edit `key = value` /
//! `key value` style files in place (postgresql.conf, sysctl.conf, ...),
//! regex-line rewrites for fixed-format files (limits.conf), tagged-block
//! replacement for files with a managed section, and an include-aware
//! reader for `postgresql.conf`-style `include '<path>'` directives.

use std::collections::HashMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;

/// Equal-sign-separated (`postgresql.conf`) vs. whitespace-separated
/// (`/etc/sysctl.conf`) config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliType {
    Equals,
    Whitespace,
}

fn backup_file(config_file: &Path, stamp: &str) -> Result<()> {
    let bak_path = config_file.with_file_name(format!(
        "{}.{stamp}",
        config_file.file_name().unwrap().to_string_lossy()
    ));
    std::fs::copy(config_file, &bak_path)
        .with_context(|| format!("backup {} to {}", config_file.display(), bak_path.display()))?;
    let meta = std::fs::metadata(config_file)?;
    nix::unistd::chown(
        &bak_path,
        Some(nix::unistd::Uid::from_raw(meta.uid())),
        Some(nix::unistd::Gid::from_raw(meta.gid())),
    )
    .with_context(|| format!("chown {}", bak_path.display()))?;
    std::fs::set_permissions(&bak_path, std::fs::Permissions::from_mode(meta.mode()))?;
    Ok(())
}

fn item_name_and_value(line: &str, deli: DeliType) -> Option<(String, String)> {
    let cells: Vec<&str> = match deli {
        DeliType::Equals => line.splitn(2, '=').collect(),
        DeliType::Whitespace => line.splitn(2, char::is_whitespace).collect(),
    };
    if cells.len() < 2 {
        return None;
    }
    Some((cells[0].trim().to_string(), cells[1].trim().to_string()))
}

fn render(deli: DeliType, item_name: &str, value: &str) -> String {
    match deli {
        DeliType::Equals => format!("{item_name} = {value}"),
        DeliType::Whitespace => format!("{item_name} {value}"),
    }
}

/// Rewrite a `k = v` (or `k v`) config file against `modify_item_dict`:
///
/// 1. a live (uncommented) match is replaced in place;
/// 2. absent a live match, a commented-out match gets the new line appended
///    right after it;
/// 3. absent either, the item is appended at the end, sorted by key.
///
/// `backup_stamp`, if set, is appended as a `.<stamp>` suffix to a copy of
/// the original file made before it's overwritten, with the original's
/// owner and mode (the caller supplies the stamp since timestamps can't be
/// taken inside this module — see the crate's ban on `SystemTime::now()`
/// inside test-replayable code paths).
pub fn modify_config_type1(
    config_file: &Path,
    modify_item_dict: &HashMap<String, String>,
    deli: DeliType,
    backup_stamp: Option<&str>,
) -> Result<()> {
    let contents = std::fs::read_to_string(config_file)
        .with_context(|| format!("read {}", config_file.display()))?;
    let ori_lines: Vec<&str> = contents.lines().collect();

    let mut live_line_of: HashMap<String, usize> = HashMap::new();
    let mut commented_line_of: HashMap<String, usize> = HashMap::new();

    for (i, raw) in ori_lines.iter().enumerate() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix('#') {
            if let Some((name, _)) = item_name_and_value(rest.trim_start(), deli) {
                if modify_item_dict.contains_key(&name) {
                    commented_line_of.insert(name, i);
                }
            }
            continue;
        }
        if let Some((name, _)) = item_name_and_value(line, deli) {
            if modify_item_dict.contains_key(&name) {
                live_line_of.insert(name, i);
            }
        }
    }

    // A live match wins over a commented one for the same key.
    commented_line_of.retain(|name, _| !live_line_of.contains_key(name));

    let live_at: HashMap<usize, String> = live_line_of.iter().map(|(k, v)| (*v, k.clone())).collect();
    let commented_at: HashMap<usize, String> = commented_line_of.iter().map(|(k, v)| (*v, k.clone())).collect();

    let mut new_lines: Vec<String> = Vec::with_capacity(ori_lines.len() + modify_item_dict.len());
    for (i, raw) in ori_lines.iter().enumerate() {
        let line = raw.trim();
        if let Some(name) = live_at.get(&i) {
            new_lines.push(render(deli, name, &modify_item_dict[name]));
        } else if let Some(name) = commented_at.get(&i) {
            new_lines.push(line.to_string());
            new_lines.push(render(deli, name, &modify_item_dict[name]));
        } else {
            new_lines.push(line.to_string());
        }
    }

    let mut untouched: Vec<&String> = modify_item_dict
        .keys()
        .filter(|k| !live_line_of.contains_key(*k) && !commented_line_of.contains_key(*k))
        .collect();
    untouched.sort();
    for name in untouched {
        new_lines.push(render(deli, name, &modify_item_dict[name]));
    }

    if let Some(stamp) = backup_stamp {
        backup_file(config_file, stamp)?;
    }

    new_lines.push(String::new());
    std::fs::write(config_file, new_lines.join("\n"))
        .with_context(|| format!("write {}", config_file.display()))
}

/// Rewrite a config file by regex-matching each line against the keys of
/// `modify_item_dict` (a `{regex: replacement_line}` map) and substituting
/// the whole line on a match. Unmatched lines pass through unchanged;
/// if `append_if_not` and a pattern matched nothing in the whole file, its
/// replacement line is appended at the end.
pub fn modify_config_type2(
    config_file: &Path,
    modify_item_dict: &[(Regex, String)],
    backup_stamp: Option<&str>,
    append_if_not: bool,
) -> Result<()> {
    let contents = std::fs::read_to_string(config_file)
        .with_context(|| format!("read {}", config_file.display()))?;

    let mut matched = vec![false; modify_item_dict.len()];
    let mut new_lines: Vec<String> = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        let mut hit = false;
        for (idx, (re, replacement)) in modify_item_dict.iter().enumerate() {
            if re.is_match(line) {
                new_lines.push(replacement.clone());
                matched[idx] = true;
                hit = true;
                break;
            }
        }
        if !hit {
            new_lines.push(line.to_string());
        }
    }

    if let Some(stamp) = backup_stamp {
        backup_file(config_file, stamp)?;
    }

    if append_if_not {
        for (idx, (_, replacement)) in modify_item_dict.iter().enumerate() {
            if !matched[idx] {
                new_lines.push(replacement.clone());
            }
        }
    }

    new_lines.push(String::new());
    std::fs::write(config_file, new_lines.join("\n"))
        .with_context(|| format!("write {}", config_file.display()))
}

fn tag_lines(tag_line: &str) -> (String, String) {
    (
        format!("{tag_line} **do not modify** begin"),
        format!("{tag_line} **do not modify** end"),
    )
}

struct SplitByTag<'a> {
    head: Vec<&'a str>,
    tail: Vec<&'a str>,
    tag_is_begin: bool,
    tag_is_end: bool,
}

fn split_by_tag<'a>(lines: &[&'a str], begin_tag_line: &str, end_tag_line: &str) -> SplitByTag<'a> {
    let mut head = Vec::new();
    let mut tail = Vec::new();
    let mut tag_is_begin = false;
    let mut tag_is_end = false;
    for &line in lines {
        if line == begin_tag_line {
            tag_is_begin = true;
            continue;
        }
        if line == end_tag_line {
            tag_is_end = true;
            continue;
        }
        if !tag_is_begin {
            head.push(line);
        }
        if tag_is_begin && tag_is_end {
            tail.push(line);
        }
    }
    SplitByTag { head, tail, tag_is_begin, tag_is_end }
}

/// Replace the tagged block in `file_name`, or append it at the end if the
/// tag isn't present yet — used for `/etc/security/limits.conf`-style
/// files where the managed block must stay together but other content
/// around it is left alone.
pub fn config_file_set_tag_content(file_name: &Path, tag_line: &str, set_contents: &str) -> Result<()> {
    let (begin_tag_line, end_tag_line) = tag_lines(tag_line);
    let content = std::fs::read_to_string(file_name).with_context(|| format!("read {}", file_name.display()))?;
    let lines: Vec<&str> = content.split('\n').collect();
    let split = split_by_tag(&lines, &begin_tag_line, &end_tag_line);

    let mut out = split.head.join("\n");
    out.push('\n');
    out.push_str(&begin_tag_line);
    out.push('\n');
    out.push_str(set_contents);
    out.push('\n');
    out.push_str(&end_tag_line);
    out.push('\n');
    if !split.tail.is_empty() {
        out.push_str(&split.tail.join("\n"));
        out.push('\n');
    }
    std::fs::write(file_name, out).with_context(|| format!("write {}", file_name.display()))
}

/// Same as [`config_file_set_tag_content`], but a first-time insertion goes
/// at the *head* of the file — used for shell rc files like
/// `~postgres/.bashrc` where the managed block must run before anything
/// that follows it.
pub fn config_file_set_tag_in_head(file_name: &Path, tag_line: &str, set_contents: &str) -> Result<()> {
    let (begin_tag_line, end_tag_line) = tag_lines(tag_line);
    let content = std::fs::read_to_string(file_name).with_context(|| format!("read {}", file_name.display()))?;
    let lines: Vec<&str> = content.split('\n').collect();
    let split = split_by_tag(&lines, &begin_tag_line, &end_tag_line);

    let out = if !split.tag_is_begin && !split.tag_is_end {
        let mut out = begin_tag_line.clone();
        out.push('\n');
        out.push_str(set_contents);
        out.push('\n');
        out.push_str(&end_tag_line);
        out.push('\n');
        out.push_str(&split.head.join("\n"));
        out
    } else {
        let mut out = String::new();
        if !split.head.is_empty() {
            out.push_str(&split.head.join("\n"));
            out.push('\n');
        }
        out.push_str(&begin_tag_line);
        out.push('\n');
        out.push_str(set_contents);
        out.push('\n');
        out.push_str(&end_tag_line);
        out.push('\n');
        if !split.tail.is_empty() {
            out.push_str(&split.tail.join("\n"));
        }
        out
    };
    std::fs::write(file_name, out).with_context(|| format!("write {}", file_name.display()))
}

/// Read selected (or, with `read_all`, every live) `k = v` items out of a
/// `postgresql.conf`-style file, following `include '<path>'` directives
/// relative to the including file's directory. A child's value for a key
/// wins over anything the parent already recorded for it (matching
/// Postgres' own "later wins" include semantics). A key that's only
/// present commented-out is reported as an empty string, but only if no
/// live value for it was found anywhere (in this file or any include).
pub fn read_config_file_items(
    config_file: &Path,
    read_item_list: &[&str],
    read_all: bool,
) -> Result<HashMap<String, String>> {
    let contents = std::fs::read_to_string(config_file)
        .with_context(|| format!("read {}", config_file.display()))?;

    let mut item_dict: HashMap<String, String> = HashMap::new();

    for raw in contents.lines() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix("include ") {
            let mut include_file = rest.trim().to_string();
            if include_file.starts_with('\'') {
                include_file.remove(0);
            }
            if include_file.ends_with('\'') {
                include_file.pop();
            }
            let full_path = if include_file.starts_with('/') {
                std::path::PathBuf::from(&include_file)
            } else {
                config_file
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join(&include_file)
            };
            let child = read_config_file_items(&full_path, read_item_list, read_all)?;
            item_dict.extend(child);
            continue;
        }

        let cells: Vec<&str> = line.splitn(2, '=').collect();
        if cells.len() < 2 {
            continue;
        }
        let item_name = cells[0].trim();
        if let Some(name) = item_name.strip_prefix('#') {
            let name = name.trim();
            if item_dict.contains_key(name) {
                continue;
            }
            if read_item_list.contains(&name) {
                item_dict.insert(name.to_string(), String::new());
            }
            continue;
        }
        if read_item_list.contains(&item_name) || read_all {
            let val = cells[1].split('#').next().unwrap_or("").trim().to_string();
            item_dict.insert(item_name.to_string(), val);
        }
    }

    Ok(item_dict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn appends_after_commented_item_when_no_live_item_exists() {
        let f = write_temp(
            "listen_addresses = '*'\n#port = 5432                            # (change requires restart)\nmax_connections = 100\n",
        );
        let mut m = HashMap::new();
        m.insert("port".to_string(), "5444".to_string());
        modify_config_type1(f.path(), &m, DeliType::Equals, None).unwrap();
        let out = std::fs::read_to_string(f.path()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[1], "#port = 5432                            # (change requires restart)");
        assert_eq!(lines[2], "port = 5444");
    }

    #[test]
    fn replaces_live_item_even_if_a_commented_one_also_exists() {
        let f = write_temp("#port = 5432\nport = 5433\nmax_connections = 100\n");
        let mut m = HashMap::new();
        m.insert("port".to_string(), "5444".to_string());
        modify_config_type1(f.path(), &m, DeliType::Equals, None).unwrap();
        let out = std::fs::read_to_string(f.path()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "#port = 5432");
        assert_eq!(lines[1], "port = 5444");
    }

    #[test]
    fn appends_to_tail_when_item_absent_entirely() {
        let f = write_temp("listen_addresses = '*'\n");
        let mut m = HashMap::new();
        m.insert("shared_buffers".to_string(), "256MB".to_string());
        modify_config_type1(f.path(), &m, DeliType::Equals, None).unwrap();
        let out = std::fs::read_to_string(f.path()).unwrap();
        assert!(out.contains("shared_buffers = 256MB"));
    }

    #[test]
    fn whitespace_delimited_file_is_rewritten_with_a_space() {
        let f = write_temp("net.core.somaxconn 128\n");
        let mut m = HashMap::new();
        m.insert("net.core.somaxconn".to_string(), "1024".to_string());
        modify_config_type1(f.path(), &m, DeliType::Whitespace, None).unwrap();
        let out = std::fs::read_to_string(f.path()).unwrap();
        assert!(out.contains("net.core.somaxconn 1024"));
    }

    #[test]
    fn regex_replace_rewrites_matching_lines_only() {
        let f = write_temp("* soft nproc 1024\nother line\n");
        let rules = vec![(
            Regex::new(r"^\*\s+soft\s+nproc\s+\d+$").unwrap(),
            "*          soft    nproc     131072".to_string(),
        )];
        modify_config_type2(f.path(), &rules, None, false).unwrap();
        let out = std::fs::read_to_string(f.path()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "*          soft    nproc     131072");
        assert_eq!(lines[1], "other line");
    }

    #[test]
    fn regex_replace_appends_unmatched_rule_when_requested() {
        let f = write_temp("other line\n");
        let rules = vec![(
            Regex::new(r"^\*\s+soft\s+nproc\s+\d+$").unwrap(),
            "*          soft    nproc     131072".to_string(),
        )];
        modify_config_type2(f.path(), &rules, None, true).unwrap();
        let out = std::fs::read_to_string(f.path()).unwrap();
        assert!(out.contains("*          soft    nproc     131072"));
    }

    #[test]
    fn tag_content_inserted_at_tail_when_absent() {
        let f = write_temp("line one\nline two\n");
        config_file_set_tag_content(f.path(), "# Add by clup", "* soft nofile 65536").unwrap();
        let out = std::fs::read_to_string(f.path()).unwrap();
        assert!(out.contains("# Add by clup **do not modify** begin"));
        assert!(out.contains("* soft nofile 65536"));
        assert!(out.contains("# Add by clup **do not modify** end"));
    }

    #[test]
    fn tag_content_replaces_existing_block_in_place() {
        let f = write_temp(
            "before\n# Add by clup **do not modify** begin\nold content\n# Add by clup **do not modify** end\nafter\n",
        );
        config_file_set_tag_content(f.path(), "# Add by clup", "new content").unwrap();
        let out = std::fs::read_to_string(f.path()).unwrap();
        assert!(out.contains("before"));
        assert!(out.contains("new content"));
        assert!(!out.contains("old content"));
        assert!(out.contains("after"));
    }

    #[test]
    fn tag_in_head_inserts_at_top_when_absent() {
        let f = write_temp("export PATH=/bin\n");
        config_file_set_tag_in_head(f.path(), "# Add by clup", "export PGDATA=/data").unwrap();
        let out = std::fs::read_to_string(f.path()).unwrap();
        assert!(out.starts_with("# Add by clup **do not modify** begin"));
        assert!(out.contains("export PATH=/bin"));
    }

    #[test]
    fn read_items_reports_commented_key_as_empty_string() {
        let f = write_temp("listen_addresses = '*'\n#port = 5432 # comment\nmax_connections = 100\n");
        let items = read_config_file_items(f.path(), &["port", "max_connections"], false).unwrap();
        assert_eq!(items.get("port").map(String::as_str), Some(""));
        assert_eq!(items.get("max_connections").map(String::as_str), Some("100"));
    }

    #[test]
    fn read_items_follows_include_and_child_wins() {
        let dir = tempfile::tempdir().unwrap();
        let child_path = dir.path().join("child.conf");
        std::fs::write(&child_path, "port = 6000\n").unwrap();
        let parent_path = dir.path().join("parent.conf");
        std::fs::write(&parent_path, "port = 5432\ninclude 'child.conf'\n").unwrap();

        let items = read_config_file_items(&parent_path, &["port"], false).unwrap();
        assert_eq!(items.get("port").map(String::as_str), Some("6000"));
    }

    #[test]
    fn read_all_returns_every_live_item() {
        let f = write_temp("a = 1\nb = 2\n#c = 3\n");
        let items = read_config_file_items(f.path(), &[], true).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items.get("a").map(String::as_str), Some("1"));
        assert_eq!(items.get("b").map(String::as_str), Some("2"));
    }
}
