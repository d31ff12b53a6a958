//! /proc/<pid>/maps inspection.
//!
//! The kernel side maps each protected module's code-cache object under a
//! synthetic `<pid>-<module>.cc` name and the shadow stack under a `.ss`
//! name. Parsing the maps listing recovers, per module, the cache mapping and
//! the original executable mapping, plus the shadow-stack region and the
//! native stack top.

use crate::result::{Error, Result};
use std::collections::BTreeMap;
use tracing::debug;

/// One mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u64,
    pub size: u64,
}

/// One parsed maps row.
#[derive(Debug, Clone)]
pub struct MapsRow {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub path: String,
}

impl MapsRow {
    pub fn is_executable(&self) -> bool {
        self.perms.contains('x')
    }

    pub fn is_shared(&self) -> bool {
        self.perms.contains('s')
    }
}

/// Parses one `start-end perms offset dev inode path` row.
pub fn parse_row(line: &str) -> Result<MapsRow> {
    let bad = || Error::MapsRow(line.to_string());
    let mut fields = line.split_whitespace();
    let range = fields.next().ok_or_else(bad)?;
    let (start, end) = range.split_once('-').ok_or_else(bad)?;
    let start = u64::from_str_radix(start, 16).map_err(|_| bad())?;
    let end = u64::from_str_radix(end, 16).map_err(|_| bad())?;
    let perms = fields.next().ok_or_else(bad)?.to_string();
    // offset, dev, inode
    for _ in 0..3 {
        fields.next().ok_or_else(bad)?;
    }
    let path = fields.next().unwrap_or("").to_string();
    Ok(MapsRow {
        start,
        end,
        perms,
        path,
    })
}

/// Everything the attach path needs from a protected process's maps.
#[derive(Debug, Default, Clone)]
pub struct ProcessLayout {
    /// Module name to its code-cache mapping (the active window).
    pub caches: BTreeMap<String, Region>,
    /// Module name to its original executable mapping.
    pub images: BTreeMap<String, Region>,
    /// Shadow-stack mapping, if created.
    pub shadow_stack: Option<Region>,
    /// Object name the shadow-stack mapping was created under.
    pub shadow_stack_name: Option<String>,
    /// Top of the native stack.
    pub stack_top: Option<u64>,
}

impl ProcessLayout {
    /// The cache mapping for a module, required at attach.
    pub fn cache_of(&self, module: &str) -> Result<Region> {
        self.caches
            .get(module)
            .copied()
            .ok_or_else(|| Error::MissingCacheMapping(module.to_string()))
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parses a full maps listing for the given pid.
pub fn parse_maps(text: &str, pid: i32) -> Result<ProcessLayout> {
    let cc_prefix = format!("{pid}-");
    let mut layout = ProcessLayout::default();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let row = parse_row(line)?;
        let name = basename(&row.path).to_string();
        if row.is_executable() {
            if row.path.contains("[vdso]") || row.path.contains("[vsyscall]") {
                continue;
            }
            let region = Region {
                base: row.start,
                size: row.end - row.start,
            };
            if row.is_shared() {
                // Synthetic "<pid>-<module>.cc" cache mapping.
                if let Some(module) = name
                    .strip_prefix(&cc_prefix)
                    .and_then(|rest| rest.strip_suffix(".cc"))
                {
                    layout.caches.insert(module.to_string(), region);
                }
            } else if !name.is_empty() {
                layout.images.entry(name).or_insert(region);
            }
        } else if row.is_shared() && name.ends_with(".ss") {
            layout.shadow_stack = Some(Region {
                base: row.start,
                size: row.end - row.start,
            });
            layout.shadow_stack_name = Some(name);
        } else if row.path.contains("[stack]") {
            layout.stack_top = Some(row.end);
        }
    }
    debug!(
        caches = layout.caches.len(),
        images = layout.images.len(),
        has_ss = layout.shadow_stack.is_some(),
        "parsed process maps"
    );
    Ok(layout)
}

/// Reads and parses `/proc/<pid>/maps`.
pub fn inspect(pid: i32) -> Result<ProcessLayout> {
    let path = format!("/proc/{pid}/maps");
    let text = std::fs::read_to_string(&path).map_err(|source| Error::Shm { path, source })?;
    parse_maps(&text, pid)
}
