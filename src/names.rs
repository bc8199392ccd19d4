/*
 * Copyright 2026 BadgeVMS Contributors
 *
 * This file is part of BadgeVMS.
 *
 * BadgeVMS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * BadgeVMS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * BadgeVMS. If not, see <https://www.gnu.org/licenses/>.
 */

//! VMS-style logical-name resolution: `DEVICE:[DIR1.DIR2]FILENAME.EXT` with
//! every token substitutable through a table of logical names, each of which
//! may itself be a search list (multiple ordered targets) and may be marked
//! terminal to stop further expansion.
//!
//! Ported from the recursive-descent resolver in
//! `examples/original_source/badgevms/logical_names.c`: that implementation
//! works over raw string slices into a single C-string buffer, reparsing in
//! place; this port works over owned `String`s, but keeps the exact recursion
//! shape (`resolve_string` / `resolve_device_string` / `_logical_name_resolve`)
//! and its depth cap so the worked examples in spec §8 resolve identically.

use std::collections::HashMap;
use std::sync::RwLock;

/// Maximum directory components accepted by the parser (mirrors `MAX_DIR_DEPTH`).
const MAX_DIR_DEPTH: usize = 25;
/// Hard recursion cap for a single resolution (spec §4.4: "depth cap (≥15)").
const RESOLVE_MAX_DEPTH: u32 = 15;

/// One entry of the logical-name table: an ordered list of targets, and
/// whether expansion should stop here once reached.
#[derive(Debug, Clone)]
pub struct LogicalName {
    pub targets: Vec<String>,
    pub terminal: bool,
}

/// The logical-name table: name → [`LogicalName`].
pub struct LogicalNameTable {
    table: RwLock<HashMap<String, LogicalName>>,
}

impl Default for LogicalNameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalNameTable {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Parses a comma-separated target list (whitespace trimmed around each
    /// entry) and stores it under `name`, replacing any prior definition.
    /// Fails (returns `false`) only if every entry was empty after trimming.
    pub fn set(&self, name: &str, targets_csv: &str, terminal: bool) -> bool {
        let targets: Vec<String> = targets_csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if targets.is_empty() {
            return false;
        }
        self.table
            .write()
            .unwrap()
            .insert(name.to_string(), LogicalName { targets, terminal });
        true
    }

    /// Returns the raw target list for `name`, or `None` if undefined.
    pub fn get(&self, name: &str) -> Option<LogicalName> {
        self.table.read().unwrap().get(name).cloned()
    }

    /// Removes `name` from the table. A no-op if it wasn't defined.
    pub fn del(&self, name: &str) {
        self.table.write().unwrap().remove(name);
    }

    /// Resolves `path`, selecting alternative `idx` of the first search-list
    /// logical name encountered during the resolution. Returns the resolved
    /// string and the arity of that first search list (1 if none was hit).
    pub fn resolve(&self, path: &str, idx: usize) -> (String, usize) {
        if path.is_empty() {
            return (String::new(), 0);
        }
        let table = self.table.read().unwrap();
        let parsed = parse(path);
        let resolved = resolve_components(&table, parsed, idx, 0);
        (serialize(&resolved), resolved.count)
    }
}

/// A string slice plus the metadata the resolver threads through recursion:
/// whether it came from a terminal logical name, and (if it was the first
/// search-list hit) the list's arity and the selected index.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawStr {
    s: String,
    terminal: bool,
    count: usize,
}

impl RawStr {
    fn plain(s: impl Into<String>) -> Self {
        Self {
            s: s.into(),
            terminal: false,
            count: 1,
        }
    }

    fn null() -> Self {
        Self {
            s: String::new(),
            terminal: false,
            count: 1,
        }
    }
}

/// Parsed `DEVICE:[DIR1.DIR2]FILENAME` shape, or an opaque `unparsable` string
/// if the path didn't fit the grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedComponents {
    unparsable: Option<String>,
    device: RawStr,
    dirs: Vec<RawStr>,
    filename: RawStr,
    count: usize,
}

fn parse(path: &str) -> ParsedComponents {
    let mut device_sep: Option<usize> = None;
    let mut dir_start: Option<usize> = None;
    let mut dir_end: Option<usize> = None;
    let mut last_dir: usize = 0;
    let mut dirs: Vec<(usize, usize)> = Vec::new();
    let bytes = path.as_bytes();

    for (i, &c) in bytes.iter().enumerate() {
        match c {
            b':' => {
                if device_sep.is_some() {
                    return ParsedComponents {
                        unparsable: Some(path.to_string()),
                        device: RawStr::null(),
                        dirs: Vec::new(),
                        filename: RawStr::null(),
                        count: 1,
                    };
                }
                device_sep = Some(i);
            }
            b'[' => {
                if dir_start.is_some() {
                    return ParsedComponents {
                        unparsable: Some(path.to_string()),
                        device: RawStr::null(),
                        dirs: Vec::new(),
                        filename: RawStr::null(),
                        count: 1,
                    };
                }
                dir_start = Some(i);
                last_dir = i + 1;
            }
            b']' => {
                if dir_end.is_some() {
                    return ParsedComponents {
                        unparsable: Some(path.to_string()),
                        device: RawStr::null(),
                        dirs: Vec::new(),
                        filename: RawStr::null(),
                        count: 1,
                    };
                }
                dir_end = Some(i);
                if dirs.len() < MAX_DIR_DEPTH {
                    dirs.push((last_dir, i));
                }
            }
            b'.' if dir_start.is_some() && dir_end.is_none() => {
                if dirs.len() < MAX_DIR_DEPTH {
                    dirs.push((last_dir, i));
                }
                last_dir = i + 1;
            }
            _ => {}
        }
    }

    let opaque = |s: &str| ParsedComponents {
        unparsable: Some(s.to_string()),
        device: RawStr::null(),
        dirs: Vec::new(),
        filename: RawStr::null(),
        count: 1,
    };

    let Some(device_sep) = device_sep else {
        return opaque(path);
    };
    if dir_start.is_some() && dir_end.is_none() {
        return opaque(path);
    }

    let device = RawStr::plain(&path[..device_sep]);
    let dirs: Vec<RawStr> = dirs.into_iter().map(|(a, b)| RawStr::plain(&path[a..b])).collect();

    let filename = if let Some(dir_end) = dir_end {
        if dir_end + 1 < path.len() {
            RawStr::plain(&path[dir_end + 1..])
        } else {
            RawStr::null()
        }
    } else if device_sep + 1 < path.len() {
        RawStr::plain(&path[device_sep + 1..])
    } else {
        RawStr::null()
    };

    ParsedComponents {
        unparsable: None,
        device,
        dirs,
        filename,
        count: 1,
    }
}

fn serialize(p: &ParsedComponents) -> String {
    if let Some(u) = &p.unparsable {
        return u.clone();
    }
    let mut out = String::new();
    out.push_str(&p.device.s);
    out.push(':');
    if !p.dirs.is_empty() {
        out.push('[');
        for (i, d) in p.dirs.iter().enumerate() {
            if i > 0 {
                out.push('.');
            }
            out.push_str(&d.s);
        }
        out.push(']');
    }
    out.push_str(&p.filename.s);
    out
}

/// Looks `raw.s` up as a single logical name and follows one more hop of
/// expansion, recursively, until a terminal, an undefined name, or the depth
/// cap is reached. Mirrors `resolve_string` in the original source.
fn resolve_string(table: &HashMap<String, LogicalName>, raw: RawStr, idx: usize, depth: u32) -> RawStr {
    if raw.terminal {
        return raw;
    }
    if depth > RESOLVE_MAX_DEPTH || raw.s.is_empty() {
        return RawStr::null();
    }
    let Some(name) = table.get(&raw.s) else {
        return raw;
    };
    let next = if name.targets.len() > 1 {
        let i = if idx >= name.targets.len() { 0 } else { idx };
        RawStr {
            s: name.targets[i].clone(),
            terminal: name.terminal,
            count: name.targets.len(),
        }
    } else {
        RawStr {
            s: name.targets[0].clone(),
            terminal: name.terminal,
            count: 1,
        }
    };
    resolve_string(table, next, idx, depth + 1)
}

/// Device-specific variant: a bare device name might be registered either as
/// `NAME` or `NAME:`, so try the form with a trailing colon first and fall
/// back to the bare form if that didn't expand. Mirrors `resolve_device_string`.
fn resolve_device_string(table: &HashMap<String, LogicalName>, raw: RawStr, idx: usize, depth: u32) -> RawStr {
    if raw.terminal {
        return raw;
    }
    if depth > RESOLVE_MAX_DEPTH || raw.s.is_empty() {
        return RawStr::null();
    }
    let with_colon = RawStr {
        s: format!("{}:", raw.s),
        terminal: raw.terminal,
        count: raw.count,
    };
    let resolved = resolve_string(table, with_colon.clone(), idx, depth);
    if resolved == with_colon {
        // No entry for `NAME:`; try the bare form instead.
        return resolve_string(table, raw, idx, depth);
    }
    resolved
}

/// The top-level fixpoint loop. Mirrors `_logical_name_resolve`: repeatedly
/// re-parses and re-resolves device/dirs/filename until nothing changes or
/// the depth cap is hit. `list_idx` is only honored the first time a
/// multi-target (search-list) name is encountered in this resolution.
fn resolve_components(
    table: &HashMap<String, LogicalName>,
    mut path: ParsedComponents,
    list_idx: usize,
    depth: u32,
) -> ParsedComponents {
    if depth > RESOLVE_MAX_DEPTH {
        return ParsedComponents {
            unparsable: None,
            device: RawStr::null(),
            dirs: Vec::new(),
            filename: RawStr::null(),
            count: 0,
        };
    }

    if let Some(s) = path.unparsable.clone() {
        let mut res = resolve_string(table, RawStr::plain(&s), 0, depth + 1);
        if res.count > 1 && path.count == 1 {
            path.count = res.count;
            res = resolve_string(table, RawStr::plain(&s), list_idx, depth + 1);
        }
        if res.s.is_empty() || res.s == s {
            return path;
        }
        let mut new_path = parse(&res.s);
        new_path.count = path.count;
        return resolve_components(table, new_path, 0, depth + 1);
    }

    let orig_path = path.clone();

    let mut new_device = resolve_device_string(table, path.device.clone(), 0, depth + 1);
    if new_device.count > 1 && path.count == 1 {
        path.count = new_device.count;
        new_device = resolve_device_string(table, path.device.clone(), list_idx, depth + 1);
    }

    if new_device != path.device {
        let device_path = parse(&new_device.s);
        if device_path.unparsable.is_some() {
            path.device = new_device;
        } else {
            if !device_path.dirs.is_empty() {
                let mut merged = device_path.dirs.clone();
                merged.extend(path.dirs.drain(..));
                path.dirs = merged;
            }
            if !device_path.filename.s.is_empty() && path.filename.s.is_empty() {
                path.filename = device_path.filename;
            }
            if !device_path.device.s.is_empty() {
                path.device = device_path.device;
            }
        }
    }

    path.filename = resolve_string(table, path.filename, 0, depth + 1);
    for dir in path.dirs.iter_mut() {
        *dir = resolve_string(table, dir.clone(), 0, depth + 1);
    }

    if path == orig_path {
        return path;
    }
    resolve_components(table, path, list_idx, depth + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worked_example_table() -> LogicalNameTable {
        let t = LogicalNameTable::new();
        t.set("SIMPLE", "STRING", false);
        t.set("DIR1", "SUBST1", false);
        t.set("DIR2", "SUBST2", false);
        t.set("FILE1", "FILENAME.EXT", false);
        t.set("FILE2", "FILE3", false);
        t.set("FILE3", "INDIRECT.EXT", false);
        t.set("USER", "FLASH0:[dira]", false);
        t.set("FLASH0", "MYFLASH", false);
        t.set("LIST1", "ONE, TWO, THREE", false);
        t.set("SEARCH", "DRIVE0:[SUBDIR], DRIVE0:[SUBDIR.ANOTHER]", false);
        t.set("CIRC1", "CIRC2", false);
        t.set("CIRC2", "CIRC1", false);
        t.set("CIRC3", "CIRC4", false);
        t.set("CIRC4", "CIRC3", true);
        t.set("USER2", "TERM1", false);
        t.set("TERM1", "TERM2", false);
        t.set("TERM2", "TERM3", true);
        t.set("TERM3", "UNREACHABLE", false);
        t
    }

    #[test]
    fn simple_substitution() {
        let t = worked_example_table();
        assert_eq!(t.resolve("SIMPLE", 0), ("STRING".to_string(), 1));
    }

    #[test]
    fn device_expansion_merges_directories_and_filename() {
        let t = worked_example_table();
        assert_eq!(t.resolve("USER:", 0), ("MYFLASH:[dira]".to_string(), 1));
        assert_eq!(
            t.resolve("USER:[DIR1]FILE1", 0),
            ("MYFLASH:[dira.SUBST1]FILENAME.EXT".to_string(), 1)
        );
    }

    #[test]
    fn search_list_indexing() {
        let t = worked_example_table();
        assert_eq!(t.resolve("LIST1", 0), ("ONE".to_string(), 3));
        assert_eq!(t.resolve("LIST1", 1), ("TWO".to_string(), 3));
        assert_eq!(t.resolve("LIST1", 2), ("THREE".to_string(), 3));
    }

    #[test]
    fn search_list_on_a_device() {
        let t = worked_example_table();
        assert_eq!(t.resolve("SEARCH:", 0), ("DRIVE0:[SUBDIR]".to_string(), 2));
        assert_eq!(t.resolve("SEARCH:", 1), ("DRIVE0:[SUBDIR.ANOTHER]".to_string(), 2));
    }

    #[test]
    fn circular_reference_returns_original() {
        let t = worked_example_table();
        assert_eq!(t.resolve("CIRC1", 0), ("CIRC1".to_string(), 1));
    }

    #[test]
    fn terminal_stops_the_chain() {
        let t = worked_example_table();
        assert_eq!(t.resolve("CIRC4", 0), ("CIRC3".to_string(), 1));
        assert_eq!(t.resolve("USER2:", 0), ("TERM3:".to_string(), 1));
    }

    #[test]
    fn malformed_bracket_is_opaque() {
        let t = worked_example_table();
        assert_eq!(t.resolve("BAD:[unclosed", 0), ("BAD:[unclosed".to_string(), 1));
    }

    #[test]
    fn undefined_strings_pass_through_unchanged() {
        let t = worked_example_table();
        assert_eq!(t.resolve("DEVICE:", 0), ("DEVICE:".to_string(), 1));
        assert_eq!(
            t.resolve("DEVICE:[dira.dirb.dirc]filename.ext", 0),
            ("DEVICE:[dira.dirb.dirc]filename.ext".to_string(), 1)
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let t = worked_example_table();
        let a = t.resolve("USER:[DIR1]FILE1", 0);
        let b = t.resolve("USER:[DIR1]FILE1", 0);
        assert_eq!(a, b);
    }

    #[test]
    fn del_removes_a_definition() {
        let t = worked_example_table();
        t.del("SIMPLE");
        assert_eq!(t.resolve("SIMPLE", 0), ("SIMPLE".to_string(), 1));
        assert!(t.get("SIMPLE").is_none());
    }

    #[test]
    fn set_rejects_an_all_whitespace_target() {
        let t = LogicalNameTable::new();
        assert!(!t.set("EMPTY", "   ,  ", false));
        assert!(t.get("EMPTY").is_none());
    }
}
