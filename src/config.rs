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

//! Boot configuration: parses the `FLASH0:init.toml` application list (spec
//! §6) with `serde`/`toml`, and tracks which `run_once` entries have already
//! executed via the [`NvStore`] trait — the real NVS partition is a hardware
//! collaborator, so tests use [`MemNvStore`].

use serde::Deserialize;

/// One application entry in the boot config's `[[app]]` list.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AppEntry {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub restart_on_failure: bool,
    #[serde(default)]
    pub run_once: bool,
    pub stack_size: u32,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The parsed contents of `init.toml`.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct BootConfig {
    #[serde(default, rename = "app")]
    pub apps: Vec<AppEntry>,
}

impl BootConfig {
    /// Parses `init.toml`'s text. Malformed TOML surfaces as `InvalidArgument`
    /// rather than panicking — a corrupt boot partition must not crash init.
    pub fn parse(text: &str) -> crate::error::EResult<Self> {
        toml::from_str(text).map_err(|_| crate::error::KernelError::InvalidArgument("init.toml: malformed boot config"))
    }

    /// Entries init should spawn this boot, i.e. every entry except a
    /// `run_once` one already marked done in `store`.
    pub fn entries_to_spawn<'a>(&'a self, store: &dyn NvStore) -> Vec<&'a AppEntry> {
        self.apps.iter().filter(|app| !app.run_once || !store.has_run(&app.name)).collect()
    }
}

/// Key-value persistence for `run_once` bookkeeping. The real firmware backs
/// this with an NVS partition; [`MemNvStore`] is the in-memory test double.
pub trait NvStore: Send + Sync {
    fn has_run(&self, app_name: &str) -> bool;
    fn mark_run(&self, app_name: &str);
}

/// An in-memory `NvStore`, for tests and the hosted simulation.
#[derive(Default)]
pub struct MemNvStore {
    done: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl MemNvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NvStore for MemNvStore {
    fn has_run(&self, app_name: &str) -> bool {
        self.done.lock().unwrap().contains(app_name)
    }

    fn mark_run(&self, app_name: &str) {
        self.done.lock().unwrap().insert(app_name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[app]]
        name = "app"
        path = "FLASH0:hello.elf"
        restart_on_failure = true
        stack_size = 8192
        args = []
    "#;

    #[test]
    fn parses_the_end_to_end_scenario_entry() {
        let cfg = BootConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.apps.len(), 1);
        let app = &cfg.apps[0];
        assert_eq!(app.name, "app");
        assert_eq!(app.path, "FLASH0:hello.elf");
        assert!(app.restart_on_failure);
        assert!(!app.run_once);
        assert_eq!(app.stack_size, 8192);
        assert!(app.args.is_empty());
    }

    #[test]
    fn malformed_toml_is_an_invalid_argument_not_a_panic() {
        let err = BootConfig::parse("this is not valid = = toml").unwrap_err();
        assert!(matches!(err, crate::error::KernelError::InvalidArgument(_)));
    }

    #[test]
    fn run_once_entry_is_excluded_once_marked_done() {
        let cfg = BootConfig::parse(
            r#"
            [[app]]
            name = "setup"
            path = "FLASH0:setup.elf"
            run_once = true
            stack_size = 4096
        "#,
        )
        .unwrap();
        let store = MemNvStore::new();
        assert_eq!(cfg.entries_to_spawn(&store).len(), 1);
        store.mark_run("setup");
        assert_eq!(cfg.entries_to_spawn(&store).len(), 0);
    }

    #[test]
    fn non_run_once_entry_always_spawns() {
        let cfg = BootConfig::parse(SAMPLE).unwrap();
        let store = MemNvStore::new();
        store.mark_run("app");
        assert_eq!(cfg.entries_to_spawn(&store).len(), 1);
    }
}
