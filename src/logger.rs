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

//! The single place that wires a [`log`] implementation into the substrate.
//! Subsystems log through `log::{trace, debug, info, warn, error}`; nothing
//! outside this module ever touches a concrete logger backend, so swapping
//! the hosted `env_logger` for the real firmware's UART sink is a one-file
//! change.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs `env_logger` as the global logger, honoring `RUST_LOG` the usual
/// way. Idempotent — safe to call from every test's setup and from `Kernel::
/// boot` alike.
pub fn init() {
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
