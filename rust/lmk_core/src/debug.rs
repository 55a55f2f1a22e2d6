// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Verbosity-gated diagnostics.
//!
//! `debug_level` (0-5) decides which messages reach the `log` facade at all;
//! the logger's own filter applies afterwards. Levels 1-2 are emitted as
//! `info`, 3-4 as `debug` and 5 as `trace`.

macro_rules! lmk_print {
    ($tunables:expr, $level:expr, $($arg:tt)+) => {{
        let level: u32 = $level;
        if $tunables.debug_level() >= level {
            match level {
                0..=2 => ::log::info!($($arg)+),
                3..=4 => ::log::debug!($($arg)+),
                _ => ::log::trace!($($arg)+),
            }
        }
    }};
}
