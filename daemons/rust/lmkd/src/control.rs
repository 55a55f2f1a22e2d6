// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Administrative commands dropped into the control file, one per line:
//!
//! ```text
//! minfree=1536,2048,4096,16384
//! debug_level=3
//! rtcc_trigger=4,15
//! cancel_soft_reclaim
//! freeze
//! thaw
//! ```

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use lmk_core::LowMemoryKiller;
use log::info;
use log::warn;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Set { name: String, value: String },
    Trigger(String),
    NeedSoftReclaim,
    CancelSoftReclaim,
    Freeze,
    Thaw,
}

impl Command {
    /// `None` for blank lines and `#` comments.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let cmd = match line.split_once('=') {
            Some(("rtcc_trigger", val)) => Command::Trigger(val.trim().to_string()),
            Some((name, value)) => {
                let name = name.trim();
                if name.is_empty() {
                    bail!("Missing parameter name in '{}'", line);
                }
                Command::Set {
                    name: name.to_string(),
                    value: value.trim().to_string(),
                }
            }
            None => match line {
                "need_soft_reclaim" => Command::NeedSoftReclaim,
                "cancel_soft_reclaim" => Command::CancelSoftReclaim,
                "freeze" => Command::Freeze,
                "thaw" => Command::Thaw,
                _ => bail!("Unknown command '{}'", line),
            },
        };
        Ok(Some(cmd))
    }

    pub fn apply(&self, lmk: &LowMemoryKiller) -> Result<()> {
        match self {
            Command::Set { name, value } => lmk.params().set(name, value)?,
            Command::Trigger(val) => lmk.trigger(val)?,
            Command::NeedSoftReclaim => lmk.need_soft_reclaim(),
            Command::CancelSoftReclaim => lmk.cancel_soft_reclaim(),
            Command::Freeze => lmk.freeze(),
            Command::Thaw => lmk.thaw(),
        }
        Ok(())
    }
}

fn claimed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".claimed");
    PathBuf::from(name)
}

/// Apply every command in `path`. The file is first renamed aside, so a
/// writer appending concurrently either lands in this batch or recreates
/// `path` for the next one. A bad line is logged and skipped. Returns how
/// many commands were applied.
pub fn process_control_file(path: &Path, lmk: &LowMemoryKiller) -> Result<usize> {
    let claimed = claimed_path(path);
    match fs::rename(path, &claimed) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to claim {:?}", path)),
    }
    let text = fs::read_to_string(&claimed)
        .with_context(|| format!("Failed to read {:?}", claimed))?;
    fs::remove_file(&claimed).with_context(|| format!("Failed to remove {:?}", claimed))?;

    let mut applied = 0;
    for line in text.lines() {
        let res = Command::parse(line).and_then(|cmd| match cmd {
            Some(cmd) => cmd.apply(lmk).map(|_| true),
            None => Ok(false),
        });
        match res {
            Ok(true) => {
                info!("control: {}", line.trim());
                applied += 1;
            }
            Ok(false) => {}
            Err(e) => warn!("control: '{}': {:#}", line.trim(), e),
        }
    }
    Ok(applied)
}
