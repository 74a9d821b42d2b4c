//! Option table (spec.md §6). Options are identified by opaque integer ids,
//! the way the teacher's `util` binaries build up configuration values by
//! hand rather than through a config-file format (see SPEC_FULL.md §2.3 for
//! why no `toml`/`serde` loader is added here).

use std::path::PathBuf;

use crate::error::{Result, TransportError};

pub const OPT_RECV_MAX_SIZE: u32 = 1;
pub const OPT_HOME: u32 = 2;
pub const OPT_NWID: u32 = 3;
pub const OPT_NODE: u32 = 4;

/// Upper bound on the `home` option's string length, matching spec.md §6's
/// "bounded by max-address-length."
pub const MAX_ADDRESS_LENGTH: usize = 4096;

pub const DEFAULT_RECV_MAX_SIZE: u32 = 1 << 20;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OptionValue {
    U32(u32),
    U64(u64),
    Str(String),
}

/// The settable subset of the option table (`recv-max-size`, `home`).
/// `nwid` and `node` are read-only and answered directly by
/// [`crate::endpoint::Endpoint`] since they reflect post-bind state this
/// table doesn't own.
#[derive(Debug, Clone)]
pub struct OptionTable {
    recv_max_size: u32,
    home: String,
}

impl Default for OptionTable {
    fn default() -> Self {
        OptionTable {
            recv_max_size: DEFAULT_RECV_MAX_SIZE,
            home: String::new(),
        }
    }
}

impl OptionTable {
    pub fn new() -> OptionTable {
        OptionTable::default()
    }

    pub fn set(&mut self, id: u32, value: OptionValue) -> Result<()> {
        match (id, value) {
            (OPT_RECV_MAX_SIZE, OptionValue::U32(v)) => {
                self.recv_max_size = v;
                Ok(())
            }
            (OPT_HOME, OptionValue::Str(s)) => {
                if s.len() > MAX_ADDRESS_LENGTH {
                    return Err(TransportError::Invalid);
                }
                self.home = s;
                Ok(())
            }
            (OPT_NWID, _) | (OPT_NODE, _) => Err(TransportError::Unsupported),
            (OPT_RECV_MAX_SIZE, _) | (OPT_HOME, _) => Err(TransportError::Invalid),
            _ => Err(TransportError::Invalid),
        }
    }

    pub fn get(&self, id: u32) -> Result<OptionValue> {
        match id {
            OPT_RECV_MAX_SIZE => Ok(OptionValue::U32(self.recv_max_size)),
            OPT_HOME => Ok(OptionValue::Str(self.home.clone())),
            _ => Err(TransportError::Invalid),
        }
    }

    pub fn recv_max_size(&self) -> u32 {
        self.recv_max_size
    }

    /// Resolves the `home` option into a directory path, or `None` if
    /// empty (ephemeral keying, per spec.md §6).
    pub fn home_dir(&self) -> Option<PathBuf> {
        if self.home.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.home))
        }
    }
}
