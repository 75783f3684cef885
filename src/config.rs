//! # Config
//!
//! Offset profiles. Function offsets differ between builds of the hooked binary, so they are kept
//! as data, one profile per platform and binary version:
//!
//! ```toml
//! [[profile]]
//! platform = "linux"
//! version = "1.21.2"
//! [profile.offsets]
//! "Level::tick" = 0x1a2b3c
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::error::HookError;

/// Errors while loading offset profiles
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The profile file could not be read
    #[error("unable to read profiles: {0}")]
    Io(#[from] std::io::Error),
    /// The profile file is not valid TOML for [`Profiles`]
    #[error("unable to parse profiles: {0}")]
    Parse(#[from] toml::de::Error),
    /// Two profiles claim the same binary
    #[error("duplicate profile for {platform} version `{version}`")]
    Duplicate {
        /// Platform of the duplicated entry
        platform: Platform,
        /// Version of the duplicated entry
        version: String,
    },
}

/// Operating system family the hooked binary was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Linux, and other ELF platforms
    Linux,
    /// macOS
    MacOs,
    /// Windows
    Windows,
}

impl Platform {
    /// Platform of the running process
    pub const fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }

    /// Name used in profile files
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::Windows => "windows",
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Function offsets for one build of the hooked binary
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Profile {
    /// Platform of the build
    pub platform: Platform,
    /// Version string reported by the binary
    pub version: String,
    /// Offsets from the module base, keyed by function name
    #[serde(default)]
    pub offsets: HashMap<String, usize>,
}

impl Profile {
    /// Offset of `key` from the module base
    pub fn offset(&self, key: &str) -> Option<usize> {
        self.offsets.get(key).copied()
    }
}

/// Every known profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Profiles {
    /// Profiles in file order
    #[serde(default, rename = "profile")]
    profiles: Vec<Profile>,
}

impl Profiles {
    /// Reads profiles from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(?path, "reading offset profiles");
        fs::read_to_string(path)?.parse()
    }

    /// Profiles in file order
    pub fn iter(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.iter()
    }

    /// Picks the profile for `platform` and `version`
    pub fn select(&self, platform: Platform, version: &str) -> Result<&Profile, HookError> {
        self.profiles
            .iter()
            .find(|p| p.platform == platform && p.version == version)
            .ok_or_else(|| HookError::UnsupportedVersion {
                platform: platform.name(),
                version: version.to_owned(),
            })
    }
}

impl FromStr for Profiles {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let profiles: Profiles = toml::from_str(s)?;

        let mut seen = HashSet::new();
        for profile in &profiles.profiles {
            if !seen.insert((profile.platform, profile.version.as_str())) {
                return Err(ConfigError::Duplicate {
                    platform: profile.platform,
                    version: profile.version.clone(),
                });
            }
        }
        Ok(profiles)
    }
}
