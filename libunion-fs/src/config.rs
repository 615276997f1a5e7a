use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::branch::BranchPerm;
use crate::error::{Result, UnionError};
use crate::vdir::RDBLK_DEFAULT;

pub const RDCACHE_DEFAULT: u64 = 10;
pub const RDCACHE_CAPACITY_DEFAULT: u64 = 1024;
pub const MAX_RETRY_DEFAULT: u32 = 8;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BranchConfig {
    pub path: PathBuf,
    /// aufs permission string, e.g. `rw` or `ro+wh`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perm: Option<String>,
    /// External inode index file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xino: Option<PathBuf>,
}

impl BranchConfig {
    pub fn perm(&self) -> Result<Option<BranchPerm>> {
        self.perm.as_deref().map(str::parse).transpose()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct UnionConfig {
    pub branches: Vec<BranchConfig>,
    /// Bytes per directory block.
    pub rdblk: usize,
    /// Whiteout hash buckets, 0 to estimate.
    pub rdhash: usize,
    /// Seconds a merged listing stays cached, 0 disables the cache.
    pub rdcache: u64,
    /// Most merged listings kept in the cache.
    pub rdcache_capacity: u64,
    /// Attempts before an operation gives up on a moving branch table.
    pub max_retry: u32,
}

impl Default for UnionConfig {
    fn default() -> Self {
        UnionConfig {
            branches: Vec::new(),
            rdblk: RDBLK_DEFAULT,
            rdhash: 0,
            rdcache: RDCACHE_DEFAULT,
            rdcache_capacity: RDCACHE_CAPACITY_DEFAULT,
            max_retry: MAX_RETRY_DEFAULT,
        }
    }
}

impl UnionConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        let config: UnionConfig =
            serde_json::from_str(s).map_err(|e| UnionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::from_json(&contents)
    }

    /// Parse aufs style mount options:
    /// `br:/rw=rw:/ro=ro+wh,rdblk=1024,rdhash=64,rdcache=0`.
    /// The other keys are named like the JSON fields.
    pub fn parse_options(opts: &str) -> Result<Self> {
        let mut config = UnionConfig::default();
        for opt in opts.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            if let Some(list) = opt.strip_prefix("br:").or_else(|| opt.strip_prefix("br=")) {
                for br in list.split(':').filter(|b| !b.is_empty()) {
                    let (path, perm) = match br.rsplit_once('=') {
                        Some((path, perm)) => (path, Some(perm.to_string())),
                        None => (br, None),
                    };
                    config.branches.push(BranchConfig {
                        path: PathBuf::from(path),
                        perm,
                        xino: None,
                    });
                }
                continue;
            }
            let (key, value) = opt.split_once('=').ok_or_else(|| {
                UnionError::InvalidConfig(format!("option {opt:?} has no value"))
            })?;
            match key {
                "rdblk" => config.rdblk = parse_num(key, value)?,
                "rdhash" => config.rdhash = parse_num(key, value)?,
                "rdcache" => config.rdcache = parse_num(key, value)?,
                "rdcache_capacity" => config.rdcache_capacity = parse_num(key, value)?,
                "max_retry" => config.max_retry = parse_num(key, value)?,
                other => {
                    return Err(UnionError::InvalidConfig(format!(
                        "unknown option {other:?}"
                    )));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.branches.is_empty() {
            return Err(UnionError::InvalidConfig("no branch specified".into()));
        }
        for br in &self.branches {
            if br.path.as_os_str().is_empty() {
                return Err(UnionError::InvalidConfig("empty branch path".into()));
            }
            br.perm()?;
        }
        if self.max_retry == 0 {
            return Err(UnionError::InvalidConfig("max_retry must be positive".into()));
        }
        Ok(())
    }

    /// Lifetime of a cached listing, `None` when caching is off.
    pub fn rdcache_ttl(&self) -> Option<Duration> {
        (self.rdcache > 0).then(|| Duration::from_secs(self.rdcache))
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| UnionError::InvalidConfig(format!("{key}={value:?} is not a number")))
}
