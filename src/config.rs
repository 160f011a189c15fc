use std::io::{self, BufRead};
use std::path::PathBuf;

use crate::app::ImageArgs;
use crate::prelude::*;
use url::Url;

/// Snapshot of the discovery inputs for one analysis run.
///
/// Written once while the stack is assembled, read thereafter. Layers
/// never consult process-wide state; everything they need is captured
/// here at instantiation time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Image location. Only the `file:` scheme is supported.
    pub location: Url,
    /// Write consent. Only granted through [`confirm_write_support`].
    pub write: bool,
    /// Profile override, skips the magic scan.
    pub profile: Option<String>,
    /// DTB override, skips DTB discovery.
    pub dtb: Option<u64>,

    // Precomputed virtual offsets forwarded to analysis plugins.
    pub sys_offset: Option<u64>,
    pub sam_offset: Option<u64>,
    pub sec_offset: Option<u64>,
    pub hive_offset: Option<u64>,
}

impl Config {
    /// Configuration for the image at `path`, defaults everywhere else.
    pub fn from_image_path(path: &std::path::Path) -> Result<Self> {
        let path = std::fs::canonicalize(path)
            .with_context(|| format!("image {} must exist", path.display()))?;
        let location = Url::from_file_path(&path)
            .map_err(|_| anyhow!("cannot express {} as a file: URL", path.display()))?;
        Ok(Self {
            location,
            write: false,
            profile: None,
            dtb: None,
            sys_offset: None,
            sam_offset: None,
            sec_offset: None,
            hive_offset: None,
        })
    }

    /// Filesystem path behind `location`.
    pub fn path(&self) -> Result<PathBuf> {
        if self.location.scheme() != "file" {
            bail!("location {} is not of file scheme", self.location);
        }
        self.location
            .to_file_path()
            .map_err(|_| anyhow!("location {} has no local path", self.location))
    }
}

#[cfg(test)]
impl Config {
    /// Constructs a `Config` over a test image path, which does not have
    /// to exist.
    pub fn test(path: &std::path::Path) -> Self {
        Self {
            location: Url::from_file_path(path).unwrap(),
            write: false,
            profile: None,
            dtb: None,
            sys_offset: None,
            sam_offset: None,
            sec_offset: None,
            hive_offset: None,
        }
    }
}

impl TryFrom<&ImageArgs> for Config {
    type Error = Error;

    fn try_from(args: &ImageArgs) -> Result<Self> {
        let mut config = Config::from_image_path(&args.image)?;
        config.write = args.write && confirm_write_support();
        config.profile = args.profile.clone();
        config.dtb = args.dtb;
        config.sys_offset = args.sys_offset;
        config.sam_offset = args.sam_offset;
        config.sec_offset = args.sec_offset;
        config.hive_offset = args.hive_offset;
        Ok(config)
    }
}

const WRITE_TESTPHRASE: &str = "Yes, I want to enable write support";

/// Asks the user to repeat a long phrase before enabling write support.
/// Three failed attempts leave writes disabled for the whole run.
pub fn confirm_write_support() -> bool {
    for _ in 0..3 {
        eprintln!(
            "Write support requested. Please type \"{WRITE_TESTPHRASE}\" below precisely (case-sensitive):"
        );
        let mut response = String::new();
        if io::stdin().lock().read_line(&mut response).is_err() {
            break;
        }
        if response.trim_end_matches(['\r', '\n']) == WRITE_TESTPHRASE {
            return true;
        }
    }
    eprintln!("Write support disabled.");
    false
}
