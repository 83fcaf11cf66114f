//! File-backed identity store: the two 32-byte secrets in one 0600 file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use meshchat_core::{IdentityError, IdentityStore, StoredIdentity};
use tracing::info;

pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn store_err(e: std::io::Error) -> IdentityError {
    IdentityError::Store(e.to_string())
}

impl IdentityStore for FileIdentityStore {
    fn load_static_keypair(&self) -> Result<Option<StoredIdentity>, IdentityError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => zeroize::Zeroizing::new(b),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_err(e)),
        };
        StoredIdentity::from_bytes(&bytes)
            .map(Some)
            .ok_or(IdentityError::Corrupt)
    }

    /// Written to a sibling temp file first, then renamed over the target.
    fn save_static_keypair(&self, identity: &StoredIdentity) -> Result<(), IdentityError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(store_err)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut options = fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp).map_err(store_err)?;
            file.write_all(&identity.to_bytes()[..]).map_err(store_err)?;
            file.sync_all().map_err(store_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(store_err)?;
        info!(path = %self.path.display(), "identity saved");
        Ok(())
    }
}
