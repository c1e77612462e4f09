use std::{
    env,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

/// Finds the encoder executable: explicit override, next to our own binary,
/// the working directory, then `PATH`.
#[derive(Debug, Clone)]
pub struct EncoderLocator {
    name: String,
    override_path: Option<PathBuf>,
}

impl EncoderLocator {
    /// `name` without the platform suffix, e.g. `ffmpeg`
    pub fn new(name: impl Into<String>, override_path: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            override_path,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, env::consts::EXE_SUFFIX)
    }

    /// Absolute path of the encoder, `None` when it cannot be found anywhere.
    pub fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = &self.override_path {
            if path.is_file() {
                return Some(absolute(path));
            }
            warn!("configured encoder {} does not exist", path.display());
            return None;
        }

        let file_name = self.file_name();

        let beside_exe = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)));
        let in_cwd = env::current_dir().ok().map(|dir| dir.join(&file_name));

        for candidate in [beside_exe, in_cwd].into_iter().flatten() {
            if candidate.is_file() {
                debug!("found encoder at {}", candidate.display());
                return Some(candidate);
            }
        }

        match which::which(&file_name) {
            Ok(path) => {
                debug!("found encoder on PATH at {}", path.display());
                Some(absolute(&path))
            }
            Err(err) => {
                warn!("could not find {}: {}", file_name, err);
                None
            }
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
