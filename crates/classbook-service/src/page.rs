use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

pub const APP_NAME: &str = "Classbook";

const APP_NAME_PLACEHOLDER: &str = "{{app_name}}";

/// The application shell served at `/`.
#[derive(Debug, Clone)]
pub enum IndexPage {
    /// Re-read from disk on every render.
    Reload(PathBuf),
    Cached(Arc<str>),
}

impl IndexPage {
    /// Locate `templates/index.html` under `resources_dir`.
    ///
    /// # Errors
    /// In cached mode, returns an error when the template cannot be read.
    pub fn load(resources_dir: &Path, reload: bool) -> Result<Self> {
        let path = resources_dir.join("templates").join("index.html");
        if reload {
            return Ok(Self::Reload(path));
        }
        Ok(Self::Cached(Arc::from(read_rendered(&path)?)))
    }

    /// # Errors
    /// Returns an error when a reloading page cannot read its template.
    pub fn render(&self) -> Result<String> {
        match self {
            Self::Reload(path) => read_rendered(path),
            Self::Cached(html) => Ok(html.to_string()),
        }
    }
}

fn read_rendered(path: &Path) -> Result<String> {
    let template = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read template {}", path.display()))?;
    Ok(template.replace(APP_NAME_PLACEHOLDER, APP_NAME))
}
