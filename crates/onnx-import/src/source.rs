use std::collections::HashSet;
use std::path::{Path, PathBuf};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Cache, CacheRepo, Repo, RepoType};
use log::{debug, info};
use crate::RetrievalError;

pub const DEFAULT_REVISION: &str = "main";

const VALID_CHARS: [char; 4] = ['-', '_', '.', '/'];

fn is_valid_char(x: char) -> bool {
    x.is_alphanumeric() || VALID_CHARS.contains(&x)
}

/// Checks a registry repo id before it reaches the network.
pub fn validate_identifier(identifier: &str) -> Result<(), RetrievalError> {
    let valid = !identifier.is_empty()
        && identifier.chars().all(is_valid_char)
        && identifier.split('/').all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(RetrievalError::InvalidIdentifier(identifier.to_string()))
    }
}

pub fn validate_revision(revision: &str) -> Result<(), RetrievalError> {
    if !revision.is_empty() && revision.chars().all(is_valid_char) {
        Ok(())
    } else {
        Err(RetrievalError::InvalidRevision(revision.to_string()))
    }
}

/// How to reach the model registry.
#[derive(Clone, Debug, Default)]
pub struct RetrievalSettings {
    /// Branch, tag or commit; `main` when unset.
    pub revision: Option<String>,
    /// Registry cache directory; the registry default (`HF_HOME`) when unset.
    pub cache_dir: Option<PathBuf>,
    pub token: Option<String>,
    /// Only consult the local registry cache.
    pub offline: bool,
}

impl RetrievalSettings {
    pub fn revision(&self) -> &str {
        self.revision.as_deref().unwrap_or(DEFAULT_REVISION)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Hub { repo_id: String, revision: String },
}

impl ModelSource {
    /// An existing directory wins over a registry id of the same spelling.
    pub fn resolve(identifier: &str, settings: &RetrievalSettings) -> Result<Self, RetrievalError> {
        let path = Path::new(identifier);
        if path.is_dir() {
            return Ok(ModelSource::Local(path.to_path_buf()));
        }
        validate_identifier(identifier)?;
        let revision = settings.revision();
        validate_revision(revision)?;
        Ok(ModelSource::Hub {
            repo_id: identifier.to_string(),
            revision: revision.to_string(),
        })
    }

    pub fn fetcher(&self, settings: &RetrievalSettings) -> Result<Box<dyn FileFetcher>, RetrievalError> {
        Ok(match self {
            ModelSource::Local(dir) => Box::new(LocalDirFetcher { dir: dir.clone() }),
            ModelSource::Hub { repo_id, revision } if settings.offline => {
                Box::new(CacheFetcher::new(repo_id, revision, settings.cache_dir.as_deref()))
            }
            ModelSource::Hub { repo_id, revision } => {
                Box::new(HubFetcher::new(repo_id, revision, settings)?)
            }
        })
    }
}

/// Gives access to the files of one resolved model.
pub trait FileFetcher {
    fn identifier(&self) -> &str;

    fn get_optional(&self, file: &str) -> Result<Option<PathBuf>, RetrievalError>;

    fn get(&self, file: &str) -> Result<PathBuf, RetrievalError> {
        self.get_optional(file)?.ok_or_else(|| RetrievalError::MissingFile {
            identifier: self.identifier().to_string(),
            file: file.to_string(),
        })
    }
}

pub struct LocalDirFetcher {
    dir: PathBuf,
}

impl LocalDirFetcher {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl FileFetcher for LocalDirFetcher {
    fn identifier(&self) -> &str {
        self.dir.to_str().unwrap_or("<local directory>")
    }

    fn get_optional(&self, file: &str) -> Result<Option<PathBuf>, RetrievalError> {
        let path = self.dir.join(file);
        Ok(path.is_file().then_some(path))
    }
}

/// Downloads through the registry API, reusing its local cache.
pub struct HubFetcher {
    repo_id: String,
    repo: ApiRepo,
    files: HashSet<String>,
}

impl HubFetcher {
    pub fn new(repo_id: &str, revision: &str, settings: &RetrievalSettings) -> Result<Self, RetrievalError> {
        let registry_error = |source| RetrievalError::RegistryError {
            identifier: repo_id.to_string(),
            source,
        };
        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(cache_dir) = &settings.cache_dir {
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        if let Some(token) = &settings.token {
            builder = builder.with_token(Some(token.clone()));
        }
        let api = builder.build().map_err(registry_error)?;
        let repo = api.repo(Repo::with_revision(repo_id.to_string(), RepoType::Model, revision.to_string()));

        info!("Listing files of {} at {}", repo_id, revision);
        let info = repo.info().map_err(registry_error)?;
        let files = info.siblings.into_iter().map(|x| x.rfilename).collect();
        Ok(Self {
            repo_id: repo_id.to_string(),
            repo,
            files,
        })
    }
}

impl FileFetcher for HubFetcher {
    fn identifier(&self) -> &str {
        &self.repo_id
    }

    fn get_optional(&self, file: &str) -> Result<Option<PathBuf>, RetrievalError> {
        if !self.files.contains(file) {
            return Ok(None);
        }
        debug!("Fetching {}/{}", self.repo_id, file);
        let path = self.repo.get(file).map_err(|source| RetrievalError::RegistryError {
            identifier: self.repo_id.clone(),
            source,
        })?;
        Ok(Some(path))
    }
}

/// Reads the registry cache without touching the network.
pub struct CacheFetcher {
    repo_id: String,
    repo: CacheRepo,
    cache_root: PathBuf,
}

impl CacheFetcher {
    pub fn new(repo_id: &str, revision: &str, cache_dir: Option<&Path>) -> Self {
        let cache = match cache_dir {
            Some(dir) => Cache::new(dir.to_path_buf()),
            None => Cache::default(),
        };
        let cache_root = cache.path().clone();
        let repo = cache.repo(Repo::with_revision(repo_id.to_string(), RepoType::Model, revision.to_string()));
        Self {
            repo_id: repo_id.to_string(),
            repo,
            cache_root,
        }
    }
}

impl FileFetcher for CacheFetcher {
    fn identifier(&self) -> &str {
        &self.repo_id
    }

    fn get_optional(&self, file: &str) -> Result<Option<PathBuf>, RetrievalError> {
        let path = self.repo.get(file);
        if path.is_none() {
            debug!("{} not cached under {}", file, self.cache_root.display());
        }
        Ok(path)
    }

    fn get(&self, file: &str) -> Result<PathBuf, RetrievalError> {
        self.get_optional(file)?.ok_or_else(|| {
            if file == "config.json" {
                RetrievalError::NotCached { identifier: self.repo_id.clone() }
            } else {
                RetrievalError::MissingFile {
                    identifier: self.repo_id.clone(),
                    file: file.to_string(),
                }
            }
        })
    }
}
