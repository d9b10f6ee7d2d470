//! Agent tools: versions and the on-disk binary swap.
//!
//! Tool versions are staged by an external collaborator under
//! `<data-dir>/tools/<version>/`. Each agent runs the binaries that
//! `<data-dir>/tools/<entity-tag>` points at; an upgrade repoints that
//! symlink and exits so the process manager relaunches the agent.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fleet_id::EntityTag;
use thiserror::Error;
use tracing::info;

/// Errors from tool version handling.
#[derive(Debug, Error)]
pub enum ToolsError {
    #[error("invalid version {0:?}: expected major.minor.patch")]
    InvalidVersion(String),

    #[error("tools {0} are not staged")]
    NotFound(Version),

    #[error("tools I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Version
// =============================================================================

/// A `major.minor.patch` tools version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Version of the running binary.
    pub fn current() -> Self {
        env!("CARGO_PKG_VERSION").parse().unwrap_or_default()
    }
}

impl std::str::FromStr for Version {
    type Err = ToolsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ToolsError::InvalidVersion(s.to_string());
        let mut parts = s.split('.');
        let mut next = || -> Result<u32, ToolsError> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(invalid)
        };
        let version = Version::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl serde::Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tools Manager
// =============================================================================

/// Tool/version collaborator used by the upgrader and the run loop.
#[async_trait]
pub trait ToolsManager: Send + Sync {
    /// Version the agent is running.
    fn current_version(&self) -> Version;

    /// Make sure `version` is available locally.
    async fn fetch(&self, version: &Version) -> Result<(), ToolsError>;

    /// Point the agent at `version` so the next launch runs it.
    async fn swap_binaries_and_mark_restart(&self, version: &Version) -> Result<(), ToolsError>;
}

/// Tools laid out under a data directory.
pub struct FileTools {
    root: PathBuf,
    tag: EntityTag,
    current: Version,
}

impl FileTools {
    pub fn new(data_dir: impl AsRef<Path>, tag: EntityTag, current: Version) -> Self {
        Self {
            root: data_dir.as_ref().join("tools"),
            tag,
            current,
        }
    }

    /// Directory holding the binaries for `version`.
    pub fn version_dir(&self, version: &Version) -> PathBuf {
        self.root.join(version.to_string())
    }

    /// Version the agent symlink currently points at, if any.
    pub async fn active_version(&self) -> Result<Option<Version>, ToolsError> {
        let link = self.root.join(self.tag.to_string());
        match tokio::fs::read_link(&link).await {
            Ok(target) => {
                let name = target.to_string_lossy().into_owned();
                Ok(Some(name.parse()?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ToolsManager for FileTools {
    fn current_version(&self) -> Version {
        self.current
    }

    async fn fetch(&self, version: &Version) -> Result<(), ToolsError> {
        match tokio::fs::metadata(self.version_dir(version)).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ToolsError::NotFound(*version)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ToolsError::NotFound(*version))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn swap_binaries_and_mark_restart(&self, version: &Version) -> Result<(), ToolsError> {
        self.fetch(version).await?;

        let link = self.root.join(self.tag.to_string());
        let temp = self.root.join(format!("{}.tmp", self.tag));

        match tokio::fs::remove_file(&temp).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Relative target keeps the data directory relocatable.
        tokio::fs::symlink(version.to_string(), &temp).await?;
        tokio::fs::rename(&temp, &link).await?;

        info!(
            tag = %self.tag,
            from = %self.current,
            to = %version,
            "Agent tools swapped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_id::MachineId;
    use rstest::rstest;

    fn tag() -> EntityTag {
        EntityTag::machine(&MachineId::from_index(0))
    }

    #[rstest]
    #[case("1.2.3", Some(Version::new(1, 2, 3)))]
    #[case("0.0.0", Some(Version::new(0, 0, 0)))]
    #[case("1.2", None)]
    #[case("1.2.3.4", None)]
    #[case("1.x.3", None)]
    #[case("", None)]
    fn test_version_parse(#[case] input: &str, #[case] expected: Option<Version>) {
        assert_eq!(input.parse::<Version>().ok(), expected);
    }

    #[test]
    fn test_version_order() {
        assert!(Version::new(1, 9, 0) < Version::new(1, 10, 0));
        assert_eq!(Version::new(2, 0, 1).to_string(), "2.0.1");
    }

    #[tokio::test]
    async fn test_fetch_requires_staged_tools() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FileTools::new(dir.path(), tag(), Version::new(1, 0, 0));
        let target = Version::new(1, 1, 0);

        assert!(matches!(
            tools.fetch(&target).await,
            Err(ToolsError::NotFound(_))
        ));

        std::fs::create_dir_all(tools.version_dir(&target)).unwrap();
        tools.fetch(&target).await.unwrap();
    }

    #[tokio::test]
    async fn test_swap_repoints_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FileTools::new(dir.path(), tag(), Version::new(1, 0, 0));
        let v1 = Version::new(1, 1, 0);
        let v2 = Version::new(1, 2, 0);
        std::fs::create_dir_all(tools.version_dir(&v1)).unwrap();
        std::fs::create_dir_all(tools.version_dir(&v2)).unwrap();

        assert_eq!(tools.active_version().await.unwrap(), None);

        tools.swap_binaries_and_mark_restart(&v1).await.unwrap();
        assert_eq!(tools.active_version().await.unwrap(), Some(v1));

        tools.swap_binaries_and_mark_restart(&v2).await.unwrap();
        assert_eq!(tools.active_version().await.unwrap(), Some(v2));
        assert!(!dir.path().join("tools/machine-0.tmp").exists());
    }

    #[tokio::test]
    async fn test_swap_to_missing_version_fails() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FileTools::new(dir.path(), tag(), Version::new(1, 0, 0));
        let result = tools
            .swap_binaries_and_mark_restart(&Version::new(9, 9, 9))
            .await;
        assert!(result.is_err());
    }
}
