//! On-disk layout, installation markers and the EULA file.
//!
//! Resolving and downloading a server build is handled outside this crate,
//! by an [`InstallCommand`]. It records what it installed in three marker
//! files under `data/`. The lifecycle reads them, runs the installer when
//! they are missing, and clears them when an installation turns out to be
//! corrupted so the installer starts over.

use log::{info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("no server installation recorded in {}; install a server build first", .0.display())]
    NotInstalled(PathBuf),

    #[error("server binary {} is missing", .0.display())]
    MissingBinary(PathBuf),

    #[error("failed to run installer {}: {source}", program.display())]
    Installer {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("installer {} exited with {status}", program.display())]
    InstallerFailed { program: PathBuf, status: ExitStatus },

    #[error("failed to access installation: {0}")]
    Io(#[from] io::Error),
}

/// External program that downloads a server build into the server directory
/// and records it with the marker files.
///
/// It runs in the root directory with `VERSION`, `CHANNEL`, `SERVER_DIR` and
/// `DATA_DIR` set.
#[derive(Debug, Clone)]
pub struct InstallCommand {
    program: PathBuf,
}

impl InstallCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub async fn run(&self, paths: &Paths, version: &str, channel: &str) -> Result<(), InstallError> {
        info!("Installing server {} ({} channel)", version, channel);

        let status = tokio::process::Command::new(&self.program)
            .current_dir(&paths.root)
            .env("VERSION", version)
            .env("CHANNEL", channel)
            .env("SERVER_DIR", &paths.minecraft)
            .env("DATA_DIR", &paths.data)
            // stdin belongs to the operator console
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| InstallError::Installer {
                program: self.program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(InstallError::InstallerFailed {
                program: self.program.clone(),
                status,
            });
        }
        Ok(())
    }
}

/// Directory layout rooted at the working directory
#[derive(Debug, Clone)]
pub struct Paths {
    pub root: PathBuf,
    /// Working directory of the real server
    pub minecraft: PathBuf,
    pub data: PathBuf,
    pub version_file: PathBuf,
    pub build_file: PathBuf,
    pub binaries_file: PathBuf,
}

impl Paths {
    pub fn new(root: &Path) -> Self {
        let minecraft = root.join("minecraft");
        let data = root.join("data");
        Self {
            root: root.to_path_buf(),
            version_file: data.join(".version"),
            build_file: data.join(".build"),
            binaries_file: data.join(".binaries"),
            minecraft,
            data,
        }
    }

    pub fn create_directories(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.minecraft)?;
        std::fs::create_dir_all(&self.data)
    }

    pub fn server_properties(&self) -> PathBuf {
        self.minecraft.join("server.properties")
    }
}

/// Writes `eula.txt` into the server directory.
pub fn accept_eula(server_dir: &Path, accept: bool) -> io::Result<()> {
    std::fs::write(server_dir.join("eula.txt"), format!("eula={}", accept))
}

/// What the markers say is installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledServer {
    pub version: String,
    pub build: Option<u32>,
    pub binary: PathBuf,
}

/// Reads and clears the installation markers
#[derive(Debug, Clone)]
pub struct Installation {
    paths: Paths,
}

impl Installation {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn get_installed_version(&self) -> Option<String> {
        read_marker(&self.paths.version_file)
    }

    pub fn get_installed_build(&self) -> Option<u32> {
        read_marker(&self.paths.build_file).and_then(|build| build.parse().ok())
    }

    pub fn get_installed_binary(&self) -> Option<String> {
        read_marker(&self.paths.binaries_file)
    }

    /// Records an installation. Used by whatever installs the server build.
    pub fn record(&self, version: &str, build: u32, binary: &str) -> io::Result<()> {
        std::fs::write(&self.paths.version_file, version)?;
        std::fs::write(&self.paths.build_file, build.to_string())?;
        std::fs::write(&self.paths.binaries_file, binary)
    }

    /// Removes every marker so the next install starts from scratch.
    pub fn clear_installation_markers(&self) -> io::Result<()> {
        for marker in [
            &self.paths.version_file,
            &self.paths.build_file,
            &self.paths.binaries_file,
        ] {
            match std::fs::remove_file(marker) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        info!("Cleared installation markers");
        Ok(())
    }

    /// Resolves the installed server binary, warning when it does not match
    /// the requested version.
    pub fn ensure_installed(&self, requested_version: &str) -> Result<InstalledServer, InstallError> {
        let (Some(version), Some(binary)) =
            (self.get_installed_version(), self.get_installed_binary())
        else {
            return Err(InstallError::NotInstalled(self.paths.data.clone()));
        };

        let binary = self.paths.minecraft.join(binary);
        if !binary.is_file() {
            return Err(InstallError::MissingBinary(binary));
        }

        if requested_version != "latest" && requested_version != version {
            warn!(
                "Requested version {} but {} is installed",
                requested_version, version
            );
        }

        let build = self.get_installed_build();
        match build {
            Some(build) => info!("Using installed server {} build {}", version, build),
            None => info!("Using installed server {}", version),
        }

        Ok(InstalledServer {
            version,
            build,
            binary,
        })
    }

    /// Like [`Installation::ensure_installed`], but runs the installer first
    /// when nothing usable is installed.
    pub async fn install_if_missing(
        &self,
        installer: Option<&InstallCommand>,
        version: &str,
        channel: &str,
    ) -> Result<InstalledServer, InstallError> {
        let Some(installer) = installer else {
            return self.ensure_installed(version);
        };

        match self.ensure_installed(version) {
            Err(InstallError::NotInstalled(_)) | Err(InstallError::MissingBinary(_)) => {
                installer.run(&self.paths, version, channel).await?;
                self.ensure_installed(version)
            }
            result => result,
        }
    }
}

fn read_marker(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
