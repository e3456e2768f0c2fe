//! Package orchestration.
//!
//! [`DebPatcher`] drives a `.deb` through a fixed sequence of [`Stage`]s inside a
//! private scratch workspace:
//!
//! 1. Extract: decode the `ar` envelope, decompress both payloads, detect the
//!    topology from the data payload's names and expand everything.
//! 2. ReadMetadata / PatchMetadata: rewrite the control file.
//! 3. PatchBinaries: patch and rename the service binary and agent libraries.
//! 4. PatchServiceDescriptor / PatchInstallScripts: text rewrites.
//! 5. Repackage: rebuild, compress and assemble, then move into place.
//! 6. Validate (optional): re-read what was written.
//!
//! A failing stage aborts the run with [`Error::Stage`]; the destination is only
//! replaced once Repackage has fully succeeded.

use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::alias::{Alias, Port};
use crate::binaries;
use crate::compress::Compression;
use crate::control::{ControlFile, PackageMetadata};
use crate::deb::{DebArchive, Payload};
use crate::error::{Error, Result};
use crate::launchd;
use crate::progress::Progress;
use crate::remap::{PathRemapper, Topology};
use crate::scripts;
use crate::tarball::{self, CONTROL_DIR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Extract,
    ReadMetadata,
    PatchMetadata,
    PatchBinaries,
    PatchServiceDescriptor,
    PatchInstallScripts,
    Repackage,
    Validate,
}

impl Stage {
    /// Progress reported on entry to the stage.
    pub fn fraction(self) -> f64 {
        match self {
            Stage::Extract => 0.1,
            Stage::ReadMetadata => 0.3,
            Stage::PatchMetadata => 0.4,
            Stage::PatchBinaries => 0.5,
            Stage::PatchServiceDescriptor => 0.7,
            Stage::PatchInstallScripts => 0.8,
            Stage::Repackage => 0.9,
            Stage::Validate => 0.95,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Stage::Extract => "Extracting package",
            Stage::ReadMetadata => "Reading package metadata",
            Stage::PatchMetadata => "Patching package metadata",
            Stage::PatchBinaries => "Patching binaries",
            Stage::PatchServiceDescriptor => "Patching service descriptor",
            Stage::PatchInstallScripts => "Patching install scripts",
            Stage::Repackage => "Repackaging",
            Stage::Validate => "Validating package",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Extract => "extract",
            Stage::ReadMetadata => "read-metadata",
            Stage::PatchMetadata => "patch-metadata",
            Stage::PatchBinaries => "patch-binaries",
            Stage::PatchServiceDescriptor => "patch-service-descriptor",
            Stage::PatchInstallScripts => "patch-install-scripts",
            Stage::Repackage => "repackage",
            Stage::Validate => "validate",
        })
    }
}

/// Reports entry to `stage`, runs `f`, and tags any failure with the stage.
pub(crate) fn run_stage<T>(
    stage: Stage,
    progress: &mut dyn FnMut(Progress),
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    tracing::info!("{}", stage.message());
    progress(Progress::new(stage.fraction(), stage.message()));
    f().map_err(|source| Error::Stage {
        stage,
        source: Box::new(source),
    })
}

/// What a successful run did.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub output: PathBuf,
    pub metadata: PackageMetadata,
    pub binaries: Vec<PathBuf>,
    pub libraries: Vec<PathBuf>,
    pub descriptors: Vec<PathBuf>,
    pub scripts: Vec<&'static str>,
    pub bytes_written: u64,
    /// Set when validation ran and failed; the package is still written.
    pub validation_warning: Option<String>,
}

/// Repackages a `.deb` under an alias.
#[derive(Debug, Clone)]
pub struct DebPatcher {
    input: PathBuf,
    output: PathBuf,
    alias: Alias,
    port: Port,
    validate: bool,
    compression: Compression,
}

impl DebPatcher {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, alias: Alias) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            alias,
            port: Port::default(),
            validate: false,
            compression: Compression::default(),
        }
    }

    pub fn port(mut self, port: Port) -> Self {
        self.port = port;
        self
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn run(&self, progress: &mut dyn FnMut(Progress)) -> Result<PatchOutcome> {
        let workspace = tempfile::Builder::new().prefix("fridare-").tempdir()?;
        let root = workspace.path().join("package");
        let control_dir = root.join(CONTROL_DIR);
        let control_path = control_dir.join("control");
        tracing::debug!("Workspace: {}", workspace.path().display());

        let (version, topology) = run_stage(Stage::Extract, progress, || {
            extract_package(&self.input, &root)
        })?;
        let remapper = PathRemapper::new(topology);

        let mut control = run_stage(Stage::ReadMetadata, progress, || {
            ControlFile::read(&control_path)
        })?;
        let mut metadata = PackageMetadata::from_control(&control, topology);
        tracing::info!(
            "Package {} {} ({}, {})",
            metadata.name,
            metadata.version,
            metadata.architecture,
            topology
        );

        run_stage(Stage::PatchMetadata, progress, || {
            metadata.apply_alias(&self.alias, self.port);
            metadata.write_into(&mut control);
            control.write(&control_path)
        })?;

        let (binaries, libraries) = run_stage(Stage::PatchBinaries, progress, || {
            let binaries = binaries::patch_service_binaries(&root, &self.alias, &remapper)?;
            let libraries = binaries::rename_agent_libraries(&root, &self.alias, &remapper)?;
            Ok((binaries, libraries))
        })?;

        let descriptors = run_stage(Stage::PatchServiceDescriptor, progress, || {
            launchd::patch_descriptors(&root, &self.alias, self.port, &remapper)
        })?;

        let scripts = run_stage(Stage::PatchInstallScripts, progress, || {
            scripts::patch_scripts(&control_dir, &self.alias, &remapper)
        })?;

        let bytes_written = run_stage(Stage::Repackage, progress, || {
            repackage(
                &root,
                topology,
                &self.alias,
                &version,
                self.compression,
                &self.output,
            )
        })?;

        let mut validation_warning = None;
        if self.validate {
            if let Err(e) = run_stage(Stage::Validate, progress, || validate_package(&self.output)) {
                tracing::warn!("{}", e);
                validation_warning = Some(e.to_string());
            }
        }

        progress(Progress::new(1.0, "Done"));
        tracing::info!("Wrote {} ({} bytes)", self.output.display(), bytes_written);

        Ok(PatchOutcome {
            output: self.output.clone(),
            metadata,
            binaries,
            libraries,
            descriptors,
            scripts,
            bytes_written,
            validation_warning,
        })
    }
}

/// Expands `input` under `root` and returns the version marker and topology.
fn extract_package(input: &Path, root: &Path) -> Result<(Vec<u8>, Topology)> {
    let deb = DebArchive::open(input)?;
    tracing::debug!(
        "Payloads: {} ({}), {} ({})",
        deb.control.name,
        deb.control.compression(),
        deb.data.name,
        deb.data.compression()
    );
    let control_tar = deb.control.tar()?;
    let data_tar = deb.data.tar()?;

    let topology = Topology::detect_from_names(tarball::entry_names(&data_tar)?);
    tracing::info!("Detected {} layout", topology);
    let remapper = PathRemapper::new(topology);

    fs::create_dir_all(root).map_err(Error::at(root))?;
    tarball::extract(&data_tar, root, &remapper)?;
    let control_dir = root.join(CONTROL_DIR);
    fs::create_dir_all(&control_dir).map_err(Error::at(&control_dir))?;
    tarball::extract(&control_tar, &control_dir, &remapper)?;

    if !control_dir.join("control").is_file() {
        return Err(Error::MissingMember("control file"));
    }
    Ok((deb.version, topology))
}

/// Builds both payloads from `root`, assembles the archive next to `output`
/// and moves it into place. Returns the archive size.
pub fn repackage(
    root: &Path,
    topology: Topology,
    alias: &Alias,
    version: &[u8],
    compression: Compression,
    output: &Path,
) -> Result<u64> {
    let control_tar = tarball::build_control(&root.join(CONTROL_DIR))?;
    let data_tar = tarball::build_data(root, topology, alias)?;

    let deb = DebArchive {
        version: version.to_vec(),
        control: Payload::from_tar("control", &control_tar, compression)?,
        data: Payload::from_tar("data", &data_tar, compression)?,
    };

    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let staged = NamedTempFile::new_in(parent).map_err(Error::at(parent))?;
    {
        let mut writer = BufWriter::new(staged.as_file());
        deb.write_to(&mut writer)?;
        writer.flush()?;
    }
    staged.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o644))
            .map_err(Error::at(staged.path()))?;
    }
    let file = staged.persist(output).map_err(|e| Error::File {
        path: output.to_path_buf(),
        source: e.error,
    })?;
    Ok(file.metadata()?.len())
}

/// What a successful self-check saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationReport {
    pub control_entries: usize,
    pub data_entries: usize,
}

/// Re-reads a written package and expands its data payload into a scratch
/// directory.
pub fn validate_package(path: &Path) -> Result<ValidationReport> {
    let invalid = |what: &str, e: Error| Error::Validation(format!("{what}: {e}"));

    let deb = DebArchive::open(path).map_err(|e| invalid("archive", e))?;
    if !deb.version.starts_with(b"2.") {
        return Err(Error::Validation(format!(
            "unexpected package format version {:?}",
            String::from_utf8_lossy(&deb.version).trim()
        )));
    }

    let control_tar = deb.control.tar().map_err(|e| invalid("control payload", e))?;
    let control_names = tarball::entry_names(&control_tar).map_err(|e| invalid("control payload", e))?;
    if !control_names.iter().any(|n| n.trim_start_matches("./") == "control") {
        return Err(Error::Validation("control payload has no control file".to_string()));
    }

    let data_tar = deb.data.tar().map_err(|e| invalid("data payload", e))?;
    let scratch = tempfile::tempdir()?;
    let topology = Topology::detect_from_names(tarball::entry_names(&data_tar)?);
    let stats = tarball::extract(&data_tar, scratch.path(), &PathRemapper::new(topology))
        .map_err(|e| invalid("data payload", e))?;

    let report = ValidationReport {
        control_entries: control_names.len(),
        data_entries: stats.directories + stats.files + stats.symlinks,
    };
    tracing::info!(
        "Validated {}: {} control entries, {} data entries",
        path.display(),
        report.control_entries,
        report.data_entries
    );
    Ok(report)
}
