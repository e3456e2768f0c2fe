//! Building a fresh package around a service binary.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::alias::{Alias, Port};
use crate::compress::Compression;
use crate::control::PackageMetadata;
use crate::deb::DEBIAN_BINARY_VERSION;
use crate::error::{Error, Result};
use crate::launchd::{self, DESCRIPTOR_DIR};
use crate::patch;
use crate::pipeline::{self, run_stage, Stage};
use crate::progress::Progress;
use crate::remap::{Topology, ROOTLESS_MARKER};
use crate::scripts;
use crate::tarball::CONTROL_DIR;

pub const ARCH_ARM: &str = "iphoneos-arm";
pub const ARCH_ARM64: &str = "iphoneos-arm64";

/// Infers the package architecture from the binary's magic. Fat and 32-bit
/// images map to `iphoneos-arm`, 64-bit (and anything unrecognised) to
/// `iphoneos-arm64`.
pub fn detect_architecture(path: &Path) -> Result<&'static str> {
    let mut magic = [0u8; 4];
    let mut file = fs::File::open(path).map_err(Error::at(path))?;
    file.read_exact(&mut magic).map_err(Error::at(path))?;
    Ok(match magic {
        [0xca, 0xfe, 0xba, 0xbe] | [0xce, 0xfa, 0xed, 0xfe] | [0xfe, 0xed, 0xfa, 0xce] => ARCH_ARM,
        _ => ARCH_ARM64,
    })
}

/// Builds a package from scratch.
#[derive(Debug, Clone)]
pub struct DebCreator {
    binary: PathBuf,
    agent: Option<PathBuf>,
    output: PathBuf,
    alias: Alias,
    port: Port,
    topology: Topology,
    version: String,
    maintainer: String,
    description: String,
    compression: Compression,
}

impl DebCreator {
    pub fn new(binary: impl Into<PathBuf>, output: impl Into<PathBuf>, alias: Alias) -> Self {
        Self {
            binary: binary.into(),
            agent: None,
            output: output.into(),
            alias,
            port: Port::default(),
            topology: Topology::Root,
            version: "1.0.0".to_string(),
            maintainer: "Fridare Team".to_string(),
            description: "Modified Frida Server for iOS".to_string(),
            compression: Compression::default(),
        }
    }

    pub fn agent(mut self, agent: Option<PathBuf>) -> Self {
        self.agent = agent;
        self
    }

    pub fn port(mut self, port: Port) -> Self {
        self.port = port;
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn maintainer(mut self, maintainer: impl Into<String>) -> Self {
        self.maintainer = maintainer.into();
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn package_name(&self) -> String {
        let mut name = format!("re.frida.server.{}", self.alias);
        if self.topology.is_rootless() {
            name.push_str(".rootless");
        }
        name
    }

    /// Writes the control file, stages the payload tree and repackages it.
    /// Returns the archive size.
    pub fn run(&self, progress: &mut dyn FnMut(Progress)) -> Result<u64> {
        let workspace = tempfile::Builder::new().prefix("fridare-create-").tempdir()?;
        let root = workspace.path().join("package");

        let architecture = detect_architecture(&self.binary)?;
        tracing::info!("Architecture: {}", architecture);
        progress(Progress::new(0.2, format!("Detected architecture {architecture}")));

        run_stage(Stage::PatchMetadata, progress, || self.write_control(&root, architecture))?;
        run_stage(Stage::PatchBinaries, progress, || self.stage_binaries(&root))?;
        run_stage(Stage::PatchServiceDescriptor, progress, || self.stage_descriptor(&root))?;
        run_stage(Stage::PatchInstallScripts, progress, || self.stage_scripts(&root))?;
        let size = run_stage(Stage::Repackage, progress, || {
            pipeline::repackage(
                &root,
                self.topology,
                &self.alias,
                DEBIAN_BINARY_VERSION,
                self.compression,
                &self.output,
            )
        })?;

        progress(Progress::new(1.0, "Done"));
        tracing::info!("Created {} ({} bytes)", self.output.display(), size);
        Ok(size)
    }

    fn install_prefix(&self, root: &Path) -> PathBuf {
        match self.topology {
            Topology::Root => root.to_path_buf(),
            Topology::Rootless => root.join(ROOTLESS_MARKER),
        }
    }

    fn program_path(&self) -> String {
        match self.topology {
            Topology::Root => format!("/usr/sbin/{}", self.alias),
            Topology::Rootless => format!("/{ROOTLESS_MARKER}/usr/sbin/{}", self.alias),
        }
    }

    fn stage_binaries(&self, root: &Path) -> Result<()> {
        let prefix = self.install_prefix(root);

        let sbin = prefix.join("usr/sbin");
        fs::create_dir_all(&sbin).map_err(Error::at(&sbin))?;
        let server = sbin.join(self.alias.as_str());
        fs::copy(&self.binary, &server).map_err(Error::at(&server))?;
        patch::patch_in_place(&server, &self.alias)?;
        scripts::make_executable(&server)?;

        if let Some(agent) = &self.agent {
            let lib = prefix.join("usr/lib").join(self.alias.as_str());
            fs::create_dir_all(&lib).map_err(Error::at(&lib))?;
            let extension = agent
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let target = lib.join(format!("{}-agent{}", self.alias, extension));
            fs::copy(agent, &target).map_err(Error::at(&target))?;
            patch::patch_in_place(&target, &self.alias)?;
            scripts::make_executable(&target)?;
        }
        Ok(())
    }

    fn descriptor(&self) -> String {
        launchd::render_descriptor(&self.alias, &self.program_path(), self.port)
    }

    fn stage_descriptor(&self, root: &Path) -> Result<()> {
        let daemons = self.install_prefix(root).join(DESCRIPTOR_DIR);
        fs::create_dir_all(&daemons).map_err(Error::at(&daemons))?;
        let plist = daemons.join(format!("{}.plist", launchd::label(&self.alias)));
        fs::write(&plist, self.descriptor()).map_err(Error::at(&plist))
    }

    fn stage_scripts(&self, root: &Path) -> Result<()> {
        let control_dir = root.join(CONTROL_DIR);
        for (name, body) in [
            ("postinst", scripts::render_postinst(&self.alias, self.port)),
            ("prerm", scripts::render_prerm(&self.alias)),
        ] {
            let path = control_dir.join(name);
            fs::write(&path, body).map_err(Error::at(&path))?;
            scripts::make_executable(&path)?;
        }
        Ok(())
    }

    fn write_control(&self, root: &Path, architecture: &str) -> Result<()> {
        let metadata = PackageMetadata {
            name: self.package_name(),
            version: self.version.clone(),
            architecture: architecture.to_string(),
            maintainer: self.maintainer.clone(),
            description: format!("{} (Modified with {})", self.description, self.alias),
            depends: String::new(),
            section: "Development".to_string(),
            priority: "optional".to_string(),
            homepage: String::new(),
            listen_port: self.port,
            alias: Some(self.alias.clone()),
            topology: self.topology,
        };
        let control_dir = root.join(CONTROL_DIR);
        fs::create_dir_all(&control_dir).map_err(Error::at(&control_dir))?;
        metadata
            .to_control(Some(self.installed_size_kb()?))
            .write(&control_dir.join("control"))
    }

    /// Size of the payload files in KiB, rounded up. Patching never changes a
    /// file's size, so this is known before anything is staged.
    fn installed_size_kb(&self) -> Result<u64> {
        let mut total = self.descriptor().len() as u64;
        for path in std::iter::once(&self.binary).chain(&self.agent) {
            total += fs::metadata(path).map_err(Error::at(path))?.len();
        }
        Ok(total.div_ceil(1024))
    }
}
