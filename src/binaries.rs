//! Binary stage of the package pipeline: the service executable and agent
//! libraries are patched into renamed copies and the originals removed.

use std::fs;
use std::path::{Path, PathBuf};

use crate::alias::{Alias, DEFAULT_NAME};
use crate::error::{Error, Result};
use crate::patch;
use crate::remap::PathRemapper;

const SERVICE_BINARY: &str = "frida-server";
const SERVICE_DIRS: &[&str] = &["usr/sbin", "usr/bin"];
const AGENT_MARKER: &str = "frida-agent";

/// Patches `old` into `new`, removes `old` and restores its permissions on `new`.
fn patch_renamed(old: &Path, new: &Path, alias: &Alias) -> Result<()> {
    if old == new {
        patch::patch_in_place(old, alias)?;
        return Ok(());
    }
    let permissions = fs::metadata(old).map_err(Error::at(old))?.permissions();
    fs::copy(old, new).map_err(Error::at(new))?;
    patch::patch_in_place(new, alias)?;
    fs::remove_file(old).map_err(Error::at(old))?;
    fs::set_permissions(new, permissions).map_err(Error::at(new))?;
    Ok(())
}

/// Finds `frida-server` under each install prefix and replaces it with a
/// patched `<alias>` alongside. Returns the new paths.
pub fn patch_service_binaries(root: &Path, alias: &Alias, remapper: &PathRemapper) -> Result<Vec<PathBuf>> {
    let mut patched = Vec::new();
    for prefix in remapper.prefixes() {
        for dir in SERVICE_DIRS {
            let old = root.join(&prefix).join(dir).join(SERVICE_BINARY);
            if !old.is_file() {
                continue;
            }
            let new = old.with_file_name(alias.as_str());
            patch_renamed(&old, &new, alias)?;
            tracing::info!("Patched service binary {} -> {}", old.display(), new.display());
            patched.push(new);
        }
    }
    if patched.is_empty() {
        tracing::warn!("No {} found in the package", SERVICE_BINARY);
    }
    Ok(patched)
}

/// Renames `usr/lib/frida` to `usr/lib/<alias>` under each prefix and patches
/// every agent library inside into its `<alias>-agent` name.
pub fn rename_agent_libraries(root: &Path, alias: &Alias, remapper: &PathRemapper) -> Result<Vec<PathBuf>> {
    let mut renamed = Vec::new();
    for prefix in remapper.prefixes() {
        let lib = root.join(&prefix).join("usr/lib");
        let old_dir = lib.join(DEFAULT_NAME);
        let new_dir = lib.join(alias.as_str());
        if old_dir.is_dir() && old_dir != new_dir {
            fs::rename(&old_dir, &new_dir).map_err(Error::at(&old_dir))?;
            tracing::debug!("Renamed {} -> {}", old_dir.display(), new_dir.display());
        }
        if !new_dir.is_dir() {
            continue;
        }

        let mut entries = fs::read_dir(&new_dir)
            .map_err(Error::at(&new_dir))?
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(Error::at(&new_dir))?;
        entries.sort_by_key(|e| e.file_name());

        let agent_stem = format!("{alias}-agent");
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if !name.contains(AGENT_MARKER) || !path.is_file() {
                continue;
            }
            let new = new_dir.join(name.replace(AGENT_MARKER, &agent_stem));
            patch_renamed(&path, &new, alias)?;
            tracing::info!("Patched agent library {} -> {}", name, new.display());
            renamed.push(new);
        }
    }
    Ok(renamed)
}
