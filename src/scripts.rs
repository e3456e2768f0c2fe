//! Maintainer scripts in the control directory.

use std::fs;
use std::path::Path;

use crate::alias::Alias;
use crate::error::{Error, Result};
use crate::launchd;
use crate::remap::PathRemapper;

/// Scripts that may reference the service, in the order they are checked.
pub const MAINTAINER_SCRIPTS: &[&str] = &["extrainst_", "preinst", "postinst", "prerm", "postrm"];

/// Applies the descriptor name, binary path and prefix substitutions.
pub fn rewrite_script(text: &str, alias: &Alias, remapper: &PathRemapper) -> String {
    remapper
        .remap(text)
        .replace("re.frida.server.plist", &format!("{}.plist", launchd::label(alias)))
        .replace("/usr/sbin/frida-server", &format!("/usr/sbin/{alias}"))
}

/// Rewrites every maintainer script present in `control_dir` and marks it
/// executable. Returns the names of the scripts touched.
pub fn patch_scripts(control_dir: &Path, alias: &Alias, remapper: &PathRemapper) -> Result<Vec<&'static str>> {
    let mut touched = Vec::new();
    for &name in MAINTAINER_SCRIPTS {
        let path = control_dir.join(name);
        if !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path).map_err(Error::at(&path))?;
        match String::from_utf8(bytes) {
            Ok(text) => {
                let rewritten = rewrite_script(&text, alias, remapper);
                fs::write(&path, rewritten).map_err(Error::at(&path))?;
            }
            Err(_) => tracing::warn!("{} is not UTF-8, leaving its contents alone", name),
        }
        make_executable(&path)?;
        tracing::debug!("Patched maintainer script {}", name);
        touched.push(name);
    }
    Ok(touched)
}

#[cfg(unix)]
pub(crate) fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(Error::at(path))
}

#[cfg(not(unix))]
pub(crate) fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Post-install script for a freshly created package: fix ownership of the
/// service binary and load its descriptor from whichever prefix exists.
pub fn render_postinst(alias: &Alias, port: crate::alias::Port) -> String {
    let label = launchd::label(alias);
    format!(
        r#"#!/bin/sh
set -e

for prefix in "" /var/jb; do
    if [ -f "$prefix/usr/sbin/{alias}" ]; then
        chmod 755 "$prefix/usr/sbin/{alias}"
        chown root:wheel "$prefix/usr/sbin/{alias}"
    fi
    if [ -f "$prefix/Library/LaunchDaemons/{label}.plist" ]; then
        launchctl load "$prefix/Library/LaunchDaemons/{label}.plist"
    fi
done

echo "{alias} installed, listening on port {port}"
"#
    )
}

pub fn render_prerm(alias: &Alias) -> String {
    let label = launchd::label(alias);
    format!(
        r#"#!/bin/sh
set -e

for prefix in "" /var/jb; do
    if [ -f "$prefix/Library/LaunchDaemons/{label}.plist" ]; then
        launchctl unload "$prefix/Library/LaunchDaemons/{label}.plist"
    fi
done

echo "{alias} stopped"
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remap::Topology;

    const EXTRAINST: &str = "#!/bin/sh\n\
launchctl unload /var/jb/Library/LaunchDaemons/re.frida.server.plist\n\
launchctl load /var/jb/Library/LaunchDaemons/re.frida.server.plist\n";

    #[test]
    fn test_rewrite_rootless_script() {
        let alias = Alias::new("abcde").unwrap();
        let out = rewrite_script(EXTRAINST, &alias, &PathRemapper::new(Topology::Rootless));
        assert_eq!(
            out,
            "#!/bin/sh\n\
launchctl unload /var/re/Library/LaunchDaemons/re.abcde.server.plist\n\
launchctl load /var/re/Library/LaunchDaemons/re.abcde.server.plist\n"
        );
    }

    #[test]
    fn test_root_script_keeps_prefix() {
        let alias = Alias::new("abcde").unwrap();
        let out = rewrite_script(
            "launchctl load /Library/LaunchDaemons/re.frida.server.plist",
            &alias,
            &PathRemapper::new(Topology::Root),
        );
        assert_eq!(out, "launchctl load /Library/LaunchDaemons/re.abcde.server.plist");
    }

    #[cfg(unix)]
    #[test]
    fn test_patch_scripts_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("prerm"), EXTRAINST).unwrap();
        fs::set_permissions(dir.path().join("prerm"), fs::Permissions::from_mode(0o644)).unwrap();
        fs::write(dir.path().join("control"), "Package: x\n").unwrap();

        let alias = Alias::new("abcde").unwrap();
        let touched = patch_scripts(dir.path(), &alias, &PathRemapper::new(Topology::Rootless)).unwrap();

        assert_eq!(touched, vec!["prerm"]);
        let mode = fs::metadata(dir.path().join("prerm")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(fs::read_to_string(dir.path().join("prerm")).unwrap().contains("re.abcde.server.plist"));
    }

    #[test]
    fn test_rendered_scripts_reference_label() {
        let alias = Alias::new("abcde").unwrap();
        assert!(render_postinst(&alias, crate::alias::Port::default()).contains("re.abcde.server.plist"));
        assert!(render_prerm(&alias).contains("launchctl unload"));
    }
}
