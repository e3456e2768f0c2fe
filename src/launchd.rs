//! Launch daemon descriptors (`.plist`) for the service.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::alias::{Alias, Port, DEFAULT_PORT};
use crate::error::{Error, Result};
use crate::remap::PathRemapper;

/// Descriptor directory, relative to each install prefix.
pub const DESCRIPTOR_DIR: &str = "Library/LaunchDaemons";

const SERVICE_MARKER: &str = "frida.server";
const DEFAULT_PROGRAM: &str = "/usr/sbin/frida-server";
const DEFAULT_LABEL: &str = "re.frida.server";

pub fn is_service_descriptor(file_name: &str) -> bool {
    file_name.contains(SERVICE_MARKER)
}

/// `re.frida.server.plist` becomes `re.<alias>.server.plist`.
pub fn descriptor_file_name(file_name: &str, alias: &Alias) -> String {
    file_name.replace(crate::alias::DEFAULT_NAME, alias.as_str())
}

pub fn label(alias: &Alias) -> String {
    format!("re.{alias}.server")
}

fn program_arguments() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<key>ProgramArguments</key>\s*<array>(.*?)</array>")
            .expect("ProgramArguments pattern is valid")
    })
}

fn listen_argument() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(<string>-l</string>\s*<string>)[^<]*(</string>)")
            .expect("listen argument pattern is valid")
    })
}

fn item_indent() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n([ \t]*)<").expect("indent pattern is valid"))
}

/// Makes `ProgramArguments` carry `-l 0.0.0.0:<port>`: an existing `-l` value is
/// replaced, otherwise the pair is appended at the array's item indentation.
pub fn ensure_listen_argument(text: &str, port: Port) -> String {
    let Some(args) = program_arguments().captures(text) else {
        tracing::warn!("Descriptor has no ProgramArguments array, listen port not set");
        return text.to_string();
    };
    let Some(body) = args.get(1) else {
        return text.to_string();
    };
    let address = format!("0.0.0.0:{port}");

    let new_body = if listen_argument().is_match(body.as_str()) {
        listen_argument()
            .replace(body.as_str(), |caps: &regex::Captures| {
                format!("{}{}{}", &caps[1], address, &caps[2])
            })
            .into_owned()
    } else {
        let content = body.as_str().trim_end();
        let trailing = &body.as_str()[content.len()..];
        let closing_indent = trailing.rsplit('\n').next().unwrap_or("");
        let indent = item_indent()
            .captures_iter(content)
            .last()
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| format!("{closing_indent}\t"));
        format!(
            "{content}\n{indent}<string>-l</string>\n{indent}<string>{address}</string>{}",
            if trailing.contains('\n') { trailing.to_string() } else { format!("\n{closing_indent}") }
        )
    };

    let mut out = String::with_capacity(text.len() + 64);
    out.push_str(&text[..body.start()]);
    out.push_str(&new_body);
    out.push_str(&text[body.end()..]);
    out
}

/// Rewrites descriptor text: program path, label, port, then listen argument.
pub fn rewrite_descriptor(text: &str, alias: &Alias, port: Port, remapper: &PathRemapper) -> String {
    let text = remapper.remap(text);
    let mut text = text
        .replace(DEFAULT_PROGRAM, &format!("/usr/sbin/{alias}"))
        .replace(DEFAULT_LABEL, &label(alias))
        .replace(
            &format!("<string>{DEFAULT_PORT}</string>"),
            &format!("<string>{port}</string>"),
        );
    if !port.is_default() {
        text = ensure_listen_argument(&text, port);
    }
    text
}

/// Renames and rewrites every service descriptor under `root`. Returns the new paths.
pub fn patch_descriptors(
    root: &Path,
    alias: &Alias,
    port: Port,
    remapper: &PathRemapper,
) -> Result<Vec<PathBuf>> {
    let mut patched = Vec::new();
    for prefix in remapper.prefixes() {
        let dir = root.join(prefix).join(DESCRIPTOR_DIR);
        if !dir.is_dir() {
            continue;
        }
        let mut entries = fs::read_dir(&dir)
            .map_err(Error::at(&dir))?
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(Error::at(&dir))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let old_path = entry.path();
            if !is_service_descriptor(&file_name) || !old_path.is_file() {
                continue;
            }
            let new_path = dir.join(descriptor_file_name(&file_name, alias));
            let permissions = fs::metadata(&old_path).map_err(Error::at(&old_path))?.permissions();
            let bytes = fs::read(&old_path).map_err(Error::at(&old_path))?;

            let contents = match String::from_utf8(bytes) {
                Ok(text) if !text.starts_with("bplist") => {
                    rewrite_descriptor(&text, alias, port, remapper).into_bytes()
                }
                Ok(text) => {
                    tracing::warn!("{} is a binary plist, renaming only", old_path.display());
                    text.into_bytes()
                }
                Err(e) => {
                    tracing::warn!("{} is a binary plist, renaming only", old_path.display());
                    e.into_bytes()
                }
            };

            fs::write(&new_path, contents).map_err(Error::at(&new_path))?;
            fs::set_permissions(&new_path, permissions).map_err(Error::at(&new_path))?;
            if new_path != old_path {
                fs::remove_file(&old_path).map_err(Error::at(&old_path))?;
            }
            tracing::info!("Patched descriptor {} -> {}", file_name, new_path.display());
            patched.push(new_path);
        }
    }
    Ok(patched)
}

/// A fresh descriptor launching `program` with the listen argument.
pub fn render_descriptor(alias: &Alias, program: &str, port: Port) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>Label</key>
	<string>{label}</string>
	<key>ProgramArguments</key>
	<array>
		<string>{program}</string>
		<string>-l</string>
		<string>0.0.0.0:{port}</string>
	</array>
	<key>UserName</key>
	<string>root</string>
	<key>RunAtLoad</key>
	<true/>
	<key>KeepAlive</key>
	<true/>
</dict>
</plist>
"#,
        label = label(alias),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remap::Topology;

    const PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
	<key>Label</key>
	<string>re.frida.server</string>
	<key>Program</key>
	<string>/var/jb/usr/sbin/frida-server</string>
	<key>ProgramArguments</key>
	<array>
		<string>/var/jb/usr/sbin/frida-server</string>
	</array>
	<key>EnvironmentVariables</key>
	<dict>
		<key>PORT</key>
		<string>27042</string>
	</dict>
</dict>
</plist>
"#;

    fn alias() -> Alias {
        Alias::new("abcde").unwrap()
    }

    #[test]
    fn test_rewrite_default_port() {
        let out = rewrite_descriptor(PLIST, &alias(), Port::default(), &PathRemapper::new(Topology::Rootless));
        assert!(out.contains("<string>re.abcde.server</string>"));
        assert!(out.contains("<string>/var/re/usr/sbin/abcde</string>"));
        assert!(!out.contains("frida"));
        assert!(!out.contains("-l"));
        assert!(!out.contains("var/jb"));
    }

    #[test]
    fn test_rewrite_custom_port_appends_listen_argument() {
        let port = Port::new(31337).unwrap();
        let out = rewrite_descriptor(PLIST, &alias(), port, &PathRemapper::new(Topology::Rootless));
        assert!(out.contains(
            "\t<array>\n\t\t<string>/var/re/usr/sbin/abcde</string>\n\t\t<string>-l</string>\n\t\t<string>0.0.0.0:31337</string>\n\t</array>"
        ));
        assert!(out.contains("<key>PORT</key>\n\t\t<string>31337</string>"));
        assert_eq!(out.matches("<string>-l</string>").count(), 1);
    }

    #[test]
    fn test_existing_listen_argument_is_replaced() {
        let text = render_descriptor(&alias(), "/usr/sbin/abcde", Port::default());
        let out = ensure_listen_argument(&text, Port::new(1234).unwrap());
        assert!(out.contains("<string>0.0.0.0:1234</string>"));
        assert!(!out.contains("27042"));
        assert_eq!(out.matches("<string>-l</string>").count(), 1);
        // Running again changes nothing.
        assert_eq!(ensure_listen_argument(&out, Port::new(1234).unwrap()), out);
    }

    #[test]
    fn test_patch_descriptors_renames_file() {
        let dir = tempfile::tempdir().unwrap();
        let daemons = dir.path().join("var/re").join(DESCRIPTOR_DIR);
        fs::create_dir_all(&daemons).unwrap();
        fs::write(daemons.join("re.frida.server.plist"), PLIST).unwrap();
        fs::write(daemons.join("com.other.plist"), "untouched").unwrap();

        let remapper = PathRemapper::new(Topology::Rootless);
        let patched = patch_descriptors(dir.path(), &alias(), Port::default(), &remapper).unwrap();

        assert_eq!(patched, vec![daemons.join("re.abcde.server.plist")]);
        assert!(!daemons.join("re.frida.server.plist").exists());
        assert_eq!(fs::read_to_string(daemons.join("com.other.plist")).unwrap(), "untouched");
    }

    #[test]
    fn test_descriptor_file_name() {
        assert_eq!(descriptor_file_name("re.frida.server.plist", &alias()), "re.abcde.server.plist");
        assert!(is_service_descriptor("re.frida.server.plist"));
        assert!(!is_service_descriptor("com.example.plist"));
    }
}
