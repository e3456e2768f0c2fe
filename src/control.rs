//! Debian control file model.
//!
//! [`ControlFile`] keeps every field in its original order, including fields it
//! does not understand and multi-line continuation values, so rewriting one field
//! leaves the rest of the file byte-for-byte intact.

use std::fmt;
use std::path::Path;

use crate::alias::{Alias, Port, DEFAULT_NAME};
use crate::error::{Error, Result};
use crate::remap::Topology;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    name: String,
    /// First-line value followed by continuation lines, each kept verbatim.
    value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlFile {
    fields: Vec<Field>,
}

impl ControlFile {
    pub fn parse(text: &str) -> Self {
        let mut fields: Vec<Field> = Vec::new();
        for line in text.lines() {
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(last) = fields.last_mut() {
                    last.value.push('\n');
                    last.value.push_str(line);
                }
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => fields.push(Field {
                    name: name.trim().to_string(),
                    value: value.trim().to_string(),
                }),
                None if line.trim().is_empty() => {}
                None => tracing::debug!("Ignoring malformed control line {:?}", line),
            }
        }
        Self { fields }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(Error::at(path))?;
        Ok(Self::parse(&text))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_string()).map_err(Error::at(path))
    }

    /// The first line of a field's value. Names compare case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.lines().next().unwrap_or(""))
    }

    /// Replaces the first line of `name`, keeping any continuation lines, or
    /// appends the field if absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter_mut().find(|f| f.name.eq_ignore_ascii_case(name)) {
            Some(field) => {
                let rest = field.value.find('\n').map(|i| field.value[i..].to_string());
                field.value = value;
                if let Some(rest) = rest {
                    field.value.push_str(&rest);
                }
            }
            None => self.fields.push(Field {
                name: name.to_string(),
                value,
            }),
        }
    }
}

impl fmt::Display for ControlFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.fields {
            writeln!(f, "{}: {}", field.name, field.value)?;
        }
        Ok(())
    }
}

/// The fields this tool reads or rewrites, plus the repackaging parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageMetadata {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub maintainer: String,
    pub description: String,
    pub depends: String,
    pub section: String,
    pub priority: String,
    pub homepage: String,
    pub listen_port: Port,
    pub alias: Option<Alias>,
    pub topology: Topology,
}

impl PackageMetadata {
    pub fn from_control(control: &ControlFile, topology: Topology) -> Self {
        let field = |name: &str| control.get(name).unwrap_or_default().to_string();
        Self {
            name: field("Package"),
            version: field("Version"),
            architecture: field("Architecture"),
            maintainer: field("Maintainer"),
            description: field("Description"),
            depends: field("Depends"),
            section: field("Section"),
            priority: field("Priority"),
            homepage: field("Homepage"),
            listen_port: Port::default(),
            alias: None,
            topology,
        }
    }

    /// Renames the package and marks the description.
    pub fn apply_alias(&mut self, alias: &Alias, port: Port) {
        if !self.name.contains(alias.as_str()) {
            self.name = self.name.replace(DEFAULT_NAME, alias.as_str());
        }
        self.description = format!("{} (Modified with {})", self.description, alias);
        self.alias = Some(alias.clone());
        self.listen_port = port;
    }

    /// Writes the mutable fields back into `control`.
    pub fn write_into(&self, control: &mut ControlFile) {
        control.set("Package", &self.name);
        control.set("Version", &self.version);
        control.set("Description", &self.description);
    }

    /// Renders a fresh control file, skipping empty optional fields.
    pub fn to_control(&self, installed_size_kb: Option<u64>) -> ControlFile {
        let mut control = ControlFile::default();
        let fields = [
            ("Package", &self.name),
            ("Version", &self.version),
            ("Architecture", &self.architecture),
            ("Maintainer", &self.maintainer),
            ("Description", &self.description),
            ("Depends", &self.depends),
            ("Section", &self.section),
            ("Priority", &self.priority),
            ("Homepage", &self.homepage),
        ];
        for (name, value) in fields {
            if !value.is_empty() {
                control.set(name, value.as_str());
            }
        }
        if let Some(size) = installed_size_kb {
            control.set("Installed-Size", size.to_string());
        }
        control
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROL: &str = "\
Package: re.frida.server
Name: Frida
Version: 16.5.9
Architecture: iphoneos-arm64
Description: Observe and reprogram running programs.
 Second line of the long description.
 .
Maintainer: Frida Maintainers <oleavr@frida.re>
X-Custom: kept
";

    #[test]
    fn test_round_trip_preserves_everything() {
        assert_eq!(ControlFile::parse(CONTROL).to_string(), CONTROL);
    }

    #[test]
    fn test_get_is_case_insensitive() {
        let control = ControlFile::parse(CONTROL);
        assert_eq!(control.get("package"), Some("re.frida.server"));
        assert_eq!(control.get("Description"), Some("Observe and reprogram running programs."));
        assert_eq!(control.get("Depends"), None);
    }

    #[test]
    fn test_apply_alias() {
        let mut control = ControlFile::parse(CONTROL);
        let mut meta = PackageMetadata::from_control(&control, Topology::Root);
        meta.apply_alias(&Alias::new("abcde").unwrap(), Port::default());
        meta.write_into(&mut control);

        let text = control.to_string();
        assert!(text.starts_with("Package: re.abcde.server\n"));
        assert!(text.contains(
            "Description: Observe and reprogram running programs. (Modified with abcde)\n Second line"
        ));
        assert!(text.contains("X-Custom: kept\n"));
        assert!(text.contains("Name: Frida\n"));
    }

    #[test]
    fn test_name_already_containing_alias_is_kept() {
        let control = ControlFile::parse("Package: re.frida.server.abcde\n");
        let mut meta = PackageMetadata::from_control(&control, Topology::Rootless);
        meta.apply_alias(&Alias::new("abcde").unwrap(), Port::default());
        assert_eq!(meta.name, "re.frida.server.abcde");
    }

    #[test]
    fn test_to_control_skips_empty_fields() {
        let control = ControlFile::parse(CONTROL);
        let meta = PackageMetadata::from_control(&control, Topology::Root);
        let fresh = meta.to_control(Some(42)).to_string();
        assert!(!fresh.contains("Depends"));
        assert!(fresh.ends_with("Installed-Size: 42\n"));
    }
}
