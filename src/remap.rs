//! Deployment topology and path-prefix remapping.
//!
//! Rootless packages install under `var/jb`. The repackaged artifact moves that
//! prefix to `var/re`; every name and text substitution goes through one
//! [`PathRemapper`] so the two spellings can never disagree.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

pub const ROOTLESS_MARKER: &str = "var/jb";
pub const ROOTLESS_REPLACEMENT: &str = "var/re";

/// Root installs into `/`; Rootless installs under a jailbreak prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Root,
    Rootless,
}

impl Topology {
    /// Inspects a payload's entry names before anything is written to disk. The
    /// already-remapped prefix counts too, so a package that went through this
    /// tool once is still recognised.
    pub fn detect_from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rootless = names.into_iter().any(|name| {
            let name = name.as_ref();
            let name = name.strip_prefix("./").unwrap_or(name);
            [ROOTLESS_MARKER, ROOTLESS_REPLACEMENT].iter().any(|prefix| {
                name.strip_prefix(prefix)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
        });
        Self::from_flag(rootless)
    }

    fn from_flag(rootless: bool) -> Self {
        if rootless {
            Topology::Rootless
        } else {
            Topology::Root
        }
    }

    pub fn is_rootless(self) -> bool {
        self == Topology::Rootless
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Topology::Root => "root",
            Topology::Rootless => "rootless",
        })
    }
}

/// Applies the topology's prefix substitution. Idempotent.
#[derive(Debug, Clone, Copy)]
pub struct PathRemapper {
    topology: Topology,
}

impl PathRemapper {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    /// Remaps every occurrence of the Rootless marker in `text`.
    pub fn remap<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if self.topology.is_rootless() && text.contains(ROOTLESS_MARKER) {
            Cow::Owned(text.replace(ROOTLESS_MARKER, ROOTLESS_REPLACEMENT))
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Directory prefixes (relative to the package root) that installed files
    /// may live under: the root itself, plus the remapped prefix when Rootless.
    pub fn prefixes(&self) -> Vec<PathBuf> {
        match self.topology {
            Topology::Root => vec![PathBuf::new()],
            Topology::Rootless => vec![PathBuf::new(), PathBuf::from(ROOTLESS_REPLACEMENT)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_from_names() {
        assert_eq!(
            Topology::detect_from_names(["./", "./var/", "./var/jb/", "./var/jb/usr/sbin/frida-server"]),
            Topology::Rootless
        );
        assert_eq!(Topology::detect_from_names(["var/re/usr"]), Topology::Rootless);
        assert_eq!(
            Topology::detect_from_names(["./usr/sbin/frida-server", "./var/jbx/file"]),
            Topology::Root
        );
        assert_eq!(Topology::detect_from_names(Vec::<String>::new()), Topology::Root);
    }

    #[test]
    fn test_remap_is_idempotent() {
        let remapper = PathRemapper::new(Topology::Rootless);
        let once = remapper.remap("/var/jb/usr/sbin/frida-server /var/jb/Library").into_owned();
        assert_eq!(once, "/var/re/usr/sbin/frida-server /var/re/Library");
        assert_eq!(remapper.remap(&once), once);
    }

    #[test]
    fn test_root_passes_through() {
        let remapper = PathRemapper::new(Topology::Root);
        assert!(matches!(remapper.remap("var/jb/usr"), Cow::Borrowed("var/jb/usr")));
        assert_eq!(remapper.prefixes(), vec![PathBuf::new()]);
    }
}
