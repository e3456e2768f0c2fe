//! String patch engine.
//!
//! Patching is split in two halves. [`plan`] is pure: it reads section bytes out of
//! a mapped file and produces one [`PatchPlan`] per touched section. [`apply_plans`]
//! is the only side effect: a positioned write of each patched range back at its
//! original offset. Section sizes never change, so nothing else in the file moves.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use memchr::memmem;
use memmap2::Mmap;

use crate::alias::{Alias, DEFAULT_NAME};
use crate::error::{Error, Result};
use crate::format::{self, ExecutableHandle, Format, Image, SectionTable};
use crate::progress::Progress;

/// An exact byte-string substitution. `new` is zero-padded to the length of `old`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementRule {
    old: Vec<u8>,
    padded: Vec<u8>,
}

impl ReplacementRule {
    pub fn new(old: impl Into<Vec<u8>>, new: impl AsRef<[u8]>) -> Result<Self> {
        let old = old.into();
        let new = new.as_ref();
        if new.len() > old.len() || old.is_empty() {
            return Err(Error::RuleTooLong {
                old: String::from_utf8_lossy(&old).into_owned(),
            });
        }
        let mut padded = new.to_vec();
        padded.resize(old.len(), 0);
        Ok(Self { old, padded })
    }

    pub fn old(&self) -> &[u8] {
        &self.old
    }

    /// Rewrites every non-overlapping occurrence, scanning left to right.
    /// Returns the number of substitutions.
    pub fn apply(&self, data: &mut [u8]) -> usize {
        if self.old == self.padded {
            return 0;
        }
        let mut count = 0;
        let mut pos = 0;
        while let Some(found) = memmem::find(&data[pos..], &self.old) {
            let start = pos + found;
            data[start..start + self.old.len()].copy_from_slice(&self.padded);
            pos = start + self.old.len();
            count += 1;
        }
        count
    }
}

/// Rules applied, in order, to one named section.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub section: &'static str,
    pub rules: Vec<ReplacementRule>,
}

const MACHO_CSTRING: &[&str] = &[
    "frida_server_",
    "frida-server-main-loop",
    "frida-main-loop",
    "frida:rpc",
    "frida-agent.dylib",
    "/usr/lib/frida/",
    "gum-",
];

const MACHO_CONST: &[&str] = &["frida:rpc"];

const ELF_RODATA: &[&str] = &[
    "frida_server_",
    "frida-main-loop",
    "frida:rpc",
    "frida-agent-<arch>.so",
    "frida-agent-arm.so",
    "frida-agent-arm64.so",
    "frida-agent-32.so",
    "frida-agent-64.so",
    "gum-",
];

const ELF_TEXT: &[&str] = &["frida:rpc", "gum-"];

const PE_RDATA: &[&str] = &[
    "frida-",
    "frida_",
    "frida_server_",
    "frida-main-loop",
    "gum-",
    "frida-thread",
    "frida:rpc",
    "frida-agent",
];

fn section_tokens(format: Format) -> &'static [(&'static str, &'static [&'static str])] {
    match format {
        Format::MachO => &[("__cstring", MACHO_CSTRING), ("__const", MACHO_CONST)],
        Format::Elf => &[(".rodata", ELF_RODATA), (".text", ELF_TEXT)],
        Format::Pe => &[(".rdata", PE_RDATA)],
    }
}

/// Replacement text for one token: the default name becomes the alias, and the
/// `gum` prefix becomes the alias's first three characters.
fn substitute(token: &str, alias: &Alias) -> String {
    match token.strip_prefix("gum") {
        Some(rest) => format!("{}{}", alias.short(), rest),
        None => token.replacen(DEFAULT_NAME, alias.as_str(), 1),
    }
}

/// The rule sets for `format`, in application order.
pub fn rule_sets(format: Format, alias: &Alias) -> Result<Vec<RuleSet>> {
    section_tokens(format)
        .iter()
        .map(|&(section, tokens)| {
            let rules = tokens
                .iter()
                .map(|token| ReplacementRule::new(token.as_bytes(), substitute(token, alias)))
                .collect::<Result<Vec<_>>>()?;
            Ok(RuleSet { section, rules })
        })
        .collect()
}

/// The computed rewrite of one section.
#[derive(Debug, Clone)]
pub struct PatchPlan {
    pub section: String,
    /// Absolute file offset of the section.
    pub section_offset: u64,
    pub original: Vec<u8>,
    pub patched: Vec<u8>,
    pub substitutions: usize,
}

impl PatchPlan {
    pub fn is_noop(&self) -> bool {
        self.original == self.patched
    }
}

/// Plans every rule set against one image. Absent sections are skipped.
pub fn plan_image(image: &Image, data: &[u8], rule_sets: &[RuleSet]) -> Result<Vec<PatchPlan>> {
    let mut plans = Vec::new();
    for set in rule_sets {
        let Some(section) = image.section(set.section) else {
            tracing::debug!("Section {} not present, skipping", set.section);
            continue;
        };
        let original = image.section_data(data, section)?.to_vec();
        let mut patched = original.clone();
        let mut substitutions = 0;
        for rule in &set.rules {
            let n = rule.apply(&mut patched);
            if n > 0 {
                tracing::trace!(
                    "{}: {} x {:?}",
                    set.section,
                    n,
                    String::from_utf8_lossy(rule.old())
                );
            }
            substitutions += n;
        }
        plans.push(PatchPlan {
            section: set.section.to_string(),
            section_offset: image.absolute_offset(section),
            original,
            patched,
            substitutions,
        });
    }
    Ok(plans)
}

/// Plans a patch of every image in `handle`. Fat slices are planned independently.
pub fn plan(handle: &ExecutableHandle, data: &[u8], alias: &Alias) -> Result<Vec<PatchPlan>> {
    let sets = rule_sets(handle.format(), alias)?;
    let mut plans = Vec::new();
    for image in handle.images() {
        plans.extend(plan_image(image, data, &sets)?);
    }
    Ok(plans)
}

/// Writes each non-empty plan back at its section offset.
pub fn apply_plans(file: &mut File, plans: &[PatchPlan]) -> Result<()> {
    for plan in plans.iter().filter(|p| !p.is_noop()) {
        file.seek(SeekFrom::Start(plan.section_offset))?;
        file.write_all(&plan.patched)?;
    }
    file.flush()?;
    Ok(())
}

/// Summary of one patched file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub images: usize,
    pub sections: usize,
    pub substitutions: usize,
}

/// Patches the executable at `path` in place.
pub fn patch_in_place(path: &Path, alias: &Alias) -> Result<PatchReport> {
    let handle = format::detect(path)?;

    let plans = {
        let file = File::open(path).map_err(Error::at(path))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(Error::at(path))?;
        plan(&handle, &mmap, alias)?
    };

    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(Error::at(path))?;
    apply_plans(&mut file, &plans).map_err(|e| match e {
        Error::Io(source) => Error::File {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })?;

    let report = PatchReport {
        images: handle.images().len(),
        sections: plans.iter().filter(|p| !p.is_noop()).count(),
        substitutions: plans.iter().map(|p| p.substitutions).sum(),
    };
    tracing::info!(
        "Patched {} ({}, {} image(s)): {} substitution(s) in {} section(s)",
        path.display(),
        handle.format(),
        report.images,
        report.substitutions,
        report.sections
    );
    Ok(report)
}

/// Copies `input` to `output` and patches the copy. The alias is validated
/// before anything is written.
pub fn patch_copy(
    input: &Path,
    output: &Path,
    alias: &str,
    progress: &mut dyn FnMut(Progress),
) -> Result<PatchReport> {
    let alias = Alias::new(alias)?;

    progress(Progress::new(0.1, "Copying executable"));
    std::fs::copy(input, output).map_err(Error::at(output))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(output, std::fs::Permissions::from_mode(0o755))
            .map_err(Error::at(output))?;
    }

    progress(Progress::new(0.3, "Detecting executable format"));
    let report = patch_in_place(output, &alias)?;

    progress(Progress::new(1.0, "Patch complete"));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alias(s: &str) -> Alias {
        Alias::new(s).unwrap()
    }

    #[test]
    fn test_rule_rejects_longer_replacement() {
        assert!(matches!(
            ReplacementRule::new("gum-", "longer"),
            Err(Error::RuleTooLong { .. })
        ));
    }

    #[test]
    fn test_rule_pads_with_zeros() {
        let rule = ReplacementRule::new("frida-agent", "ab").unwrap();
        let mut data = b"xfrida-agenty".to_vec();
        assert_eq!(rule.apply(&mut data), 1);
        assert_eq!(&data, b"xab\0\0\0\0\0\0\0\0\0y");
    }

    #[test]
    fn test_rule_is_leftmost_and_non_overlapping() {
        let rule = ReplacementRule::new("aa", "bb").unwrap();
        let mut data = b"aaa".to_vec();
        assert_eq!(rule.apply(&mut data), 1);
        assert_eq!(&data, b"bba");
    }

    #[test]
    fn test_rule_replaces_every_occurrence() {
        let rule = ReplacementRule::new("frida", "abcde").unwrap();
        let mut data = b"xxfrida:rpcxxfrida\0fridafrida".to_vec();
        assert_eq!(rule.apply(&mut data), 4);
        assert_eq!(&data, b"xxabcde:rpcxxabcde\0abcdeabcde");
    }

    #[test]
    fn test_substitute_tokens() {
        let a = alias("abcde");
        assert_eq!(substitute("frida:rpc", &a), "abcde:rpc");
        assert_eq!(substitute("/usr/lib/frida/", &a), "/usr/lib/abcde/");
        assert_eq!(substitute("gum-", &a), "abc-");
        assert_eq!(substitute("frida-agent-<arch>.so", &a), "abcde-agent-<arch>.so");
    }

    #[test]
    fn test_rule_tables_per_format() {
        let a = alias("abcde");
        let macho = rule_sets(Format::MachO, &a).unwrap();
        assert_eq!(macho.iter().map(|s| s.section).collect::<Vec<_>>(), ["__cstring", "__const"]);
        assert_eq!(macho[0].rules.len(), 7);

        let elf = rule_sets(Format::Elf, &a).unwrap();
        assert_eq!(elf.iter().map(|s| s.section).collect::<Vec<_>>(), [".rodata", ".text"]);
        assert_eq!(elf[0].rules.len(), 9);

        let pe = rule_sets(Format::Pe, &a).unwrap();
        assert_eq!(pe.len(), 1);
        assert_eq!(pe[0].section, ".rdata");
        assert_eq!(pe[0].rules.len(), 8);
    }

    #[test]
    fn test_pe_rules_apply_in_order() {
        let a = alias("abcde");
        let sets = rule_sets(Format::Pe, &a).unwrap();
        let mut data = b"frida_server_\0frida-thread\0gum-js\0frida:rpc".to_vec();
        let original_len = data.len();
        for rule in &sets[0].rules {
            rule.apply(&mut data);
        }
        assert_eq!(data.len(), original_len);
        assert_eq!(&data, b"abcde_server_\0abcde-thread\0abc-js\0abcde:rpc");
    }

    #[test]
    fn test_second_pass_is_noop() {
        let a = alias("gumxy");
        let sets = rule_sets(Format::Elf, &a).unwrap();
        let mut data = b"frida:rpc gum-js-loop frida-main-loop".to_vec();
        let first: usize = sets[0].rules.iter().map(|r| r.apply(&mut data)).sum();
        assert_eq!(first, 2);
        let after_first = data.clone();
        let second: usize = sets[0].rules.iter().map(|r| r.apply(&mut data)).sum();
        assert_eq!(second, 0);
        assert_eq!(data, after_first);
    }

    #[test]
    fn test_patch_copy_rejects_alias_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::write(&input, b"frida").unwrap();
        let err = patch_copy(&input, &output, "ab1", &mut crate::progress::ignore).unwrap_err();
        assert!(matches!(err, Error::InvalidAlias(_)));
        assert!(!output.exists());
    }
}
