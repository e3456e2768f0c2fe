//! Executable format detection.
//!
//! This module checks a file's magic bytes and opens it as one of the four
//! supported shapes: thin Mach-O, fat (universal) Mach-O, ELF or PE. Parsing is
//! done by the `object` crate; the section table of every image is copied into
//! owned [`Section`] values so the mapped file can be released before anything
//! is written back to it.

use std::fmt;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use object::read::macho::{FatArch, MachOFatFile32, MachOFatFile64};
use object::{Architecture, FileKind, Object, ObjectKind, ObjectSection, SectionFlags};

use crate::error::{Error, Result};

/// The executable container a rule set is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    MachO,
    Elf,
    Pe,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::MachO => "Mach-O",
            Format::Elf => "ELF",
            Format::Pe => "PE",
        })
    }
}

/// A file-backed section of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section name (`__cstring`, `.rodata`, ...).
    pub name: String,
    /// Owning segment, when the format has one (Mach-O).
    pub segment: Option<String>,
    /// Offset of the section's bytes, relative to the start of its image.
    pub file_offset: u64,
    /// Size of the section's bytes in the file.
    pub size: u64,
    /// Raw format-specific flags.
    pub flags: u64,
}

/// Capability shared by every parsed image: a section table plus the file
/// offset its section offsets are relative to.
pub trait SectionTable {
    fn sections(&self) -> &[Section];

    fn section_offset_base(&self) -> u64;

    /// Looks up the first section called `name`.
    fn section(&self, name: &str) -> Option<&Section> {
        self.sections().iter().find(|s| s.name == name)
    }

    /// Absolute file offset of `section`.
    fn absolute_offset(&self, section: &Section) -> u64 {
        self.section_offset_base() + section.file_offset
    }
}

/// One parsed image. Thin files have exactly one; a fat Mach-O has one per
/// architecture slice, each with its own base offset.
#[derive(Debug, Clone)]
pub struct Image {
    pub format: Format,
    pub architecture: Architecture,
    pub kind: ObjectKind,
    pub is_64: bool,
    pub is_little_endian: bool,
    /// Offset of the image inside the file (non-zero only for fat slices).
    pub base_offset: u64,
    /// Length of the image in bytes.
    pub size: u64,
    sections: Vec<Section>,
}

impl Image {
    fn parse(format: Format, data: &[u8], base_offset: u64) -> Result<Self> {
        let file = object::File::parse(data)
            .map_err(|e| Error::UnsupportedFormat(format!("{format} parse failed: {e}")))?;

        let mut sections = Vec::new();
        for section in file.sections() {
            // Zero-fill / NOBITS sections have nothing on disk to patch.
            let Some((file_offset, size)) = section.file_range() else {
                continue;
            };
            let Ok(name) = section.name() else {
                tracing::trace!("Skipping section with unreadable name at {:#x}", file_offset);
                continue;
            };
            sections.push(Section {
                name: name.to_string(),
                segment: section.segment_name().ok().flatten().map(str::to_string),
                file_offset,
                size,
                flags: raw_flags(section.flags()),
            });
        }

        Ok(Self {
            format,
            architecture: file.architecture(),
            kind: file.kind(),
            is_64: file.is_64(),
            is_little_endian: file.is_little_endian(),
            base_offset,
            size: data.len() as u64,
            sections,
        })
    }

    /// Borrows the bytes of `section` out of the whole file.
    pub fn section_data<'a>(&self, file_data: &'a [u8], section: &Section) -> Result<&'a [u8]> {
        let start = self.absolute_offset(section);
        let out_of_bounds = || Error::SectionOutOfBounds {
            name: section.name.clone(),
            offset: start,
            size: section.size,
        };
        let end = start.checked_add(section.size).ok_or_else(out_of_bounds)?;
        if end > file_data.len() as u64 {
            return Err(out_of_bounds());
        }
        Ok(&file_data[start as usize..end as usize])
    }
}

impl SectionTable for Image {
    fn sections(&self) -> &[Section] {
        &self.sections
    }

    fn section_offset_base(&self) -> u64 {
        self.base_offset
    }
}

fn raw_flags(flags: SectionFlags) -> u64 {
    match flags {
        SectionFlags::Elf { sh_flags } => sh_flags,
        SectionFlags::MachO { flags } => u64::from(flags),
        SectionFlags::Coff { characteristics } => u64::from(characteristics),
        _ => 0,
    }
}

/// A detected executable.
#[derive(Debug, Clone)]
pub enum ExecutableHandle {
    ThinMachO(Image),
    FatMachO(Vec<Image>),
    Elf(Image),
    Pe(Image),
}

impl ExecutableHandle {
    pub fn format(&self) -> Format {
        match self {
            ExecutableHandle::ThinMachO(_) | ExecutableHandle::FatMachO(_) => Format::MachO,
            ExecutableHandle::Elf(_) => Format::Elf,
            ExecutableHandle::Pe(_) => Format::Pe,
        }
    }

    /// Every image in the file, in file order.
    pub fn images(&self) -> &[Image] {
        match self {
            ExecutableHandle::FatMachO(slices) => slices,
            ExecutableHandle::ThinMachO(image)
            | ExecutableHandle::Elf(image)
            | ExecutableHandle::Pe(image) => std::slice::from_ref(image),
        }
    }

    pub fn is_fat(&self) -> bool {
        matches!(self, ExecutableHandle::FatMachO(_))
    }
}

/// Opens `path` and detects its format.
pub fn detect(path: &Path) -> Result<ExecutableHandle> {
    let file = File::open(path).map_err(Error::at(path))?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(Error::at(path))?;
    detect_bytes(&mmap).map_err(|e| match e {
        Error::UnsupportedFormat(reason) => {
            Error::UnsupportedFormat(format!("{}: {}", path.display(), reason))
        }
        other => other,
    })
}

/// Detects the format of an in-memory file.
///
/// Probes, in order: thin Mach-O, fat Mach-O, ELF, PE.
pub fn detect_bytes(data: &[u8]) -> Result<ExecutableHandle> {
    let kind = FileKind::parse(data)
        .map_err(|_| Error::UnsupportedFormat("file too short or unrecognised".to_string()))?;

    let handle = match kind {
        FileKind::MachO32 | FileKind::MachO64 => {
            ExecutableHandle::ThinMachO(Image::parse(Format::MachO, data, 0)?)
        }
        FileKind::MachOFat32 => {
            let fat = MachOFatFile32::parse(data)
                .map_err(|e| Error::UnsupportedFormat(format!("fat Mach-O: {e}")))?;
            ExecutableHandle::FatMachO(parse_slices(fat.arches(), data)?)
        }
        FileKind::MachOFat64 => {
            let fat = MachOFatFile64::parse(data)
                .map_err(|e| Error::UnsupportedFormat(format!("fat Mach-O: {e}")))?;
            ExecutableHandle::FatMachO(parse_slices(fat.arches(), data)?)
        }
        FileKind::Elf32 | FileKind::Elf64 => ExecutableHandle::Elf(Image::parse(Format::Elf, data, 0)?),
        FileKind::Pe32 | FileKind::Pe64 => ExecutableHandle::Pe(Image::parse(Format::Pe, data, 0)?),
        other => {
            return Err(Error::UnsupportedFormat(format!("{other:?} files are not patchable")));
        }
    };

    tracing::debug!(
        "Detected {} ({} image(s))",
        handle.format(),
        handle.images().len()
    );
    Ok(handle)
}

fn parse_slices<A: FatArch>(arches: &[A], data: &[u8]) -> Result<Vec<Image>> {
    let mut slices = Vec::with_capacity(arches.len());
    for arch in arches {
        let (offset, _) = arch.file_range();
        let bytes = arch
            .data(data)
            .map_err(|e| Error::UnsupportedFormat(format!("fat slice at {offset:#x}: {e}")))?;
        slices.push(Image::parse(Format::MachO, bytes, offset)?);
    }
    Ok(slices)
}

/// A printable run of bytes found inside a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundString {
    pub offset: u64,
    pub text: String,
}

/// Collects runs of printable ASCII at least `min_len` bytes long.
/// `base_offset` is added to every reported offset.
pub fn printable_strings(data: &[u8], base_offset: u64, min_len: usize) -> Vec<FoundString> {
    let mut found = Vec::new();
    let mut start = None;
    for (i, &b) in data.iter().chain(std::iter::once(&0)).enumerate() {
        let printable = (0x20..0x7f).contains(&b);
        match (printable, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if i - s >= min_len {
                    found.push(FoundString {
                        offset: base_offset + s as u64,
                        text: String::from_utf8_lossy(&data[s..i]).into_owned(),
                    });
                }
                start = None;
            }
            _ => {}
        }
    }
    found
}

impl fmt::Display for ExecutableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            ExecutableHandle::ThinMachO(_) => "Mach-O",
            ExecutableHandle::FatMachO(_) => "Mach-O universal binary",
            ExecutableHandle::Elf(_) => "ELF",
            ExecutableHandle::Pe(_) => "PE",
        };
        writeln!(f, "Format: {shape}")?;
        for (index, image) in self.images().iter().enumerate() {
            if self.is_fat() {
                writeln!(
                    f,
                    "Slice {index}: offset {:#x}, size {:#x}",
                    image.base_offset, image.size
                )?;
            }
            writeln!(
                f,
                "  Architecture: {:?}, {}-bit, {} endian, {:?}",
                image.architecture,
                if image.is_64 { 64 } else { 32 },
                if image.is_little_endian { "little" } else { "big" },
                image.kind
            )?;
            writeln!(f, "  Sections: {}", image.sections().len())?;
            for section in image.sections() {
                let name = match &section.segment {
                    Some(segment) if !segment.is_empty() => format!("{},{}", segment, section.name),
                    _ => section.name.clone(),
                };
                writeln!(
                    f,
                    "    {:<28} offset {:#010x} size {:#010x} flags {:#x}",
                    name,
                    image.absolute_offset(section),
                    section.size,
                    section.flags
                )?;
            }
        }
        Ok(())
    }
}
