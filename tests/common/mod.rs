#![allow(dead_code)]

use std::fs;
use std::path::Path;

use object::write::Object;
use object::{Architecture, BinaryFormat, Endianness, SectionKind};

use fridare::alias::Alias;
use fridare::compress::Compression;
use fridare::deb::{DebArchive, Payload, DEBIAN_BINARY_VERSION};
use fridare::remap::Topology;
use fridare::tarball;

pub const RODATA: &[u8] = b"frida:rpc\0frida-main-loop\0gum-js-loop\0frida_server_%u\0frida-agent-64.so\0";
pub const TEXT: &[u8] = b"\x90\x90frida:rpc\x90gum-\xc3";
pub const CSTRING: &[u8] =
    b"frida-server-main-loop\0/usr/lib/frida/frida-agent.dylib\0gum-exceptor\0frida:rpc\0";
pub const CONST: &[u8] = b"\0\0\0\0frida:rpc\0\0\0";

pub fn alias() -> Alias {
    Alias::new("abcde").unwrap()
}

/// A relocatable ELF with the given `.rodata` and optional `.text` contents.
pub fn elf(rodata: Option<&[u8]>, text: Option<&[u8]>) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    if let Some(text) = text {
        let id = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(id, text, 16);
    }
    if let Some(rodata) = rodata {
        let id = obj.add_section(Vec::new(), b".rodata".to_vec(), SectionKind::ReadOnlyData);
        obj.append_section_data(id, rodata, 8);
    }
    obj.write().unwrap()
}

/// A thin Mach-O object with `__TEXT,__cstring` and optionally `__DATA,__const`.
pub fn macho(arch: Architecture, cstring: &[u8], konst: Option<&[u8]>) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::MachO, arch, Endianness::Little);
    let id = obj.add_section(b"__TEXT".to_vec(), b"__cstring".to_vec(), SectionKind::ReadOnlyString);
    obj.append_section_data(id, cstring, 1);
    if let Some(konst) = konst {
        let id = obj.add_section(b"__DATA".to_vec(), b"__const".to_vec(), SectionKind::ReadOnlyData);
        obj.append_section_data(id, konst, 8);
    }
    obj.write().unwrap()
}

/// Wraps thin images in a 32-bit fat header, each slice 4 KiB aligned.
pub fn fat(slices: &[(u32, Vec<u8>)]) -> Vec<u8> {
    const ALIGN_LOG2: u32 = 12;
    let header_len = 8 + 20 * slices.len() as u64;

    let mut offsets = Vec::new();
    let mut cursor = header_len;
    for (_, image) in slices {
        let offset = align_up(cursor, 1 << ALIGN_LOG2);
        offsets.push(offset);
        cursor = offset + image.len() as u64;
    }

    let mut out = Vec::new();
    out.extend_from_slice(&object::macho::FAT_MAGIC.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());
    for ((cputype, image), offset) in slices.iter().zip(&offsets) {
        out.extend_from_slice(&cputype.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&(*offset as u32).to_be_bytes());
        out.extend_from_slice(&(image.len() as u32).to_be_bytes());
        out.extend_from_slice(&ALIGN_LOG2.to_be_bytes());
    }
    for ((_, image), offset) in slices.iter().zip(&offsets) {
        out.resize(*offset as usize, 0);
        out.extend_from_slice(image);
    }
    out
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    memchr::memmem::find(haystack, needle).is_some()
}

pub fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

#[cfg(unix)]
pub fn chmod(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

#[cfg(not(unix))]
pub fn chmod(_path: &Path, _mode: u32) {}

pub const PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
	<key>Label</key>
	<string>re.frida.server</string>
	<key>ProgramArguments</key>
	<array>
		<string>PREFIX/usr/sbin/frida-server</string>
	</array>
	<key>RunAtLoad</key>
	<true/>
</dict>
</plist>
"#;

pub const CONTROL: &str = "\
Package: re.frida.server
Version: 16.5.9
Architecture: iphoneos-arm64
Maintainer: Frida Maintainers <oleavr@frida.re>
Description: Observe and reprogram running programs.
 Long description line.
Section: Development
";

/// Lays out an unpatched package tree under `root` with binaries under `prefix`.
pub fn package_tree(root: &Path, prefix: &str) {
    let base = root.join(prefix);
    fs::create_dir_all(base.join("usr/sbin")).unwrap();
    fs::create_dir_all(base.join("usr/lib/frida")).unwrap();
    fs::create_dir_all(base.join("Library/LaunchDaemons")).unwrap();
    fs::create_dir_all(root.join("DEBIAN")).unwrap();

    let server = base.join("usr/sbin/frida-server");
    fs::write(&server, macho(Architecture::Aarch64, CSTRING, Some(CONST))).unwrap();
    chmod(&server, 0o755);
    fs::write(
        base.join("usr/lib/frida/frida-agent.dylib"),
        macho(Architecture::Aarch64, CSTRING, None),
    )
    .unwrap();

    let program_prefix = if prefix.is_empty() { String::new() } else { format!("/{prefix}") };
    fs::write(
        base.join("Library/LaunchDaemons/re.frida.server.plist"),
        PLIST.replace("PREFIX", &program_prefix),
    )
    .unwrap();

    fs::write(root.join("DEBIAN/control"), CONTROL).unwrap();
    let extrainst = format!(
        "#!/bin/sh\nlaunchctl load {program_prefix}/Library/LaunchDaemons/re.frida.server.plist\n"
    );
    fs::write(root.join("DEBIAN/extrainst_"), &extrainst).unwrap();
    fs::write(root.join("DEBIAN/prerm"), extrainst.replace("load", "unload")).unwrap();
}

/// Packs a tree laid out by [`package_tree`] into a `.deb` at `output`.
pub fn write_deb(root: &Path, topology: Topology, output: &Path) {
    // Role-based modes depend only on names here, any alias will do.
    let data = tarball::build_data(root, topology, &alias()).unwrap();
    let control = tarball::build_control(&root.join("DEBIAN")).unwrap();
    let deb = DebArchive {
        version: DEBIAN_BINARY_VERSION.to_vec(),
        control: Payload::from_tar("control", &control, Compression::Xz).unwrap(),
        data: Payload::from_tar("data", &data, Compression::Xz).unwrap(),
    };
    fs::write(output, deb.to_bytes().unwrap()).unwrap();
}

/// Reads every entry of a tar stream as `(name, mode, contents)`.
pub fn tar_entries(tar: &[u8]) -> Vec<(String, u32, Vec<u8>)> {
    use std::io::Read;
    let mut archive = tar::Archive::new(tar);
    archive
        .entries()
        .unwrap()
        .map(|e| {
            let mut e = e.unwrap();
            let name = String::from_utf8_lossy(&e.path_bytes()).into_owned();
            let mode = e.header().mode().unwrap();
            let mut data = Vec::new();
            e.read_to_end(&mut data).unwrap();
            (name, mode, data)
        })
        .collect()
}
