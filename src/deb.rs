//! The `.deb` envelope: an `ar` archive holding a version marker, a control
//! payload and a data payload, always in that order.

use std::path::Path;

use crate::ar::{self, ArMember, ArWriter};
use crate::compress::{self, Compression};
use crate::error::{Error, Result};

pub const DEBIAN_BINARY: &str = "debian-binary";
pub const DEBIAN_BINARY_VERSION: &[u8] = b"2.0\n";

/// A compressed tar payload as stored in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn compression(&self) -> Compression {
        Compression::from_magic(&self.bytes)
    }

    /// The uncompressed tar stream.
    pub fn tar(&self) -> Result<Vec<u8>> {
        compress::decompress(&self.bytes)
    }

    /// Compresses `tar` and names the member after `stem` and the codec.
    pub fn from_tar(stem: &str, tar: &[u8], compression: Compression) -> Result<Self> {
        Ok(Self {
            name: compression.member_name(stem),
            bytes: compress::compress(tar, compression)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebArchive {
    pub version: Vec<u8>,
    pub control: Payload,
    pub data: Payload,
}

impl DebArchive {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_members(ar::extract(path)?)
    }

    /// Picks the recognised members out of a decoded archive.
    pub fn from_members(members: Vec<ArMember>) -> Result<Self> {
        let mut version = None;
        let mut control = None;
        let mut data = None;

        for member in members {
            let slot = if member.name == DEBIAN_BINARY {
                version = Some(member.payload);
                continue;
            } else if is_payload(&member.name, "control") {
                &mut control
            } else if is_payload(&member.name, "data") {
                &mut data
            } else {
                tracing::info!("Ignoring unrecognised member {:?}", member.name);
                continue;
            };
            if slot.is_some() {
                tracing::warn!("Duplicate member {:?}, keeping the first", member.name);
                continue;
            }
            *slot = Some(Payload {
                name: member.name,
                bytes: member.payload,
            });
        }

        let version = version.unwrap_or_else(|| {
            tracing::warn!("Package has no {} member, assuming 2.0", DEBIAN_BINARY);
            DEBIAN_BINARY_VERSION.to_vec()
        });
        Ok(Self {
            version,
            control: control.ok_or(Error::MissingMember("control"))?,
            data: data.ok_or(Error::MissingMember("data"))?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = ArWriter::new(Vec::new());
        self.write_members(&mut writer)?;
        writer.finish()
    }

    pub fn write_to<W: std::io::Write>(&self, out: W) -> Result<()> {
        let mut writer = ArWriter::new(out);
        self.write_members(&mut writer)?;
        writer.finish()?;
        Ok(())
    }

    fn write_members<W: std::io::Write>(&self, writer: &mut ArWriter<W>) -> Result<()> {
        writer.append(DEBIAN_BINARY, &self.version)?;
        writer.append(&self.control.name, &self.control.bytes)?;
        writer.append(&self.data.name, &self.data.bytes)
    }
}

fn is_payload(name: &str, stem: &str) -> bool {
    name.starts_with(&format!("{stem}.tar")) && Compression::from_member_name(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> Vec<ArMember> {
        vec![
            ArMember::new(DEBIAN_BINARY, DEBIAN_BINARY_VERSION.to_vec()),
            ArMember::new("control.tar.gz", vec![1]),
            ArMember::new("data.tar.xz", vec![2, 3]),
        ]
    }

    #[test]
    fn test_from_members() {
        let deb = DebArchive::from_members(members()).unwrap();
        assert_eq!(deb.version, b"2.0\n");
        assert_eq!(deb.control.name, "control.tar.gz");
        assert_eq!(deb.data.bytes, vec![2, 3]);
    }

    #[test]
    fn test_member_order_is_fixed() {
        let mut shuffled = members();
        shuffled.reverse();
        let bytes = DebArchive::from_members(shuffled).unwrap().to_bytes().unwrap();
        let names: Vec<String> = ar::parse(&bytes).unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, ["debian-binary", "control.tar.gz", "data.tar.xz"]);
    }

    #[test]
    fn test_missing_data_member() {
        let mut partial = members();
        partial.pop();
        assert!(matches!(
            DebArchive::from_members(partial),
            Err(Error::MissingMember("data"))
        ));
    }

    #[test]
    fn test_unknown_members_are_ignored_and_version_defaults() {
        let mut list = members();
        list.remove(0);
        list.push(ArMember::new("_gpgorigin", vec![9]));
        let deb = DebArchive::from_members(list).unwrap();
        assert_eq!(deb.version, DEBIAN_BINARY_VERSION);
    }

    #[test]
    fn test_is_payload() {
        assert!(is_payload("data.tar", "data"));
        assert!(is_payload("control.tar.xz", "control"));
        assert!(!is_payload("data.tar.zst", "data"));
        assert!(!is_payload("database.tar", "data"));
    }
}
