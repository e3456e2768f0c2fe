//! Unix `ar` container codec.
//!
//! A `.deb` is an `ar` archive: the 8-byte global magic followed by members,
//! each a 60-byte text header and a payload padded to an even length. The
//! `ar` crate does the header encoding; this module adds the checks a package
//! reader needs (magic, short names, truncated payloads) and maps failures onto
//! [`Error`].

use std::io::{Read, Write};
use std::path::Path;

use crate::error::{Error, Result};

pub const AR_MAGIC: &[u8; 8] = b"!<arch>\n";
pub const HEADER_SIZE: usize = 60;
const NAME_LEN: usize = 16;
const MEMBER_MODE: u32 = 0o100644;

/// One archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArMember {
    pub name: String,
    pub payload: Vec<u8>,
}

impl ArMember {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Decodes every member of an in-memory archive, in order.
pub fn parse(data: &[u8]) -> Result<Vec<ArMember>> {
    if !data.starts_with(AR_MAGIC) {
        let seen = data[..data.len().min(AR_MAGIC.len())].to_vec();
        return Err(Error::NotAnArArchive(seen));
    }

    let mut archive = ::ar::Archive::new(data);
    let mut members = Vec::new();
    let mut offset = AR_MAGIC.len();
    while let Some(entry) = archive.next_entry() {
        let mut entry = entry.map_err(|e| Error::MalformedArchive {
            offset,
            reason: e.to_string(),
        })?;

        let identifier = String::from_utf8_lossy(entry.header().identifier()).into_owned();
        // GNU ar terminates names with '/'.
        let name = identifier.strip_suffix('/').unwrap_or(&identifier).to_string();
        let size = entry.header().size() as usize;

        let mut payload = Vec::with_capacity(size);
        entry.read_to_end(&mut payload).map_err(|e| Error::MalformedArchive {
            offset,
            reason: e.to_string(),
        })?;
        if payload.len() != size {
            return Err(Error::MalformedArchive {
                offset,
                reason: format!(
                    "member {:?} claims {} bytes but only {} remain",
                    name,
                    size,
                    payload.len()
                ),
            });
        }

        tracing::trace!("ar member {:?}: {} bytes at {:#x}", name, size, offset + HEADER_SIZE);
        members.push(ArMember::new(name, payload));
        offset += HEADER_SIZE + size + size % 2;
    }
    Ok(members)
}

/// Reads and decodes the archive at `path`.
pub fn extract(path: &Path) -> Result<Vec<ArMember>> {
    let data = std::fs::read(path).map_err(Error::at(path))?;
    parse(&data)
}

/// Streams members into an `ar` archive. Every header carries a zero
/// timestamp and owner and mode `100644`.
pub struct ArWriter<W: Write> {
    builder: ::ar::Builder<W>,
}

impl<W: Write> ArWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            builder: ::ar::Builder::new(inner),
        }
    }

    pub fn append(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        // Longer names would silently switch to the BSD `#1/` form.
        if name.len() > NAME_LEN || name.contains(' ') {
            return Err(Error::MemberNameTooLong(name.to_string()));
        }
        let mut header = ::ar::Header::new(name.as_bytes().to_vec(), payload.len() as u64);
        header.set_mode(MEMBER_MODE);
        self.builder.append(&header, payload)?;
        Ok(())
    }

    pub fn finish(self) -> Result<W> {
        let mut inner = self.builder.into_inner()?;
        inner.flush()?;
        Ok(inner)
    }
}

/// Encodes `members` into a complete archive.
pub fn assemble(members: &[ArMember]) -> Result<Vec<u8>> {
    if members.is_empty() {
        return Ok(AR_MAGIC.to_vec());
    }
    let mut writer = ArWriter::new(Vec::new());
    for member in members {
        writer.append(&member.name, &member.payload)?;
    }
    writer.finish()
}
