//! Alias repackager for instrumentation-agent artifacts.
//!
//! This library rewrites the identifying strings, port and service labels of an
//! agent's executables and `.deb` packages under a caller-chosen alias, keeping
//! every artifact byte-compatible with its original container.
//! It is organized into several modules:
//! - `config`: CLI configuration.
//! - `format`: Executable format detection (Mach-O, fat Mach-O, ELF, PE).
//! - `patch`: Same-length string substitution inside named sections.
//! - `ar`, `compress`, `tarball`, `deb`: The package container codecs.
//! - `remap`: Root/Rootless topology and path-prefix remapping.
//! - `control`, `launchd`, `scripts`, `binaries`: Per-stage package rewrites.
//! - `pipeline`: The staged package orchestrator.
//! - `create`: Building a new package around a server binary.

pub mod alias;
pub mod ar;
pub mod binaries;
pub mod compress;
pub mod config;
pub mod control;
pub mod create;
pub mod deb;
pub mod error;
pub mod format;
pub mod launchd;
pub mod patch;
pub mod pipeline;
pub mod progress;
pub mod remap;
pub mod scripts;
pub mod tarball;
pub mod utils;

pub use alias::{Alias, Port};
pub use error::{Error, Result};
pub use format::ExecutableHandle;
pub use pipeline::{DebPatcher, Stage};
