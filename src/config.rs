//! Configuration module.
//!
//! This module defines the command-line interface (CLI) using `clap`. Aliases and
//! ports are parsed into their validated types here, so a bad value is rejected
//! before any file is opened.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::alias::{Alias, Port};
use crate::compress::Compression;
use crate::remap::Topology;

/// Rebrand instrumentation-agent executables and packages under an alias.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info", help = "Set the logging level")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy an executable and patch the copy in place
    Patch(PatchArgs),
    /// Repackage a .deb under an alias
    Deb(DebArgs),
    /// Build a new .deb around a server binary
    Create(CreateArgs),
    /// Print an executable's format and section table
    Describe(DescribeArgs),
}

#[derive(Args, Debug)]
pub struct PatchArgs {
    /// Executable to patch
    pub input: PathBuf,

    /// Where to write the patched copy
    #[arg(short, long)]
    pub output: PathBuf,

    /// Five-character replacement name
    #[arg(short, long, value_parser = parse_alias)]
    pub alias: Alias,
}

#[derive(Args, Debug)]
pub struct DebArgs {
    /// Package to repackage
    pub input: PathBuf,

    /// Where to write the new package
    #[arg(short, long)]
    pub output: PathBuf,

    /// Five-character replacement name
    #[arg(short, long, value_parser = parse_alias)]
    pub alias: Alias,

    /// Listen port for the service
    #[arg(short, long, default_value = "27042", value_parser = parse_port)]
    pub port: Port,

    /// Re-read the written package as a final check
    #[arg(long)]
    pub validate: bool,

    /// Payload compression for the rebuilt package
    #[arg(long, value_enum, default_value_t = CompressionArg::Xz)]
    pub compression: CompressionArg,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Server binary to package
    pub binary: PathBuf,

    /// Where to write the package
    #[arg(short, long)]
    pub output: PathBuf,

    /// Five-character replacement name
    #[arg(short, long, value_parser = parse_alias)]
    pub alias: Alias,

    /// Listen port for the service
    #[arg(short, long, default_value = "27042", value_parser = parse_port)]
    pub port: Port,

    /// Agent library to ship alongside the server
    #[arg(long)]
    pub agent: Option<PathBuf>,

    /// Install under the rootless prefix
    #[arg(long)]
    pub rootless: bool,

    /// Package version
    #[arg(long = "package-version", default_value = "1.0.0")]
    pub package_version: String,

    /// Package maintainer
    #[arg(long, default_value = "Fridare Team")]
    pub maintainer: String,

    /// Payload compression
    #[arg(long, value_enum, default_value_t = CompressionArg::Xz)]
    pub compression: CompressionArg,
}

#[derive(Args, Debug)]
pub struct DescribeArgs {
    /// Executable to inspect
    pub input: PathBuf,

    /// Dump printable strings from this section
    #[arg(long, value_name = "SECTION")]
    pub strings: Option<String>,
}

impl CreateArgs {
    pub fn topology(&self) -> Topology {
        if self.rootless {
            Topology::Rootless
        } else {
            Topology::Root
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CompressionArg {
    None,
    Gzip,
    Xz,
}

impl From<CompressionArg> for Compression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => Compression::None,
            CompressionArg::Gzip => Compression::Gzip,
            CompressionArg::Xz => Compression::Xz,
        }
    }
}

fn parse_alias(s: &str) -> Result<Alias, String> {
    Alias::new(s).map_err(|e| e.to_string())
}

fn parse_port(s: &str) -> Result<Port, String> {
    s.parse::<Port>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        use clap::CommandFactory;
        Config::command().debug_assert();
    }

    #[test]
    fn test_parse_deb_command() {
        let config = Config::try_parse_from([
            "fridare", "--log-level", "debug", "deb", "in.deb", "-o", "out.deb", "-a", "abcde", "-p", "31337",
        ])
        .unwrap();
        assert_eq!(config.log_level, "debug");
        let Command::Deb(args) = config.command else {
            panic!("expected deb command");
        };
        assert_eq!(args.alias.as_str(), "abcde");
        assert_eq!(args.port.get(), 31337);
        assert_eq!(Compression::from(args.compression), Compression::Xz);
    }

    #[test]
    fn test_bad_alias_is_rejected_by_parser() {
        let result = Config::try_parse_from(["fridare", "patch", "in", "-o", "out", "-a", "1bcde"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_port_is_rejected_by_parser() {
        let result = Config::try_parse_from(["fridare", "deb", "in", "-o", "out", "-a", "abcde", "-p", "70000"]);
        assert!(result.is_err());
    }
}
