use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use elfhex_core::{assemble, AssembleOptions, ExtensionRegistry, FileLoader};

/// An ELF hexadecimal "assembler".
#[derive(Parser, Debug)]
#[command(name = "elfhex", version, about, long_about = None)]
struct Cli {
    /// Location of the input EH file.
    input: String,

    /// Location for the output executable.
    output: String,

    /// A path to search for source files (repeatable).
    #[arg(short = 'i', long = "include-path", default_value = ".")]
    include_path: Vec<String>,

    /// The label to use as the entry point.
    #[arg(short, long, default_value = "_start")]
    entry: String,

    /// The starting memory address in hexadecimal.
    #[arg(short = 's', long, default_value = "08048000", value_parser = parse_hex_address)]
    memory_start: u32,

    /// Do not output the ELF header.
    #[arg(short = 'r', long)]
    no_header: bool,

    /// The maximum depth when resolving fragment references.
    #[arg(short = 'f', long, default_value_t = 16)]
    max_fragment_depth: u32,

    /// Override the machine number from the program declaration.
    #[arg(long, value_name = "MACHINE")]
    machine_override: Option<u16>,
}

fn parse_hex_address(value: &str) -> Result<u32, String> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u32::from_str_radix(digits, 16).map_err(|_| format!("invalid hexadecimal address '{value}'"))
}

fn main() -> Result<()> {
    execute(Cli::parse())
}

fn execute(cli: Cli) -> Result<()> {
    let loader = FileLoader::new(cli.include_path.iter().map(PathBuf::from));
    let registry = ExtensionRegistry::with_builtins();
    let options = AssembleOptions {
        memory_start: cli.memory_start,
        entry_label: cli.entry.clone(),
        emit_header: !cli.no_header,
        max_fragment_depth: cli.max_fragment_depth,
        machine_override: cli.machine_override,
    };

    let output = assemble(&loader, &cli.input, &registry, &options)
        .with_context(|| format!("failed to assemble {}", cli.input))?;
    write_output(&cli.output, &output)?;
    println!("Assembled. Total size: {} bytes.", output.len());
    Ok(())
}

fn write_output(path: &str, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = PathBuf::from(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {parent:?}"))?;
        }
    }
    fs::write(path, bytes).with_context(|| format!("failed to write output file {path}"))?;
    Ok(())
}
