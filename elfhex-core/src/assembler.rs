//! Pipeline orchestration: preprocess, transform, render.

use crate::error::CoreError;
use crate::extension::ExtensionRegistry;
use crate::loader::FileResolver;
use crate::preprocessor::Preprocessor;
use crate::render::{render, RenderOptions};
use crate::transformer::transform;

pub struct AssembleOptions {
    pub memory_start: u32,
    pub entry_label: String,
    pub emit_header: bool,
    pub max_fragment_depth: u32,
    /// Replaces the machine number of the program declaration.
    pub machine_override: Option<u16>,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        AssembleOptions {
            memory_start: 0x0804_8000,
            entry_label: "_start".to_string(),
            emit_header: true,
            max_fragment_depth: 16,
            machine_override: None,
        }
    }
}

/// Assembles the program rooted at `entry_path` into its binary image.
pub fn assemble<R: FileResolver>(
    resolver: &R,
    entry_path: &str,
    registry: &ExtensionRegistry,
    options: &AssembleOptions,
) -> Result<Vec<u8>, CoreError> {
    let mut merged = Preprocessor::new(resolver).preprocess(entry_path)?;
    if let Some(machine) = options.machine_override {
        merged.metadata.machine = machine;
    }
    let program = transform(&merged, registry, options.max_fragment_depth)?;
    render(
        &program,
        &RenderOptions {
            memory_start: options.memory_start,
            entry_label: options.entry_label.clone(),
            emit_header: options.emit_header,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn files(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(path, contents)| (path.to_string(), contents.to_string()))
            .collect()
    }

    #[test]
    fn assembles_across_includes() {
        let files = files(&[
            (
                "main.eh",
                "program 3 < 4096 include \"syscalls.eh\" \
                 segment text(flags: rx) { [_start] @!exit(=0d4) }",
            ),
            (
                "syscalls.eh",
                "program 3 < 4096 fragment exit(code) { b8 =1d4 bb $code cd 80 }",
            ),
        ]);
        let output = assemble(
            &files,
            "main.eh",
            &ExtensionRegistry::with_builtins(),
            &AssembleOptions::default(),
        )
        .expect("assemble");

        assert_eq!(&output[0..4], b"\x7fELF");
        assert_eq!(output[84], 0xb8);
        assert_eq!(output.len(), 84 + 12);
    }

    #[test]
    fn applies_the_machine_override() {
        let files = files(&[(
            "main.eh",
            "program 3 < 4096 segment text(flags: rx) { [_start] 90 }",
        )]);
        let output = assemble(
            &files,
            "main.eh",
            &ExtensionRegistry::new(),
            &AssembleOptions {
                machine_override: Some(40),
                ..AssembleOptions::default()
            },
        )
        .expect("assemble");
        assert_eq!(&output[18..20], &[40, 0]); // e_machine
    }

    #[test]
    fn propagates_pipeline_errors() {
        let files = files(&[("main.eh", "program 3 < 16 segment a() { @nope() }")]);
        let err = assemble(
            &files,
            "main.eh",
            &ExtensionRegistry::new(),
            &AssembleOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::UnknownFragment(_)));
    }
}
