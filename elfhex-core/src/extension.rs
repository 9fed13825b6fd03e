//! Pluggable byte-producing extensions.
//!
//! An extension is invoked from source as `:name { content }` (looked up in
//! the built-in namespace) or `::name { content }` (looked up from the global
//! root). Its content is parsed once into a handle; the renderer queries the
//! handle's size before layout and asks it to render after layout, so the two
//! calls must agree on length.

use std::collections::HashMap;

use crate::ast::ExtensionInvocation;
use crate::error::CoreError;
use crate::program::Metadata;

/// Read access to the laid-out program, handed to extensions during
/// rendering so they can resolve label addresses themselves.
pub trait ProgramView {
    fn metadata(&self) -> &Metadata;
    /// Name of the segment whose contents are being rendered.
    fn segment_name(&self) -> &str;
    /// Absolute address of a label, in the named segment or the current one.
    fn label_address(&self, segment: Option<&str>, label: &str) -> Result<u32, CoreError>;
}

/// One parsed extension invocation. `size` must be pure and must equal the
/// length of what `render` later produces.
pub trait ExtensionHandle: std::fmt::Debug {
    fn size(&self) -> usize;
    fn render(&self, view: &dyn ProgramView) -> Result<Vec<u8>, CoreError>;
}

pub trait Extension {
    fn parse(&self, content: &str) -> Result<Box<dyn ExtensionHandle>, CoreError>;
}

/// Named extensions in two namespaces: built-in (`:name`) and global
/// (`::name`).
#[derive(Default)]
pub struct ExtensionRegistry {
    builtin: HashMap<String, Box<dyn Extension>>,
    global: HashMap<String, Box<dyn Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> ExtensionRegistry {
        ExtensionRegistry::default()
    }

    /// A registry with the extensions that ship with the assembler.
    pub fn with_builtins() -> ExtensionRegistry {
        let mut registry = ExtensionRegistry::new();
        registry.register_builtin("x86.args", Box::new(crate::extensions::x86::X86Args));
        registry
    }

    pub fn register_builtin(&mut self, name: &str, extension: Box<dyn Extension>) {
        self.builtin.insert(name.to_string(), extension);
    }

    pub fn register_global(&mut self, name: &str, extension: Box<dyn Extension>) {
        self.global.insert(name.to_string(), extension);
    }

    pub fn instantiate(
        &self,
        invocation: &ExtensionInvocation,
    ) -> Result<Box<dyn ExtensionHandle>, CoreError> {
        let table = if invocation.absolute {
            &self.global
        } else {
            &self.builtin
        };
        let extension = table
            .get(&invocation.name)
            .ok_or_else(|| CoreError::UnknownExtension(invocation.name.clone()))?;
        extension.parse(&invocation.content).map_err(|err| match err {
            already @ CoreError::ExtensionParse { .. } => already,
            other => CoreError::ExtensionParse {
                name: invocation.name.clone(),
                message: other.to_string(),
            },
        })
    }
}
