//! Raw syntax tree produced by the parser, before include resolution and
//! fragment expansion.

use crate::program::{AutoLabel, Metadata, Number, Reference, SegmentFlags};

#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub metadata: Metadata,
    pub includes: Vec<Include>,
    pub segments: Vec<RawSegment>,
    pub fragments: Vec<FragmentDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Include {
    pub path: String,
    /// `include fragments "..."`: contribute fragments but no segments.
    pub fragments_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentArgs {
    pub flags: Option<SegmentFlags>,
    pub size: Option<u32>,
    pub alignment: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawSegment {
    pub name: String,
    pub args: SegmentArgs,
    pub contents: Vec<Element>,
    pub auto_labels: Vec<AutoLabel>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FragmentDef {
    pub name: String,
    pub params: Vec<String>,
    pub contents: Vec<Element>,
}

/// A fragment call site: `@name(args)`, optionally aliased `(alias)` and
/// optionally flagged once-only (`@!name`).
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentRef {
    pub name: String,
    pub args: Vec<Vec<Element>>,
    pub alias: Option<String>,
    pub once: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionInvocation {
    pub name: String,
    /// `::name` looks the extension up from the global root instead of the
    /// built-in namespace.
    pub absolute: bool,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Bytes(Vec<u8>),
    Number(Number),
    Label(String),
    Reference(Reference),
    FragmentRef(FragmentRef),
    ParamRef(String),
    Extension(ExtensionInvocation),
}
