use std::path::PathBuf;

use thiserror::Error;

/// Errors produced anywhere in the compilation pipeline. All of them are
/// fatal; there is no recovery or partial output.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("parse error at byte {position}: {message}")]
    Parse { position: usize, message: String },
    #[error("couldn't find {path} in {searched:?}")]
    FileNotFound { path: String, searched: Vec<PathBuf> },
    #[error("incompatible program declaration in {path}: {reason}")]
    IncompatibleProgram { path: String, reason: String },
    #[error("conflicting flags for segment {segment}")]
    MetadataConflict { segment: String },
    #[error("fragment {0} defined more than once")]
    FragmentRedefinition(String),
    #[error("non-existent fragment {0} referenced")]
    UnknownFragment(String),
    #[error("wrong number of arguments in reference to fragment {fragment}: expected {expected}, got {got}")]
    Arity {
        fragment: String,
        expected: usize,
        got: usize,
    },
    #[error("fragment parameter reference ${0} found in segment")]
    UnresolvedParameter(String),
    #[error("max recursion depth ({0}) for fragments reached")]
    ExpansionTooDeep(u32),
    #[error("label {segment}:{label} not defined")]
    UnknownLabel { segment: String, label: String },
    #[error("label {0} defined more than once")]
    AmbiguousLabel(String),
    #[error("reference to {label} does not fit in {width} bytes")]
    ReferenceOutOfRange { label: String, width: u8 },
    #[error("number too big for specified width")]
    LiteralOutOfRange,
    #[error("unprintable character in string at byte {position}")]
    UnprintableCharInString { position: usize },
    #[error("entry label {0} not defined in any segment")]
    EntryNotFound(String),
    #[error("entry label {0} defined in more than one segment")]
    EntryAmbiguous(String),
    #[error("unknown extension {0}")]
    UnknownExtension(String),
    #[error("extension {name} failed to parse its content: {message}")]
    ExtensionParse { name: String, message: String },
    #[error("extension {name} rendered {rendered} bytes but reported a size of {reported}")]
    ExtensionSizeMismatch {
        name: String,
        reported: usize,
        rendered: usize,
    },
}
