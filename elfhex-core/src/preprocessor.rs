//! Include resolution and program merging.
//!
//! Walks the include graph depth-first from the entry file, checks that every
//! file's program declaration is compatible, merges same-name segments, and
//! collects fragments into one table. Files are identified by canonical path;
//! a file seen twice is skipped, which also terminates include cycles.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::ast::{FragmentDef, RawSegment};
use crate::error::CoreError;
use crate::loader::FileResolver;
use crate::parser;
use crate::program::Metadata;

/// The merged output of preprocessing: one declaration, segments in order of
/// first appearance, and the fragment table.
#[derive(Debug)]
pub struct MergedProgram {
    pub metadata: Metadata,
    pub segments: Vec<RawSegment>,
    pub fragments: HashMap<String, FragmentDef>,
}

pub struct Preprocessor<'a, R: FileResolver> {
    resolver: &'a R,
}

impl<'a, R: FileResolver> Preprocessor<'a, R> {
    pub fn new(resolver: &'a R) -> Preprocessor<'a, R> {
        Preprocessor { resolver }
    }

    pub fn preprocess(&self, path: &str) -> Result<MergedProgram, CoreError> {
        let mut state = MergeState {
            metadata: None,
            segments: Vec::new(),
            segment_index: HashMap::new(),
            fragments: HashMap::new(),
            seen: HashSet::new(),
        };
        self.visit(path, false, &mut state)?;
        match state.metadata {
            Some(metadata) => Ok(MergedProgram {
                metadata,
                segments: state.segments,
                fragments: state.fragments,
            }),
            None => Err(CoreError::Parse {
                position: 0,
                message: format!("{path} contains no program declaration"),
            }),
        }
    }

    fn visit(
        &self,
        path: &str,
        fragments_only: bool,
        state: &mut MergeState,
    ) -> Result<(), CoreError> {
        let (contents, canonical) = self.resolver.resolve(path)?;
        if !state.seen.insert(canonical) {
            return Ok(());
        }
        let file = parser::parse(&contents)?;

        state.merge_metadata(path, file.metadata)?;
        // Includes contribute before the including file's own segments, so
        // segment order is order of first appearance in depth-first traversal.
        for include in &file.includes {
            self.visit(
                &include.path,
                fragments_only || include.fragments_only,
                state,
            )?;
        }
        if !fragments_only {
            for segment in file.segments {
                state.merge_segment(segment)?;
            }
        }
        for fragment in file.fragments {
            if state.fragments.contains_key(&fragment.name) {
                return Err(CoreError::FragmentRedefinition(fragment.name));
            }
            state.fragments.insert(fragment.name.clone(), fragment);
        }
        Ok(())
    }
}

struct MergeState {
    metadata: Option<Metadata>,
    segments: Vec<RawSegment>,
    segment_index: HashMap<String, usize>,
    fragments: HashMap<String, FragmentDef>,
    seen: HashSet<PathBuf>,
}

impl MergeState {
    fn merge_metadata(&mut self, path: &str, metadata: Metadata) -> Result<(), CoreError> {
        match &mut self.metadata {
            None => self.metadata = Some(metadata),
            Some(existing) => {
                if existing.machine != metadata.machine {
                    return Err(CoreError::IncompatibleProgram {
                        path: path.to_string(),
                        reason: format!(
                            "machine {} does not match {}",
                            metadata.machine, existing.machine
                        ),
                    });
                }
                if existing.endianness != metadata.endianness {
                    return Err(CoreError::IncompatibleProgram {
                        path: path.to_string(),
                        reason: "endianness does not match".to_string(),
                    });
                }
                existing.align = existing.align.max(metadata.align);
            }
        }
        Ok(())
    }

    fn merge_segment(&mut self, segment: RawSegment) -> Result<(), CoreError> {
        match self.segment_index.get(&segment.name) {
            Some(&index) => {
                let existing = &mut self.segments[index];
                if let (Some(first), Some(second)) = (existing.args.flags, segment.args.flags) {
                    if first != second {
                        return Err(CoreError::MetadataConflict {
                            segment: segment.name,
                        });
                    }
                }
                existing.contents.extend(segment.contents);
                existing.auto_labels.extend(segment.auto_labels);
            }
            None => {
                self.segment_index
                    .insert(segment.name.clone(), self.segments.len());
                self.segments.push(segment);
            }
        }
        Ok(())
    }
}
