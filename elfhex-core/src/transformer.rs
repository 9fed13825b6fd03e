//! Fragment expansion and lowering to the typed program model.
//!
//! Expansion is hygienic: every call site gets a fresh instance token from a
//! counter that is global to the pass, and `__`-local label names are
//! rewritten under it. A call-site alias replaces the token as the rewrite
//! prefix, which deliberately lets outside code reach an expansion's
//! internal labels.

use std::collections::{HashMap, HashSet};

use crate::ast::{self, FragmentDef, FragmentRef, RawSegment};
use crate::error::CoreError;
use crate::extension::ExtensionRegistry;
use crate::preprocessor::MergedProgram;
use crate::program::{Element, ExtensionElement, Program, Segment};

pub fn transform(
    merged: &MergedProgram,
    registry: &ExtensionRegistry,
    max_fragment_depth: u32,
) -> Result<Program, CoreError> {
    let mut expansion = Expansion {
        fragments: &merged.fragments,
        registry,
        max_depth: max_fragment_depth,
        next_instance: 0,
        once_done: HashSet::new(),
    };
    let mut segments = Vec::with_capacity(merged.segments.len());
    for raw in &merged.segments {
        segments.push(lower_segment(raw, &mut expansion, merged.metadata.align)?);
    }
    Ok(Program {
        metadata: merged.metadata,
        segments,
    })
}

struct Expansion<'a> {
    fragments: &'a HashMap<String, FragmentDef>,
    registry: &'a ExtensionRegistry,
    max_depth: u32,
    next_instance: u32,
    once_done: HashSet<String>,
}

/// The rewrite prefix of one expansion: the call-site alias if given,
/// otherwise a fresh instance token that only touches `__`-local names.
enum Prefix {
    Instance(u32),
    Alias(String),
}

fn rename(name: &str, prefix: &Prefix) -> String {
    match prefix {
        Prefix::Alias(alias) => format!("{alias}.{name}"),
        Prefix::Instance(instance) if name.starts_with("__") => format!("__{instance}.{name}"),
        Prefix::Instance(_) => name.to_string(),
    }
}

impl Expansion<'_> {
    /// Expands and lowers a list of raw elements into `out`.
    fn expand(
        &mut self,
        elements: &[ast::Element],
        depth: u32,
        out: &mut Vec<Element>,
    ) -> Result<(), CoreError> {
        for element in elements {
            match element {
                ast::Element::FragmentRef(reference) => {
                    self.expand_reference(reference, depth, out)?
                }
                ast::Element::ParamRef(name) => {
                    return Err(CoreError::UnresolvedParameter(name.clone()))
                }
                ast::Element::Bytes(bytes) => out.push(Element::Bytes(bytes.clone())),
                ast::Element::Number(number) => out.push(Element::Number(*number)),
                ast::Element::Label(name) => out.push(Element::Label(name.clone())),
                ast::Element::Reference(reference) => {
                    out.push(Element::Reference(reference.clone()))
                }
                ast::Element::Extension(invocation) => {
                    let handle = self.registry.instantiate(invocation)?;
                    out.push(Element::Extension(ExtensionElement {
                        name: invocation.name.clone(),
                        handle,
                    }));
                }
            }
        }
        Ok(())
    }

    fn expand_reference(
        &mut self,
        reference: &FragmentRef,
        depth: u32,
        out: &mut Vec<Element>,
    ) -> Result<(), CoreError> {
        if depth >= self.max_depth {
            return Err(CoreError::ExpansionTooDeep(self.max_depth));
        }
        if reference.once && !self.once_done.insert(reference.name.clone()) {
            return Ok(());
        }
        let fragment = self
            .fragments
            .get(&reference.name)
            .ok_or_else(|| CoreError::UnknownFragment(reference.name.clone()))?;
        if fragment.params.len() != reference.args.len() {
            return Err(CoreError::Arity {
                fragment: reference.name.clone(),
                expected: fragment.params.len(),
                got: reference.args.len(),
            });
        }
        let instance = self.next_instance;
        self.next_instance += 1;
        let prefix = match &reference.alias {
            Some(alias) => Prefix::Alias(alias.clone()),
            None => Prefix::Instance(instance),
        };
        let args: HashMap<&str, &[ast::Element]> = fragment
            .params
            .iter()
            .map(String::as_str)
            .zip(reference.args.iter().map(Vec::as_slice))
            .collect();
        let body = substitute(&fragment.contents, &args, &prefix)?;
        self.expand(&body, depth + 1, out)
    }
}

/// Produces a fragment body ready for expansion: parameter references are
/// replaced by the caller's (already processed) argument elements verbatim,
/// label names and unqualified reference targets are rewritten under the
/// prefix, and the arguments of nested fragment references are processed the
/// same way. Nested references themselves are left for the expansion loop.
fn substitute(
    elements: &[ast::Element],
    args: &HashMap<&str, &[ast::Element]>,
    prefix: &Prefix,
) -> Result<Vec<ast::Element>, CoreError> {
    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        match element {
            ast::Element::ParamRef(name) => {
                let replacement = args
                    .get(name.as_str())
                    .ok_or_else(|| CoreError::UnresolvedParameter(name.clone()))?;
                out.extend(replacement.iter().cloned());
            }
            ast::Element::Label(name) => out.push(ast::Element::Label(rename(name, prefix))),
            ast::Element::Reference(reference) if reference.segment.is_none() => {
                let mut renamed = reference.clone();
                renamed.label = rename(&reference.label, prefix);
                out.push(ast::Element::Reference(renamed));
            }
            ast::Element::FragmentRef(reference) => {
                let mut processed = reference.clone();
                processed.args = reference
                    .args
                    .iter()
                    .map(|arg| substitute(arg, args, prefix))
                    .collect::<Result<_, _>>()?;
                out.push(ast::Element::FragmentRef(processed));
            }
            other => out.push(other.clone()),
        }
    }
    Ok(out)
}

fn lower_segment(
    raw: &RawSegment,
    expansion: &mut Expansion,
    default_align: u32,
) -> Result<Segment, CoreError> {
    let mut elements = Vec::new();
    expansion.expand(&raw.contents, 0, &mut elements)?;

    let mut names = HashSet::new();
    for element in &elements {
        if let Element::Label(name) = element {
            if !names.insert(name.clone()) {
                return Err(CoreError::AmbiguousLabel(name.clone()));
            }
        }
    }
    for auto_label in &raw.auto_labels {
        if !names.insert(auto_label.name.clone()) {
            return Err(CoreError::AmbiguousLabel(auto_label.name.clone()));
        }
    }

    Ok(Segment {
        name: raw.name.clone(),
        flags: raw.args.flags.unwrap_or_default(),
        declared_size: raw.args.size.unwrap_or(0),
        align: raw.args.alignment.unwrap_or(default_align),
        elements,
        auto_labels: raw.auto_labels.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessor::Preprocessor;
    use crate::program::ReferenceKind;

    fn transform_source(source: &str) -> Result<Program, CoreError> {
        let mut files = HashMap::new();
        files.insert("main.eh".to_string(), source.to_string());
        let merged = Preprocessor::new(&files).preprocess("main.eh")?;
        transform(&merged, &ExtensionRegistry::with_builtins(), 16)
    }

    fn segment_bytes(program: &Program, index: usize) -> Vec<u8> {
        program.segments[index]
            .elements
            .iter()
            .filter_map(|e| match e {
                Element::Bytes(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn segment_labels(program: &Program, index: usize) -> Vec<String> {
        program.segments[index]
            .elements
            .iter()
            .filter_map(|e| match e {
                Element::Label(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn expands_fragments_with_arguments() {
        let program = transform_source(
            "program 3 < 16 segment a() { ff @a(11) } \
             fragment a(a) { $a @b($a) } fragment b(a) { $a }",
        )
        .expect("transform");
        assert_eq!(segment_bytes(&program, 0), vec![0xff, 0x11, 0x11]);
    }

    #[test]
    fn rewrites_labels_under_aliases() {
        let program = transform_source(
            "program 3 < 16 segment a() { @a()(test) } fragment a() { [a] }",
        )
        .expect("transform");
        assert_eq!(segment_labels(&program, 0), vec!["test.a".to_string()]);
    }

    #[test]
    fn mangles_local_labels_per_instance() {
        let program = transform_source(
            "program 3 < 16 segment a() { @a() @a() } fragment a() { [__a] eb <__a> }",
        )
        .expect("transform");
        assert_eq!(
            segment_labels(&program, 0),
            vec!["__0.__a".to_string(), "__1.__a".to_string()]
        );
        // references are mangled with their defining expansion
        let targets: Vec<&str> = program.segments[0]
            .elements
            .iter()
            .filter_map(|e| match e {
                Element::Reference(r) => Some(r.label.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec!["__0.__a", "__1.__a"]);
    }

    #[test]
    fn aliases_leave_local_labels_reachable() {
        let program = transform_source(
            "program 3 < 16 segment a() { @a()(alias) <alias.__x> } fragment a() { [__x] }",
        )
        .expect("transform");
        assert_eq!(segment_labels(&program, 0), vec!["alias.__x".to_string()]);
    }

    #[test]
    fn qualified_reference_targets_are_not_rewritten() {
        let program = transform_source(
            "program 3 < 16 segment a() { @a()(alias) } segment b() { [x] } \
             fragment a() { <<b:x>> }",
        )
        .expect("transform");
        let Element::Reference(reference) = &program.segments[0].elements[0] else {
            panic!("expected reference");
        };
        assert_eq!(reference.label, "x");
        assert_eq!(reference.segment.as_deref(), Some("b"));
        assert_eq!(reference.kind, ReferenceKind::Absolute);
    }

    #[test]
    fn once_only_references_expand_once() {
        let program = transform_source(
            "program 3 < 16 segment a() { @!g() 90 @!g() @!g() } fragment g() { cd 80 }",
        )
        .expect("transform");
        assert_eq!(segment_bytes(&program, 0), vec![0xcd, 0x80, 0x90]);
    }

    #[test]
    fn plain_references_after_once_only_expand_again() {
        let program = transform_source(
            "program 3 < 16 segment a() { @!g() @!g() @g() } fragment g() { 00 }",
        )
        .expect("transform");
        assert_eq!(segment_bytes(&program, 0), vec![0x00, 0x00]);
    }

    #[test]
    fn fragment_references_in_arguments_expand_at_the_call_site() {
        let program = transform_source(
            "program 3 < 16 segment a() { @wrap(@inner()) } \
             fragment wrap(body) { aa $body bb } fragment inner() { 11 }",
        )
        .expect("transform");
        assert_eq!(segment_bytes(&program, 0), vec![0xaa, 0x11, 0xbb]);
    }

    #[test]
    fn rejects_unknown_fragments() {
        let err =
            transform_source("program 3 < 16 segment a() { @missing() }").unwrap_err();
        assert!(matches!(err, CoreError::UnknownFragment(_)));
    }

    #[test]
    fn rejects_wrong_arity() {
        let err = transform_source(
            "program 3 < 16 segment a() { @f(11) } fragment f() { 00 }",
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Arity { .. }));
    }

    #[test]
    fn rejects_parameter_references_in_segments() {
        let err = transform_source("program 3 < 16 segment a() { $a }").unwrap_err();
        assert!(matches!(err, CoreError::UnresolvedParameter(_)));
    }

    #[test]
    fn rejects_expansion_beyond_the_depth_limit() {
        let source = "program 3 < 16 segment a() { @a() } \
                      fragment a() { @b() } fragment b() { @c() } fragment c() { ff }";
        let mut files = HashMap::new();
        files.insert("main.eh".to_string(), source.to_string());
        let merged = Preprocessor::new(&files).preprocess("main.eh").expect("preprocess");
        let registry = ExtensionRegistry::new();

        let err = transform(&merged, &registry, 0).unwrap_err();
        assert!(matches!(err, CoreError::ExpansionTooDeep(0)));
        let err = transform(&merged, &registry, 2).unwrap_err();
        assert!(matches!(err, CoreError::ExpansionTooDeep(2)));
        assert!(transform(&merged, &registry, 3).is_ok());
    }

    #[test]
    fn rejects_duplicate_labels_after_expansion() {
        let err = transform_source(
            "program 3 < 16 segment a() { @f()(same) @f()(same) } fragment f() { [x] }",
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::AmbiguousLabel(_)));
    }

    #[test]
    fn rejects_duplicate_auto_label_names() {
        let err = transform_source("program 3 < 16 segment a() { [x] [[x: 4]] }").unwrap_err();
        assert!(matches!(err, CoreError::AmbiguousLabel(_)));
    }

    #[test]
    fn applies_segment_defaults() {
        let program = transform_source(
            "program 3 < 64 segment a() {} segment b(flags: rwx alignment: 16 size: 9) {}",
        )
        .expect("transform");
        assert_eq!(program.segments[0].align, 64);
        assert_eq!(program.segments[0].flags.p_flags(), 0x4);
        assert_eq!(program.segments[0].declared_size, 0);
        assert_eq!(program.segments[1].align, 16);
        assert_eq!(program.segments[1].flags.p_flags(), 0x7);
        assert_eq!(program.segments[1].declared_size, 9);
    }

    #[test]
    fn resolves_extension_invocations() {
        let program = transform_source(
            "program 3 < 16 segment a() { :x86.args { ecx, [esi + 8] } }",
        )
        .expect("transform");
        let Element::Extension(extension) = &program.segments[0].elements[0] else {
            panic!("expected extension element");
        };
        assert_eq!(extension.name, "x86.args");
        assert_eq!(extension.handle.size(), 2);
    }

    #[test]
    fn rejects_unknown_extensions() {
        let err = transform_source("program 3 < 16 segment a() { ::nope { x } }").unwrap_err();
        assert!(matches!(err, CoreError::UnknownExtension(_)));
    }
}
