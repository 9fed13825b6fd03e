//! Two-pass rendering: lay segments out in memory and in the file, then emit
//! bytes with every reference resolved.
//!
//! No label address is authoritative until the layout pass completes; the
//! emission pass reads the layout but never mutates it.

use std::collections::HashMap;

use crate::elf::{self, ProgramHeader};
use crate::error::CoreError;
use crate::extension::ProgramView;
use crate::program::{Element, Metadata, Program, Reference, ReferenceKind};

pub struct RenderOptions {
    /// First virtual address considered for segment placement.
    pub memory_start: u32,
    pub entry_label: String,
    /// When false, no ELF header is produced and segments start at file
    /// offset zero.
    pub emit_header: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            memory_start: 0x0804_8000,
            entry_label: "_start".to_string(),
            emit_header: true,
        }
    }
}

pub fn render(program: &Program, options: &RenderOptions) -> Result<Vec<u8>, CoreError> {
    let layout = lay_out(program, options)?;
    emit(program, &layout, options)
}

struct Placement {
    vaddr: u32,
    file_offset: u32,
    file_size: u32,
    mem_size: u32,
}

struct Layout {
    placements: Vec<Placement>,
    /// Per segment: label name to absolute address, auto-labels included.
    labels: Vec<HashMap<String, u32>>,
}

fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

fn lay_out(program: &Program, options: &RenderOptions) -> Result<Layout, CoreError> {
    let header_size = if options.emit_header {
        elf::header_size(program.segments.len())
    } else {
        0
    };
    let mut placements = Vec::with_capacity(program.segments.len());
    let mut labels = Vec::with_capacity(program.segments.len());
    let mut memory = options.memory_start;
    let mut file = header_size;

    for (index, segment) in program.segments.iter().enumerate() {
        memory = align_up(memory, segment.align);
        if index > 0 {
            file = align_up(file, segment.align);
        }

        let mut segment_labels = HashMap::new();
        let mut offset = 0u32;
        for element in &segment.elements {
            if let Element::Label(name) = element {
                if segment_labels.insert(name.clone(), memory + offset).is_some() {
                    return Err(CoreError::AmbiguousLabel(name.clone()));
                }
            }
            offset += element.size() as u32;
        }
        let file_size = offset;
        // auto-labels sit immediately past the file image
        for auto_label in &segment.auto_labels {
            if segment_labels
                .insert(auto_label.name.clone(), memory + offset)
                .is_some()
            {
                return Err(CoreError::AmbiguousLabel(auto_label.name.clone()));
            }
            offset += auto_label.width;
        }
        let mem_size = segment.declared_size.max(offset);

        placements.push(Placement {
            vaddr: memory,
            file_offset: file,
            file_size,
            mem_size,
        });
        labels.push(segment_labels);
        file += file_size;
        memory += mem_size;
    }

    Ok(Layout { placements, labels })
}

fn emit(program: &Program, layout: &Layout, options: &RenderOptions) -> Result<Vec<u8>, CoreError> {
    let mut out = Vec::new();
    if options.emit_header {
        let entry = entry_address(layout, &options.entry_label)?;
        out.extend(elf::render_file_header(
            &program.metadata,
            entry,
            program.segments.len(),
        ));
        let headers: Vec<ProgramHeader> = program
            .segments
            .iter()
            .zip(&layout.placements)
            .map(|(segment, placement)| ProgramHeader {
                offset: placement.file_offset,
                vaddr: placement.vaddr,
                file_size: placement.file_size,
                mem_size: placement.mem_size,
                flags: segment.flags.p_flags(),
                align: segment.align,
            })
            .collect();
        out.extend(elf::render_program_headers(&program.metadata, &headers));
    }

    for (index, segment) in program.segments.iter().enumerate() {
        let placement = &layout.placements[index];
        // zero-fill the alignment gap up to this segment's file offset
        out.resize(placement.file_offset as usize, 0);
        let mut cursor = placement.vaddr;
        for element in &segment.elements {
            match element {
                Element::Bytes(bytes) => {
                    out.extend_from_slice(bytes);
                    cursor += bytes.len() as u32;
                }
                Element::Number(number) => {
                    out.extend(number.encode(program.metadata.endianness)?);
                    cursor += number.width as u32;
                }
                Element::Label(_) => {}
                Element::Reference(reference) => {
                    let encoded = encode_reference(program, layout, index, reference, cursor)?;
                    cursor += encoded.len() as u32;
                    out.extend(encoded);
                }
                Element::Extension(extension) => {
                    let view = RenderView {
                        program,
                        layout,
                        segment_index: index,
                    };
                    let bytes = extension.handle.render(&view)?;
                    let reported = extension.handle.size();
                    if bytes.len() != reported {
                        return Err(CoreError::ExtensionSizeMismatch {
                            name: extension.name.clone(),
                            reported,
                            rendered: bytes.len(),
                        });
                    }
                    cursor += bytes.len() as u32;
                    out.extend(bytes);
                }
            }
        }
    }
    Ok(out)
}

fn encode_reference(
    program: &Program,
    layout: &Layout,
    segment_index: usize,
    reference: &Reference,
    address: u32,
) -> Result<Vec<u8>, CoreError> {
    let target = resolve_label(
        program,
        layout,
        segment_index,
        reference.segment.as_deref(),
        &reference.label,
    )?;
    let endianness = program.metadata.endianness;
    let width = reference.width as usize;
    let mut out = Vec::with_capacity(width);
    match reference.kind {
        ReferenceKind::Absolute => {
            let value = i64::from(target) + reference.offset;
            if value < 0 || value > i64::from(u32::MAX) {
                return Err(CoreError::ReferenceOutOfRange {
                    label: reference.label.clone(),
                    width: reference.width,
                });
            }
            endianness.write_u32(&mut out, value as u32);
        }
        ReferenceKind::Relative => {
            let value =
                i64::from(target) - (i64::from(address) + width as i64) + reference.offset;
            if width < 8 {
                let bits = width as u32 * 8;
                if value < -(1i64 << (bits - 1)) || value >= 1i64 << (bits - 1) {
                    return Err(CoreError::ReferenceOutOfRange {
                        label: reference.label.clone(),
                        width: reference.width,
                    });
                }
            }
            endianness.write_uint(&mut out, value as u64, width);
        }
    }
    Ok(out)
}

fn resolve_label(
    program: &Program,
    layout: &Layout,
    segment_index: usize,
    segment: Option<&str>,
    label: &str,
) -> Result<u32, CoreError> {
    let (index, segment_name) = match segment {
        Some(name) => (
            program
                .segment_index(name)
                .ok_or_else(|| CoreError::UnknownLabel {
                    segment: name.to_string(),
                    label: label.to_string(),
                })?,
            name,
        ),
        None => (segment_index, program.segments[segment_index].name.as_str()),
    };
    layout.labels[index]
        .get(label)
        .copied()
        .ok_or_else(|| CoreError::UnknownLabel {
            segment: segment_name.to_string(),
            label: label.to_string(),
        })
}

fn entry_address(layout: &Layout, entry_label: &str) -> Result<u32, CoreError> {
    let mut found = None;
    for labels in &layout.labels {
        if let Some(&address) = labels.get(entry_label) {
            if found.is_some() {
                return Err(CoreError::EntryAmbiguous(entry_label.to_string()));
            }
            found = Some(address);
        }
    }
    found.ok_or_else(|| CoreError::EntryNotFound(entry_label.to_string()))
}

/// The read-only view extensions render through.
struct RenderView<'a> {
    program: &'a Program,
    layout: &'a Layout,
    segment_index: usize,
}

impl ProgramView for RenderView<'_> {
    fn metadata(&self) -> &Metadata {
        &self.program.metadata
    }

    fn segment_name(&self) -> &str {
        &self.program.segments[self.segment_index].name
    }

    fn label_address(&self, segment: Option<&str>, label: &str) -> Result<u32, CoreError> {
        resolve_label(self.program, self.layout, self.segment_index, segment, label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::ExtensionRegistry;
    use crate::preprocessor::Preprocessor;
    use crate::transformer::transform;

    fn render_source(source: &str, options: &RenderOptions) -> Result<Vec<u8>, CoreError> {
        let mut files = HashMap::new();
        files.insert("main.eh".to_string(), source.to_string());
        let merged = Preprocessor::new(&files).preprocess("main.eh")?;
        let program = transform(&merged, &ExtensionRegistry::with_builtins(), 16)?;
        render(&program, options)
    }

    fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }

    #[test]
    fn renders_a_minimal_executable() {
        let output = render_source(
            "program 3 < 4096 segment text(flags: rx) { [_start] b8 =1d4 cd 80 }",
            &RenderOptions::default(),
        )
        .expect("render");

        assert_eq!(&output[0..4], b"\x7fELF");
        // one segment: content follows the 52 + 32 byte headers
        assert_eq!(output.len(), 84 + 7);
        // e_entry is the address of _start
        assert_eq!(read_u32_le(&output, 24), 0x0804_8000);
        assert_eq!(output[84], 0xb8);
        // the four bytes after b8 decode as unsigned 1, little-endian
        assert_eq!(read_u32_le(&output, 85), 1);
        assert_eq!(&output[89..91], &[0xcd, 0x80]);
    }

    #[test]
    fn no_header_mode_emits_bare_segment_images() {
        let output = render_source(
            "program 3 < 16 segment a() { [_start] 00 01 02 03 }",
            &RenderOptions {
                emit_header: false,
                ..RenderOptions::default()
            },
        )
        .expect("render");
        assert_eq!(output, vec![0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn resolves_cross_segment_absolute_references() {
        let output = render_source(
            "program 3 < 4096 \
             segment text(flags: rx) { [_start] <<strings:hello>> } \
             segment strings(flags: r) { [hello] \"Hi\" }",
            &RenderOptions::default(),
        )
        .expect("render");

        // text sits at 0x08048000 and is 4 bytes long; strings aligns up to
        // the next 0x1000 boundary
        let reference = read_u32_le(&output, 116);
        assert_eq!(reference, 0x0804_9000);
        // strings lands at file offset 4096 with its two bytes
        assert_eq!(&output[4096..4098], b"Hi");
        // second program header records the aligned placement
        let second_phdr = 52 + 32;
        assert_eq!(read_u32_le(&output, second_phdr + 4), 4096); // p_offset
        assert_eq!(read_u32_le(&output, second_phdr + 8), 0x0804_9000); // p_vaddr
    }

    #[test]
    fn encodes_backward_relative_references() {
        let output = render_source(
            "program 3 < 16 segment a() { [_start] [a] 90 90 72 <a> }",
            &RenderOptions {
                emit_header: false,
                ..RenderOptions::default()
            },
        )
        .expect("render");
        assert_eq!(output, vec![0x90, 0x90, 0x72, 0xfc]);
    }

    #[test]
    fn hygienic_fragments_self_reference_locally() {
        let output = render_source(
            "program 3 < 16 segment a() { [_start] @f() @f() } \
             fragment f() { [__x] eb <__x> }",
            &RenderOptions {
                emit_header: false,
                ..RenderOptions::default()
            },
        )
        .expect("render");
        assert_eq!(output, vec![0xeb, 0xfe, 0xeb, 0xfe]);
    }

    #[test]
    fn wide_relative_references_encode_in_program_endianness() {
        let output = render_source(
            "program 3 > 16 segment a() { [_start] <end:2> 00 [end] }",
            &RenderOptions {
                emit_header: false,
                ..RenderOptions::default()
            },
        )
        .expect("render");
        // target 3, reference ends at 2: difference 1, big-endian 2 bytes
        assert_eq!(output, vec![0x00, 0x01, 0x00]);
    }

    #[test]
    fn relative_references_respect_offsets() {
        let output = render_source(
            "program 3 < 16 segment a() { [_start] [a] 90 <a + 2> }",
            &RenderOptions {
                emit_header: false,
                ..RenderOptions::default()
            },
        )
        .expect("render");
        // target 0 - (1 + 1) + 2 = 0
        assert_eq!(output, vec![0x90, 0x00]);
    }

    #[test]
    fn rejects_relative_references_out_of_range() {
        let mut body = String::from("[_start] [a] ");
        for _ in 0..130 {
            body.push_str("90 ");
        }
        body.push_str("<a>");
        let err = render_source(
            &format!("program 3 < 16 segment a() {{ {body} }}"),
            &RenderOptions {
                emit_header: false,
                ..RenderOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::ReferenceOutOfRange { .. }));
    }

    #[test]
    fn auto_labels_follow_file_content() {
        let output = render_source(
            "program 3 < 16 \
             segment a() { [_start] <<buf>> <<end>> 00 [[buf: 6 end: 2]] }",
            &RenderOptions {
                emit_header: false,
                ..RenderOptions::default()
            },
        )
        .expect("render");
        // file image is 9 bytes; buf sits right past it, end after buf
        assert_eq!(read_u32_le(&output, 0), 0x0804_8000 + 9);
        assert_eq!(read_u32_le(&output, 4), 0x0804_8000 + 15);
    }

    #[test]
    fn memory_size_covers_auto_labels_and_declared_size() {
        let output = render_source(
            "program 3 < 4096 \
             segment a(flags: rx) { [_start] 00 } \
             segment b(size: 64) { 11 [[tail: 7]] }",
            &RenderOptions::default(),
        )
        .expect("render");
        let second_phdr = 52 + 32;
        assert_eq!(read_u32_le(&output, second_phdr + 16), 1); // p_filesz
        assert_eq!(read_u32_le(&output, second_phdr + 20), 64); // p_memsz
    }

    #[test]
    fn segment_addresses_honor_alignment() {
        let output = render_source(
            "program 3 < 4096 \
             segment a(flags: rx) { [_start] 00 } \
             segment b(alignment: 32) { 11 }",
            &RenderOptions::default(),
        )
        .expect("render");
        let second_phdr = 52 + 32;
        let vaddr = read_u32_le(&output, second_phdr + 8);
        assert_eq!(vaddr % 32, 0);
        assert_eq!(vaddr, 0x0804_8020);
    }

    #[test]
    fn reports_unknown_reference_targets() {
        let err = render_source(
            "program 3 < 16 segment a() { [_start] <missing> }",
            &RenderOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::UnknownLabel { .. }));
    }

    #[test]
    fn unqualified_references_stay_in_their_segment() {
        let err = render_source(
            "program 3 < 16 \
             segment a() { [_start] <other> } segment b() { [other] }",
            &RenderOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::UnknownLabel { .. }));
    }

    #[test]
    fn reports_missing_and_ambiguous_entry_labels() {
        let err = render_source(
            "program 3 < 16 segment a() { 00 }",
            &RenderOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::EntryNotFound(_)));

        let err = render_source(
            "program 3 < 16 segment a() { [_start] } segment b() { [_start] }",
            &RenderOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::EntryAmbiguous(_)));
    }

    #[test]
    fn honors_a_custom_entry_label() {
        let output = render_source(
            "program 3 < 4096 segment a(flags: rx) { 90 [begin] cd 80 }",
            &RenderOptions {
                entry_label: "begin".to_string(),
                ..RenderOptions::default()
            },
        )
        .expect("render");
        assert_eq!(read_u32_le(&output, 24), 0x0804_8001);
    }

    #[test]
    fn renders_extension_payloads_in_place() {
        let output = render_source(
            "program 3 < 16 \
             segment a() { [_start] 89 :x86.args { ecx, [esi + 8] } }",
            &RenderOptions {
                emit_header: false,
                ..RenderOptions::default()
            },
        )
        .expect("render");
        assert_eq!(output, vec![0x89, 0x4e, 0x08]);
    }

    #[test]
    fn extension_pointers_resolve_against_the_layout() {
        let output = render_source(
            "program 3 < 16 \
             segment a() { [_start] 8b :x86.args { ecx, [ebx + dword ptr data:value] } } \
             segment data() { [value] =7d4 }",
            &RenderOptions {
                emit_header: false,
                ..RenderOptions::default()
            },
        )
        .expect("render");
        assert_eq!(output[0], 0x8b);
        assert_eq!(output[1], 0x8b);
        // disp32 holds the address of data:value
        let data_vaddr = read_u32_le(&output, 2);
        assert_eq!(data_vaddr, 0x0804_8000 + 16);
    }

    struct Lying;

    impl crate::extension::Extension for Lying {
        fn parse(
            &self,
            _content: &str,
        ) -> Result<Box<dyn crate::extension::ExtensionHandle>, CoreError> {
            Ok(Box::new(LyingHandle))
        }
    }

    #[derive(Debug)]
    struct LyingHandle;

    impl crate::extension::ExtensionHandle for LyingHandle {
        fn size(&self) -> usize {
            2
        }

        fn render(&self, _view: &dyn ProgramView) -> Result<Vec<u8>, CoreError> {
            Ok(vec![0x90])
        }
    }

    #[test]
    fn rejects_extension_size_mismatches() {
        let mut files = HashMap::new();
        files.insert(
            "main.eh".to_string(),
            "program 3 < 16 segment a() { [_start] ::bad { x } }".to_string(),
        );
        let merged = Preprocessor::new(&files)
            .preprocess("main.eh")
            .expect("preprocess");
        let mut registry = ExtensionRegistry::new();
        registry.register_global("bad", Box::new(Lying));
        let program = transform(&merged, &registry, 16).expect("transform");

        let err = render(&program, &RenderOptions::default()).unwrap_err();
        assert!(matches!(err, CoreError::ExtensionSizeMismatch { .. }));
    }

    #[test]
    fn aligns_like_the_original_hello_world() {
        // include-merged program with aligned data segment
        let output = render_source(
            "program 3 < 4096 \
             segment text(flags: rx) { [_start] b8 =4d4 bb =1d4 b9 <<data:msg>> ba =5d4 cd 80 } \
             segment data(flags: r) { [msg] \"aaaaa\" }",
            &RenderOptions::default(),
        )
        .expect("render");
        assert_eq!(&output[0..4], b"\x7fELF");
        let data_phdr = 52 + 32;
        let msg_address = read_u32_le(&output, data_phdr + 8);
        // the b9 immediate points at msg; text content starts after the
        // 52 + 2 * 32 byte headers
        let immediate_offset = 116 + 11;
        assert_eq!(read_u32_le(&output, immediate_offset), msg_address);
        assert_eq!(&output[4096..4101], b"aaaaa");
    }
}
