//! Recursive-descent parser for the `.eh` surface syntax.
//!
//! The token stream is produced by [`crate::lexer`]; the output is the raw
//! syntax tree of [`crate::ast`]. Element words are interpreted in place: a
//! bare word inside a segment or fragment body must be a lowercase hex byte
//! pair.

use crate::ast::{
    Element, ExtensionInvocation, FragmentDef, FragmentRef, Include, RawSegment, SegmentArgs,
    SourceFile,
};
use crate::error::CoreError;
use crate::lexer::{lex, Token, TokenKind};
use crate::program::{AutoLabel, Endianness, Metadata, Number, Reference, ReferenceKind, SegmentFlags};

pub fn parse(input: &str) -> Result<SourceFile, CoreError> {
    let tokens = lex(input)?;
    let mut position = 0;
    parse_source_file(&tokens, &mut position)
}

fn parse_source_file(tokens: &[Token], position: &mut usize) -> Result<SourceFile, CoreError> {
    let (keyword, keyword_position) = expect_word(tokens, position, "program declaration")?;
    if keyword != "program" {
        return parse_error(keyword_position, "expected program declaration");
    }
    let (machine_word, machine_position) = expect_word(tokens, position, "machine number")?;
    let machine = parse_number_word::<u16>(machine_word, machine_position, "machine number")?;
    let endianness = match next(tokens, position)? {
        Token {
            kind: TokenKind::Lt,
            ..
        } => Endianness::Little,
        Token {
            kind: TokenKind::Gt,
            ..
        } => Endianness::Big,
        token => return parse_error(token.position, "expected endianness ('<' or '>')"),
    };
    let (align_word, align_position) = expect_word(tokens, position, "alignment")?;
    let align = parse_number_word::<u32>(align_word, align_position, "alignment")?;
    if align == 0 {
        return parse_error(align_position, "alignment must be positive");
    }

    let mut file = SourceFile {
        metadata: Metadata {
            machine,
            endianness,
            align,
        },
        includes: Vec::new(),
        segments: Vec::new(),
        fragments: Vec::new(),
    };
    while *position < tokens.len() {
        let (keyword, keyword_position) =
            expect_word(tokens, position, "include, segment, or fragment")?;
        match keyword {
            "include" => file.includes.push(parse_include(tokens, position)?),
            "segment" => file.segments.push(parse_segment(tokens, position)?),
            "fragment" => file.fragments.push(parse_fragment(tokens, position)?),
            _ => return parse_error(keyword_position, "expected include, segment, or fragment"),
        }
    }
    Ok(file)
}

fn parse_include(tokens: &[Token], position: &mut usize) -> Result<Include, CoreError> {
    let fragments_only =
        matches!(peek(tokens, *position), Some(TokenKind::Word(word)) if word == "fragments");
    if fragments_only {
        *position += 1;
    }
    let token = next(tokens, position)?;
    match &token.kind {
        TokenKind::Str(path) => Ok(Include {
            path: path.clone(),
            fragments_only,
        }),
        _ => parse_error(token.position, "expected include path string"),
    }
}

fn parse_segment(tokens: &[Token], position: &mut usize) -> Result<RawSegment, CoreError> {
    let (name, _) = expect_word(tokens, position, "segment name")?;
    let name = name.to_string();
    expect(tokens, position, TokenKind::LParen, "'('")?;
    let mut args = SegmentArgs::default();
    loop {
        let token = next(tokens, position)?;
        match &token.kind {
            TokenKind::RParen => break,
            TokenKind::Word(key) => {
                expect(tokens, position, TokenKind::Colon, "':'")?;
                let (value, value_position) = expect_word(tokens, position, "argument value")?;
                match key.as_str() {
                    "flags" => {
                        args.flags = Some(SegmentFlags::parse(value).ok_or_else(|| {
                            CoreError::Parse {
                                position: value_position,
                                message: format!("invalid segment flags '{value}'"),
                            }
                        })?)
                    }
                    "size" => {
                        args.size =
                            Some(parse_number_word::<u32>(value, value_position, "segment size")?)
                    }
                    "alignment" => {
                        let alignment =
                            parse_number_word::<u32>(value, value_position, "segment alignment")?;
                        if alignment == 0 {
                            return parse_error(value_position, "alignment must be positive");
                        }
                        args.alignment = Some(alignment);
                    }
                    _ => {
                        return parse_error(
                            token.position,
                            format!("unknown segment argument '{key}'"),
                        )
                    }
                }
            }
            _ => return parse_error(token.position, "expected segment argument or ')'"),
        }
    }
    expect(tokens, position, TokenKind::LBrace, "'{'")?;

    let mut contents = Vec::new();
    let mut auto_labels = Vec::new();
    loop {
        match peek(tokens, *position) {
            Some(TokenKind::RBrace) => {
                *position += 1;
                break;
            }
            Some(TokenKind::AutoOpen) => {
                *position += 1;
                auto_labels = parse_auto_labels(tokens, position)?;
                expect(tokens, position, TokenKind::RBrace, "'}'")?;
                break;
            }
            Some(_) => contents.push(parse_element(tokens, position)?),
            None => {
                return parse_error(end_position(tokens), "unexpected end of input in segment")
            }
        }
    }
    Ok(RawSegment {
        name,
        args,
        contents,
        auto_labels,
    })
}

fn parse_auto_labels(tokens: &[Token], position: &mut usize) -> Result<Vec<AutoLabel>, CoreError> {
    let mut auto_labels = Vec::new();
    loop {
        let token = next(tokens, position)?;
        match &token.kind {
            TokenKind::AutoClose => break,
            TokenKind::Word(name) => {
                expect(tokens, position, TokenKind::Colon, "':'")?;
                let (width_word, width_position) =
                    expect_word(tokens, position, "auto-label width")?;
                let width = parse_number_word::<u32>(width_word, width_position, "auto-label width")?;
                auto_labels.push(AutoLabel {
                    name: name.clone(),
                    width,
                });
            }
            _ => return parse_error(token.position, "expected auto-label or ']]'"),
        }
    }
    Ok(auto_labels)
}

fn parse_fragment(tokens: &[Token], position: &mut usize) -> Result<FragmentDef, CoreError> {
    let (name, _) = expect_word(tokens, position, "fragment name")?;
    let name = name.to_string();
    expect(tokens, position, TokenKind::LParen, "'('")?;
    let mut params = Vec::new();
    if matches!(peek(tokens, *position), Some(TokenKind::RParen)) {
        *position += 1;
    } else {
        loop {
            let (param, _) = expect_word(tokens, position, "parameter name")?;
            params.push(param.to_string());
            let token = next(tokens, position)?;
            match token.kind {
                TokenKind::Comma => continue,
                TokenKind::RParen => break,
                _ => return parse_error(token.position, "expected ',' or ')'"),
            }
        }
    }
    expect(tokens, position, TokenKind::LBrace, "'{'")?;
    let mut contents = Vec::new();
    loop {
        match peek(tokens, *position) {
            Some(TokenKind::RBrace) => {
                *position += 1;
                break;
            }
            Some(_) => contents.push(parse_element(tokens, position)?),
            None => {
                return parse_error(end_position(tokens), "unexpected end of input in fragment")
            }
        }
    }
    Ok(FragmentDef {
        name,
        params,
        contents,
    })
}

fn parse_element(tokens: &[Token], position: &mut usize) -> Result<Element, CoreError> {
    let token = next(tokens, position)?;
    match &token.kind {
        TokenKind::Word(word) => Ok(Element::Bytes(vec![parse_hex_pair(word, token.position)?])),
        TokenKind::Str(string) => Ok(Element::Bytes(string.bytes().collect())),
        TokenKind::Padded { sign, body } => Ok(Element::Number(parse_padded_number(
            *sign,
            body,
            token.position,
        )?)),
        TokenKind::LBracket => {
            let (name, _) = expect_word(tokens, position, "label name")?;
            let name = name.to_string();
            expect(tokens, position, TokenKind::RBracket, "']'")?;
            Ok(Element::Label(name))
        }
        TokenKind::Lt => Ok(Element::Reference(parse_reference(
            tokens,
            position,
            ReferenceKind::Relative,
        )?)),
        TokenKind::LtLt => Ok(Element::Reference(parse_reference(
            tokens,
            position,
            ReferenceKind::Absolute,
        )?)),
        TokenKind::At | TokenKind::AtBang => {
            let once = token.kind == TokenKind::AtBang;
            Ok(Element::FragmentRef(parse_fragment_ref(
                tokens, position, once,
            )?))
        }
        TokenKind::Dollar => {
            let (name, _) = expect_word(tokens, position, "parameter name")?;
            Ok(Element::ParamRef(name.to_string()))
        }
        TokenKind::Colon | TokenKind::ColonColon => {
            let absolute = token.kind == TokenKind::ColonColon;
            Ok(Element::Extension(parse_extension(
                tokens, position, absolute,
            )?))
        }
        _ => parse_error(token.position, "expected an element"),
    }
}

fn parse_reference(
    tokens: &[Token],
    position: &mut usize,
    kind: ReferenceKind,
) -> Result<Reference, CoreError> {
    let (first, _) = expect_word(tokens, position, "label name")?;
    let mut segment = None;
    let mut label = first.to_string();
    // `seg:label` when the word after ':' is a name; `label:width` when digits.
    if matches!(peek(tokens, *position), Some(TokenKind::Colon)) {
        if let Some(TokenKind::Word(word)) = peek(tokens, *position + 1) {
            if !word.chars().all(|c| c.is_ascii_digit()) {
                *position += 1;
                let (target, _) = expect_word(tokens, position, "label name")?;
                segment = Some(first.to_string());
                label = target.to_string();
            }
        }
    }

    let mut offset = 0i64;
    match peek(tokens, *position) {
        Some(TokenKind::Plus) | Some(TokenKind::Minus) => {
            let negative = matches!(peek(tokens, *position), Some(TokenKind::Minus));
            *position += 1;
            let (value_word, value_position) = expect_word(tokens, position, "offset")?;
            let value = parse_number_word::<i64>(value_word, value_position, "offset")?;
            offset = if negative { -value } else { value };
        }
        Some(TokenKind::Padded { sign, body }) if *sign != '=' => {
            let token_position = tokens[*position].position;
            let value = parse_number_word::<i64>(body, token_position, "offset")?;
            offset = if *sign == '-' { -value } else { value };
            *position += 1;
        }
        _ => {}
    }

    let mut width: u8 = match kind {
        ReferenceKind::Relative => 1,
        ReferenceKind::Absolute => 4,
    };
    if matches!(peek(tokens, *position), Some(TokenKind::Colon)) {
        *position += 1;
        let (width_word, width_position) = expect_word(tokens, position, "reference width")?;
        if kind == ReferenceKind::Absolute {
            return parse_error(width_position, "absolute references have a fixed width");
        }
        width = parse_number_word::<u8>(width_word, width_position, "reference width")?;
        if !matches!(width, 1 | 2 | 4 | 8) {
            return parse_error(width_position, format!("invalid reference width {width}"));
        }
    }

    let closer = next(tokens, position)?;
    let expected = match kind {
        ReferenceKind::Relative => TokenKind::Gt,
        ReferenceKind::Absolute => TokenKind::GtGt,
    };
    if closer.kind != expected {
        return parse_error(closer.position, "unterminated reference");
    }
    Ok(Reference {
        label,
        segment,
        offset,
        width,
        kind,
    })
}

fn parse_fragment_ref(
    tokens: &[Token],
    position: &mut usize,
    once: bool,
) -> Result<FragmentRef, CoreError> {
    let (name, _) = expect_word(tokens, position, "fragment name")?;
    let name = name.to_string();
    expect(tokens, position, TokenKind::LParen, "'('")?;
    let mut args: Vec<Vec<Element>> = Vec::new();
    if matches!(peek(tokens, *position), Some(TokenKind::RParen)) {
        *position += 1;
    } else {
        let mut current = Vec::new();
        loop {
            match peek(tokens, *position) {
                Some(TokenKind::Comma) => {
                    *position += 1;
                    args.push(std::mem::take(&mut current));
                }
                Some(TokenKind::RParen) => {
                    *position += 1;
                    args.push(current);
                    break;
                }
                Some(_) => current.push(parse_element(tokens, position)?),
                None => {
                    return parse_error(
                        end_position(tokens),
                        "unexpected end of input in fragment arguments",
                    )
                }
            }
        }
    }
    let alias = if matches!(peek(tokens, *position), Some(TokenKind::LParen)) {
        *position += 1;
        let (alias, _) = expect_word(tokens, position, "alias")?;
        let alias = alias.to_string();
        expect(tokens, position, TokenKind::RParen, "')'")?;
        Some(alias)
    } else {
        None
    };
    Ok(FragmentRef {
        name,
        args,
        alias,
        once,
    })
}

fn parse_extension(
    tokens: &[Token],
    position: &mut usize,
    absolute: bool,
) -> Result<ExtensionInvocation, CoreError> {
    let (name, _) = expect_word(tokens, position, "extension name")?;
    let name = name.to_string();
    expect(tokens, position, TokenKind::LBrace, "'{'")?;
    let mut parts = Vec::new();
    loop {
        let token = next(tokens, position)?;
        match &token.kind {
            TokenKind::RBrace => break,
            kind => parts.push(kind.source_text()),
        }
    }
    Ok(ExtensionInvocation {
        name,
        absolute,
        content: parts.join(" "),
    })
}

fn parse_hex_pair(word: &str, position: usize) -> Result<u8, CoreError> {
    let valid = word.len() == 2
        && word
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if !valid {
        return parse_error(position, format!("expected an element, found '{word}'"));
    }
    u8::from_str_radix(word, 16).map_err(|_| CoreError::Parse {
        position,
        message: format!("invalid hex pair '{word}'"),
    })
}

fn parse_padded_number(sign: char, body: &str, position: usize) -> Result<Number, CoreError> {
    let bytes = body.as_bytes();
    let (digits, base_char, width) = if body.len() >= 2 && bytes[body.len() - 1].is_ascii_digit() {
        (
            &body[..body.len() - 2],
            bytes[body.len() - 2] as char,
            bytes[body.len() - 1] - b'0',
        )
    } else {
        (&body[..body.len() - 1], bytes[body.len() - 1] as char, 1)
    };
    let base = match base_char {
        'b' => 2,
        'd' => 10,
        'h' => 16,
        _ => return parse_error(position, format!("invalid number base '{base_char}'")),
    };
    if !matches!(width, 1 | 2 | 4 | 8) {
        return parse_error(position, format!("invalid number width {width}"));
    }
    if digits.is_empty() {
        return parse_error(position, "number literal has no digits");
    }
    let mut magnitude: u64 = 0;
    for c in digits.chars() {
        let digit = c.to_digit(base).ok_or_else(|| CoreError::Parse {
            position,
            message: format!("invalid digit '{c}' for base {base}"),
        })? as u64;
        magnitude = magnitude
            .checked_mul(base as u64)
            .and_then(|m| m.checked_add(digit))
            .ok_or(CoreError::LiteralOutOfRange)?;
    }
    Ok(Number {
        magnitude,
        negative: sign == '-',
        signed: sign != '=',
        width,
    })
}

fn parse_number_word<T: std::str::FromStr>(
    word: &str,
    position: usize,
    what: &str,
) -> Result<T, CoreError> {
    word.parse().map_err(|_| CoreError::Parse {
        position,
        message: format!("invalid {what} '{word}'"),
    })
}

fn next<'a>(tokens: &'a [Token], position: &mut usize) -> Result<&'a Token, CoreError> {
    let token = tokens.get(*position).ok_or_else(|| CoreError::Parse {
        position: end_position(tokens),
        message: "unexpected end of input".to_string(),
    })?;
    *position += 1;
    Ok(token)
}

fn peek(tokens: &[Token], position: usize) -> Option<&TokenKind> {
    tokens.get(position).map(|t| &t.kind)
}

fn expect(
    tokens: &[Token],
    position: &mut usize,
    kind: TokenKind,
    what: &str,
) -> Result<(), CoreError> {
    let token = next(tokens, position)?;
    if token.kind == kind {
        Ok(())
    } else {
        parse_error(token.position, format!("expected {what}"))
    }
}

fn expect_word<'a>(
    tokens: &'a [Token],
    position: &mut usize,
    what: &str,
) -> Result<(&'a str, usize), CoreError> {
    let token = next(tokens, position)?;
    match &token.kind {
        TokenKind::Word(word) => Ok((word, token.position)),
        _ => parse_error(token.position, format!("expected {what}")),
    }
}

fn end_position(tokens: &[Token]) -> usize {
    tokens.last().map(|t| t.position).unwrap_or(0)
}

fn parse_error<T>(position: usize, message: impl Into<String>) -> Result<T, CoreError> {
    Err(CoreError::Parse {
        position,
        message: message.into(),
    })
}
