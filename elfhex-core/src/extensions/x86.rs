//! The `x86.args` extension: computes x86 argument ("ModR/M") byte
//! sequences, written Intel style. Since argument order is determined by the
//! opcode, the register always comes first, and can also be given as a
//! number for unary opcodes that reuse the register field. Displacements can
//! be decimal, `h`-suffixed hex, or `dword ptr label` pointers (optionally
//! `segment:label`), resolved against the laid-out program.

use crate::error::CoreError;
use crate::extension::{Extension, ExtensionHandle, ProgramView};
use crate::lexer::{lex, Token, TokenKind};

pub struct X86Args;

impl Extension for X86Args {
    fn parse(&self, content: &str) -> Result<Box<dyn ExtensionHandle>, CoreError> {
        let handle = parse_args(content).map_err(|message| CoreError::ExtensionParse {
            name: "x86.args".to_string(),
            message,
        })?;
        Ok(Box::new(handle))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Register {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Register {
    fn from_word(word: &str) -> Option<Register> {
        let registers = [
            Register::Eax,
            Register::Ecx,
            Register::Edx,
            Register::Ebx,
            Register::Esp,
            Register::Ebp,
            Register::Esi,
            Register::Edi,
        ];
        if let Ok(value) = word.parse::<usize>() {
            return registers.get(value).copied();
        }
        // 8-bit aliases share the encoding of the register whose number they
        // carry
        let index = match word.to_ascii_lowercase().as_str() {
            "eax" | "al" => 0,
            "ecx" | "cl" => 1,
            "edx" | "dl" => 2,
            "ebx" | "bl" => 3,
            "esp" | "ah" => 4,
            "ebp" | "ch" => 5,
            "esi" | "dh" => 6,
            "edi" | "bh" => 7,
            _ => return None,
        };
        Some(registers[index])
    }

    fn value(self) -> u8 {
        self as u8
    }

    fn bitmask(self) -> u8 {
        self.value() << 3
    }
}

#[derive(Debug, Clone, Copy)]
struct Scale(u8);

impl Scale {
    const ONE: Scale = Scale(0);

    fn from_word(word: &str) -> Option<Scale> {
        match word {
            "1" => Some(Scale(0)),
            "2" => Some(Scale(1)),
            "4" => Some(Scale(2)),
            "8" => Some(Scale(3)),
            _ => None,
        }
    }

    fn bitmask(self) -> u8 {
        self.0 << 6
    }
}

#[derive(Debug, Clone, Copy)]
struct Index {
    register: Register,
    scale: Scale,
}

impl Index {
    fn new(register: Register, scale: Scale) -> Result<Index, String> {
        if register == Register::Esp {
            return Err("the esp register can't be used as the index".to_string());
        }
        Ok(Index { register, scale })
    }

    fn bitmask(self) -> u8 {
        self.scale.bitmask() | self.register.value() << 3
    }
}

#[derive(Debug, Clone)]
enum Disp {
    Constant(i64),
    Pointer {
        segment: Option<String>,
        label: String,
    },
}

#[derive(Debug, Clone)]
struct Memory {
    base: Option<Register>,
    index: Option<Index>,
    disp: Disp,
}

#[derive(Debug, Clone)]
enum Operand {
    Register(Register),
    Memory(Memory),
}

#[derive(Debug)]
struct ArgsHandle {
    register: Register,
    operand: Operand,
}

impl ExtensionHandle for ArgsHandle {
    fn size(&self) -> usize {
        // encoding with no view resolves pointers to 0; length is unaffected
        match self.encode(None) {
            Ok(bytes) => bytes.len(),
            Err(_) => 0,
        }
    }

    fn render(&self, view: &dyn ProgramView) -> Result<Vec<u8>, CoreError> {
        self.encode(Some(view))
    }
}

impl ArgsHandle {
    fn encode(&self, view: Option<&dyn ProgramView>) -> Result<Vec<u8>, CoreError> {
        match &self.operand {
            Operand::Register(rm) => Ok(vec![0b11 << 6 | self.register.bitmask() | rm.value()]),
            Operand::Memory(memory) => memory.encode(self.register, view),
        }
    }
}

impl Memory {
    fn encode(
        &self,
        register: Register,
        view: Option<&dyn ProgramView>,
    ) -> Result<Vec<u8>, CoreError> {
        let reg = register.bitmask();
        match (self.base, self.index) {
            // disp32 only, mod stays 00
            (None, None) => {
                let mut out = vec![reg | 0b101];
                self.extend_disp(&mut out, view, false, true)?;
                Ok(out)
            }
            (Some(base), None) => {
                let first = reg | base.value();
                if base == Register::Esp {
                    // esp as base always takes the no-index SIB form
                    let mut out = vec![first, 0x24];
                    self.extend_disp(&mut out, view, true, false)?;
                    Ok(out)
                } else if base == Register::Ebp && matches!(self.disp, Disp::Constant(0)) {
                    // ebp with mod 00 would mean disp32, so use mod 01 disp 0
                    Ok(vec![first | 0b01 << 6, 0])
                } else {
                    let mut out = vec![first];
                    self.extend_disp(&mut out, view, true, false)?;
                    Ok(out)
                }
            }
            (base, Some(index)) => {
                let first = reg | 0b100;
                let mut second = index.bitmask();
                match base {
                    None => {
                        // index + disp32, mod stays 00
                        second |= 0b101;
                        let mut out = vec![first, second];
                        self.extend_disp(&mut out, view, false, true)?;
                        Ok(out)
                    }
                    Some(base) => {
                        second |= base.value();
                        let mut out = vec![first, second];
                        self.extend_disp(&mut out, view, true, false)?;
                        Ok(out)
                    }
                }
            }
        }
    }

    fn extend_disp(
        &self,
        out: &mut Vec<u8>,
        view: Option<&dyn ProgramView>,
        set_mod: bool,
        fix32: bool,
    ) -> Result<(), CoreError> {
        let mut first = out[0];
        let mut bytes = Vec::new();
        match &self.disp {
            Disp::Constant(value) => {
                if *value != 0 || fix32 {
                    if !fix32 && (-128..=127).contains(value) {
                        first |= 0b01 << 6;
                        bytes.push(*value as i8 as u8);
                    } else {
                        first |= 0b10 << 6;
                        bytes.extend_from_slice(&(*value as i32).to_le_bytes());
                    }
                }
            }
            Disp::Pointer { segment, label } => {
                let address = match view {
                    Some(view) => view.label_address(segment.as_deref(), label)?,
                    None => 0,
                };
                first |= 0b10 << 6;
                bytes.extend_from_slice(&address.to_le_bytes());
            }
        }
        if set_mod {
            out[0] = first;
        }
        out.extend_from_slice(&bytes);
        Ok(())
    }
}

fn parse_args(content: &str) -> Result<ArgsHandle, String> {
    let tokens = lex(content).map_err(|err| err.to_string())?;
    let mut position = 0;

    let register = match next(&tokens, &mut position)? {
        TokenKind::Word(word) => Register::from_word(word)
            .ok_or_else(|| format!("invalid register '{word}'"))?,
        other => return Err(format!("expected register, found '{}'", other.source_text())),
    };
    if next(&tokens, &mut position)? != &TokenKind::Comma {
        return Err("expected ',' after the register argument".to_string());
    }

    let operand = match next(&tokens, &mut position)? {
        TokenKind::Word(word) => Operand::Register(
            Register::from_word(word).ok_or_else(|| format!("invalid register '{word}'"))?,
        ),
        TokenKind::LBracket => Operand::Memory(parse_memory(&tokens, &mut position)?),
        other => {
            return Err(format!(
                "expected register or memory operand, found '{}'",
                other.source_text()
            ))
        }
    };
    if position != tokens.len() {
        return Err("unexpected trailing input".to_string());
    }
    Ok(ArgsHandle { register, operand })
}

fn parse_memory(tokens: &[Token], position: &mut usize) -> Result<Memory, String> {
    let mut base: Option<Register> = None;
    let mut index: Option<Index> = None;
    let mut disp: Option<Disp> = None;
    let mut negative = false;

    loop {
        match next(tokens, position)? {
            TokenKind::Word(word) => {
                if let Some(register) = Register::from_word(word) {
                    if negative {
                        return Err("registers can't be negated".to_string());
                    }
                    if peek(tokens, *position) == Some(&TokenKind::Star) {
                        *position += 1;
                        let scale = match next(tokens, position)? {
                            TokenKind::Word(scale_word) => Scale::from_word(scale_word)
                                .ok_or_else(|| format!("invalid scale '{scale_word}'"))?,
                            other => {
                                return Err(format!(
                                    "expected scale, found '{}'",
                                    other.source_text()
                                ))
                            }
                        };
                        if index.is_some() {
                            return Err("more than one index register".to_string());
                        }
                        index = Some(Index::new(register, scale)?);
                    } else if base.is_none() && index.is_none() {
                        base = Some(register);
                    } else if index.is_none() {
                        index = Some(Index::new(register, Scale::ONE)?);
                    } else {
                        return Err("more than one index register".to_string());
                    }
                } else if word == "dword" {
                    match next(tokens, position)? {
                        TokenKind::Word(ptr) if ptr == "ptr" => {}
                        _ => return Err("expected 'ptr' after 'dword'".to_string()),
                    }
                    if negative {
                        return Err("pointers can't be negated".to_string());
                    }
                    let first = expect_name(tokens, position)?;
                    let pointer = if peek(tokens, *position) == Some(&TokenKind::Colon) {
                        *position += 1;
                        let label = expect_name(tokens, position)?;
                        Disp::Pointer {
                            segment: Some(first),
                            label,
                        }
                    } else {
                        Disp::Pointer {
                            segment: None,
                            label: first,
                        }
                    };
                    set_disp(&mut disp, pointer)?;
                } else {
                    let value = parse_literal(word)?;
                    let value = if negative { -value } else { value };
                    set_disp(&mut disp, Disp::Constant(value))?;
                }
            }
            TokenKind::Padded { sign, body } => {
                if *sign == '=' || negative {
                    return Err("invalid displacement".to_string());
                }
                let value = parse_literal(body)?;
                let value = if *sign == '-' { -value } else { value };
                set_disp(&mut disp, Disp::Constant(value))?;
            }
            other => {
                return Err(format!(
                    "unexpected '{}' in memory operand",
                    other.source_text()
                ))
            }
        }
        match next(tokens, position)? {
            TokenKind::RBracket => break,
            TokenKind::Plus => negative = false,
            TokenKind::Minus => negative = true,
            other => {
                return Err(format!(
                    "expected '+', '-', or ']', found '{}'",
                    other.source_text()
                ))
            }
        }
    }

    Ok(Memory {
        base,
        index,
        disp: disp.unwrap_or(Disp::Constant(0)),
    })
}

fn set_disp(slot: &mut Option<Disp>, disp: Disp) -> Result<(), String> {
    if slot.is_some() {
        return Err("more than one displacement".to_string());
    }
    *slot = Some(disp);
    Ok(())
}

fn parse_literal(word: &str) -> Result<i64, String> {
    if word.chars().all(|c| c.is_ascii_digit()) {
        return word
            .parse::<i64>()
            .map_err(|_| format!("invalid value '{word}'"));
    }
    if let Some(hex) = word.strip_suffix('h') {
        if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return i64::from_str_radix(hex, 16).map_err(|_| format!("invalid value '{word}'"));
        }
    }
    Err(format!("invalid value '{word}'"))
}

fn expect_name(tokens: &[Token], position: &mut usize) -> Result<String, String> {
    match next(tokens, position)? {
        TokenKind::Word(word) => Ok(word.clone()),
        other => Err(format!("expected name, found '{}'", other.source_text())),
    }
}

fn next<'a>(tokens: &'a [Token], position: &mut usize) -> Result<&'a TokenKind, String> {
    let token = tokens
        .get(*position)
        .ok_or_else(|| "unexpected end of input".to_string())?;
    *position += 1;
    Ok(&token.kind)
}

fn peek(tokens: &[Token], position: usize) -> Option<&TokenKind> {
    tokens.get(position).map(|t| &t.kind)
}
