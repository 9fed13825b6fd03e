use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// A bare word: names, integers, hex byte pairs, dotted extension names.
    Word(String),
    /// A quoted string literal, quotes stripped.
    Str(String),
    /// A sign character glued to an alphanumeric run, e.g. `=1d4` or `-7`.
    Padded { sign: char, body: String },
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    AutoOpen,
    AutoClose,
    Lt,
    Gt,
    LtLt,
    GtGt,
    Colon,
    ColonColon,
    Comma,
    Plus,
    Minus,
    Star,
    At,
    AtBang,
    Dollar,
}

impl TokenKind {
    /// The surface text of the token, used to reassemble extension content.
    pub fn source_text(&self) -> String {
        match self {
            TokenKind::Word(word) => word.clone(),
            TokenKind::Str(string) => format!("\"{string}\""),
            TokenKind::Padded { sign, body } => format!("{sign}{body}"),
            TokenKind::LParen => "(".to_string(),
            TokenKind::RParen => ")".to_string(),
            TokenKind::LBrace => "{".to_string(),
            TokenKind::RBrace => "}".to_string(),
            TokenKind::LBracket => "[".to_string(),
            TokenKind::RBracket => "]".to_string(),
            TokenKind::AutoOpen => "[[".to_string(),
            TokenKind::AutoClose => "]]".to_string(),
            TokenKind::Lt => "<".to_string(),
            TokenKind::Gt => ">".to_string(),
            TokenKind::LtLt => "<<".to_string(),
            TokenKind::GtGt => ">>".to_string(),
            TokenKind::Colon => ":".to_string(),
            TokenKind::ColonColon => "::".to_string(),
            TokenKind::Comma => ",".to_string(),
            TokenKind::Plus => "+".to_string(),
            TokenKind::Minus => "-".to_string(),
            TokenKind::Star => "*".to_string(),
            TokenKind::At => "@".to_string(),
            TokenKind::AtBang => "@!".to_string(),
            TokenKind::Dollar => "$".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

pub fn lex(input: &str) -> Result<Vec<Token>, CoreError> {
    let mut tokens = Vec::new();
    let mut iter = input.char_indices().peekable();

    while let Some((idx, ch)) = iter.next() {
        let kind = match ch {
            c if c.is_whitespace() => continue,
            '#' => {
                for (_, c) in iter.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                continue;
            }
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            '*' => TokenKind::Star,
            '$' => TokenKind::Dollar,
            '[' => double_or(&mut iter, '[', TokenKind::AutoOpen, TokenKind::LBracket),
            ']' => double_or(&mut iter, ']', TokenKind::AutoClose, TokenKind::RBracket),
            '<' => double_or(&mut iter, '<', TokenKind::LtLt, TokenKind::Lt),
            '>' => double_or(&mut iter, '>', TokenKind::GtGt, TokenKind::Gt),
            ':' => double_or(&mut iter, ':', TokenKind::ColonColon, TokenKind::Colon),
            '@' => double_or(&mut iter, '!', TokenKind::AtBang, TokenKind::At),
            '"' => lex_string(input, idx, &mut iter)?,
            '=' => lex_padded(ch, idx, &mut iter)?,
            '+' | '-' => {
                if iter
                    .peek()
                    .is_some_and(|&(_, next)| next.is_ascii_alphanumeric())
                {
                    lex_padded(ch, idx, &mut iter)?
                } else if ch == '+' {
                    TokenKind::Plus
                } else {
                    TokenKind::Minus
                }
            }
            c if is_word_start(c) => {
                let mut word = String::new();
                word.push(c);
                while let Some(&(_, next)) = iter.peek() {
                    if is_word_continue(next) {
                        word.push(next);
                        iter.next();
                    } else {
                        break;
                    }
                }
                TokenKind::Word(word)
            }
            _ => {
                return Err(CoreError::Parse {
                    position: idx,
                    message: format!("unexpected character '{ch}'"),
                });
            }
        };
        tokens.push(Token {
            kind,
            position: idx,
        });
    }

    Ok(tokens)
}

fn double_or(
    iter: &mut std::iter::Peekable<std::str::CharIndices>,
    second: char,
    double: TokenKind,
    single: TokenKind,
) -> TokenKind {
    if iter.peek().is_some_and(|&(_, next)| next == second) {
        iter.next();
        double
    } else {
        single
    }
}

fn lex_string(
    input: &str,
    start: usize,
    iter: &mut std::iter::Peekable<std::str::CharIndices>,
) -> Result<TokenKind, CoreError> {
    let mut string = String::new();
    for (idx, c) in iter.by_ref() {
        match c {
            '"' => return Ok(TokenKind::Str(string)),
            ' '..='~' => string.push(c),
            _ => return Err(CoreError::UnprintableCharInString { position: idx }),
        }
    }
    Err(CoreError::Parse {
        position: start,
        message: format!("unterminated string {:?}", &input[start..]),
    })
}

fn lex_padded(
    sign: char,
    start: usize,
    iter: &mut std::iter::Peekable<std::str::CharIndices>,
) -> Result<TokenKind, CoreError> {
    let mut body = String::new();
    while let Some(&(_, next)) = iter.peek() {
        if next.is_ascii_alphanumeric() {
            body.push(next);
            iter.next();
        } else {
            break;
        }
    }
    if body.is_empty() {
        return Err(CoreError::Parse {
            position: start,
            message: format!("expected digits after '{sign}'"),
        });
    }
    Ok(TokenKind::Padded { sign, body })
}

fn is_word_start(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn is_word_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '.'
}
