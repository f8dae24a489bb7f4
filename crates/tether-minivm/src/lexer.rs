//! Line-oriented tokenizer. `#` starts a comment; newlines separate
//! statements and survive as tokens.

use tether::error::{ScriptError, TraceFrame};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    Plus,
    Minus,
    Star,
    Slash,
    Assign,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Newline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
    pub column: u32,
}

pub fn tokenize(source: &str, script_name: &str) -> Result<Vec<Spanned>, ScriptError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line: u32 = 1;
    let mut column: u32 = 1;

    macro_rules! push {
        ($token:expr, $col:expr) => {
            tokens.push(Spanned {
                token: $token,
                line,
                column: $col,
            })
        };
    }

    while let Some(&c) = chars.peek() {
        let start_col = column;
        match c {
            '\n' => {
                chars.next();
                push!(Token::Newline, start_col);
                line += 1;
                column = 1;
            }
            ' ' | '\t' | '\r' => {
                chars.next();
                column += 1;
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                    column += 1;
                }
            }
            '+' | '-' | '*' | '/' | '=' | '(' | ')' | '[' | ']' | ',' | '.' => {
                chars.next();
                column += 1;
                let token = match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '=' => Token::Assign,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    ',' => Token::Comma,
                    _ => Token::Dot,
                };
                push!(token, start_col);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                column += 1;
                let mut text = String::new();
                let mut closed = false;
                while let Some(&c) = chars.peek() {
                    chars.next();
                    column += 1;
                    if c == quote {
                        closed = true;
                        break;
                    }
                    if c == '\n' {
                        break;
                    }
                    text.push(c);
                }
                if !closed {
                    return Err(syntax(
                        "unterminated string literal",
                        script_name,
                        line,
                        start_col,
                    ));
                }
                push!(Token::Str(text), start_col);
            }
            '0'..='9' => {
                let mut text = String::new();
                let mut is_float = false;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                    } else if c == '.' && !is_float {
                        is_float = true;
                        text.push(c);
                    } else {
                        break;
                    }
                    chars.next();
                    column += 1;
                }
                let token = if is_float {
                    text.parse().ok().map(Token::Float)
                } else {
                    text.parse().ok().map(Token::Int)
                };
                match token {
                    Some(token) => push!(token, start_col),
                    None => {
                        return Err(syntax(
                            &format!("invalid number literal `{text}`"),
                            script_name,
                            line,
                            start_col,
                        ));
                    }
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                        column += 1;
                    } else {
                        break;
                    }
                }
                push!(Token::Name(name), start_col);
            }
            other => {
                return Err(syntax(
                    &format!("unexpected character `{other}`"),
                    script_name,
                    line,
                    start_col,
                ));
            }
        }
    }
    Ok(tokens)
}

pub fn syntax(message: &str, script_name: &str, line: u32, column: u32) -> ScriptError {
    ScriptError::new("SyntaxError", message)
        .with_frame(TraceFrame::new(script_name, line, column))
}
