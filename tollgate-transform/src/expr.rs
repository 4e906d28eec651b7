use thiserror::Error;

/// Parse errors for transform expressions.
///
/// Offsets are byte offsets into the source string.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unexpected end of expression")]
    UnexpectedEof,

    #[error("unexpected token '{0}' at offset {1}")]
    UnexpectedToken(String, usize),

    #[error("unterminated string literal at offset {0}")]
    UnterminatedString(usize),

    #[error("invalid number literal at offset {0}")]
    InvalidNumber(usize),

    #[error("expression nested too deeply")]
    TooDeep,

    #[error("empty expression")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Expression AST. Built once per route at snapshot compile time,
/// evaluated per request by `eval`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Var(String),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// A parsed expression together with its source text.
#[derive(Debug, Clone)]
pub struct Program {
    src: String,
    expr: Expr,
}

impl Program {
    pub fn parse(src: &str) -> Result<Self, ParseError> {
        let tokens = lex(src)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_expr()?;
        if parser.pos < parser.tokens.len() {
            let (tok, off) = &parser.tokens[parser.pos];
            return Err(ParseError::UnexpectedToken(tok.describe(), *off));
        }
        Ok(Self {
            src: src.to_string(),
            expr,
        })
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}

// ── Lexer ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Num(n) => n.to_string(),
            Tok::Str(s) => format!("\"{}\"", s),
            Tok::Ident(s) => s.clone(),
            Tok::Punct(p) => (*p).to_string(),
        }
    }
}

fn lex(src: &str) -> Result<Vec<(Tok, usize)>, ParseError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                // Exponent suffix
                if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                    i += 1;
                    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
                        i += 1;
                    }
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text = &src[start..i];
                let n: f64 = text.parse().map_err(|_| ParseError::InvalidNumber(start))?;
                tokens.push((Tok::Num(n), start));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push((Tok::Ident(src[start..i].to_string()), start));
            }
            '"' | '\'' => {
                let quote = bytes[i];
                let start = i;
                i += 1;
                let mut s = String::new();
                loop {
                    if i >= bytes.len() {
                        return Err(ParseError::UnterminatedString(start));
                    }
                    let b = bytes[i];
                    if b == quote {
                        i += 1;
                        break;
                    }
                    if b == b'\\' {
                        i += 1;
                        if i >= bytes.len() {
                            return Err(ParseError::UnterminatedString(start));
                        }
                        let esc = bytes[i] as char;
                        match esc {
                            'n' => s.push('\n'),
                            't' => s.push('\t'),
                            'r' => s.push('\r'),
                            '\\' => s.push('\\'),
                            '"' => s.push('"'),
                            '\'' => s.push('\''),
                            other => return Err(ParseError::UnexpectedChar(other, i)),
                        }
                        i += 1;
                    } else {
                        // Consume one full UTF-8 scalar
                        let ch_str = &src[i..];
                        let ch = ch_str.chars().next().ok_or(ParseError::UnexpectedEof)?;
                        s.push(ch);
                        i += ch.len_utf8();
                    }
                }
                tokens.push((Tok::Str(s), start));
            }
            _ => {
                let start = i;
                if !c.is_ascii() {
                    let ch = src[i..].chars().next().unwrap_or('\u{fffd}');
                    return Err(ParseError::UnexpectedChar(ch, start));
                }
                let two = src.get(i..i + 2).unwrap_or("");
                let punct: &'static str = match two {
                    "==" => "==",
                    "!=" => "!=",
                    "<=" => "<=",
                    ">=" => ">=",
                    "&&" => "&&",
                    "||" => "||",
                    _ => match c {
                        '+' => "+",
                        '-' => "-",
                        '*' => "*",
                        '/' => "/",
                        '%' => "%",
                        '<' => "<",
                        '>' => ">",
                        '!' => "!",
                        '?' => "?",
                        ':' => ":",
                        '.' => ".",
                        ',' => ",",
                        '(' => "(",
                        ')' => ")",
                        '[' => "[",
                        ']' => "]",
                        '{' => "{",
                        '}' => "}",
                        other => return Err(ParseError::UnexpectedChar(other, start)),
                    },
                };
                i += punct.len();
                tokens.push((Tok::Punct(punct), start));
            }
        }
    }

    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(tokens)
}

// ── Parser ───────────────────────────────────────────────────

const MAX_PARSE_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, o)| *o)
            .unwrap_or_else(|| self.tokens.last().map(|(_, o)| *o).unwrap_or(0))
    }

    fn next(&mut self) -> Result<Tok, ParseError> {
        let tok = self
            .tokens
            .get(self.pos)
            .map(|(t, _)| t.clone())
            .ok_or(ParseError::UnexpectedEof)?;
        self.pos += 1;
        Ok(tok)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if let Some(Tok::Punct(q)) = self.peek() {
            if *q == p {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_punct(&mut self, p: &'static str) -> Result<(), ParseError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            match self.peek() {
                Some(tok) => Err(ParseError::UnexpectedToken(tok.describe(), self.offset())),
                None => Err(ParseError::UnexpectedEof),
            }
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_PARSE_DEPTH {
            return Err(ParseError::TooDeep);
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let cond = self.parse_or()?;
        let out = if self.eat_punct("?") {
            let then = self.parse_expr()?;
            self.expect_punct(":")?;
            let other = self.parse_expr()?;
            Expr::Ternary(Box::new(cond), Box::new(then), Box::new(other))
        } else {
            cond
        };
        self.leave();
        Ok(out)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.eat_punct("||") {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_equality()?;
        while self.eat_punct("&&") {
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = if self.eat_punct("==") {
                BinOp::Eq
            } else if self.eat_punct("!=") {
                BinOp::Ne
            } else {
                break;
            };
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = if self.eat_punct("<=") {
                BinOp::Le
            } else if self.eat_punct(">=") {
                BinOp::Ge
            } else if self.eat_punct("<") {
                BinOp::Lt
            } else if self.eat_punct(">") {
                BinOp::Gt
            } else {
                break;
            };
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = if self.eat_punct("+") {
                BinOp::Add
            } else if self.eat_punct("-") {
                BinOp::Sub
            } else {
                break;
            };
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = if self.eat_punct("*") {
                BinOp::Mul
            } else if self.eat_punct("/") {
                BinOp::Div
            } else if self.eat_punct("%") {
                BinOp::Mod
            } else {
                break;
            };
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let out = if self.eat_punct("!") {
            Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?))
        } else if self.eat_punct("-") {
            Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?))
        } else {
            self.parse_postfix()?
        };
        self.leave();
        Ok(out)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_punct(".") {
                let off = self.offset();
                match self.next()? {
                    Tok::Ident(name) => expr = Expr::Field(Box::new(expr), name),
                    tok => return Err(ParseError::UnexpectedToken(tok.describe(), off)),
                }
            } else if self.eat_punct("[") {
                let idx = self.parse_expr()?;
                self.expect_punct("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(idx));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let off = self.offset();
        let out = match self.next()? {
            Tok::Num(n) => Expr::Num(n),
            Tok::Str(s) => Expr::Str(s),
            Tok::Ident(name) => match name.as_str() {
                "true" => Expr::Bool(true),
                "false" => Expr::Bool(false),
                "null" => Expr::Null,
                _ => {
                    if self.eat_punct("(") {
                        let mut args = Vec::new();
                        if !self.eat_punct(")") {
                            loop {
                                args.push(self.parse_expr()?);
                                if self.eat_punct(")") {
                                    break;
                                }
                                self.expect_punct(",")?;
                            }
                        }
                        Expr::Call(name, args)
                    } else {
                        Expr::Var(name)
                    }
                }
            },
            Tok::Punct("(") => {
                let inner = self.parse_expr()?;
                self.expect_punct(")")?;
                inner
            }
            Tok::Punct("[") => {
                let mut items = Vec::new();
                if !self.eat_punct("]") {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.eat_punct("]") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Expr::Array(items)
            }
            Tok::Punct("{") => {
                let mut fields = Vec::new();
                if !self.eat_punct("}") {
                    loop {
                        let key_off = self.offset();
                        let key = match self.next()? {
                            Tok::Ident(k) => k,
                            Tok::Str(k) => k,
                            tok => {
                                return Err(ParseError::UnexpectedToken(tok.describe(), key_off));
                            }
                        };
                        self.expect_punct(":")?;
                        let value = self.parse_expr()?;
                        fields.push((key, value));
                        if self.eat_punct("}") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Expr::Object(fields)
            }
            tok => return Err(ParseError::UnexpectedToken(tok.describe(), off)),
        };
        self.leave();
        Ok(out)
    }
}
