use crate::symbolic::expr::{Expr, UnaryFn};
use std::fmt;

/// Parse failure with the byte offset of the offending token, when known.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub position: Option<usize>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(p) => write!(f, "{} at position {}", self.message, p),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(Tok, usize)>, ParseError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        let start = i;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '+' => {
                tokens.push((Tok::Plus, start));
                i += 1;
            }
            '-' => {
                tokens.push((Tok::Minus, start));
                i += 1;
            }
            '*' => {
                tokens.push((Tok::Star, start));
                i += 1;
            }
            '/' => {
                tokens.push((Tok::Slash, start));
                i += 1;
            }
            '^' => {
                tokens.push((Tok::Caret, start));
                i += 1;
            }
            '(' => {
                tokens.push((Tok::LParen, start));
                i += 1;
            }
            ')' => {
                tokens.push((Tok::RParen, start));
                i += 1;
            }
            ',' => {
                tokens.push((Tok::Comma, start));
                i += 1;
            }
            '0'..='9' | '.' => {
                let mut end = i;
                while end < bytes.len() && matches!(bytes[end] as char, '0'..='9' | '.') {
                    end += 1;
                }
                // exponent suffix, e.g. 1.5e-3
                if end < bytes.len() && matches!(bytes[end] as char, 'e' | 'E') {
                    let mut exp_end = end + 1;
                    if exp_end < bytes.len() && matches!(bytes[exp_end] as char, '+' | '-') {
                        exp_end += 1;
                    }
                    let digits_start = exp_end;
                    while exp_end < bytes.len() && (bytes[exp_end] as char).is_ascii_digit() {
                        exp_end += 1;
                    }
                    if exp_end > digits_start {
                        end = exp_end;
                    }
                }
                let text = &input[i..end];
                let value: f64 = text.parse().map_err(|_| ParseError {
                    message: format!("invalid number '{text}'"),
                    position: Some(start),
                })?;
                tokens.push((Tok::Num(value), start));
                i = end;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = i;
                while end < bytes.len()
                    && ((bytes[end] as char).is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                tokens.push((Tok::Ident(input[i..end].to_string()), start));
                i = end;
            }
            other => {
                return Err(ParseError {
                    message: format!("unexpected character '{other}'"),
                    position: Some(start),
                });
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [(Tok, usize)],
    pos: usize,
    input_len: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next_pos(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|&(_, p)| p)
            .unwrap_or(self.input_len)
    }

    fn advance(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        t
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), ParseError> {
        if self.peek() == Some(&tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ParseError {
                message: format!("expected {what}"),
                position: Some(self.next_pos()),
            })
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.term()?;
        loop {
            match self.peek() {
                Some(Tok::Plus) => {
                    self.pos += 1;
                    lhs = Expr::Add(Box::new(lhs), Box::new(self.term()?));
                }
                Some(Tok::Minus) => {
                    self.pos += 1;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(self.term()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            match self.peek() {
                Some(Tok::Star) => {
                    self.pos += 1;
                    lhs = Expr::Mul(Box::new(lhs), Box::new(self.unary()?));
                }
                Some(Tok::Slash) => {
                    self.pos += 1;
                    lhs = Expr::Div(Box::new(lhs), Box::new(self.unary()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    // unary := '-' unary | power
    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Tok::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.power()
    }

    // power := primary ('^' unary)?   right-associative
    fn power(&mut self) -> Result<Expr, ParseError> {
        let base = self.primary()?;
        if self.peek() == Some(&Tok::Caret) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Pow(Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let pos = self.next_pos();
        match self.advance() {
            Some(Tok::Num(v)) => Ok(Expr::Num(v)),
            Some(Tok::Ident(name)) => {
                if self.peek() == Some(&Tok::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Tok::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if self.peek() == Some(&Tok::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Tok::RParen, "')'")?;
                    // two-argument pow(a, b) is sugar for a ^ b
                    if name == "pow" && args.len() == 2 {
                        let b = args.pop().unwrap();
                        let a = args.pop().unwrap();
                        return Ok(Expr::Pow(Box::new(a), Box::new(b)));
                    }
                    if args.len() == 1 {
                        if let Some(f) = UnaryFn::from_name(&name) {
                            return Ok(Expr::Unary(f, Box::new(args.pop().unwrap())));
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(Tok::LParen) => {
                let inner = self.expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            _ => Err(ParseError {
                message: "expected a number, symbol or '('".to_string(),
                position: Some(pos),
            }),
        }
    }
}

/// Parse an arithmetic expression string into an [`Expr`] tree. Function
/// calls stay unresolved (`Expr::Call`) except for the builtins.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        input_len: input.len(),
    };
    let expr = parser.expr()?;
    if parser.pos != tokens.len() {
        return Err(ParseError {
            message: "unexpected trailing input".to_string(),
            position: Some(parser.next_pos()),
        });
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn eval(input: &str, pairs: &[(&str, f64)]) -> f64 {
        let vars: HashMap<String, f64> =
            pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        parse(input).unwrap().eval_map(&vars).unwrap()
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval("1+2*3", &[]), 7.0);
        assert_eq!(eval("(1+2)*3", &[]), 9.0);
        assert_eq!(eval("2^3^2", &[]), 512.0); // right-associative
        assert_eq!(eval("-2^2", &[]), -4.0); // unary minus binds looser
        assert_eq!(eval("6/3/2", &[]), 1.0);
        assert_eq!(eval("2e-2 + 1", &[]), 1.02);
    }

    #[test]
    fn builtins_and_pow_sugar() {
        assert!((eval("cos(0)", &[]) - 1.0).abs() < 1e-15);
        assert!((eval("pow(2, 10)", &[]) - 1024.0).abs() < 1e-12);
        assert!((eval("ln(exp(2))", &[]) - 2.0).abs() < 1e-12);
        let x = 1.345;
        assert!((eval("x^2+cos(x)", &[("x", x)]) - (x * x + x.cos())).abs() < 1e-15);
    }

    #[test]
    fn errors_carry_positions() {
        let err = parse("1 + $").unwrap_err();
        assert_eq!(err.position, Some(4));
        let err = parse("2 *").unwrap_err();
        assert!(err.message.contains("expected"));
        let err = parse("1 2").unwrap_err();
        assert!(err.message.contains("trailing"));
    }

    #[test]
    fn unknown_calls_stay_unresolved() {
        let e = parse("f(x, 2) + g()").unwrap();
        let mut names = std::collections::BTreeSet::new();
        e.call_names(&mut names);
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["f", "g"]);
    }
}
