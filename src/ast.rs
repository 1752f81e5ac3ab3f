//! Expression parsing.
//!
//! Turns text such as `(2 + 3) * 4` into an [`Expr`] tree. Precedence is the
//! usual one: `*` and `/` bind tighter than `+` and `-`, all operators are
//! left-associative, and a leading `-` negates the following factor.

use std::mem;

use crate::error::ParseError;
use crate::task::Operator;

/// Maximum parenthesis / unary nesting accepted by the parser.
pub const MAX_DEPTH: usize = 256;

/// A parsed arithmetic expression
///
/// Long operator chains form deep left spines, so dropping, comparing and
/// counting walk the tree with an explicit stack.
#[derive(Debug)]
pub enum Expr {
    Number(f64),
    Binary {
        op: Operator,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn binary(op: Operator, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Number of operator nodes in the tree.
    pub fn operation_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            if let Expr::Binary { lhs, rhs, .. } = expr {
                count += 1;
                stack.push(&**lhs);
                stack.push(&**rhs);
            }
        }
        count
    }

    /// Detaches both children, leaving literal placeholders behind.
    fn take_children(&mut self, into: &mut Vec<Expr>) {
        if let Expr::Binary { lhs, rhs, .. } = self {
            into.push(mem::replace(lhs.as_mut(), Expr::Number(0.0)));
            into.push(mem::replace(rhs.as_mut(), Expr::Number(0.0)));
        }
    }
}

impl Drop for Expr {
    fn drop(&mut self) {
        let mut detached = Vec::new();
        self.take_children(&mut detached);
        while let Some(mut expr) = detached.pop() {
            expr.take_children(&mut detached);
        }
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        let mut pairs = vec![(self, other)];
        while let Some(pair) = pairs.pop() {
            match pair {
                (Expr::Number(a), Expr::Number(b)) => {
                    if a != b {
                        return false;
                    }
                }
                (
                    Expr::Binary { op, lhs, rhs },
                    Expr::Binary {
                        op: other_op,
                        lhs: other_lhs,
                        rhs: other_rhs,
                    },
                ) => {
                    if op != other_op {
                        return false;
                    }
                    pairs.push((&**lhs, &**other_lhs));
                    pairs.push((&**rhs, &**other_rhs));
                }
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Op(Operator),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        if ch.is_ascii_digit() || ch == '.' {
            let mut end = pos;
            while let Some(&(i, c)) = chars.peek() {
                if c.is_ascii_digit() || c == '.' {
                    end = i + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let literal = &input[pos..end];
            if literal.matches('.').count() > 1 || literal == "." {
                return Err(ParseError::InvalidNumber(literal.to_string()));
            }
            let value = literal
                .parse::<f64>()
                .map_err(|_| ParseError::InvalidNumber(literal.to_string()))?;
            tokens.push((pos, Token::Number(value)));
            continue;
        }

        let token = match ch {
            '(' => Token::LParen,
            ')' => Token::RParen,
            _ => match Operator::from_symbol(ch) {
                Some(op) => Token::Op(op),
                None => return Err(ParseError::UnexpectedChar { ch, pos }),
            },
        };
        tokens.push((pos, token));
        chars.next();
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.cursor).map(|(_, t)| *t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.cursor).map(|(p, _)| *p).unwrap_or(0)
    }

    fn descend(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ (Operator::Add | Operator::Sub))) = self.peek() {
            self.cursor += 1;
            let rhs = self.term()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.factor()?;
        while let Some(Token::Op(op @ (Operator::Mul | Operator::Div))) = self.peek() {
            self.cursor += 1;
            let rhs = self.factor()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Number(value)) => {
                self.cursor += 1;
                Ok(Expr::Number(value))
            }
            Some(Token::Op(Operator::Sub)) => {
                self.cursor += 1;
                self.descend()?;
                let inner = self.factor()?;
                self.depth -= 1;
                Ok(match inner {
                    Expr::Number(value) => Expr::Number(-value),
                    other => Expr::binary(Operator::Sub, Expr::Number(0.0), other),
                })
            }
            Some(Token::LParen) => {
                self.cursor += 1;
                self.descend()?;
                let inner = self.expr()?;
                self.depth -= 1;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.cursor += 1;
                        Ok(inner)
                    }
                    None => Err(ParseError::UnbalancedParens),
                    Some(_) => Err(ParseError::UnexpectedToken {
                        pos: self.position(),
                    }),
                }
            }
            Some(Token::RParen) | Some(Token::Op(_)) => Err(ParseError::UnexpectedToken {
                pos: self.position(),
            }),
            None => Err(ParseError::UnexpectedEnd),
        }
    }
}

/// Parses an arithmetic expression.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut parser = Parser {
        tokens,
        cursor: 0,
        depth: 0,
    };
    let expr = parser.expr()?;

    match parser.peek() {
        None => Ok(expr),
        Some(Token::RParen) => Err(ParseError::UnbalancedParens),
        Some(_) => Err(ParseError::UnexpectedToken {
            pos: parser.position(),
        }),
    }
}
