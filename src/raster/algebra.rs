//! Minimal band-algebra evaluator for spectral indices.
//!
//! Supports:
//!   - Band references by name: `B8`, `NIR`, `swir16`
//!   - Numeric literals: `10000.`, `2.5`
//!   - Operators `+ - * /` with the usual precedence, unary minus, parentheses
//!
//! Expressions are evaluated per pixel over `f64`; any nodata input pixel
//! yields a nodata output pixel.

use std::collections::BTreeMap;

use ndarray::Array2;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f64),
    Band(String),
    Neg(Box<Expr>),
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

pub fn parse(input: &str) -> Result<Expr, String> {
    let mut parser = Parser { input: input.as_bytes(), pos: 0 };
    let expr = parser.expr()?;
    parser.skip_ws();
    if parser.pos != parser.input.len() {
        return Err(format!("unexpected input at offset {}", parser.pos));
    }
    Ok(expr)
}

/// Band names referenced by an expression, sorted and deduplicated.
pub fn band_refs(expr: &Expr) -> Vec<String> {
    let mut names = Vec::new();
    collect_bands(expr, &mut names);
    names.sort();
    names.dedup();
    names
}

fn collect_bands(expr: &Expr, names: &mut Vec<String>) {
    match expr {
        Expr::Band(name) => names.push(name.clone()),
        Expr::Neg(inner) => collect_bands(inner, names),
        Expr::Binary { lhs, rhs, .. } => {
            collect_bands(lhs, names);
            collect_bands(rhs, names);
        }
        Expr::Literal(_) => {}
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn skip_ws(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.input.get(self.pos).copied()
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.term()?;
        while let Some(c) = self.peek() {
            let op = match c {
                b'+' => BinOp::Add,
                b'-' => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.factor()?;
        while let Some(c) = self.peek() {
            let op = match c {
                b'*' => BinOp::Mul,
                b'/' => BinOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.factor()?)))
            }
            Some(b'(') => {
                self.pos += 1;
                let inner = self.expr()?;
                if self.peek() != Some(b')') {
                    return Err("expected closing parenthesis".to_string());
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.band(),
            Some(c) => Err(format!("unexpected character '{}'", c as char)),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn number(&mut self) -> Result<Expr, String> {
        let start = self.pos;
        while self.pos < self.input.len()
            && (self.input[self.pos].is_ascii_digit() || self.input[self.pos] == b'.')
        {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.input[start..self.pos]).expect("ascii digits");
        // A trailing dot (`10000.`) is a valid float literal.
        text.parse::<f64>()
            .map(Expr::Literal)
            .map_err(|_| format!("bad number literal '{text}'"))
    }

    fn band(&mut self) -> Result<Expr, String> {
        let start = self.pos;
        while self.pos < self.input.len()
            && (self.input[self.pos].is_ascii_alphanumeric() || self.input[self.pos] == b'_')
        {
            self.pos += 1;
        }
        let name = std::str::from_utf8(&self.input[start..self.pos]).expect("ascii ident");
        Ok(Expr::Band(name.to_string()))
    }
}

/// Evaluate `expr` over co-registered band arrays.
///
/// Nodata handling stays with the caller: feed NaN for nodata pixels and every
/// arithmetic result involving them stays NaN, to be written back as nodata.
pub fn evaluate(
    expr: &Expr,
    bands: &BTreeMap<String, Array2<f64>>,
    shape: (usize, usize),
) -> Result<Array2<f64>, String> {
    match expr {
        Expr::Literal(v) => Ok(Array2::from_elem(shape, *v)),
        Expr::Band(name) => {
            let band = bands
                .get(name)
                .ok_or_else(|| format!("expression references unknown band '{name}'"))?;
            if band.dim() != shape {
                return Err(format!("band '{name}' does not match the target grid"));
            }
            Ok(band.clone())
        }
        Expr::Neg(inner) => Ok(-evaluate(inner, bands, shape)?),
        Expr::Binary { op, lhs, rhs } => {
            let l = evaluate(lhs, bands, shape)?;
            let r = evaluate(rhs, bands, shape)?;
            Ok(match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
            })
        }
    }
}
