//! Computation sandbox for deterministic numeric scripts
//!
//! Quant computations run through a restricted expression language instead
//! of arbitrary code: numeric literals, bound identifiers, arithmetic, and
//! an allow-listed set of statistical functions. No network, no filesystem,
//! no other names. Evaluation is bounded by a step budget, a series-size
//! ceiling, and a wall-clock timeout; every violation surfaces as
//! `CodeError`, never as a crash.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const MAX_SCRIPT_LEN: usize = 4096;
const MAX_STEPS: u64 = 10_000;
const MAX_SERIES_LEN: usize = 100_000;
const MAX_DEPTH: usize = 64;

/// Input binding for a script: a scalar or a numeric series.
#[derive(Debug, Clone)]
pub enum SandboxValue {
    Num(f64),
    Series(Vec<f64>),
}

pub type SandboxData = HashMap<String, SandboxValue>;

/// Typed result of a sandbox execution.
#[derive(Debug, Clone)]
pub enum SandboxOutcome {
    Success { final_output: Value },
    CodeError { message: String },
}

impl SandboxOutcome {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SandboxOutcome::Success { final_output } => final_output.as_f64(),
            SandboxOutcome::CodeError { .. } => None,
        }
    }
}

/// Executes short numeric scripts under fixed budgets.
pub struct Sandbox {
    timeout: Duration,
}

impl Sandbox {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a script against the provided data. Timeout is reported as
    /// `CodeError`, the same as any in-script failure.
    pub async fn execute(&self, script: &str, data: &SandboxData) -> SandboxOutcome {
        let script = script.to_string();
        let data = data.clone();

        let handle = tokio::task::spawn_blocking(move || evaluate_script(&script, &data));

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(Ok(output))) => SandboxOutcome::Success {
                final_output: output,
            },
            Ok(Ok(Err(message))) => {
                debug!(%message, "Sandbox script failed");
                SandboxOutcome::CodeError { message }
            }
            Ok(Err(join_err)) => SandboxOutcome::CodeError {
                message: format!("sandbox task panicked: {}", join_err),
            },
            Err(_) => SandboxOutcome::CodeError {
                message: format!("script exceeded the {:?} wall-clock budget", self.timeout),
            },
        }
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

/// Synchronous parse + evaluate. Exposed for tests; production callers go
/// through `Sandbox::execute`.
pub fn evaluate_script(script: &str, data: &SandboxData) -> Result<Value, String> {
    if script.len() > MAX_SCRIPT_LEN {
        return Err(format!(
            "script length {} exceeds limit {}",
            script.len(),
            MAX_SCRIPT_LEN
        ));
    }
    for value in data.values() {
        if let SandboxValue::Series(s) = value {
            if s.len() > MAX_SERIES_LEN {
                return Err(format!(
                    "input series length {} exceeds limit {}",
                    s.len(),
                    MAX_SERIES_LEN
                ));
            }
        }
    }

    let tokens = tokenize(script)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
    };
    let expr = parser.parse_expr(0)?;
    parser.expect_end()?;

    let mut ctx = EvalCtx { data, steps: 0 };
    let result = ctx.eval(&expr)?;

    match result {
        EvalValue::Num(n) => {
            if !n.is_finite() {
                return Err("non-finite result".to_string());
            }
            serde_json::Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(|| "result not representable as JSON".to_string())
        }
        EvalValue::Series(s) => {
            let nums: Option<Vec<Value>> = s
                .iter()
                .map(|v| serde_json::Number::from_f64(*v).map(Value::Number))
                .collect();
            nums.map(Value::Array)
                .ok_or_else(|| "non-finite value in result series".to_string())
        }
    }
}

//
// ================= Tokens =================
//

#[derive(Debug, Clone, PartialEq)]
enum Token {
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

fn tokenize(script: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = script.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number literal '{}'", text))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

//
// ================= Parser =================
//

#[derive(Debug, Clone)]
enum Expr {
    Num(f64),
    Ident(String),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn expect_end(&self) -> Result<(), String> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err("trailing tokens after expression".to_string())
        }
    }

    fn parse_expr(&mut self, depth: usize) -> Result<Expr, String> {
        if depth > MAX_DEPTH {
            return Err("expression nesting too deep".to_string());
        }
        let mut lhs = self.parse_term(depth + 1)?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.bump();
                    let rhs = self.parse_term(depth + 1)?;
                    lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Minus) => {
                    self.bump();
                    let rhs = self.parse_term(depth + 1)?;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(rhs));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn parse_term(&mut self, depth: usize) -> Result<Expr, String> {
        if depth > MAX_DEPTH {
            return Err("expression nesting too deep".to_string());
        }
        let mut lhs = self.parse_unary(depth + 1)?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.bump();
                    let rhs = self.parse_unary(depth + 1)?;
                    lhs = Expr::Mul(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Slash) => {
                    self.bump();
                    let rhs = self.parse_unary(depth + 1)?;
                    lhs = Expr::Div(Box::new(lhs), Box::new(rhs));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn parse_unary(&mut self, depth: usize) -> Result<Expr, String> {
        if depth > MAX_DEPTH {
            return Err("expression nesting too deep".to_string());
        }
        if let Some(Token::Minus) = self.peek() {
            self.bump();
            let inner = self.parse_unary(depth + 1)?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        let base = self.parse_primary(depth + 1)?;
        if let Some(Token::Caret) = self.peek() {
            self.bump();
            let exp = self.parse_unary(depth + 1)?;
            return Ok(Expr::Pow(Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self, depth: usize) -> Result<Expr, String> {
        match self.bump().cloned() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.bump();
                    let mut args = Vec::new();
                    if let Some(Token::RParen) = self.peek() {
                        self.bump();
                        return Ok(Expr::Call(name, args));
                    }
                    loop {
                        args.push(self.parse_expr(depth + 1)?);
                        match self.bump() {
                            Some(Token::Comma) => continue,
                            Some(Token::RParen) => break,
                            _ => return Err("expected ',' or ')' in call".to_string()),
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr(depth + 1)?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

//
// ================= Evaluator =================
//

#[derive(Debug, Clone)]
enum EvalValue {
    Num(f64),
    Series(Vec<f64>),
}

impl EvalValue {
    fn num(self) -> Result<f64, String> {
        match self {
            EvalValue::Num(n) => Ok(n),
            EvalValue::Series(_) => Err("expected a scalar, got a series".to_string()),
        }
    }

    fn series(self) -> Result<Vec<f64>, String> {
        match self {
            EvalValue::Series(s) => Ok(s),
            EvalValue::Num(_) => Err("expected a series, got a scalar".to_string()),
        }
    }
}

struct EvalCtx<'a> {
    data: &'a SandboxData,
    steps: u64,
}

impl<'a> EvalCtx<'a> {
    fn tick(&mut self) -> Result<(), String> {
        self.steps += 1;
        if self.steps > MAX_STEPS {
            Err(format!("evaluation exceeded {} steps", MAX_STEPS))
        } else {
            Ok(())
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<EvalValue, String> {
        self.tick()?;
        match expr {
            Expr::Num(n) => Ok(EvalValue::Num(*n)),
            Expr::Ident(name) => match self.data.get(name) {
                Some(SandboxValue::Num(n)) => Ok(EvalValue::Num(*n)),
                Some(SandboxValue::Series(s)) => Ok(EvalValue::Series(s.clone())),
                None => Err(format!("unknown identifier '{}'", name)),
            },
            Expr::Neg(inner) => Ok(EvalValue::Num(-self.eval(inner)?.num()?)),
            Expr::Add(a, b) => self.arith(a, b, |x, y| Ok(x + y)),
            Expr::Sub(a, b) => self.arith(a, b, |x, y| Ok(x - y)),
            Expr::Mul(a, b) => self.arith(a, b, |x, y| Ok(x * y)),
            Expr::Div(a, b) => self.arith(a, b, |x, y| {
                if y == 0.0 {
                    Err("division by zero".to_string())
                } else {
                    Ok(x / y)
                }
            }),
            Expr::Pow(a, b) => self.arith(a, b, |x, y| Ok(x.powf(y))),
            Expr::Call(name, args) => self.call(name, args),
        }
    }

    fn arith(
        &mut self,
        a: &Expr,
        b: &Expr,
        op: fn(f64, f64) -> Result<f64, String>,
    ) -> Result<EvalValue, String> {
        let x = self.eval(a)?.num()?;
        let y = self.eval(b)?.num()?;
        let out = op(x, y)?;
        if out.is_finite() {
            Ok(EvalValue::Num(out))
        } else {
            Err("non-finite intermediate result".to_string())
        }
    }

    fn call(&mut self, name: &str, args: &[Expr]) -> Result<EvalValue, String> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        let mut values = values.into_iter();
        let mut next = |what: &str| {
            values
                .next()
                .ok_or_else(|| format!("{}: missing argument", what))
        };

        let expect_arity = |want: usize| {
            if args.len() != want {
                Err(format!("{}: expected {} argument(s), got {}", name, want, args.len()))
            } else {
                Ok(())
            }
        };

        let out = match name {
            "mean" => {
                expect_arity(1)?;
                EvalValue::Num(mean(&next(name)?.series()?)?)
            }
            "stddev" => {
                expect_arity(1)?;
                EvalValue::Num(stddev(&next(name)?.series()?)?)
            }
            "min" => {
                expect_arity(1)?;
                let s = non_empty(next(name)?.series()?)?;
                EvalValue::Num(s.iter().cloned().fold(f64::INFINITY, f64::min))
            }
            "max" => {
                expect_arity(1)?;
                let s = non_empty(next(name)?.series()?)?;
                EvalValue::Num(s.iter().cloned().fold(f64::NEG_INFINITY, f64::max))
            }
            "sum" => {
                expect_arity(1)?;
                EvalValue::Num(next(name)?.series()?.iter().sum())
            }
            "len" => {
                expect_arity(1)?;
                EvalValue::Num(next(name)?.series()?.len() as f64)
            }
            "first" => {
                expect_arity(1)?;
                let s = non_empty(next(name)?.series()?)?;
                EvalValue::Num(s[0])
            }
            "last" => {
                expect_arity(1)?;
                let s = non_empty(next(name)?.series()?)?;
                EvalValue::Num(s[s.len() - 1])
            }
            "abs" => {
                expect_arity(1)?;
                EvalValue::Num(next(name)?.num()?.abs())
            }
            "sqrt" => {
                expect_arity(1)?;
                let x = next(name)?.num()?;
                if x < 0.0 {
                    return Err("sqrt of negative number".to_string());
                }
                EvalValue::Num(x.sqrt())
            }
            "ln" => {
                expect_arity(1)?;
                let x = next(name)?.num()?;
                if x <= 0.0 {
                    return Err("ln of non-positive number".to_string());
                }
                EvalValue::Num(x.ln())
            }
            "round2" => {
                expect_arity(1)?;
                let x = next(name)?.num()?;
                EvalValue::Num((x * 100.0).round() / 100.0)
            }
            "pct_change" => {
                expect_arity(2)?;
                let s = next(name)?.series()?;
                let n = next(name)?.num()? as usize;
                EvalValue::Num(pct_change(&s, n)?)
            }
            "annualized_vol" => {
                expect_arity(1)?;
                EvalValue::Num(annualized_vol(&next(name)?.series()?)?)
            }
            "sma" => {
                expect_arity(2)?;
                let s = next(name)?.series()?;
                let n = next(name)?.num()? as usize;
                EvalValue::Num(sma(&s, n)?)
            }
            "rsi" => {
                expect_arity(2)?;
                let s = next(name)?.series()?;
                let n = next(name)?.num()? as usize;
                EvalValue::Num(rsi(&s, n)?)
            }
            "max_drawdown" => {
                expect_arity(1)?;
                EvalValue::Num(max_drawdown(&next(name)?.series()?)?)
            }
            other => return Err(format!("unknown function '{}'", other)),
        };

        if let EvalValue::Num(n) = &out {
            if !n.is_finite() {
                return Err(format!("{}: non-finite result", name));
            }
        }
        Ok(out)
    }
}

//
// ================= Builtins =================
//

fn non_empty(s: Vec<f64>) -> Result<Vec<f64>, String> {
    if s.is_empty() {
        Err("empty series".to_string())
    } else {
        Ok(s)
    }
}

fn mean(s: &[f64]) -> Result<f64, String> {
    if s.is_empty() {
        return Err("mean of empty series".to_string());
    }
    Ok(s.iter().sum::<f64>() / s.len() as f64)
}

fn stddev(s: &[f64]) -> Result<f64, String> {
    if s.len() < 2 {
        return Err("stddev needs at least 2 points".to_string());
    }
    let m = mean(s)?;
    let var = s.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (s.len() - 1) as f64;
    Ok(var.sqrt())
}

/// Percent change between the last point and the point `n` back.
fn pct_change(s: &[f64], n: usize) -> Result<f64, String> {
    if s.is_empty() {
        return Err("pct_change on empty series".to_string());
    }
    if n == 0 || n >= s.len() {
        return Err(format!(
            "pct_change window {} out of range for {} points",
            n,
            s.len()
        ));
    }
    let base = s[s.len() - 1 - n];
    if base == 0.0 {
        return Err("division by zero".to_string());
    }
    Ok((s[s.len() - 1] / base - 1.0) * 100.0)
}

/// Annualized volatility of daily log returns, in percent.
fn annualized_vol(s: &[f64]) -> Result<f64, String> {
    if s.len() < 3 {
        return Err("annualized_vol needs at least 3 points".to_string());
    }
    let mut returns = Vec::with_capacity(s.len() - 1);
    for pair in s.windows(2) {
        if pair[0] <= 0.0 || pair[1] <= 0.0 {
            return Err("non-positive price in series".to_string());
        }
        returns.push((pair[1] / pair[0]).ln());
    }
    Ok(stddev(&returns)? * (252.0f64).sqrt() * 100.0)
}

fn sma(s: &[f64], n: usize) -> Result<f64, String> {
    if n == 0 || n > s.len() {
        return Err(format!("sma window {} out of range for {} points", n, s.len()));
    }
    mean(&s[s.len() - n..])
}

/// Wilder-free simple RSI over the last `n` deltas. Bounded to [0, 100].
fn rsi(s: &[f64], n: usize) -> Result<f64, String> {
    if n == 0 || n + 1 > s.len() {
        return Err(format!("rsi window {} out of range for {} points", n, s.len()));
    }
    let window = &s[s.len() - n - 1..];
    let mut gains = 0.0;
    let mut losses = 0.0;
    for pair in window.windows(2) {
        let delta = pair[1] - pair[0];
        if delta >= 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }
    if losses == 0.0 {
        return Ok(100.0);
    }
    let rs = (gains / n as f64) / (losses / n as f64);
    Ok(100.0 - 100.0 / (1.0 + rs))
}

/// Maximum peak-to-trough decline, as a positive percentage.
fn max_drawdown(s: &[f64]) -> Result<f64, String> {
    if s.len() < 2 {
        return Err("max_drawdown needs at least 2 points".to_string());
    }
    let mut peak = s[0];
    let mut worst = 0.0f64;
    for &x in s {
        if x > peak {
            peak = x;
        }
        if peak > 0.0 {
            let dd = (peak - x) / peak * 100.0;
            if dd > worst {
                worst = dd;
            }
        }
    }
    Ok(worst)
}
