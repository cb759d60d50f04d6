//! Breakpoint conditions.
//!
//! Conditions compare registers against constants and may be combined with
//! `&&` and `||` (`&&` binds tighter), e.g. `A == 0x10 && HL >= $8000`.
//! Numbers are decimal, `0x`/`$` prefixed hex, or `h` suffixed hex.

use crate::registers::{RegisterSet, Z80Register};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{digit1, hex_digit1, multispace0};
use nom::combinator::{all_consuming, map, map_res};
use nom::multi::separated_list1;
use nom::sequence::{delimited, preceded, terminated};
use nom::{IResult, Parser};
use std::fmt;
use thiserror::Error;

/// A condition that does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{text}': {reason}")]
pub struct ConditionError {
    pub text: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparison {
    register: Z80Register,
    op: Op,
    value: u16,
}

/// A parsed breakpoint condition in disjunctive form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    source: String,
    any_of: Vec<Vec<Comparison>>,
}

impl Condition {
    pub fn parse(text: &str) -> Result<Self, ConditionError> {
        let (_, any_of) = all_consuming(delimited(multispace0, or_expr, multispace0))
            .parse(text)
            .map_err(|e| ConditionError { text: text.to_string(), reason: e.to_string() })?;
        Ok(Self { source: text.trim().to_string(), any_of })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, regs: &RegisterSet) -> bool {
        self.any_of.iter().any(|all_of| {
            all_of.iter().all(|cmp| {
                let lhs = regs.get(cmp.register);
                match cmp.op {
                    Op::Eq => lhs == cmp.value,
                    Op::Ne => lhs != cmp.value,
                    Op::Le => lhs <= cmp.value,
                    Op::Ge => lhs >= cmp.value,
                    Op::Lt => lhs < cmp.value,
                    Op::Gt => lhs > cmp.value,
                }
            })
        })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn ws<'a, O>(
    inner: impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>,
) -> impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>> {
    delimited(multispace0, inner, multispace0)
}

fn register(input: &str) -> IResult<&str, Z80Register> {
    map_res(take_while1(|c: char| c.is_ascii_alphanumeric() || c == '\''), str::parse).parse(input)
}

fn op(input: &str) -> IResult<&str, Op> {
    alt((
        map(tag("=="), |_| Op::Eq),
        map(tag("!="), |_| Op::Ne),
        map(tag("<="), |_| Op::Le),
        map(tag(">="), |_| Op::Ge),
        map(tag("<"), |_| Op::Lt),
        map(tag(">"), |_| Op::Gt),
    ))
    .parse(input)
}

fn number(input: &str) -> IResult<&str, u16> {
    alt((
        map_res(preceded(alt((tag("0x"), tag("0X"), tag("$"))), hex_digit1), |s| {
            u16::from_str_radix(s, 16)
        }),
        map_res(terminated(hex_digit1, alt((tag("h"), tag("H")))), |s| u16::from_str_radix(s, 16)),
        map_res(digit1, str::parse::<u16>),
    ))
    .parse(input)
}

fn comparison(input: &str) -> IResult<&str, Comparison> {
    let (input, register) = ws(register).parse(input)?;
    let (input, op) = ws(op).parse(input)?;
    let (input, value) = ws(number).parse(input)?;
    Ok((input, Comparison { register, op, value }))
}

fn and_expr(input: &str) -> IResult<&str, Vec<Comparison>> {
    separated_list1(tag("&&"), comparison).parse(input)
}

fn or_expr(input: &str) -> IResult<&str, Vec<Vec<Comparison>>> {
    separated_list1(tag("||"), and_expr).parse(input)
}
