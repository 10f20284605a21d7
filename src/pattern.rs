// Shoal
// Copyright (C) 2021  Wesley Merkel
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Values, parameters and the parser that turns pattern expressions into values.
//!
//! Handler sends take [`Param`]s. A parameter is either a literal [`Value`] or a pattern
//! expression. Expressions are resolved through the environment's active [`Parser`] into a list of
//! values, and one element of that list is picked with [`reduce`] based on the runner's
//! iteration. This is how a single send like
//!
//! ```text
//! note: "60 64 67"
//! ```
//!
//! walks an arpeggio as the runner recurses.
//!
//! The default parser is [`ListParser`]. It understands a small word based notation:
//!
//! | word      | meaning                                                   |
//! |-----------|-----------------------------------------------------------|
//! | `60`      | the number 60                                             |
//! | `bd`      | the text `bd`, or the value of the session variable `bd`  |
//! | `a\|b\|c` | one of the alternatives, picked at random                 |
//! | `x:y`     | a random number between `x` and `y`                       |
//! | `w?30`    | `w` with a 30% chance, otherwise nothing (`?` means 50%)  |
//! | `w!3`     | `w` three times (at most [`MAX_REPEAT`])                  |
//! | `~` or `.`| a rest                                                    |
//!
//! Suffixes combine in the order range, chance, repeat: `1:8?75!2`.

use rand::{rngs::StdRng, Rng, SeedableRng};
use regex::Regex;
use rosc::OscType;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use thiserror::Error;

/// A resolved parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Number(number) => Some(number),
            Value::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Number(_) => None,
            Value::Text(text) => Some(text),
        }
    }

    /// Whether the value is one of the rest words `~` and `.`.
    pub fn is_rest(&self) -> bool {
        matches!(self.as_str(), Some("~") | Some("."))
    }

    /// Converts the value to an OSC argument. Whole numbers become integers.
    pub fn to_osc(&self) -> OscType {
        match self {
            Value::Number(number) if number.fract() == 0.0 && number.abs() <= f64::from(i32::MAX) => {
                OscType::Int(*number as i32)
            }
            Value::Number(number) => OscType::Float(*number as f32),
            Value::Text(text) => OscType::String(text.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(number) => write!(f, "{}", number),
            Value::Text(text) => f.write_str(text),
        }
    }
}

impl From<f64> for Value {
    fn from(number: f64) -> Value {
        Value::Number(number)
    }
}

impl From<i32> for Value {
    fn from(number: i32) -> Value {
        Value::Number(f64::from(number))
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Value {
        Value::Text(text.to_owned())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Value {
        Value::Text(text)
    }
}

/// A parameter of a handler send: either a literal value or a pattern expression.
///
/// Numbers convert to literals and strings convert to expressions:
///
/// ```
/// use shoal::pattern::{Param, Value};
///
/// assert_eq!(Param::Literal(Value::Number(60.0)), Param::from(60));
/// assert_eq!(Param::Expr("60 64 67".to_owned()), Param::from("60 64 67"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Literal(Value),
    Expr(String),
}

impl From<Value> for Param {
    fn from(value: Value) -> Param {
        Param::Literal(value)
    }
}

impl From<f64> for Param {
    fn from(number: f64) -> Param {
        Param::Literal(Value::Number(number))
    }
}

impl From<i32> for Param {
    fn from(number: i32) -> Param {
        Param::Literal(Value::from(number))
    }
}

impl From<u8> for Param {
    fn from(number: u8) -> Param {
        Param::Literal(Value::Number(f64::from(number)))
    }
}

impl From<&str> for Param {
    fn from(expr: &str) -> Param {
        Param::Expr(expr.to_owned())
    }
}

impl From<String> for Param {
    fn from(expr: String) -> Param {
        Param::Expr(expr)
    }
}

/// Shared session state that pattern expressions can refer to.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    scale: String,
    variables: HashMap<String, Value>,
}

impl Default for Session {
    fn default() -> Session {
        Session {
            scale: "major".to_owned(),
            variables: HashMap::new(),
        }
    }
}

impl Session {
    pub fn scale(&self) -> &str {
        &self.scale
    }

    pub fn set_scale(&mut self, scale: impl Into<String>) {
        self.scale = scale.into();
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Sets a variable, returning its previous value.
    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.variables.insert(name.into(), value.into())
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }
}

/// The error type returned by [`Parser::parse`].
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("empty pattern expression")]
    Empty,
    #[error("invalid pattern word {0:?}")]
    Token(String),
    #[error("expected a number in {0:?}")]
    NotANumber(String),
    #[error("repeat count in {0:?} exceeds {}", MAX_REPEAT)]
    Repeat(String),
    #[error("pattern parser panicked: {0}")]
    Panicked(String),
}

/// The largest count accepted by a `!N` suffix.
pub const MAX_REPEAT: usize = 1024;

/// Turns pattern expressions into lists of values.
///
/// The environment holds one active parser, replaced with
/// [`Environment::swap_parser`](crate::Environment::swap_parser).
pub trait Parser: Send + 'static {
    fn parse(&mut self, expr: &str, session: &Session) -> Result<Vec<Value>, ParseError>;
}

/// The default [`Parser`]. See the [module documentation](self) for the notation.
#[derive(Debug)]
pub struct ListParser {
    rng: StdRng,
    word: Regex,
}

impl Default for ListParser {
    fn default() -> ListParser {
        ListParser::with_rng(StdRng::from_os_rng())
    }
}

impl ListParser {
    pub fn new() -> ListParser {
        ListParser::default()
    }

    /// A parser whose random choices are reproducible.
    pub fn seeded(seed: u64) -> ListParser {
        ListParser::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> ListParser {
        let word = Regex::new(
            r"^(?P<token>[^?!:\s]+)(?::(?P<range>[-+]?\d+(?:\.\d+)?))?(?:\?(?P<chance>\d*))?(?:!(?P<repeat>\d+))?$",
        )
        .unwrap();
        ListParser { rng, word }
    }

    fn parse_word(
        &mut self,
        word: &str,
        session: &Session,
        values: &mut Vec<Value>,
    ) -> Result<(), ParseError> {
        let captures = self
            .word
            .captures(word)
            .ok_or_else(|| ParseError::Token(word.to_owned()))?;

        let alternatives: Vec<&str> = captures["token"].split('|').collect();
        if alternatives.iter().any(|alternative| alternative.is_empty()) {
            return Err(ParseError::Token(word.to_owned()));
        }
        let choice = alternatives[self.rng.random_range(0..alternatives.len())];
        let mut value = atom(choice, session);

        if let Some(range) = captures.name("range") {
            let low = value
                .as_f64()
                .ok_or_else(|| ParseError::NotANumber(word.to_owned()))?;
            let high: f64 = range
                .as_str()
                .parse()
                .map_err(|_| ParseError::NotANumber(word.to_owned()))?;
            value = Value::Number(
                self.between(low, high)
                    .ok_or_else(|| ParseError::NotANumber(word.to_owned()))?,
            );
        }

        if let Some(chance) = captures.name("chance") {
            let percent = match chance.as_str() {
                "" => 50,
                digits => digits
                    .parse::<u32>()
                    .map_err(|_| ParseError::Token(word.to_owned()))?,
            };
            if !self.rng.random_bool(f64::from(percent.min(100)) / 100.0) {
                return Ok(());
            }
        }

        let repeat = match captures.name("repeat") {
            Some(repeat) => repeat
                .as_str()
                .parse::<usize>()
                .map_err(|_| ParseError::Token(word.to_owned()))?,
            None => 1,
        };
        if repeat > MAX_REPEAT {
            return Err(ParseError::Repeat(word.to_owned()));
        }
        values.extend(std::iter::repeat(value).take(repeat));
        Ok(())
    }

    /// A random number in the range, or `None` if the range is not finite.
    fn between(&mut self, low: f64, high: f64) -> Option<f64> {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        if !(high - low).is_finite() {
            return None;
        }
        if low == high {
            return Some(low);
        }
        Some(if low.fract() == 0.0 && high.fract() == 0.0 {
            self.rng.random_range(low as i64..=high as i64) as f64
        } else {
            self.rng.random_range(low..high)
        })
    }
}

impl Parser for ListParser {
    fn parse(&mut self, expr: &str, session: &Session) -> Result<Vec<Value>, ParseError> {
        let mut values = Vec::new();
        let mut words = 0;
        for word in expr.split_whitespace() {
            words += 1;
            self.parse_word(word, session, &mut values)?;
        }
        if words == 0 {
            return Err(ParseError::Empty);
        }
        Ok(values)
    }
}

fn atom(token: &str, session: &Session) -> Value {
    if let Some(value) = session.variable(token) {
        return value.clone();
    }
    match token.parse::<f64>() {
        Ok(number) if number.is_finite() => Value::Number(number),
        _ => Value::Text(token.to_owned()),
    }
}

/// Resolves a parameter into its list of values.
pub fn resolve(
    parser: &mut dyn Parser,
    param: &Param,
    session: &Session,
) -> Result<Vec<Value>, ParseError> {
    match param {
        Param::Literal(value) => Ok(vec![value.clone()]),
        Param::Expr(expr) => parser.parse(expr, session),
    }
}

/// Picks the element at `floor(iterator / divisor * rate)`, wrapping around the list.
///
/// Returns `None` for an empty list, which callers treat as a rest. A zero divisor counts as one.
///
/// # Examples
///
/// ```
/// use shoal::pattern::{reduce, Value};
///
/// let values: Vec<Value> = vec![60.into(), 64.into(), 67.into()];
/// assert_eq!(Some(&Value::Number(64.0)), reduce(&values, 4.0, 1.0, 1.0));
/// assert_eq!(Some(&Value::Number(64.0)), reduce(&values, 2.0, 2.0, 1.0));
/// assert_eq!(Some(&Value::Number(67.0)), reduce(&values, 1.0, 1.0, 2.0));
/// ```
pub fn reduce(values: &[Value], iterator: f64, divisor: f64, rate: f64) -> Option<&Value> {
    if values.is_empty() {
        return None;
    }
    let divisor = if divisor == 0.0 { 1.0 } else { divisor };
    let position = (iterator / divisor * rate).floor();
    let index = if position.is_finite() {
        (position as i64).rem_euclid(values.len() as i64) as usize
    } else {
        0
    };
    values.get(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(expr: &str) -> Result<Vec<Value>, ParseError> {
        ListParser::seeded(7).parse(expr, &Session::default())
    }

    fn numbers(values: &[Value]) -> Vec<f64> {
        values.iter().filter_map(Value::as_f64).collect()
    }

    #[test]
    fn numbers_and_text() {
        assert_eq!(
            vec![Value::Number(60.0), Value::Text("bd".to_owned()), Value::Number(-1.5)],
            parse("60 bd  -1.5").unwrap()
        );
    }

    #[test]
    fn session_variables_substitute() {
        let mut session = Session::default();
        session.set_variable("root", 48);
        assert_eq!(
            vec![Value::Number(48.0), Value::Number(50.0)],
            ListParser::seeded(1).parse("root 50", &session).unwrap()
        );
    }

    #[test]
    fn repeat() {
        assert_eq!(vec![3.0, 3.0, 3.0, 1.0], numbers(&parse("3!3 1").unwrap()));
        assert_eq!(MAX_REPEAT, parse("3!1024").unwrap().len());
        assert_eq!(
            Err(ParseError::Repeat("60!99999999999".to_owned())),
            parse("60!99999999999")
        );
    }

    #[test]
    fn choice_picks_an_alternative() {
        let mut parser = ListParser::seeded(3);
        for _ in 0..50 {
            let values = parser.parse("60|64|67", &Session::default()).unwrap();
            assert_eq!(1, values.len());
            assert!([60.0, 64.0, 67.0].contains(&values[0].as_f64().unwrap()));
        }
    }

    #[test]
    fn integer_range_is_inclusive_and_whole() {
        let mut parser = ListParser::seeded(11);
        for _ in 0..100 {
            let value = numbers(&parser.parse("1:4", &Session::default()).unwrap())[0];
            assert!((1.0..=4.0).contains(&value));
            assert_eq!(0.0, value.fract());
        }
        let value = numbers(&parser.parse("0.5:0.75", &Session::default()).unwrap())[0];
        assert!((0.5..0.75).contains(&value));
    }

    #[test]
    fn chance_extremes() {
        assert_eq!(Vec::<Value>::new(), parse("60?0 64?0").unwrap());
        assert_eq!(vec![60.0, 64.0], numbers(&parse("60?100 64?100").unwrap()));
    }

    #[test]
    fn errors() {
        assert_eq!(Err(ParseError::Empty), parse("   "));
        assert_eq!(Err(ParseError::Token("?".to_owned())), parse("?"));
        assert_eq!(Err(ParseError::Token("a||b".to_owned())), parse("a||b"));
        assert_eq!(Err(ParseError::NotANumber("bd:3".to_owned())), parse("bd:3"));
    }

    #[test]
    fn non_finite_ranges_are_rejected() {
        let mut session = Session::default();
        session.set_variable("lo", f64::NAN);
        let mut parser = ListParser::seeded(5);
        assert_eq!(
            Err(ParseError::NotANumber("lo:3".to_owned())),
            parser.parse("lo:3", &session)
        );
        let overflowing = format!("0:{}", "9".repeat(400));
        assert_eq!(
            Err(ParseError::NotANumber(overflowing.clone())),
            parser.parse(&overflowing, &session)
        );
        assert_eq!(vec![60.0], numbers(&parser.parse("60", &session).unwrap()));
    }

    #[test]
    fn resolve_literal_skips_parser() {
        let mut parser = ListParser::seeded(0);
        assert_eq!(
            vec![Value::Text("60 64".to_owned())],
            resolve(
                &mut parser,
                &Param::Literal(Value::from("60 64")),
                &Session::default()
            )
            .unwrap()
        );
    }

    #[test]
    fn reduce_wraps_and_handles_empty() {
        let values: Vec<Value> = vec![1.into(), 2.into()];
        assert_eq!(None, reduce(&[], 3.0, 1.0, 1.0));
        assert_eq!(Some(&Value::Number(2.0)), reduce(&values, 3.0, 1.0, 1.0));
        assert_eq!(Some(&Value::Number(2.0)), reduce(&values, -1.0, 1.0, 1.0));
        assert_eq!(Some(&Value::Number(1.0)), reduce(&values, 5.0, 0.0, 0.0));
    }

    #[test]
    fn whole_numbers_become_osc_integers() {
        assert_eq!(OscType::Int(3), Value::Number(3.0).to_osc());
        assert_eq!(OscType::Float(0.5), Value::Number(0.5).to_osc());
        assert_eq!(OscType::String("bd".to_owned()), Value::from("bd").to_osc());
    }
}
