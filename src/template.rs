//!Resolution of `{expr}` / `{if …}` blocks in user start/end G-code.
//!
//!The grammar is `{ CONDITION? EXPRESSION (, EXTRUDER_EXPRESSION)? }` where
//!CONDITION is one of `if`, `elif`, `else`, `endif` and drives a single
//!level of conditionals. Expressions are evaluated against the settings of
//!the selected extruder, falling back to global settings. Errors keep the
//!template text verbatim, so a broken template never breaks the print.

use std::collections::HashMap;
use std::fmt;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::{char as nom_char, multispace0};
use nom::combinator::{map, opt, recognize, verify};
use nom::number::complete::double;
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;

///Symbols only known after slicing finishes; expressions consisting of one
///of these are preserved verbatim for a later substitution pass.
const POST_SLICE_VARIABLES: [&str; 5] = [
    "filament_cost",
    "print_time",
    "filament_amount",
    "filament_weight",
    "jobname",
];

///A value in the template expression language.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn truthy(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => {
                if v.fract() == 0.0 && v.abs() < 1e15 {
                    write!(f, "{}", *v as i64)
                } else {
                    write!(f, "{v}")
                }
            }
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

///Settings visible to template expressions: one global namespace and one
///namespace per extruder that shadows it.
#[derive(Clone, Debug, Default)]
pub struct TemplateEnvironment {
    pub global: HashMap<String, Value>,
    pub per_extruder: Vec<HashMap<String, Value>>,
}

impl TemplateEnvironment {
    fn lookup(&self, extruder_nr: Option<usize>, key: &str) -> Option<Value> {
        if let Some(nr) = extruder_nr {
            if let Some(value) = self.per_extruder.get(nr).and_then(|map| map.get(key)) {
                return Some(value.clone());
            }
        }
        self.global.get(key).cloned()
    }

    fn has_extruder(&self, extruder_nr: usize) -> bool {
        extruder_nr < self.per_extruder.len()
    }
}

#[derive(Debug, PartialEq)]
enum EvalError {
    Syntax,
    UnknownIdentifier,
}

// --- expression AST ------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Literal(Value),
    Identifier(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn atom(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        delimited(nom_char('('), expr, nom_char(')')),
        map(
            delimited(nom_char('"'), take_while(|c| c != '"'), nom_char('"')),
            |s: &str| Expr::Literal(Value::Str(s.to_string())),
        ),
        map(
            delimited(nom_char('\''), take_while(|c| c != '\''), nom_char('\'')),
            |s: &str| Expr::Literal(Value::Str(s.to_string())),
        ),
        map(tuple((tag("true"), peek_non_ident)), |_| {
            Expr::Literal(Value::Bool(true))
        }),
        map(tuple((tag("false"), peek_non_ident)), |_| {
            Expr::Literal(Value::Bool(false))
        }),
        number,
        map(
            verify(identifier, |s: &&str| {
                !matches!(*s, "true" | "false" | "and" | "or" | "not")
            }),
            |s: &str| Expr::Identifier(s.to_string()),
        ),
    )))(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    // Integers stay integral so modulo arithmetic on extruder indices works.
    let (rest, text) = recognize(double)(input)?;
    // Words like "inf" are identifiers in a template, never numbers.
    if text
        .chars()
        .any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E')
    {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Float,
        )));
    }
    if !text.contains(['.', 'e', 'E']) {
        if let Ok(v) = text.parse::<i64>() {
            return Ok((rest, Expr::Literal(Value::Int(v))));
        }
    }
    let value: f64 = text.parse().map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Float))
    })?;
    Ok((rest, Expr::Literal(Value::Float(value))))
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(nom_char('-')), unary), |e| {
            Expr::Unary(UnaryOp::Neg, Box::new(e))
        }),
        map(
            preceded(ws(tuple((tag("not"), peek_non_ident))), unary),
            |e| Expr::Unary(UnaryOp::Not, Box::new(e)),
        ),
        atom,
    ))(input)
}

///Succeeds when the next char cannot continue an identifier, so `not` the
///keyword is distinguished from `nothing` the identifier.
fn peek_non_ident(input: &str) -> IResult<&str, ()> {
    if input
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric() || c == '_')
        .unwrap_or(false)
    {
        Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        )))
    } else {
        Ok((input, ()))
    }
}

fn product(input: &str) -> IResult<&str, Expr> {
    let (mut rest, mut acc) = unary(input)?;
    loop {
        let op = alt((
            map(ws(nom_char('*')), |_| BinaryOp::Mul),
            map(ws(nom_char('/')), |_| BinaryOp::Div),
            map(ws(nom_char('%')), |_| BinaryOp::Mod),
        ))(rest);
        match op {
            Ok((r, op)) => {
                let (r, rhs) = unary(r)?;
                acc = Expr::Binary(op, Box::new(acc), Box::new(rhs));
                rest = r;
            }
            Err(_) => return Ok((rest, acc)),
        }
    }
}

fn sum(input: &str) -> IResult<&str, Expr> {
    let (mut rest, mut acc) = product(input)?;
    loop {
        let op = alt((
            map(ws(nom_char('+')), |_| BinaryOp::Add),
            map(ws(nom_char('-')), |_| BinaryOp::Sub),
        ))(rest);
        match op {
            Ok((r, op)) => {
                let (r, rhs) = product(r)?;
                acc = Expr::Binary(op, Box::new(acc), Box::new(rhs));
                rest = r;
            }
            Err(_) => return Ok((rest, acc)),
        }
    }
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (rest, lhs) = sum(input)?;
    let op = alt((
        map(ws(tag(">=")), |_| BinaryOp::Ge),
        map(ws(tag("<=")), |_| BinaryOp::Le),
        map(ws(tag("==")), |_| BinaryOp::Eq),
        map(ws(tag("!=")), |_| BinaryOp::Ne),
        map(ws(nom_char('>')), |_| BinaryOp::Gt),
        map(ws(nom_char('<')), |_| BinaryOp::Lt),
    ))(rest);
    match op {
        Ok((r, op)) => {
            let (r, rhs) = sum(r)?;
            Ok((r, Expr::Binary(op, Box::new(lhs), Box::new(rhs))))
        }
        Err(_) => Ok((rest, lhs)),
    }
}

fn conjunction(input: &str) -> IResult<&str, Expr> {
    let (mut rest, mut acc) = comparison(input)?;
    loop {
        match ws(tuple((tag("and"), peek_non_ident)))(rest) {
            Ok((r, _)) => {
                let (r, rhs) = comparison(r)?;
                acc = Expr::Binary(BinaryOp::And, Box::new(acc), Box::new(rhs));
                rest = r;
            }
            Err(_) => return Ok((rest, acc)),
        }
    }
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let (mut rest, mut acc) = conjunction(input)?;
    loop {
        match ws(tuple((tag("or"), peek_non_ident)))(rest) {
            Ok((r, _)) => {
                let (r, rhs) = conjunction(r)?;
                acc = Expr::Binary(BinaryOp::Or, Box::new(acc), Box::new(rhs));
                rest = r;
            }
            Err(_) => return Ok((rest, acc)),
        }
    }
}

fn eval(
    expression: &Expr,
    env: &TemplateEnvironment,
    extruder_nr: Option<usize>,
) -> Result<Value, EvalError> {
    match expression {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Identifier(name) => env
            .lookup(extruder_nr, name)
            .ok_or(EvalError::UnknownIdentifier),
        Expr::Unary(op, inner) => {
            let value = eval(inner, env, extruder_nr)?;
            match op {
                UnaryOp::Neg => match value {
                    Value::Int(v) => Ok(Value::Int(-v)),
                    Value::Float(v) => Ok(Value::Float(-v)),
                    _ => Err(EvalError::Syntax),
                },
                UnaryOp::Not => match value.truthy() {
                    Some(b) => Ok(Value::Bool(!b)),
                    None => Err(EvalError::Syntax),
                },
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let left = eval(lhs, env, extruder_nr)?;
            let right = eval(rhs, env, extruder_nr)?;
            eval_binary(*op, left, right)
        }
    }
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, EvalError> {
    use BinaryOp::*;
    match op {
        And | Or => {
            let (l, r) = (
                left.truthy().ok_or(EvalError::Syntax)?,
                right.truthy().ok_or(EvalError::Syntax)?,
            );
            Ok(Value::Bool(if op == And { l && r } else { l || r }))
        }
        Eq | Ne => {
            let equal = match (&left, &right) {
                (Value::Str(a), Value::Str(b)) => a == b,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (a, b) => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => return Err(EvalError::Syntax),
                },
            };
            Ok(Value::Bool(if op == Eq { equal } else { !equal }))
        }
        Lt | Gt | Le | Ge => {
            let (x, y) = (
                left.as_f64().ok_or(EvalError::Syntax)?,
                right.as_f64().ok_or(EvalError::Syntax)?,
            );
            Ok(Value::Bool(match op {
                Lt => x < y,
                Gt => x > y,
                Le => x <= y,
                Ge => x >= y,
                _ => unreachable!(),
            }))
        }
        Add | Sub | Mul | Mod => match (left, right) {
            (Value::Int(a), Value::Int(b)) => match op {
                Add => Ok(Value::Int(a + b)),
                Sub => Ok(Value::Int(a - b)),
                Mul => Ok(Value::Int(a * b)),
                Mod => {
                    if b == 0 {
                        Err(EvalError::Syntax)
                    } else {
                        Ok(Value::Int(a.rem_euclid(b)))
                    }
                }
                _ => unreachable!(),
            },
            (a, b) => {
                let (x, y) = (
                    a.as_f64().ok_or(EvalError::Syntax)?,
                    b.as_f64().ok_or(EvalError::Syntax)?,
                );
                Ok(Value::Float(match op {
                    Add => x + y,
                    Sub => x - y,
                    Mul => x * y,
                    Mod => x.rem_euclid(y),
                    _ => unreachable!(),
                }))
            }
        },
        Div => {
            let (x, y) = (
                left.as_f64().ok_or(EvalError::Syntax)?,
                right.as_f64().ok_or(EvalError::Syntax)?,
            );
            if y == 0.0 {
                return Err(EvalError::Syntax);
            }
            Ok(Value::Float(x / y))
        }
    }
}

// --- template blocks -----------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
enum Condition {
    If,
    Elif,
    Else,
    Endif,
}

#[derive(Debug)]
struct Block<'a> {
    condition: Option<Condition>,
    expression: &'a str,
    extruder_expression: Option<&'a str>,
    ///The newline directly following the closing brace, if any.
    end_of_line: bool,
    ///The raw text of the whole block, braces included.
    raw: &'a str,
}

fn condition_keyword(input: &str) -> IResult<&str, Condition> {
    let (rest, cond) = alt((
        map(tag("endif"), |_| Condition::Endif),
        map(tag("elif"), |_| Condition::Elif),
        map(tag("else"), |_| Condition::Else),
        map(tag("if"), |_| Condition::If),
    ))(input)?;
    // Keywords must stand alone, not prefix an identifier.
    peek_non_ident(rest)?;
    Ok((rest, cond))
}

fn parse_block(input: &str) -> IResult<&str, Block<'_>> {
    let (rest, inner) = delimited(
        nom_char('{'),
        take_while(|c| c != '{' && c != '}'),
        nom_char('}'),
    )(input)?;
    let (rest, newline) = opt(nom_char('\n'))(rest)?;
    let raw_len = input.len() - rest.len() - newline.map(|_| 1).unwrap_or(0);

    let (after_ws, _) = multispace0::<&str, nom::error::Error<&str>>(inner)
        .unwrap_or((inner, ""));
    let (expr_part, condition) = match condition_keyword(after_ws) {
        Ok((r, c)) => (r, Some(c)),
        Err(_) => (after_ws, None),
    };
    let (expression, extruder_expression) = match expr_part.rfind(',') {
        Some(pos) => (
            expr_part[..pos].trim(),
            Some(expr_part[pos + 1..].trim()).filter(|s| !s.is_empty()),
        ),
        None => (expr_part.trim(), None),
    };

    Ok((
        rest,
        Block {
            condition,
            expression,
            extruder_expression,
            end_of_line: newline.is_some(),
            raw: &input[..raw_len],
        },
    ))
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ConditionState {
    OutsideCondition,
    ConditionFalse,
    ConditionTrue,
    ConditionDone,
}

fn evaluate_expression(
    expression: &str,
    env: &TemplateEnvironment,
    extruder_nr: Option<usize>,
) -> Result<Value, EvalError> {
    let Ok((rest, parsed)) = expr(expression) else {
        log::error!("invalid syntax in expression [{expression}]");
        return Err(EvalError::Syntax);
    };
    if !rest.trim().is_empty() {
        log::error!("invalid syntax in expression [{expression}]");
        return Err(EvalError::Syntax);
    }
    match eval(&parsed, env, extruder_nr) {
        Ok(value) => Ok(value),
        Err(EvalError::UnknownIdentifier) => {
            if POST_SLICE_VARIABLES.contains(&expression.trim()) {
                return Err(EvalError::UnknownIdentifier);
            }
            log::warn!("invalid variable identifier in expression [{expression}]");
            Err(EvalError::Syntax)
        }
        Err(err) => Err(err),
    }
}

///Resolve a start/end G-code template. On any error the raw input is
///returned unchanged. A trailing newline is appended when missing.
pub fn resolve_gcode_template(
    input: &str,
    context_extruder_nr: Option<usize>,
    env: &TemplateEnvironment,
    extra_settings: &HashMap<String, String>,
) -> String {
    let mut env = env.clone();
    for (key, value) in extra_settings {
        env.global.insert(key.clone(), Value::Str(value.clone()));
    }

    let mut output = String::new();
    let mut state = ConditionState::OutsideCondition;
    let mut rest = input;
    let mut failed = false;

    while !rest.is_empty() {
        let Some(brace) = rest.find('{') else {
            if matches!(state, ConditionState::OutsideCondition | ConditionState::ConditionTrue) {
                output.push_str(rest);
            }
            break;
        };
        let (prefix, at_block) = rest.split_at(brace);
        if matches!(state, ConditionState::OutsideCondition | ConditionState::ConditionTrue) {
            output.push_str(prefix);
        }
        match parse_block(at_block) {
            Ok((remaining, block)) => {
                if !process_block(&mut output, &mut state, &block, context_extruder_nr, &env) {
                    failed = true;
                    break;
                }
                rest = remaining;
            }
            Err(_) => {
                // A stray brace is ordinary text.
                if matches!(state, ConditionState::OutsideCondition | ConditionState::ConditionTrue) {
                    output.push('{');
                }
                rest = &at_block[1..];
            }
        }
    }

    if failed {
        output = input.to_string();
    }
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output
}

fn process_block(
    output: &mut String,
    state: &mut ConditionState,
    block: &Block<'_>,
    context_extruder_nr: Option<usize>,
    env: &TemplateEnvironment,
) -> bool {
    #[derive(PartialEq)]
    enum Instruction {
        Skip,
        Evaluate,
        EvaluateAndWrite,
    }

    let mut instruction = Instruction::Skip;
    match block.condition {
        None => {
            if matches!(state, ConditionState::OutsideCondition | ConditionState::ConditionTrue) {
                instruction = Instruction::EvaluateAndWrite;
            }
        }
        Some(Condition::If) => {
            if *state != ConditionState::OutsideCondition {
                log::error!("nested conditions are not supported");
                return false;
            }
            instruction = Instruction::Evaluate;
        }
        Some(condition) => {
            if *state == ConditionState::OutsideCondition {
                log::error!("condition should start with an 'if' statement");
                return false;
            }
            if *state == ConditionState::ConditionTrue {
                *state = ConditionState::ConditionDone;
            }
            match condition {
                Condition::Elif => {
                    if *state == ConditionState::ConditionFalse {
                        instruction = Instruction::Evaluate;
                    }
                }
                Condition::Else => {
                    if *state == ConditionState::ConditionFalse {
                        *state = ConditionState::ConditionTrue;
                    }
                }
                Condition::Endif => {
                    *state = ConditionState::OutsideCondition;
                }
                Condition::If => unreachable!(),
            }
        }
    }

    if instruction == Instruction::Skip {
        return true;
    }

    // The optional second expression selects the extruder whose settings
    // provide the evaluation context; it is itself evaluated globally.
    let mut extruder_nr = context_extruder_nr;
    if let Some(extruder_expression) = block.extruder_expression {
        match evaluate_expression(extruder_expression, env, None) {
            Ok(value) => {
                let parsed = match &value {
                    Value::Int(v) => Some(*v),
                    Value::Float(v) => Some(v.floor() as i64),
                    Value::Str(s) => s.trim().parse::<i64>().ok(),
                    Value::Bool(_) => None,
                };
                match parsed {
                    Some(v) if v >= 0 => extruder_nr = Some(v as usize),
                    _ => return false,
                }
            }
            Err(_) => return false,
        }
    }
    if let Some(nr) = extruder_nr {
        if !env.has_extruder(nr) {
            log::warn!("invalid extruder number {nr}, using global settings instead");
            extruder_nr = None;
        }
    }

    match evaluate_expression(block.expression, env, extruder_nr) {
        Ok(value) => {
            if instruction == Instruction::Evaluate {
                match value.truthy() {
                    Some(truth) => {
                        *state = if truth {
                            ConditionState::ConditionTrue
                        } else {
                            ConditionState::ConditionFalse
                        };
                    }
                    None => {
                        log::warn!(
                            "condition [{}] does not evaluate to boolean, considering true",
                            block.expression
                        );
                        *state = ConditionState::ConditionTrue;
                    }
                }
                true
            } else {
                output.push_str(&value.to_string());
                if block.end_of_line {
                    output.push('\n');
                }
                true
            }
        }
        Err(EvalError::UnknownIdentifier) => {
            // A known post-slice placeholder; keep the raw block.
            output.push_str(block.raw);
            if block.end_of_line {
                output.push('\n');
            }
            true
        }
        Err(EvalError::Syntax) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_env() -> TemplateEnvironment {
        let mut env = TemplateEnvironment::default();
        env.global
            .insert("bed_temperature".to_string(), Value::Float(50.0));
        env.global.insert("initial_extruder".to_string(), Value::Int(0));
        let mut extruder0 = HashMap::new();
        extruder0.insert("material_temperature".to_string(), Value::Float(190.5));
        let mut extruder1 = HashMap::new();
        extruder1.insert("material_temperature".to_string(), Value::Float(210.0));
        env.per_extruder = vec![extruder0, extruder1];
        env
    }

    fn resolve(input: &str, extruder: Option<usize>) -> String {
        resolve_gcode_template(input, extruder, &test_env(), &HashMap::new())
    }

    #[test]
    fn static_code_gains_trailing_newline() {
        assert_eq!(resolve("G0", None), "G0\n");
    }

    #[test]
    fn plain_text_with_newline_is_unchanged() {
        assert_eq!(resolve("G28\nG1 Z5\n", None), "G28\nG1 Z5\n");
    }

    #[test]
    fn basic_replacement() {
        assert_eq!(resolve("M128 {bed_temperature}", None), "M128 50\n");
    }

    #[test]
    fn conditional_with_global_setting() {
        let input = "{if bed_temperature > 30}\nG123\n{else}\nG456\n{endif}";
        assert_eq!(resolve(input, None), "G123\n");
    }

    #[test]
    fn conditional_with_extruder_index() {
        let input = "{if material_temperature > 200, 0}\nG10\n{else}\nG20\n{endif}";
        assert_eq!(resolve(input, None), "G20\n");
        let input = "{if material_temperature > 200, 1}\nG100\n{else}\nG200\n{endif}";
        assert_eq!(resolve(input, None), "G100\n");
    }

    #[test]
    fn conditional_with_context_extruder() {
        let input = "{if material_temperature > 200}\nC10\n{else}\nC20\n{endif}";
        assert_eq!(resolve(input, Some(0)), "C20\n");
        assert_eq!(resolve(input, Some(1)), "C10\n");
    }

    #[test]
    fn extruder_index_from_setting_and_formula() {
        let input = "{if material_temperature > 200, initial_extruder}\nG1000\n{else}\nG2000\n{endif}";
        assert_eq!(resolve(input, None), "G2000\n");
        let input =
            "{if material_temperature > 200, (initial_extruder + 1) % 2}\nX1000\n{else}\nX2000\n{endif}";
        assert_eq!(resolve(input, None), "X1000\n");
    }

    #[test]
    fn elif_chain_picks_matching_branch() {
        let input = "{if bed_temperature < 30}\nT30\n{elif bed_temperature >= 30 and bed_temperature < 40}\nT40\n{elif bed_temperature >= 40 and bed_temperature < 50}\nT50\n{elif bed_temperature >= 50 and bed_temperature < 60}\nT60\n{else}\nT70\n{endif}";
        assert_eq!(resolve(input, None), "T60\n");
    }

    #[test]
    fn nested_condition_returns_raw_input() {
        let input = "{if bed_temperature > 30}\n{if bed_temperature > 40}\nX\n{endif}\n{endif}";
        let result = resolve(input, None);
        assert_eq!(result, format!("{input}\n"));
    }

    #[test]
    fn unknown_identifier_returns_raw_input() {
        let input = "M104 S{no_such_setting}";
        assert_eq!(resolve(input, None), "M104 S{no_such_setting}\n");
    }

    #[test]
    fn post_slice_placeholders_are_preserved() {
        let input = "M117 time {print_time} cost {filament_cost}";
        assert_eq!(resolve(input, None), "M117 time {print_time} cost {filament_cost}\n");
    }

    #[test]
    fn extra_settings_extend_the_environment() {
        let mut extra = HashMap::new();
        extra.insert("jobname".to_string(), "benchy".to_string());
        let result = resolve_gcode_template("M117 {jobname}", None, &test_env(), &extra);
        assert_eq!(result, "M117 benchy\n");
    }

    #[test]
    fn invalid_extruder_falls_back_to_global() {
        // Extruder 7 does not exist; the expression then resolves against
        // global settings, where material_temperature is unknown, so the
        // whole template is echoed raw.
        let input = "{material_temperature, 7}";
        assert_eq!(resolve(input, None), format!("{input}\n"));
    }
}
