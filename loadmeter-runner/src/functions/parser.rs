// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Compiler from `${…}` source text to [`Piece`] lists.

use crate::{
    errors::InvalidVariableError,
    functions::{CompoundVariable, FunctionRegistry, Piece, SimpleVariable},
};
use smol_str::SmolStr;
use std::str::Chars;
use tracing::warn;

const NUL: char = '\0';

/// Compiles `source` into an ordered list of literal, variable, and
/// function pieces.
///
/// `\` escapes the next character; the backslash itself is kept unless it
/// escapes `$`, `,`, or `\`. Unknown function names decay to simple
/// variables. An unterminated call is an [`InvalidVariableError`].
pub fn compile_string(
    source: &str,
    registry: &FunctionRegistry,
) -> Result<Vec<Piece>, InvalidVariableError> {
    let mut reader = source.chars();
    let mut pieces = Vec::new();
    let mut buffer = String::new();
    let mut previous = NUL;

    while let Some(current) = reader.next() {
        if current == '\\' {
            let Some(escaped) = reader.next() else {
                break;
            };
            if escaped != '$' && escaped != ',' && escaped != '\\' {
                buffer.push('\\');
            }
            buffer.push(escaped);
            previous = NUL;
        } else if current == '{' && previous == '$' {
            buffer.pop();
            if !buffer.is_empty() {
                pieces.push(Piece::Literal(std::mem::take(&mut buffer)));
            }
            pieces.push(make_function(&mut reader, source, registry)?);
            previous = NUL;
        } else {
            buffer.push(current);
            previous = current;
        }
    }

    if !buffer.is_empty() {
        pieces.push(Piece::Literal(buffer));
    }
    if pieces.is_empty() {
        pieces.push(Piece::Literal(String::new()));
    }
    Ok(pieces)
}

/// Parses the inside of a `${…}` placeholder, the opening brace already
/// consumed.
fn make_function(
    reader: &mut Chars<'_>,
    source: &str,
    registry: &FunctionRegistry,
) -> Result<Piece, InvalidVariableError> {
    let mut buffer = String::new();
    let mut previous = NUL;

    while let Some(current) = reader.next() {
        match current {
            '\\' => {
                let Some(escaped) = reader.next() else {
                    break;
                };
                buffer.push(escaped);
                previous = NUL;
            }
            '(' if previous != NUL => {
                if registry.contains(&buffer) {
                    let name = SmolStr::new(&buffer);
                    let mut function = registry
                        .instantiate(&buffer)
                        .expect("key is registered");
                    let params = parse_params(reader, source, registry)?;
                    function.set_parameters(params)?;
                    return match reader.next() {
                        Some('}') => Ok(Piece::Function(function)),
                        _ => Err(InvalidVariableError::UnterminatedFunction {
                            function: name,
                            expr: source.to_string(),
                        }),
                    };
                }
                // Not a registered function; treat the parenthesis as part
                // of the (eventual) variable name.
                buffer.push(current);
                previous = current;
            }
            '}' => {
                // A variable reference, or a function called without
                // parentheses.
                if let Some(mut function) = registry.instantiate(&buffer) {
                    function.set_parameters(Vec::new())?;
                    return Ok(Piece::Function(function));
                }
                return Ok(Piece::Variable(SimpleVariable::new(buffer.as_str())));
            }
            _ => {
                buffer.push(current);
                previous = current;
            }
        }
    }

    warn!(text = %buffer, "possibly invalid placeholder, keeping literal text");
    Ok(Piece::Literal(buffer))
}

/// Parses a comma-separated parameter list up to the closing parenthesis.
/// Commas split only at the top nesting level: `${…}` placeholders and
/// parenthesized groups inside an argument are tracked with counters.
fn parse_params(
    reader: &mut Chars<'_>,
    source: &str,
    registry: &FunctionRegistry,
) -> Result<Vec<CompoundVariable>, InvalidVariableError> {
    let mut result = Vec::new();
    let mut buffer = String::new();
    let mut previous = NUL;
    let mut placeholder_depth = 0u32;
    let mut paren_depth = 0u32;

    loop {
        let Some(current) = reader.next() else {
            return Err(InvalidVariableError::UnterminatedParams {
                expr: source.to_string(),
            });
        };

        if current == '\\' {
            // Keep the backslash; the recursive compile of the argument
            // text handles the escape.
            buffer.push('\\');
            let Some(escaped) = reader.next() else {
                return Err(InvalidVariableError::UnterminatedParams {
                    expr: source.to_string(),
                });
            };
            buffer.push(escaped);
            previous = NUL;
        } else if current == ',' && placeholder_depth == 0 && paren_depth == 0 {
            result.push(CompoundVariable::compile(&buffer, registry)?);
            buffer.clear();
            previous = current;
        } else if current == ')' && placeholder_depth == 0 && paren_depth == 0 {
            // An empty parameter list compiles to no parameters at all.
            if buffer.is_empty() && result.is_empty() {
                return Ok(result);
            }
            result.push(CompoundVariable::compile(&buffer, registry)?);
            return Ok(result);
        } else if current == '{' && previous == '$' {
            buffer.push(current);
            previous = current;
            placeholder_depth += 1;
        } else if current == '}' && placeholder_depth > 0 {
            buffer.push(current);
            previous = current;
            placeholder_depth -= 1;
        } else if current == ')' && placeholder_depth == 0 && paren_depth > 0 {
            buffer.push(current);
            previous = current;
            paren_depth -= 1;
        } else if current == '(' && placeholder_depth == 0 {
            buffer.push(current);
            previous = current;
            paren_depth += 1;
        } else {
            buffer.push(current);
            previous = current;
        }
    }
}
