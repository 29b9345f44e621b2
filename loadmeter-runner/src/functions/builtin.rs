// Copyright (c) The loadmeter Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Built-in functions.

use crate::{
    errors::FunctionError,
    functions::{check_parameter_count, check_parameter_range, CompoundVariable, Function},
    worker::ThreadContext,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Datelike, Duration, Local, Timelike};
use rand::RngExt;
use smol_str::SmolStr;
use uuid::Uuid;

fn execution_error(function: &'static str, message: impl Into<String>) -> FunctionError {
    FunctionError::Execution {
        function: SmolStr::new_static(function),
        message: message.into(),
    }
}

fn parse_offset(
    function: &'static str,
    param: &mut CompoundVariable,
    ctx: &ThreadContext,
) -> Result<i64, FunctionError> {
    let text = param.execute(ctx);
    text.trim()
        .parse()
        .map_err(|_| execution_error(function, format!("`{text}` is not an integer offset")))
}

/// `${__year()}` / `${__year(offset)}`: the current year, optionally
/// shifted by a number of years.
#[derive(Debug, Default)]
pub struct YearFunction {
    offset: Option<CompoundVariable>,
}

impl YearFunction {
    const KEY: &'static str = "__year";

    /// Boxed constructor for registry use.
    pub fn boxed() -> Box<dyn Function> {
        Box::new(Self::default())
    }
}

impl Function for YearFunction {
    fn reference_key(&self) -> &'static str {
        Self::KEY
    }

    fn set_parameters(&mut self, mut params: Vec<CompoundVariable>) -> Result<(), FunctionError> {
        check_parameter_range(Self::KEY, &params, 0, 1)?;
        self.offset = params.pop();
        Ok(())
    }

    fn execute(&mut self, ctx: &ThreadContext) -> Result<String, FunctionError> {
        let mut year = i64::from(Local::now().year());
        if let Some(offset) = &mut self.offset {
            year += parse_offset(Self::KEY, offset, ctx)?;
        }
        Ok(year.to_string())
    }

    fn boxed_clone(&self) -> Box<dyn Function> {
        Box::new(Self {
            offset: self.offset.clone(),
        })
    }
}

/// `${__second()}` / `${__second(offset)}`: the current second of the
/// minute, optionally shifted by a number of seconds.
#[derive(Debug, Default)]
pub struct SecondFunction {
    offset: Option<CompoundVariable>,
}

impl SecondFunction {
    const KEY: &'static str = "__second";

    /// Boxed constructor for registry use.
    pub fn boxed() -> Box<dyn Function> {
        Box::new(Self::default())
    }
}

impl Function for SecondFunction {
    fn reference_key(&self) -> &'static str {
        Self::KEY
    }

    fn set_parameters(&mut self, mut params: Vec<CompoundVariable>) -> Result<(), FunctionError> {
        check_parameter_range(Self::KEY, &params, 0, 1)?;
        self.offset = params.pop();
        Ok(())
    }

    fn execute(&mut self, ctx: &ThreadContext) -> Result<String, FunctionError> {
        let mut now = Local::now();
        if let Some(offset) = &mut self.offset {
            now = now + Duration::seconds(parse_offset(Self::KEY, offset, ctx)?);
        }
        Ok(now.second().to_string())
    }

    fn boxed_clone(&self) -> Box<dyn Function> {
        Box::new(Self {
            offset: self.offset.clone(),
        })
    }
}

/// `${__random()}` / `${__random(length)}`: a random digit string of the
/// given length, or the fractional digits of a random float.
#[derive(Debug, Default)]
pub struct RandomFunction {
    length: Option<CompoundVariable>,
}

impl RandomFunction {
    const KEY: &'static str = "__random";

    /// Boxed constructor for registry use.
    pub fn boxed() -> Box<dyn Function> {
        Box::new(Self::default())
    }
}

impl Function for RandomFunction {
    fn reference_key(&self) -> &'static str {
        Self::KEY
    }

    fn set_parameters(&mut self, mut params: Vec<CompoundVariable>) -> Result<(), FunctionError> {
        check_parameter_range(Self::KEY, &params, 0, 1)?;
        self.length = params.pop();
        Ok(())
    }

    fn execute(&mut self, ctx: &ThreadContext) -> Result<String, FunctionError> {
        let mut rng = rand::rng();
        if let Some(length) = &mut self.length {
            let length = parse_offset(Self::KEY, length, ctx)?;
            if length <= 0 {
                return Err(execution_error(Self::KEY, "length must be positive"));
            }
            let digits: String = (0..length)
                .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
                .collect();
            return Ok(digits);
        }
        let fraction: f64 = rng.random();
        Ok(format!("{fraction}").trim_start_matches("0.").to_string())
    }

    fn boxed_clone(&self) -> Box<dyn Function> {
        Box::new(Self {
            length: self.length.clone(),
        })
    }
}

/// `${__base64(data)}`: standard base64 of the evaluated argument.
#[derive(Debug, Default)]
pub struct Base64Function {
    data: Option<CompoundVariable>,
}

impl Base64Function {
    const KEY: &'static str = "__base64";

    /// Boxed constructor for registry use.
    pub fn boxed() -> Box<dyn Function> {
        Box::new(Self::default())
    }
}

impl Function for Base64Function {
    fn reference_key(&self) -> &'static str {
        Self::KEY
    }

    fn set_parameters(&mut self, mut params: Vec<CompoundVariable>) -> Result<(), FunctionError> {
        check_parameter_count(Self::KEY, &params, 1)?;
        self.data = params.pop();
        Ok(())
    }

    fn execute(&mut self, ctx: &ThreadContext) -> Result<String, FunctionError> {
        let data = self
            .data
            .as_mut()
            .ok_or_else(|| execution_error(Self::KEY, "parameters not bound"))?
            .execute(ctx);
        Ok(STANDARD.encode(data.trim()))
    }

    fn boxed_clone(&self) -> Box<dyn Function> {
        Box::new(Self {
            data: self.data.clone(),
        })
    }
}

/// `${__uuid()}`: a random v4 UUID.
#[derive(Clone, Debug, Default)]
pub struct UuidFunction;

impl UuidFunction {
    const KEY: &'static str = "__uuid";

    /// Boxed constructor for registry use.
    pub fn boxed() -> Box<dyn Function> {
        Box::new(Self)
    }
}

impl Function for UuidFunction {
    fn reference_key(&self) -> &'static str {
        Self::KEY
    }

    fn set_parameters(&mut self, params: Vec<CompoundVariable>) -> Result<(), FunctionError> {
        check_parameter_count(Self::KEY, &params, 0)?;
        Ok(())
    }

    fn execute(&mut self, _ctx: &ThreadContext) -> Result<String, FunctionError> {
        Ok(Uuid::new_v4().to_string())
    }

    fn boxed_clone(&self) -> Box<dyn Function> {
        Box::new(Self)
    }
}
