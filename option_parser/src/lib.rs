// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;

use thiserror::Error;

/// Parser for the free-form, comma-separated option strings devices are
/// configured with.
///
/// Device option strings are forgiving: a token that does not name a known
/// option, or that is not of the `name=value` shape the option requires, is
/// skipped rather than rejected, so a single mistyped token cannot prevent a
/// device from attaching. Skipped tokens are handed back to the caller for
/// logging.
#[derive(Default)]
pub struct OptionParser {
    options: HashMap<String, OptionParserValue>,
}

struct OptionParserValue {
    value: Option<String>,
    requires_value: bool,
}

#[derive(Error, Debug)]
pub enum OptionParserError {
    #[error("unable to convert {1} for {0}")]
    Conversion(String /* field */, String /* value */),
}

type OptionParserResult<T> = std::result::Result<T, OptionParserError>;

impl OptionParser {
    pub fn new() -> Self {
        Self {
            options: HashMap::new(),
        }
    }

    /// Parse `input`, filling in the values of the registered options.
    ///
    /// Returns the list of tokens that were skipped: unknown option names,
    /// tokens missing a required `=value`, and empty tokens.
    pub fn parse(&mut self, input: &str) -> Vec<String> {
        let mut skipped = Vec::new();

        if input.trim().is_empty() {
            return skipped;
        }

        for option in input.trim().split(',') {
            if option.is_empty() {
                continue;
            }

            let parts: Vec<&str> = option.splitn(2, '=').collect();
            match self.options.get_mut(parts[0]) {
                None => skipped.push(option.to_owned()),
                Some(value) => {
                    if value.requires_value {
                        if parts.len() != 2 {
                            skipped.push(option.to_owned());
                            continue;
                        }
                        value.value = Some(parts[1].trim().to_owned());
                    } else {
                        value.value = Some(String::new());
                    }
                }
            }
        }

        skipped
    }

    pub fn add(&mut self, option: &str) -> &mut Self {
        self.options.insert(
            option.to_owned(),
            OptionParserValue {
                value: None,
                requires_value: true,
            },
        );

        self
    }

    pub fn add_valueless(&mut self, option: &str) -> &mut Self {
        self.options.insert(
            option.to_owned(),
            OptionParserValue {
                value: None,
                requires_value: false,
            },
        );

        self
    }

    pub fn get(&self, option: &str) -> Option<String> {
        self.options
            .get(option)
            .and_then(|v| v.value.clone())
            .and_then(|s| if s.is_empty() { None } else { Some(s) })
    }

    pub fn is_set(&self, option: &str) -> bool {
        self.options
            .get(option)
            .and_then(|v| v.value.as_ref())
            .is_some()
    }

    pub fn convert<T: FromOption>(&self, option: &str) -> OptionParserResult<Option<T>> {
        match self.options.get(option).and_then(|v| v.value.as_ref()) {
            None => Ok(None),
            Some(v) => {
                if v.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(T::from_option(v).map_err(|_| {
                        OptionParserError::Conversion(option.to_owned(), v.to_owned())
                    })?))
                }
            }
        }
    }
}

/// Conversion from an option value string.
pub trait FromOption: Sized {
    type Err;

    fn from_option(value: &str) -> Result<Self, Self::Err>;
}

impl<T: std::str::FromStr> FromOption for T {
    type Err = <T as std::str::FromStr>::Err;

    fn from_option(value: &str) -> Result<Self, Self::Err> {
        value.parse()
    }
}

/// Boolean-like option value: `on`/`true` enable, `off`/`false` and the
/// empty string disable.
#[derive(Debug)]
pub struct Toggle(pub bool);

#[derive(Error, Debug)]
pub enum ToggleParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl FromOption for Toggle {
    type Err = ToggleParseError;

    fn from_option(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" => Ok(Toggle(false)),
            "on" => Ok(Toggle(true)),
            "off" => Ok(Toggle(false)),
            "true" => Ok(Toggle(true)),
            "false" => Ok(Toggle(false)),
            _ => Err(ToggleParseError::InvalidValue(s.to_owned())),
        }
    }
}
