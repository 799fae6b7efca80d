use crate::config::json_boolean_value;
use crate::wire::ErrorMessage;
use serde_json::{Map, Value};

// Interface parameters accepted in a query body.
pub const CODE: &str = "code";
pub const SCRIPT: &str = "script";
pub const NAME: &str = "name";
pub const CACHE_CODE: &str = "cache_code";
pub const REPLACE_CACHE_ENTRY: &str = "replace";
pub const LIMIT_RETURN_TO: &str = "limitReturnTo";
pub const EXEC_HANDLES_RETURN: &str = "codeHandlesReturn";
pub const PRESET_VALUES: &str = "presetValues";

const ERROR_PREFIX: &str = "io.vantiq.pyexecsource.runpython";

/// The validated options of one execution request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Inline script text.
    pub code: Option<String>,
    /// Name of a stored document to fetch the script from.
    pub script: Option<String>,
    /// Effective cache key; the script name when `script` is given.
    pub name: Option<String>,
    /// Whether to cache the compiled artifact. Defaults to true when a
    /// name is present.
    pub cache_code: bool,
    /// Evict the named cache entry before resolving.
    pub replace: bool,
    /// The script produces its own responses; nothing is auto-emitted.
    pub code_handles_return: bool,
    /// Restrict auto-returned variables to these names.
    pub limit_return_to: Option<Vec<String>>,
    /// Values preseeded into the script's scope.
    pub preset_values: Map<String, Value>,
}

impl RequestOptions {
    /// Parses and validates a query body. Violations come back as the
    /// error message to return to the server, one taxonomy code each.
    pub fn parse(source_name: &str, msg: &Value) -> Result<Self, ErrorMessage> {
        let code = msg.get(CODE).and_then(Value::as_str).map(str::to_string);
        let script = msg.get(SCRIPT).and_then(Value::as_str).map(str::to_string);
        let raw_name = msg.get(NAME).and_then(Value::as_str).map(str::to_string);
        let name = script.clone().or_else(|| raw_name.clone());

        let cache_code = match msg.get(CACHE_CODE) {
            Some(value) => json_boolean_value(value),
            None => name.is_some(),
        };

        let code_handles_return = msg
            .get(EXEC_HANDLES_RETURN)
            .is_some_and(json_boolean_value);

        let limit_return_to = match msg.get(LIMIT_RETURN_TO) {
            None => None,
            Some(Value::String(raw)) => Some(
                raw.replace(' ', "")
                    .split(',')
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            Some(Value::Array(values)) => {
                let mut names = Vec::with_capacity(values.len());
                for value in values {
                    let Some(name) = value.as_str() else {
                        return Err(bad_return_values(value));
                    };
                    names.push(name.trim().to_string());
                }
                Some(names)
            }
            Some(other) => return Err(bad_return_values(other)),
        };

        if code_handles_return && limit_return_to.is_some() {
            return Err(ErrorMessage::new(
                format!("{ERROR_PREFIX}.conflictingreturn"),
                "This query stated that the code will generate the return value and specified \
                 the returnValuesFor list. These items are in conflict.",
                vec![],
            ));
        }

        let replace = msg.get(REPLACE_CACHE_ENTRY).is_some_and(json_boolean_value);

        let preset_values = match msg.get(PRESET_VALUES) {
            None => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(ErrorMessage::new(
                    format!("{ERROR_PREFIX}.badglobalpreset"),
                    "The {0} entry must be a VAIL object (a map at the connector).",
                    vec![Value::String(PRESET_VALUES.to_string())],
                ))
            }
        };

        if cache_code && name.is_none() {
            return Err(ErrorMessage::new(
                format!("{ERROR_PREFIX}.nocachename"),
                "A request was made to cache the code but no name was provided.",
                vec![],
            ));
        }
        if code.is_none() && script.is_none() && name.is_none() {
            return Err(ErrorMessage::new(
                format!("{ERROR_PREFIX}.nocode"),
                "No code was provided to execute. Message was {0}, but no {1} value was present.",
                vec![msg.clone(), Value::String(CODE.to_string())],
            ));
        }
        if code.is_some() && script.is_some() {
            return Err(ErrorMessage::new(
                format!("{ERROR_PREFIX}.ambiguouscode"),
                "Both the code and script parameters were specified. Specify either one or the \
                 other. Message was {0}.",
                vec![msg.clone()],
            ));
        }
        if script.is_some() && raw_name.is_some() && raw_name != script {
            return Err(ErrorMessage::new(
                format!("{ERROR_PREFIX}.ambiguousname"),
                "A query was made to source {0} including both the script and name parameters. \
                 When script is provided, no name is permitted. Message was {1}.",
                vec![
                    Value::String(source_name.to_string()),
                    msg.clone(),
                ],
            ));
        }

        Ok(RequestOptions {
            code,
            script,
            name,
            cache_code,
            replace,
            code_handles_return,
            limit_return_to,
            preset_values,
        })
    }

    /// Whether `name` passes the `limitReturnTo` filter (everything does
    /// when no filter was given).
    pub fn wants_result(&self, name: &str) -> bool {
        match &self.limit_return_to {
            Some(names) => names.iter().any(|n| n == name),
            None => true,
        }
    }
}

fn bad_return_values(found: &Value) -> ErrorMessage {
    let type_name = match found {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    ErrorMessage::new(
        format!("{ERROR_PREFIX}.badreturnvaluesfor"),
        "The returnValuesFor parameter must be a string or a list, found: {0}",
        vec![Value::String(type_name.to_string())],
    )
}
