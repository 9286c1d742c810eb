use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcErrorKind {
    NoExpression,
    InvalidChars,
    Syntax,
    DivideByZero,
    Overflow,
    Other,
}

/// Outcome of one calculator invocation. The two-variant shape makes the
/// "a failed result never carries a value" invariant structural.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "CalcResultWire", into = "CalcResultWire")]
pub enum CalcResult {
    Success {
        expression: String,
        value: f64,
        formatted: String,
    },
    Failure {
        expression: Option<String>,
        error_kind: CalcErrorKind,
        error_message: String,
    },
}

impl CalcResult {
    pub fn success(expression: impl Into<String>, value: f64) -> Self {
        let expression = expression.into();
        let formatted = format!("{expression} = {}", format_value(value));
        Self::Success { expression, value, formatted }
    }

    pub fn failure(
        kind: CalcErrorKind,
        message: impl Into<String>,
        expression: Option<String>,
    ) -> Self {
        Self::Failure { expression, error_kind: kind, error_message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Success { value, .. } => Some(*value),
            Self::Failure { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<CalcErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error_kind, .. } => Some(*error_kind),
        }
    }
}

/// Integer-valued results print without a fractional part; everything else
/// rounds to six decimals.
pub fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", (value * 1e6).round() / 1e6)
    }
}

#[derive(Serialize, Deserialize)]
struct CalcResultWire {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    formatted: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_kind: Option<CalcErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl From<CalcResult> for CalcResultWire {
    fn from(result: CalcResult) -> Self {
        match result {
            CalcResult::Success { expression, value, formatted } => Self {
                ok: true,
                expression: Some(expression),
                value: Some(value),
                formatted: Some(formatted),
                error_kind: None,
                error_message: None,
            },
            CalcResult::Failure { expression, error_kind, error_message } => Self {
                ok: false,
                expression,
                value: None,
                formatted: None,
                error_kind: Some(error_kind),
                error_message: Some(error_message),
            },
        }
    }
}

impl From<CalcResultWire> for CalcResult {
    fn from(wire: CalcResultWire) -> Self {
        match (wire.ok, wire.value, wire.expression) {
            (true, Some(value), Some(expression)) => CalcResult::success(expression, value),
            (_, _, expression) => CalcResult::Failure {
                expression,
                error_kind: wire.error_kind.unwrap_or(CalcErrorKind::Other),
                error_message: wire.error_message.unwrap_or_else(|| "unknown error".to_string()),
            },
        }
    }
}
