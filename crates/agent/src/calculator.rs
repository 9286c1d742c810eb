use kopi_core::{CalcErrorKind, CalcResult};

/// Word triggers that pair with a number to signal arithmetic intent.
const INTENT_TRIGGERS: &[&str] = &[
    "plus",
    "minus",
    "times",
    "multiplied by",
    "divided by",
    "calculate",
    "compute",
    "what is",
    "equals",
];

/// Word-to-operator substitutions applied before a second extraction pass.
/// Multi-word phrases first so "multiplied by" never degrades to "by".
const WORD_OPERATORS: &[(&str, &str)] = &[
    ("to the power of", "**"),
    ("multiplied by", "*"),
    ("divided by", "/"),
    ("plus", "+"),
    ("minus", "-"),
    ("times", "*"),
    ("over", "/"),
    ("modulo", "%"),
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntentReport {
    pub has_intent: bool,
    pub reason: String,
}

/// Safe arithmetic over natural-language text. No I/O, no global state, and
/// no runtime eval: expressions go through a dedicated parser.
#[derive(Clone, Copy, Debug, Default)]
pub struct Calculator;

impl Calculator {
    pub fn new() -> Self {
        Self
    }

    pub fn detect_intent(&self, text: &str) -> IntentReport {
        if contains_math_expression(text) {
            return IntentReport {
                has_intent: true,
                reason: "numeric tokens separated by an arithmetic operator".to_string(),
            };
        }

        let lowered = text.to_lowercase();
        let has_numbers = lowered.chars().any(|ch| ch.is_ascii_digit());
        if has_numbers {
            if let Some(trigger) =
                INTENT_TRIGGERS.iter().find(|trigger| lowered.contains(*trigger))
            {
                return IntentReport {
                    has_intent: true,
                    reason: format!("trigger word `{trigger}` paired with a number"),
                };
            }
        }

        IntentReport { has_intent: false, reason: "no arithmetic trigger found".to_string() }
    }

    pub fn parse_and_calculate(&self, text: &str) -> CalcResult {
        let intent = self.detect_intent(text);
        if !intent.has_intent {
            return CalcResult::failure(
                CalcErrorKind::NoExpression,
                format!("No arithmetic expression detected: {}.", intent.reason),
                None,
            );
        }

        match self.extract_expression(text) {
            Some(expression) => self.calculate(&expression),
            None => CalcResult::failure(
                CalcErrorKind::NoExpression,
                "Could not extract a mathematical expression from the text.",
                None,
            ),
        }
    }

    /// Extraction rules, applied in order: a bare expression is used
    /// verbatim; otherwise word triggers become operator symbols and the
    /// longest valid span wins.
    pub fn extract_expression(&self, text: &str) -> Option<String> {
        if let Some(expression) = longest_expression_span(text) {
            return Some(expression);
        }

        let mut substituted = text.to_lowercase();
        for (word, symbol) in WORD_OPERATORS {
            substituted = substituted.replace(word, symbol);
        }
        longest_expression_span(&substituted)
    }

    pub fn calculate(&self, expression: &str) -> CalcResult {
        let invalid = expression
            .chars()
            .find(|ch| !matches!(ch, '0'..='9' | '.' | '+' | '-' | '*' | '/' | '%' | '(' | ')') && !ch.is_whitespace());
        if let Some(ch) = invalid {
            return CalcResult::failure(
                CalcErrorKind::InvalidChars,
                format!(
                    "Invalid character `{ch}`. Only numbers and operators (+, -, *, /, %, **, parentheses) are allowed."
                ),
                Some(expression.to_string()),
            );
        }

        let expression = normalize_whitespace(expression);
        match evaluate(&expression) {
            Ok(value) => CalcResult::success(expression, value),
            Err((kind, message)) => CalcResult::failure(kind, message, Some(expression)),
        }
    }
}

fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// True when the text contains a contiguous `number (operator number)+`
/// span, ignoring whitespace between elements.
pub fn contains_math_expression(text: &str) -> bool {
    let bytes: Vec<char> = text.chars().collect();
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index].is_ascii_digit() {
            if math_span_from(&bytes, index) {
                return true;
            }
            while index < bytes.len() && (bytes[index].is_ascii_digit() || bytes[index] == '.') {
                index += 1;
            }
        } else {
            index += 1;
        }
    }
    false
}

fn math_span_from(chars: &[char], start: usize) -> bool {
    let mut index = start;
    let mut numbers = 0;

    loop {
        let digits_start = index;
        while index < chars.len() && (chars[index].is_ascii_digit() || chars[index] == '.') {
            index += 1;
        }
        if index == digits_start {
            return false;
        }
        numbers += 1;

        while index < chars.len() && chars[index].is_whitespace() {
            index += 1;
        }
        let is_operator =
            index < chars.len() && matches!(chars[index], '+' | '-' | '*' | '/' | '%');
        if !is_operator {
            return numbers >= 2;
        }
        while index < chars.len() && matches!(chars[index], '+' | '-' | '*' | '/' | '%') {
            index += 1;
        }
        while index < chars.len() && chars[index].is_whitespace() {
            index += 1;
        }
        if index >= chars.len() || !chars[index].is_ascii_digit() {
            return numbers >= 2;
        }
    }
}

/// Longest run of expression characters that contains at least one digit and
/// one operator with balanced parentheses.
fn longest_expression_span(text: &str) -> Option<String> {
    let mut best: Option<String> = None;
    let mut current = String::new();

    let mut consider = |candidate: &str, best: &mut Option<String>| {
        let trimmed = normalize_whitespace(candidate.trim());
        if !is_plausible_expression(&trimmed) {
            return;
        }
        let longer = best.as_ref().map(|existing| trimmed.len() > existing.len()).unwrap_or(true);
        if longer {
            *best = Some(trimmed);
        }
    };

    for ch in text.chars() {
        if matches!(ch, '0'..='9' | '.' | '+' | '-' | '*' | '/' | '%' | '(' | ')') || ch == ' ' {
            current.push(ch);
        } else {
            consider(&current, &mut best);
            current.clear();
        }
    }
    consider(&current, &mut best);
    best
}

fn is_plausible_expression(candidate: &str) -> bool {
    let has_digit = candidate.chars().any(|ch| ch.is_ascii_digit());
    let has_operator = candidate.chars().any(|ch| matches!(ch, '+' | '-' | '*' | '/' | '%'));
    let mut depth: i32 = 0;
    for ch in candidate.chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    has_digit && has_operator && depth == 0
}

// ---------------------------------------------------------------------------
// Expression evaluation
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Power,
    LeftParen,
    RightParen,
}

type EvalError = (CalcErrorKind, String);

fn evaluate(expression: &str) -> Result<f64, EvalError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, position: 0 };
    let value = parser.parse_expression()?;
    if parser.position != parser.tokens.len() {
        return Err((CalcErrorKind::Syntax, "unexpected trailing input".to_string()));
    }
    if !value.is_finite() {
        return Err((CalcErrorKind::Overflow, "result exceeds the representable range".to_string()));
    }
    Ok(value)
}

fn tokenize(expression: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];
        match ch {
            ch if ch.is_whitespace() => index += 1,
            '0'..='9' | '.' => {
                let start = index;
                while index < chars.len() && (chars[index].is_ascii_digit() || chars[index] == '.')
                {
                    index += 1;
                }
                let literal: String = chars[start..index].iter().collect();
                let value = literal.parse::<f64>().map_err(|_| {
                    (CalcErrorKind::Syntax, format!("`{literal}` is not a valid number"))
                })?;
                tokens.push(Token::Number(value));
            }
            '*' => {
                if chars.get(index + 1) == Some(&'*') {
                    tokens.push(Token::Power);
                    index += 2;
                } else {
                    tokens.push(Token::Star);
                    index += 1;
                }
            }
            '+' => {
                tokens.push(Token::Plus);
                index += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                index += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                index += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                index += 1;
            }
            '(' => {
                tokens.push(Token::LeftParen);
                index += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                index += 1;
            }
            other => {
                return Err((CalcErrorKind::InvalidChars, format!("invalid character `{other}`")))
            }
        }
    }

    if tokens.is_empty() {
        return Err((CalcErrorKind::Syntax, "empty expression".to_string()));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.position).copied()
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.peek();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    /// expression := term (('+' | '-') term)*
    fn parse_expression(&mut self) -> Result<f64, EvalError> {
        let mut value = self.parse_term()?;
        while let Some(token) = self.peek() {
            match token {
                Token::Plus => {
                    self.advance();
                    value += self.parse_term()?;
                }
                Token::Minus => {
                    self.advance();
                    value -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    /// term := unary (('*' | '/' | '%') unary)*
    fn parse_term(&mut self) -> Result<f64, EvalError> {
        let mut value = self.parse_unary()?;
        while let Some(token) = self.peek() {
            match token {
                Token::Star => {
                    self.advance();
                    value *= self.parse_unary()?;
                }
                Token::Slash => {
                    self.advance();
                    let divisor = self.parse_unary()?;
                    if divisor == 0.0 {
                        return Err((
                            CalcErrorKind::DivideByZero,
                            "Division by zero is not allowed.".to_string(),
                        ));
                    }
                    value /= divisor;
                }
                Token::Percent => {
                    self.advance();
                    let divisor = self.parse_unary()?;
                    if divisor == 0.0 {
                        return Err((
                            CalcErrorKind::DivideByZero,
                            "Modulo by zero is not allowed.".to_string(),
                        ));
                    }
                    value %= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    /// unary := ('-' | '+') unary | power
    /// `**` binds tighter than unary minus, so -2 ** 2 is -(2 ** 2).
    fn parse_unary(&mut self) -> Result<f64, EvalError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(-self.parse_unary()?)
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    /// power := primary ('**' unary)?   (right-associative)
    fn parse_power(&mut self) -> Result<f64, EvalError> {
        let base = self.parse_primary()?;
        if self.peek() == Some(Token::Power) {
            self.advance();
            let exponent = self.parse_unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<f64, EvalError> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::LeftParen) => {
                let value = self.parse_expression()?;
                match self.advance() {
                    Some(Token::RightParen) => Ok(value),
                    _ => Err((CalcErrorKind::Syntax, "missing closing parenthesis".to_string())),
                }
            }
            other => Err((CalcErrorKind::Syntax, format!("unexpected token {other:?}"))),
        }
    }
}
