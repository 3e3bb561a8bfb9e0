//! RSQL filter expressions over target field data.
//!
//! [`FilterExpression::parse`] validates syntax and the field whitelist.
//! [`FilterMatcher`] evaluates a parsed expression against a
//! [`TargetFieldData`] snapshot and never fails.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use fleetgate_core::{AppError, AppResult};

use crate::field_data::TargetFieldData;

/// Whitelisted target fields addressable from filter expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetField {
    /// Controller id alias.
    Id,
    /// Controller id.
    ControllerId,
    /// Display name.
    Name,
    /// Description.
    Description,
    /// Update status storage value.
    UpdateStatus,
    /// Last reported network address.
    IpAddress,
    /// Target type key.
    TargetType,
    /// Assigned distribution set id.
    AssignedDs,
    /// Installed distribution set id.
    InstalledDs,
    /// Last poll timestamp in epoch millis.
    LastControllerRequestAt,
    /// Creation timestamp in epoch millis.
    CreatedAt,
    /// Tag name.
    Tag,
    /// Controller attribute, addressed by sub-key.
    Attribute,
    /// Metadata entry, addressed by sub-key.
    Metadata,
}

impl TargetField {
    /// Every whitelisted field.
    pub const ALL: [Self; 14] = [
        Self::Id,
        Self::ControllerId,
        Self::Name,
        Self::Description,
        Self::UpdateStatus,
        Self::IpAddress,
        Self::TargetType,
        Self::AssignedDs,
        Self::InstalledDs,
        Self::LastControllerRequestAt,
        Self::CreatedAt,
        Self::Tag,
        Self::Attribute,
        Self::Metadata,
    ];

    /// Returns the lowercase field name used in expressions and field data.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::ControllerId => "controllerid",
            Self::Name => "name",
            Self::Description => "description",
            Self::UpdateStatus => "updatestatus",
            Self::IpAddress => "ipaddress",
            Self::TargetType => "targettype",
            Self::AssignedDs => "assignedds",
            Self::InstalledDs => "installedds",
            Self::LastControllerRequestAt => "lastcontrollerrequestat",
            Self::CreatedAt => "createdat",
            Self::Tag => "tag",
            Self::Attribute => "attribute",
            Self::Metadata => "metadata",
        }
    }

    /// Resolves a field name case-insensitively.
    pub fn parse(name: &str) -> AppResult<Self> {
        let normalized = name.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|field| field.key() == normalized)
            .ok_or_else(|| AppError::Validation(format!("unknown filter field '{name}'")))
    }

    /// Returns true for map fields that require a sub-key.
    #[must_use]
    pub fn is_map(&self) -> bool {
        matches!(self, Self::Attribute | Self::Metadata)
    }
}

/// Field reference with an optional sub-key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    field: TargetField,
    sub_key: Option<String>,
}

impl FieldPath {
    /// Parses `field` or `field.subkey`.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let (name, sub_key) = match raw.split_once('.') {
            Some((name, sub_key)) => (name, Some(sub_key)),
            None => (raw, None),
        };
        let field = TargetField::parse(name)?;

        match (field.is_map(), sub_key) {
            (true, Some(sub_key)) if !sub_key.is_empty() => Ok(Self {
                field,
                sub_key: Some(sub_key.to_owned()),
            }),
            (true, _) => Err(AppError::Validation(format!(
                "filter field '{}' requires a sub-key",
                field.key()
            ))),
            (false, None) => Ok(Self {
                field,
                sub_key: None,
            }),
            (false, Some(_)) => Err(AppError::Validation(format!(
                "filter field '{}' does not accept a sub-key",
                field.key()
            ))),
        }
    }

    /// Returns the field.
    #[must_use]
    pub fn field(&self) -> TargetField {
        self.field
    }

    /// Returns the sub-key.
    #[must_use]
    pub fn sub_key(&self) -> Option<&str> {
        self.sub_key.as_deref()
    }

    /// Returns the key used to look values up in field data.
    #[must_use]
    pub fn data_key(&self) -> String {
        match &self.sub_key {
            Some(sub_key) => format!("{}.{sub_key}", self.field.key()),
            None => self.field.key().to_owned(),
        }
    }
}

impl Display for FieldPath {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.data_key().as_str())
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    /// `==`, supports `*` wildcards.
    Equal,
    /// `!=`, supports `*` wildcards.
    NotEqual,
    /// `=gt=` or `>`.
    GreaterThan,
    /// `=ge=` or `>=`.
    GreaterThanOrEqual,
    /// `=lt=` or `<`.
    LessThan,
    /// `=le=` or `<=`.
    LessThanOrEqual,
    /// `=in=`.
    In,
    /// `=out=`.
    Out,
}

// Longest spellings first so `>=` wins over `>`.
const OPERATOR_SPELLINGS: [(&str, ComparisonOperator); 12] = [
    ("=out=", ComparisonOperator::Out),
    ("=gt=", ComparisonOperator::GreaterThan),
    ("=ge=", ComparisonOperator::GreaterThanOrEqual),
    ("=lt=", ComparisonOperator::LessThan),
    ("=le=", ComparisonOperator::LessThanOrEqual),
    ("=in=", ComparisonOperator::In),
    ("==", ComparisonOperator::Equal),
    ("!=", ComparisonOperator::NotEqual),
    (">=", ComparisonOperator::GreaterThanOrEqual),
    ("<=", ComparisonOperator::LessThanOrEqual),
    (">", ComparisonOperator::GreaterThan),
    ("<", ComparisonOperator::LessThan),
];

impl ComparisonOperator {
    /// Returns the canonical spelling.
    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::GreaterThan => "=gt=",
            Self::GreaterThanOrEqual => "=ge=",
            Self::LessThan => "=lt=",
            Self::LessThanOrEqual => "=le=",
            Self::In => "=in=",
            Self::Out => "=out=",
        }
    }

    /// Returns true for operators taking a list argument.
    #[must_use]
    pub fn accepts_list(&self) -> bool {
        matches!(self, Self::In | Self::Out)
    }
}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpression {
    /// Every child must match.
    And(Vec<FilterExpression>),
    /// At least one child must match.
    Or(Vec<FilterExpression>),
    /// Single field comparison.
    Comparison {
        /// Compared field.
        path: FieldPath,
        /// Operator.
        operator: ComparisonOperator,
        /// One argument, or several for `=in=`/`=out=`.
        arguments: Vec<String>,
    },
}

impl FilterExpression {
    /// Parses and validates a filter query.
    pub fn parse(query: &str) -> AppResult<Self> {
        let mut parser = Parser::new(query);
        parser.skip_whitespace();
        if parser.at_end() {
            return Err(AppError::Validation(
                "filter query must not be empty".to_owned(),
            ));
        }

        let expression = parser.parse_or()?;
        parser.skip_whitespace();
        if !parser.at_end() {
            return Err(parser.error("unexpected input"));
        }

        Ok(expression)
    }
}

struct Parser {
    chars: Vec<char>,
    position: usize,
}

impl Parser {
    fn new(query: &str) -> Self {
        Self {
            chars: query.chars().collect(),
            position: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.position >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.position += 1;
        }
    }

    fn error(&self, message: &str) -> AppError {
        AppError::Validation(format!(
            "invalid filter query at position {}: {message}",
            self.position
        ))
    }

    fn starts_with_ignore_case(&self, token: &str) -> bool {
        let mut offset = self.position;
        for expected in token.chars() {
            match self.chars.get(offset) {
                Some(actual) if actual.eq_ignore_ascii_case(&expected) => offset += 1,
                _ => return false,
            }
        }
        true
    }

    /// Consumes `;`/`,` or a whitespace-delimited `and`/`or` keyword.
    fn consume_logical(&mut self, symbol: char, keyword: &str) -> bool {
        self.skip_whitespace();
        if self.peek() == Some(symbol) {
            self.position += 1;
            return true;
        }

        if self.starts_with_ignore_case(keyword) {
            let follower = self.chars.get(self.position + keyword.len()).copied();
            if follower.is_some_and(|next| next.is_whitespace() || next == '(') {
                self.position += keyword.len();
                return true;
            }
        }

        false
    }

    fn parse_or(&mut self) -> AppResult<FilterExpression> {
        let mut children = vec![self.parse_and()?];
        while self.consume_logical(',', "or") {
            children.push(self.parse_and()?);
        }

        Ok(collapse(children, FilterExpression::Or))
    }

    fn parse_and(&mut self) -> AppResult<FilterExpression> {
        let mut children = vec![self.parse_term()?];
        while self.consume_logical(';', "and") {
            children.push(self.parse_term()?);
        }

        Ok(collapse(children, FilterExpression::And))
    }

    fn parse_term(&mut self) -> AppResult<FilterExpression> {
        self.skip_whitespace();
        if self.peek() == Some('(') {
            self.position += 1;
            let expression = self.parse_or()?;
            self.skip_whitespace();
            if self.peek() != Some(')') {
                return Err(self.error("expected ')'"));
            }
            self.position += 1;
            return Ok(expression);
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> AppResult<FilterExpression> {
        let start = self.position;
        while self
            .peek()
            .is_some_and(|next| !is_reserved(next) && !matches!(next, '=' | '!' | '<' | '>'))
        {
            self.position += 1;
        }
        if self.position == start {
            return Err(self.error("expected field name"));
        }

        let raw_field: String = self.chars[start..self.position].iter().collect();
        let path = FieldPath::parse(raw_field.as_str())?;

        self.skip_whitespace();
        let operator = self.parse_operator()?;
        self.skip_whitespace();

        let arguments = if self.peek() == Some('(') {
            if !operator.accepts_list() {
                return Err(self.error(&format!(
                    "operator '{}' does not accept a list argument",
                    operator.symbol()
                )));
            }
            self.parse_list()?
        } else {
            vec![self.parse_value()?]
        };

        Ok(FilterExpression::Comparison {
            path,
            operator,
            arguments,
        })
    }

    fn parse_operator(&mut self) -> AppResult<ComparisonOperator> {
        for (spelling, operator) in OPERATOR_SPELLINGS {
            if self.starts_with_ignore_case(spelling) {
                self.position += spelling.len();
                return Ok(operator);
            }
        }

        Err(self.error("expected comparison operator"))
    }

    fn parse_list(&mut self) -> AppResult<Vec<String>> {
        self.position += 1;
        let mut values = Vec::new();
        loop {
            self.skip_whitespace();
            values.push(self.parse_value()?);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => self.position += 1,
                Some(')') => {
                    self.position += 1;
                    return Ok(values);
                }
                _ => return Err(self.error("expected ',' or ')' in argument list")),
            }
        }
    }

    fn parse_value(&mut self) -> AppResult<String> {
        match self.peek() {
            Some(quote @ ('\'' | '"')) => self.parse_quoted(quote),
            _ => {
                let start = self.position;
                while self.peek().is_some_and(|next| !is_reserved(next)) {
                    self.position += 1;
                }
                if self.position == start {
                    return Err(self.error("expected value"));
                }
                Ok(self.chars[start..self.position].iter().collect())
            }
        }
    }

    fn parse_quoted(&mut self, quote: char) -> AppResult<String> {
        self.position += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated quoted value")),
                Some('\\') => {
                    self.position += 1;
                    match self.peek() {
                        Some(escaped) => {
                            value.push(escaped);
                            self.position += 1;
                        }
                        None => return Err(self.error("dangling escape")),
                    }
                }
                Some(next) if next == quote => {
                    self.position += 1;
                    return Ok(value);
                }
                Some(next) => {
                    value.push(next);
                    self.position += 1;
                }
            }
        }
    }
}

fn is_reserved(next: char) -> bool {
    next.is_whitespace() || matches!(next, '(' | ')' | ';' | ',' | '\'' | '"')
}

fn collapse(
    mut children: Vec<FilterExpression>,
    combine: fn(Vec<FilterExpression>) -> FilterExpression,
) -> FilterExpression {
    if children.len() == 1 {
        return children.remove(0);
    }
    combine(children)
}

/// Evaluates filter expressions against target field data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterMatcher {
    ignore_case: bool,
}

impl Default for FilterMatcher {
    fn default() -> Self {
        Self { ignore_case: true }
    }
}

impl FilterMatcher {
    /// Creates a matcher with the given case sensitivity.
    #[must_use]
    pub fn new(ignore_case: bool) -> Self {
        Self { ignore_case }
    }

    /// Returns whether string comparisons ignore case.
    #[must_use]
    pub fn ignore_case(&self) -> bool {
        self.ignore_case
    }

    /// Returns true when the field data satisfies the expression.
    #[must_use]
    pub fn matches(&self, expression: &FilterExpression, data: &TargetFieldData) -> bool {
        match expression {
            FilterExpression::And(children) => {
                children.iter().all(|child| self.matches(child, data))
            }
            FilterExpression::Or(children) => {
                children.iter().any(|child| self.matches(child, data))
            }
            FilterExpression::Comparison {
                path,
                operator,
                arguments,
            } => self.compare(data.values(path.data_key().as_str()), *operator, arguments),
        }
    }

    /// Parses and evaluates a query; unparseable queries never match.
    #[must_use]
    pub fn matches_query(&self, query: &str, data: &TargetFieldData) -> bool {
        FilterExpression::parse(query)
            .map(|expression| self.matches(&expression, data))
            .unwrap_or(false)
    }

    fn compare(&self, values: &[String], operator: ComparisonOperator, arguments: &[String]) -> bool {
        let Some(first) = arguments.first() else {
            return false;
        };

        match operator {
            ComparisonOperator::Equal => {
                if values.is_empty() {
                    return first.is_empty();
                }
                values.iter().any(|value| self.glob(first, value))
            }
            ComparisonOperator::NotEqual => {
                !values.is_empty() && !values.iter().any(|value| self.glob(first, value))
            }
            ComparisonOperator::In => self.any_member(values, arguments),
            ComparisonOperator::Out => !self.any_member(values, arguments),
            ComparisonOperator::GreaterThan => {
                self.any_ordered(values, first, |ordering| ordering == Ordering::Greater)
            }
            ComparisonOperator::GreaterThanOrEqual => {
                self.any_ordered(values, first, |ordering| ordering != Ordering::Less)
            }
            ComparisonOperator::LessThan => {
                self.any_ordered(values, first, |ordering| ordering == Ordering::Less)
            }
            ComparisonOperator::LessThanOrEqual => {
                self.any_ordered(values, first, |ordering| ordering != Ordering::Greater)
            }
        }
    }

    fn fold(&self, value: &str) -> String {
        if self.ignore_case {
            value.to_lowercase()
        } else {
            value.to_owned()
        }
    }

    fn glob(&self, pattern: &str, value: &str) -> bool {
        let pattern: Vec<char> = self.fold(pattern).chars().collect();
        let value: Vec<char> = self.fold(value).chars().collect();
        glob_match(&pattern, &value)
    }

    fn any_member(&self, values: &[String], arguments: &[String]) -> bool {
        values.iter().any(|value| {
            let value = self.fold(value);
            arguments
                .iter()
                .any(|argument| self.fold(argument) == value)
        })
    }

    fn any_ordered(
        &self,
        values: &[String],
        argument: &str,
        accept: impl Fn(Ordering) -> bool,
    ) -> bool {
        values
            .iter()
            .any(|value| self.order(value, argument).is_some_and(&accept))
    }

    fn order(&self, value: &str, argument: &str) -> Option<Ordering> {
        match (parse_number(value), parse_number(argument)) {
            (Some(left), Some(right)) => left.partial_cmp(&right),
            _ => Some(self.fold(value).cmp(&self.fold(argument))),
        }
    }
}

fn parse_number(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
}

fn glob_match(pattern: &[char], value: &[char]) -> bool {
    let (mut pattern_index, mut value_index) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while value_index < value.len() {
        match pattern.get(pattern_index) {
            Some('*') => {
                backtrack = Some((pattern_index, value_index));
                pattern_index += 1;
            }
            Some(expected) if *expected == value[value_index] => {
                pattern_index += 1;
                value_index += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    pattern_index = star + 1;
                    value_index = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[pattern_index..].iter().all(|next| *next == '*')
}

#[cfg(test)]
mod tests;
