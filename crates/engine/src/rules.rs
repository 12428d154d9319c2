//! Rule descriptors and the built-in rule constructors.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use draftsync_core::{FieldValue, Fields};
use futures::future::BoxFuture;
use regex::Regex;
use thiserror::Error;

/// A validator that could not produce a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RuleError(pub String);

pub type RuleResult = Result<Option<String>, RuleError>;

pub type SyncCheck = Arc<dyn Fn(&FieldValue, &Fields) -> RuleResult + Send + Sync>;
pub type AsyncCheck =
    Arc<dyn Fn(FieldValue, Fields) -> BoxFuture<'static, RuleResult> + Send + Sync>;

#[derive(Clone)]
pub enum Check {
    Sync(SyncCheck),
    Async(AsyncCheck),
}

/// One validation rule for one field.
///
/// A check returns `Ok(Some(message))` when the value is invalid. A rule
/// without a check always passes.
#[derive(Clone)]
pub struct Rule {
    pub field: String,
    pub check: Option<Check>,
    /// Replaces whatever message the check reports.
    pub message: Option<String>,
    /// Delay before an async check runs; ignored for sync checks.
    pub debounce: Option<Duration>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.check {
            Some(Check::Sync(_)) => "sync",
            Some(Check::Async(_)) => "async",
            None => "none",
        };
        f.debug_struct("Rule")
            .field("field", &self.field)
            .field("check", &kind)
            .field("message", &self.message)
            .field("debounce", &self.debounce)
            .finish()
    }
}

impl Rule {
    /// A rule with no check.
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
            check: None,
            message: None,
            debounce: None,
        }
    }

    pub fn check<F>(field: &str, check: F) -> Self
    where
        F: Fn(&FieldValue, &Fields) -> RuleResult + Send + Sync + 'static,
    {
        Self {
            check: Some(Check::Sync(Arc::new(check))),
            ..Self::new(field)
        }
    }

    pub fn check_async<F, Fut>(field: &str, check: F) -> Self
    where
        F: Fn(FieldValue, Fields) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RuleResult> + Send + 'static,
    {
        let check: AsyncCheck = Arc::new(
            move |value: FieldValue, fields: Fields| -> BoxFuture<'static, RuleResult> {
                Box::pin(check(value, fields))
            },
        );
        Self {
            check: Some(Check::Async(check)),
            ..Self::new(field)
        }
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn debounce(mut self, delay: Duration) -> Self {
        self.debounce = Some(delay);
        self
    }

    pub fn is_async(&self) -> bool {
        matches!(self.check, Some(Check::Async(_)))
    }
}

/// Whether a value satisfies `required`.
///
/// Null, blank text and empty lists are missing. `0`, `false` and objects
/// (empty or not) count as present.
pub fn is_present(value: &FieldValue) -> bool {
    match value {
        FieldValue::Null => false,
        FieldValue::Text(s) => !s.trim().is_empty(),
        FieldValue::List(items) => !items.is_empty(),
        FieldValue::Integer(_)
        | FieldValue::Float(_)
        | FieldValue::Boolean(_)
        | FieldValue::Object(_) => true,
    }
}

pub fn required(field: &str) -> Rule {
    Rule::check(field, |value, _| {
        Ok((!is_present(value)).then(|| "This field is required".to_string()))
    })
}

/// Text shorter than `min` characters (or a list with fewer items) fails.
/// Missing values pass; pair with [`required`] to reject them.
pub fn min_length(field: &str, min: usize) -> Rule {
    Rule::check(field, move |value, _| {
        Ok(match value.len() {
            Some(len) if is_present(value) && len < min => {
                Some(format!("Must be at least {min} characters"))
            }
            _ => None,
        })
    })
}

pub fn max_length(field: &str, max: usize) -> Rule {
    Rule::check(field, move |value, _| {
        Ok(match value.len() {
            Some(len) if len > max => Some(format!("Must be at most {max} characters")),
            _ => None,
        })
    })
}

/// Text must match `pattern`. Blank and non-text values pass.
pub fn pattern(field: &str, pattern: &str) -> Result<Rule, regex::Error> {
    let regex = Regex::new(pattern)?;
    Ok(Rule::check(field, move |value, _| {
        Ok(match value.as_text() {
            Some(text) if !text.trim().is_empty() && !regex.is_match(text) => {
                Some("Invalid format".to_string())
            }
            _ => None,
        })
    }))
}

/// Numeric value within `[min, max]`. Non-numeric values pass.
pub fn range(field: &str, min: f64, max: f64) -> Rule {
    Rule::check(field, move |value, _| {
        Ok(match value.as_float() {
            Some(n) if n < min || n > max => Some(format!("Must be between {min} and {max}")),
            _ => None,
        })
    })
}

/// Arbitrary sync check; shorthand for [`Rule::check`].
pub fn custom<F>(field: &str, check: F) -> Rule
where
    F: Fn(&FieldValue, &Fields) -> RuleResult + Send + Sync + 'static,
{
    Rule::check(field, check)
}

pub fn custom_async<F, Fut>(field: &str, check: F) -> Rule
where
    F: Fn(FieldValue, Fields) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RuleResult> + Send + 'static,
{
    Rule::check_async(field, check)
}
