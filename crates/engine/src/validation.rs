//! Per-field validation state over a declarative rule set.
//!
//! Each `validate_field` call opens a new pass for that field. Sync rules run
//! first, in registration order, and the first failure wins. Async rules run
//! only when every sync rule passed; the field sits in `loading` until they
//! settle. A pass that has been superseded by a newer one (or by teardown)
//! leaves the state untouched when it finishes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use draftsync_core::{FieldValue, Fields};
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ValidationConfig;
use crate::debounce::{DebounceError, Debouncer};
use crate::rules::{AsyncCheck, Check, Rule, RuleError, RuleResult};

type RuleDebouncer = Debouncer<(FieldValue, Fields), Option<String>, RuleError>;

#[derive(Default)]
struct ValidationState {
    errors: BTreeMap<String, String>,
    touched: BTreeSet<String>,
    loading: BTreeSet<String>,
    values: Fields,
    passes: HashMap<String, u64>,
    torn_down: bool,
}

impl ValidationState {
    fn begin_pass(&mut self, field: &str) -> u64 {
        let pass = self.passes.entry(field.to_string()).or_insert(0);
        *pass += 1;
        *pass
    }

    fn is_current(&self, field: &str, pass: u64) -> bool {
        !self.torn_down && self.passes.get(field) == Some(&pass)
    }
}

enum AsyncVerdict {
    Settled(Option<String>),
    Cancelled,
}

pub struct ValidationEngine {
    rules: Vec<Rule>,
    config: ValidationConfig,
    state: Mutex<ValidationState>,
    debouncers: Mutex<HashMap<(String, usize), Arc<RuleDebouncer>>>,
}

impl ValidationEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self::with_config(rules, ValidationConfig::default())
    }

    pub fn with_config(rules: Vec<Rule>, config: ValidationConfig) -> Self {
        Self {
            rules,
            config,
            state: Mutex::new(ValidationState::default()),
            debouncers: Mutex::new(HashMap::new()),
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Fields that have at least one rule, in name order.
    pub fn rule_fields(&self) -> BTreeSet<String> {
        self.rules.iter().map(|r| r.field.clone()).collect()
    }

    /// Seed the values `validate_all` reads and rules see as the whole draft.
    pub fn set_values(&self, values: Fields) {
        self.state.lock().values = values;
    }

    /// Validate one field against its rules.
    ///
    /// Returns the message this pass produced. If a newer pass for the same
    /// field started meanwhile, the shared state keeps the newer result.
    pub async fn validate_field(&self, field: &str, value: FieldValue) -> Option<String> {
        let (pass, values) = {
            let mut state = self.state.lock();
            if state.torn_down {
                return None;
            }
            state.values.insert(field.to_string(), value.clone());
            (state.begin_pass(field), state.values.clone())
        };

        let rules: Vec<(usize, &Rule)> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.field == field)
            .collect();

        for (_, rule) in &rules {
            let Some(Check::Sync(check)) = &rule.check else {
                continue;
            };
            let result = catch_unwind(AssertUnwindSafe(|| check(&value, &values)))
                .unwrap_or_else(|_| Err(RuleError("validator panicked".into())));
            if let Some(message) = self.verdict(field, rule, result) {
                // Older passes waiting on a debounced check have nothing left to decide.
                self.cancel_field_timers(field);
                self.settle(field, pass, Some(message.clone()));
                return Some(message);
            }
        }

        let async_rules: Vec<(usize, &Rule, &AsyncCheck)> = rules
            .iter()
            .filter_map(|&(idx, rule)| match &rule.check {
                Some(Check::Async(check)) => Some((idx, rule, check)),
                _ => None,
            })
            .collect();

        if async_rules.is_empty() {
            self.settle(field, pass, None);
            return None;
        }

        {
            let mut state = self.state.lock();
            if !state.is_current(field, pass) {
                return None;
            }
            state.errors.remove(field);
            state.loading.insert(field.to_string());
        }

        for (idx, rule, check) in async_rules {
            let verdict = self
                .run_async(field, idx, rule, check, value.clone(), values.clone())
                .await;
            match verdict {
                AsyncVerdict::Cancelled => return None,
                AsyncVerdict::Settled(Some(message)) => {
                    self.settle(field, pass, Some(message.clone()));
                    return Some(message);
                }
                AsyncVerdict::Settled(None) => {
                    if !self.state.lock().is_current(field, pass) {
                        return None;
                    }
                }
            }
        }

        self.settle(field, pass, None);
        None
    }

    /// Validate every field that has rules, concurrently, and return the
    /// resulting error map once all passes have settled.
    pub async fn validate_all(&self) -> BTreeMap<String, String> {
        let values = self.state.lock().values.clone();
        let fields = self.rule_fields();
        join_all(fields.iter().map(|field| {
            let value = values.get(field).cloned().unwrap_or_default();
            self.validate_field(field, value)
        }))
        .await;
        self.errors()
    }

    pub fn touch_field(&self, field: &str) {
        self.state.lock().touched.insert(field.to_string());
    }

    pub fn touch_all(&self) {
        let fields = self.rule_fields();
        self.state.lock().touched.extend(fields);
    }

    pub fn is_touched(&self, field: &str) -> bool {
        self.state.lock().touched.contains(field)
    }

    /// The field's error, surfaced only once the field has been touched.
    pub fn field_error(&self, field: &str) -> Option<String> {
        let state = self.state.lock();
        if !state.touched.contains(field) {
            return None;
        }
        state.errors.get(field).cloned()
    }

    /// All current errors, touched or not.
    pub fn errors(&self) -> BTreeMap<String, String> {
        self.state.lock().errors.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().errors.is_empty()
    }

    pub fn is_loading(&self, field: &str) -> bool {
        self.state.lock().loading.contains(field)
    }

    pub fn loading_fields(&self) -> BTreeSet<String> {
        self.state.lock().loading.clone()
    }

    pub fn clear_field_error(&self, field: &str) {
        self.state.lock().errors.remove(field);
    }

    /// Forget errors, touched markers and in-flight passes.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.errors.clear();
            state.touched.clear();
            state.loading.clear();
            for pass in state.passes.values_mut() {
                *pass += 1;
            }
        }
        self.cancel_timers();
    }

    /// Cancel every async-rule timer and discard results still in flight.
    pub fn teardown(&self) {
        {
            let mut state = self.state.lock();
            state.torn_down = true;
            state.loading.clear();
        }
        self.cancel_timers();
    }

    fn cancel_timers(&self) {
        for debouncer in self.debouncers.lock().values() {
            debouncer.cancel();
        }
    }

    fn cancel_field_timers(&self, field: &str) {
        for ((owner, _), debouncer) in self.debouncers.lock().iter() {
            if owner == field {
                debouncer.cancel();
            }
        }
    }

    fn verdict(&self, field: &str, rule: &Rule, result: RuleResult) -> Option<String> {
        match result {
            Ok(Some(message)) => {
                let message = rule.message.clone().unwrap_or(message);
                debug!(field, %message, "validation failed");
                Some(message)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(field, error = %e, "validator raised an error");
                Some(self.config.fault_message.clone())
            }
        }
    }

    /// Record the outcome of `pass` if it is still the field's latest.
    fn settle(&self, field: &str, pass: u64, error: Option<String>) {
        let mut state = self.state.lock();
        if !state.is_current(field, pass) {
            return;
        }
        state.loading.remove(field);
        match error {
            Some(message) => {
                state.errors.insert(field.to_string(), message);
            }
            None => {
                state.errors.remove(field);
            }
        }
    }

    async fn run_async(
        &self,
        field: &str,
        idx: usize,
        rule: &Rule,
        check: &AsyncCheck,
        value: FieldValue,
        values: Fields,
    ) -> AsyncVerdict {
        let delay = rule
            .debounce
            .unwrap_or(Duration::from_millis(self.config.async_debounce_ms));

        let result = if delay.is_zero() {
            run_guarded(Arc::clone(check), value, values).await
        } else {
            let debouncer = self.debouncer_for(field, idx, check, delay);
            match debouncer.call((value, values)).await {
                Ok(outcome) => Ok(outcome),
                Err(DebounceError::Failed(e)) => Err(e),
                Err(DebounceError::Cancelled) => return AsyncVerdict::Cancelled,
            }
        };
        AsyncVerdict::Settled(self.verdict(field, rule, result))
    }

    fn debouncer_for(
        &self,
        field: &str,
        idx: usize,
        check: &AsyncCheck,
        delay: Duration,
    ) -> Arc<RuleDebouncer> {
        let mut debouncers = self.debouncers.lock();
        let debouncer = debouncers
            .entry((field.to_string(), idx))
            .or_insert_with(|| {
                let check = Arc::clone(check);
                Arc::new(Debouncer::new(delay, move |(value, values): (FieldValue, Fields)| {
                    run_guarded(Arc::clone(&check), value, values)
                }))
            });
        Arc::clone(debouncer)
    }
}

/// Run an async check on its own task so a panicking validator turns into an
/// ordinary rule error.
async fn run_guarded(check: AsyncCheck, value: FieldValue, values: Fields) -> RuleResult {
    match tokio::spawn(check(value, values)).await {
        Ok(result) => result,
        Err(e) => Err(RuleError(format!("validator task failed: {e}"))),
    }
}
