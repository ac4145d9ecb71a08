//! Fan-out of a task over a list of items.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::models::{json_get, json_set, TaskExecution};
use crate::error::{AppError, AppResult};
use crate::expression::{DataContext, Evaluator};
use crate::spec::{ItemsSource, WithItemsClause};

use super::states::State;

const WITH_ITEMS_KEY: &str = "with_items";

/// Bookkeeping kept in `runtime_context.with_items`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct WithItemsState {
    pub count: usize,
    /// Zero means unbounded.
    pub concurrency: usize,
    /// Free slots when bounded.
    pub capacity: usize,
    pub next_index: usize,
}

impl WithItemsState {
    pub(crate) fn new(count: usize, concurrency: usize) -> Self {
        Self {
            count,
            concurrency,
            capacity: concurrency,
            next_index: 0,
        }
    }

    pub(crate) fn load(task_ex: &TaskExecution) -> Option<Self> {
        json_get(&task_ex.runtime_context, WITH_ITEMS_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub(crate) fn save(&self, task_ex: &mut TaskExecution) -> AppResult<()> {
        json_set(&mut task_ex.runtime_context, WITH_ITEMS_KEY, serde_json::to_value(self)?);
        Ok(())
    }

    /// Whether another item may be scheduled now.
    pub(crate) fn can_schedule(&self) -> bool {
        self.next_index < self.count && (self.concurrency == 0 || self.capacity > 0)
    }

    pub(crate) fn take_slot(&mut self) {
        self.next_index += 1;
        if self.concurrency > 0 {
            self.capacity = self.capacity.saturating_sub(1);
        }
    }

    pub(crate) fn release_slot(&mut self) {
        if self.concurrency > 0 {
            self.capacity = (self.capacity + 1).min(self.concurrency);
        }
    }

    pub(crate) fn all_scheduled(&self) -> bool {
        self.next_index >= self.count
    }
}

/// Item variables per index. Clauses are zipped and must have equal lengths.
pub(crate) fn evaluate_items(
    evaluator: &dyn Evaluator,
    clauses: &[WithItemsClause],
    ctx: &DataContext,
) -> AppResult<Vec<Map<String, Value>>> {
    let mut columns: Vec<(&str, Vec<Value>)> = Vec::with_capacity(clauses.len());
    for clause in clauses {
        let values = match &clause.source {
            ItemsSource::List(items) => items.clone(),
            ItemsSource::Expression(expression) => {
                match evaluator.evaluate_expression(expression, ctx)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(AppError::Validation(format!(
                            "with-items expression '{}' must evaluate to a list, got {}",
                            expression, other
                        )))
                    }
                }
            }
        };
        columns.push((clause.var.as_str(), values));
    }

    let count = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
    if let Some((var, values)) = columns.iter().find(|(_, v)| v.len() != count) {
        return Err(AppError::Validation(format!(
            "with-items lists must have equal lengths [{}={}, expected={}]",
            var,
            values.len(),
            count
        )));
    }

    Ok((0..count)
        .map(|i| {
            columns
                .iter()
                .map(|(var, values)| (var.to_string(), values[i].clone()))
                .collect()
        })
        .collect())
}

/// Final state of a with-items task from the states of its item runs.
pub(crate) fn final_state(states: &[State]) -> (State, Option<String>) {
    if states.iter().any(|s| s.is_cancelled()) {
        (
            State::Cancelled,
            Some("One or more actions was cancelled.".to_string()),
        )
    } else if states.iter().any(|s| s.is_error()) {
        (State::Error, Some("One or more actions had failed.".to_string()))
    } else {
        (State::Success, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::JinjaEvaluator;
    use crate::spec::parse_with_items;
    use serde_json::json;

    #[test]
    fn test_zip_clauses() {
        let clauses = parse_with_items(&[
            "x in [1, 2, 3]".to_string(),
            "name in names".to_string(),
        ])
        .unwrap();
        let mut ctx = DataContext::new();
        ctx.insert("names".to_string(), json!(["a", "b", "c"]));

        let items = evaluate_items(&JinjaEvaluator::new(), &clauses, &ctx).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1]["x"], json!(2));
        assert_eq!(items[1]["name"], json!("b"));
    }

    #[test]
    fn test_unequal_lengths_rejected() {
        let clauses =
            parse_with_items(&["x in [1, 2]".to_string(), "y in [1]".to_string()]).unwrap();
        let err = evaluate_items(&JinjaEvaluator::new(), &clauses, &DataContext::new()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_non_list_expression_rejected() {
        let clauses = parse_with_items(&["x in value".to_string()]).unwrap();
        let mut ctx = DataContext::new();
        ctx.insert("value".to_string(), json!(5));
        assert!(evaluate_items(&JinjaEvaluator::new(), &clauses, &ctx).is_err());
    }

    #[test]
    fn test_bounded_slots() {
        let mut state = WithItemsState::new(3, 2);
        let mut scheduled = 0;
        while state.can_schedule() {
            state.take_slot();
            scheduled += 1;
        }
        assert_eq!(scheduled, 2);

        state.release_slot();
        assert!(state.can_schedule());
        state.take_slot();
        assert!(state.all_scheduled());
        assert!(!state.can_schedule());
    }

    #[test]
    fn test_unbounded_schedules_everything() {
        let mut state = WithItemsState::new(4, 0);
        while state.can_schedule() {
            state.take_slot();
        }
        assert_eq!(state.next_index, 4);
        assert_eq!(state.capacity, 0);
    }

    #[test]
    fn test_final_state_dominance() {
        assert_eq!(
            final_state(&[State::Success, State::Error, State::Cancelled]).0,
            State::Cancelled
        );
        assert_eq!(
            final_state(&[State::Success, State::Error]),
            (State::Error, Some("One or more actions had failed.".to_string()))
        );
        assert_eq!(final_state(&[State::Success, State::Success]), (State::Success, None));
    }
}
