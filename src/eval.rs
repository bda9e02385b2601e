use std::{collections::HashSet, sync::Arc};

use crate::{
    models::{Distribution, Flag, FlagKind, FlagState, Serve, ServingRule, Variation},
    repository::Query,
    rules::{all_clauses_match, is_target_in_segments},
    sharder::{Murmur3Sharder, Sharder},
    Target,
};

/// Reasons an evaluation falls back to the caller's default. Never leaves the evaluation
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum EvaluationError {
    #[error("flag not found")]
    FlagNotFound,
    #[error("flag kind is {actual}, expected {expected}")]
    KindMismatch {
        expected: FlagKind,
        actual: FlagKind,
    },
    #[error("variation {0:?} not found")]
    VariationNotFound(String),
    #[error("no variation served")]
    NoVariation,
    #[error("prerequisites of {0:?} form a cycle")]
    PrerequisiteCycle(String),
    #[error("variation value {0:?} does not match the flag kind")]
    InvalidValue(String),
}

/// Chains of flags and segments being evaluated, used to detect reference cycles.
#[derive(Debug, Default)]
pub(crate) struct EvaluationStack {
    pub prerequisite_chain: HashSet<String>,
    pub segment_chain: HashSet<String>,
}

/// Outcome of a successful evaluation.
#[derive(Debug, Clone)]
pub(crate) struct Evaluation {
    pub flag: Arc<Flag>,
    pub variation: Variation,
}

/// Evaluates flags against whatever is currently in the repository.
pub(crate) struct Evaluator {
    query: Arc<dyn Query + Send + Sync>,
}

impl Evaluator {
    pub fn new(query: Arc<dyn Query + Send + Sync>) -> Evaluator {
        Evaluator { query }
    }

    pub fn evaluate(
        &self,
        identifier: &str,
        target: &Target,
        expected: FlagKind,
    ) -> Result<Evaluation, EvaluationError> {
        evaluate(self.query.as_ref(), &Murmur3Sharder, identifier, target, expected)
    }
}

/// Evaluate flag `identifier` for `target`.
pub(crate) fn evaluate(
    query: &dyn Query,
    sharder: &impl Sharder,
    identifier: &str,
    target: &Target,
    expected: FlagKind,
) -> Result<Evaluation, EvaluationError> {
    let flag = query
        .get_flag(identifier)
        .ok_or(EvaluationError::FlagNotFound)?;

    if flag.kind != expected {
        return Err(EvaluationError::KindMismatch {
            expected,
            actual: flag.kind,
        });
    }

    let mut stack = EvaluationStack::default();
    let variation_id = evaluate_flag(&flag, target, query, sharder, &mut stack)?;

    let variation = flag.find_variation(&variation_id).cloned().ok_or_else(|| {
        log::warn!(target: "ff",
                   flag = identifier,
                   variation = variation_id.as_str();
                   "internal: unable to find variation");
        EvaluationError::VariationNotFound(variation_id)
    })?;

    Ok(Evaluation { flag, variation })
}

/// Pick the identifier of the variation `flag` serves to `target`.
fn evaluate_flag(
    flag: &Flag,
    target: &Target,
    query: &dyn Query,
    sharder: &impl Sharder,
    stack: &mut EvaluationStack,
) -> Result<String, EvaluationError> {
    if flag.state == FlagState::Off {
        return Ok(flag.off_variation.clone());
    }

    if !flag.prerequisites.is_empty() {
        if !stack.prerequisite_chain.insert(flag.identifier.clone()) {
            log::warn!(target: "ff",
                       flag = flag.identifier.as_str();
                       "prerequisite relationship caused a circular reference; this is probably a temporary condition due to an incomplete update");
            return Err(EvaluationError::PrerequisiteCycle(flag.identifier.clone()));
        }
        let satisfied = check_prerequisites(flag, target, query, sharder, stack)?;
        stack.prerequisite_chain.remove(&flag.identifier);

        if !satisfied {
            return Ok(flag.off_variation.clone());
        }
    }

    if let Some(variation) = evaluate_variation_map(flag, target, query, stack) {
        return Ok(variation);
    }

    if let Some(variation) = evaluate_rules(&flag.rules, target, query, sharder, stack) {
        return Ok(variation);
    }

    evaluate_serve(&flag.default_serve, target, sharder).ok_or(EvaluationError::NoVariation)
}

fn check_prerequisites(
    flag: &Flag,
    target: &Target,
    query: &dyn Query,
    sharder: &impl Sharder,
    stack: &mut EvaluationStack,
) -> Result<bool, EvaluationError> {
    for prerequisite in &flag.prerequisites {
        let Some(prerequisite_flag) = query.get_flag(&prerequisite.feature) else {
            log::warn!(target: "ff",
                       flag = flag.identifier.as_str(),
                       prerequisite = prerequisite.feature.as_str();
                       "prerequisite flag not found, treating it as satisfied");
            continue;
        };

        let served = evaluate_flag(&prerequisite_flag, target, query, sharder, stack)?;
        if !prerequisite.variations.contains(&served) {
            log::debug!(target: "ff",
                        flag = flag.identifier.as_str(),
                        prerequisite = prerequisite.feature.as_str(),
                        served = served.as_str();
                        "prerequisite not satisfied");
            return Ok(false);
        }
    }
    Ok(true)
}

fn evaluate_variation_map(
    flag: &Flag,
    target: &Target,
    query: &dyn Query,
    stack: &mut EvaluationStack,
) -> Option<String> {
    flag.variation_to_target_map
        .iter()
        .find(|map| {
            map.targets.iter().any(|t| t.identifier == target.identifier)
                || (!map.target_segments.is_empty()
                    && is_target_in_segments(&map.target_segments, target, query, stack))
        })
        .map(|map| map.variation.clone())
}

fn evaluate_rules(
    rules: &[ServingRule],
    target: &Target,
    query: &dyn Query,
    sharder: &impl Sharder,
    stack: &mut EvaluationStack,
) -> Option<String> {
    let mut sorted: Vec<&ServingRule> = rules.iter().collect();
    sorted.sort_by_key(|rule| rule.priority);

    let rule = sorted
        .into_iter()
        .find(|rule| all_clauses_match(&rule.clauses, target, query, stack))?;

    evaluate_serve(&rule.serve, target, sharder)
}

fn evaluate_serve(serve: &Serve, target: &Target, sharder: &impl Sharder) -> Option<String> {
    match &serve.distribution {
        Some(distribution) => evaluate_distribution(distribution, target, sharder),
        None => serve.variation.clone(),
    }
}

/// Bucket `target` into `distribution`: the first variation whose cumulative weight reaches the
/// target's bucket. If the weights sum to less than the bucket, the last variation is served.
fn evaluate_distribution(
    distribution: &Distribution,
    target: &Target,
    sharder: &impl Sharder,
) -> Option<String> {
    let value = target
        .get_attribute(&distribution.bucket_by)
        .unwrap_or_else(|| {
            log::debug!(target: "ff",
                        bucket_by = distribution.bucket_by.as_str(),
                        target = target.identifier.as_str();
                        "bucket-by attribute not found on target, bucketing on empty string");
            String::new()
        });
    let bucket = sharder.get_bucket(&distribution.bucket_by, &value);

    let mut total: u32 = 0;
    for weighted in &distribution.variations {
        total = total.saturating_add(weighted.weight);
        if total >= bucket {
            return Some(weighted.variation.clone());
        }
    }

    distribution.variations.last().map(|v| v.variation.clone())
}

impl Variation {
    pub(crate) fn as_bool(&self) -> Result<bool, EvaluationError> {
        if self.value.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if self.value.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(EvaluationError::InvalidValue(self.value.clone()))
        }
    }

    pub(crate) fn as_number(&self) -> Result<f64, EvaluationError> {
        self.value
            .trim()
            .parse()
            .map_err(|_| EvaluationError::InvalidValue(self.value.clone()))
    }

    pub(crate) fn as_json(&self) -> Result<serde_json::Value, EvaluationError> {
        serde_json::from_str(&self.value)
            .map_err(|_| EvaluationError::InvalidValue(self.value.clone()))
    }
}
