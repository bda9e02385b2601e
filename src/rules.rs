use regex::Regex;

use crate::{
    eval::EvaluationStack,
    models::{Clause, Segment, TargetRef},
    repository::Query,
    Target,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    StartsWith,
    EndsWith,
    /// Regular expression that must match the whole attribute value.
    Match,
    Contains,
    /// Case-insensitive equality.
    Equal,
    EqualSensitive,
    /// Attribute value is one of the clause values.
    In,
    SegmentMatch,
}

impl Operator {
    pub fn parse(op: &str) -> Option<Operator> {
        Some(match op {
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "match" => Self::Match,
            "contains" => Self::Contains,
            "equal" => Self::Equal,
            "equal_sensitive" => Self::EqualSensitive,
            "in" => Self::In,
            "segmentMatch" => Self::SegmentMatch,
            _ => return None,
        })
    }

    /// Apply a non-segment operator to `attribute`. Returns `false` on misconfiguration (no
    /// values, invalid regex).
    fn eval(&self, attribute: &str, values: &[String]) -> bool {
        let Some(value) = values.first() else {
            return false;
        };
        match self {
            Self::StartsWith => attribute.starts_with(value.as_str()),
            Self::EndsWith => attribute.ends_with(value.as_str()),
            Self::Match => match Regex::new(&format!("^(?:{value})$")) {
                Ok(regex) => regex.is_match(attribute),
                Err(err) => {
                    log::warn!(target: "ff", pattern = value.as_str(); "invalid regex in clause: {err}");
                    false
                }
            },
            Self::Contains => attribute.contains(value.as_str()),
            Self::Equal => attribute.to_lowercase() == value.to_lowercase(),
            Self::EqualSensitive => attribute == value,
            Self::In => values.iter().any(|v| v == attribute),
            // Handled by the caller, which has access to segments.
            Self::SegmentMatch => false,
        }
    }
}

impl Clause {
    /// Evaluate the clause for `target`, applying `negate`.
    pub(crate) fn eval(
        &self,
        target: &Target,
        query: &dyn Query,
        stack: &mut EvaluationStack,
    ) -> bool {
        self.matches(target, query, stack) != self.negate
    }

    fn matches(&self, target: &Target, query: &dyn Query, stack: &mut EvaluationStack) -> bool {
        let Some(operator) = Operator::parse(&self.op) else {
            log::debug!(target: "ff", op = self.op.as_str(); "unknown clause operator");
            return false;
        };

        if operator == Operator::SegmentMatch {
            return is_target_in_segments(&self.values, target, query, stack);
        }

        let attribute = target.get_attribute(&self.attribute).unwrap_or_else(|| {
            log::debug!(target: "ff",
                        attribute = self.attribute.as_str(),
                        target = target.identifier.as_str();
                        "attribute not found on target, evaluating against empty string");
            String::new()
        });

        operator.eval(&attribute, &self.values)
    }
}

/// Returns `true` if all clauses match. An empty list matches.
pub(crate) fn all_clauses_match(
    clauses: &[Clause],
    target: &Target,
    query: &dyn Query,
    stack: &mut EvaluationStack,
) -> bool {
    clauses
        .iter()
        .all(|clause| clause.eval(target, query, stack))
}

/// Segment membership over a list of segments.
///
/// The first segment that yields a decision (excluded, included, or matched by a rule) determines
/// the result. Unknown segments are skipped.
pub(crate) fn is_target_in_segments(
    segment_ids: &[String],
    target: &Target,
    query: &dyn Query,
    stack: &mut EvaluationStack,
) -> bool {
    for segment_id in segment_ids {
        let Some(segment) = query.get_segment(segment_id) else {
            log::debug!(target: "ff", segment = segment_id.as_str(); "segment not found");
            continue;
        };

        if !stack.segment_chain.insert(segment_id.clone()) {
            log::warn!(target: "ff",
                       segment = segment_id.as_str();
                       "segment rules reference each other in a cycle, treating target as not a member");
            continue;
        }
        let decision = segment_decision(&segment, target, query, stack);
        stack.segment_chain.remove(segment_id);

        if let Some(is_member) = decision {
            return is_member;
        }
    }
    false
}

fn segment_decision(
    segment: &Segment,
    target: &Target,
    query: &dyn Query,
    stack: &mut EvaluationStack,
) -> Option<bool> {
    if is_target_in_list(target, &segment.excluded) {
        log::trace!(target: "ff", segment = segment.identifier.as_str(), target = target.identifier.as_str(); "target excluded from segment");
        return Some(false);
    }

    if is_target_in_list(target, &segment.included) {
        log::trace!(target: "ff", segment = segment.identifier.as_str(), target = target.identifier.as_str(); "target included in segment");
        return Some(true);
    }

    if segment
        .rules
        .iter()
        .any(|clause| clause.eval(target, query, stack))
    {
        log::trace!(target: "ff", segment = segment.identifier.as_str(), target = target.identifier.as_str(); "target included in segment via rules");
        return Some(true);
    }

    None
}

fn is_target_in_list(target: &Target, list: &[TargetRef]) -> bool {
    list.iter().any(|t| t.identifier == target.identifier)
}
