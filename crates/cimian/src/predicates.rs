// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Boolean predicates over host facts, used to gate conditional manifest
//! blocks. Operators are a closed, case-insensitive set; comparisons are
//! string-based after coercion.

use serde::{Deserialize, Serialize};

use crate::{
    facts::{FactValue, Facts},
    Error,
};

/// A value that may be written as a single scalar or a list in YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single element.
    One(T),
    /// A list of elements.
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// Iterates the contained element(s).
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        match self {
            Self::One(v) => std::slice::from_ref(v).iter(),
            Self::Many(v) => v.iter(),
        }
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

/// The comparison value of a condition: a scalar or a list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(untagged)]
pub enum ConditionValue {
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// String scalar.
    Str(String),
    /// List of strings.
    List(Vec<String>),
}

impl ConditionValue {
    fn to_comparable(&self) -> String {
        match self {
            Self::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Str(s) => s.clone(),
            Self::List(l) => l.join(","),
        }
    }

    /// The membership list for `IN`: a real list, or a comma-separated string.
    fn to_list(&self) -> Vec<String> {
        match self {
            Self::List(l) => l.clone(),
            other => other
                .to_comparable()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

/// A single predicate over one fact.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct Condition {
    /// Fact name to test.
    pub key: String,
    /// One of the closed operator set, case-insensitive.
    pub operator: String,
    /// Comparison value.
    pub value: ConditionValue,
}

/// How multiple conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionType {
    /// Every condition must hold; errors make the whole block false.
    #[default]
    And,
    /// Any condition may hold; errors skip that condition.
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Like,
    Contains,
    BeginsWith,
    EndsWith,
    In,
}

fn parse_operator(raw: &str) -> crate::Result<Op> {
    match raw.to_ascii_uppercase().as_str() {
        "==" | "=" => Ok(Op::Eq),
        "!=" | "<>" => Ok(Op::Ne),
        ">" => Ok(Op::Gt),
        "<" => Ok(Op::Lt),
        ">=" => Ok(Op::Ge),
        "<=" => Ok(Op::Le),
        "LIKE" => Ok(Op::Like),
        "CONTAINS" => Ok(Op::Contains),
        "BEGINSWITH" => Ok(Op::BeginsWith),
        "ENDSWITH" => Ok(Op::EndsWith),
        "IN" => Ok(Op::In),
        _ => Err(Error::UnknownOperator(raw.to_string())),
    }
}

/// Evaluates a single condition against the gathered facts.
///
/// Unknown operators are configuration errors; unknown fact keys are
/// evaluation errors, handled by the caller per the composition mode.
pub fn evaluate_condition(condition: &Condition, facts: &Facts) -> crate::Result<bool> {
    let op = parse_operator(&condition.operator)?;
    let fact = facts
        .get(&condition.key)
        .ok_or_else(|| Error::UnknownFactKey(condition.key.clone()))?;

    let fact_str = fact.to_comparable();
    let value_str = condition.value.to_comparable();

    let result = match op {
        Op::Eq => fact_str == value_str,
        Op::Ne => fact_str != value_str,
        Op::Gt => fact_str > value_str,
        Op::Lt => fact_str < value_str,
        Op::Ge => fact_str >= value_str,
        Op::Le => fact_str <= value_str,
        Op::Like => {
            let needle = value_str.to_lowercase().replace('*', "");
            fact_str.to_lowercase().contains(&needle)
        }
        Op::Contains => match fact.as_list() {
            Some(list) => list
                .iter()
                .any(|e| e.eq_ignore_ascii_case(value_str.trim())),
            None => fact_str.to_lowercase().contains(&value_str.to_lowercase()),
        },
        Op::BeginsWith => fact_str.to_lowercase().starts_with(&value_str.to_lowercase()),
        Op::EndsWith => fact_str.to_lowercase().ends_with(&value_str.to_lowercase()),
        Op::In => {
            let members = condition.value.to_list();
            let candidates: Vec<String> = match fact {
                FactValue::List(l) => l.clone(),
                other => vec![other.to_comparable()],
            };
            candidates
                .iter()
                .any(|c| members.iter().any(|m| m.eq_ignore_ascii_case(c)))
        }
    };

    Ok(result)
}

/// Evaluates a condition set under the given composition mode.
///
/// `AND` short-circuits on the first false and treats any evaluation error as
/// false for the whole set. `OR` short-circuits on the first true and skips
/// conditions that fail to evaluate. Configuration errors (unknown operators)
/// always propagate.
pub fn evaluate_all(
    conditions: &OneOrMany<Condition>,
    condition_type: ConditionType,
    facts: &Facts,
) -> crate::Result<bool> {
    match condition_type {
        ConditionType::And => {
            for condition in conditions.iter() {
                match evaluate_condition(condition, facts) {
                    Ok(true) => (),
                    Ok(false) => return Ok(false),
                    Err(e @ Error::UnknownOperator(_)) => return Err(e),
                    Err(e) => {
                        tracing::error!("condition on `{}` failed to evaluate: {e}", condition.key);
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        }
        ConditionType::Or => {
            for condition in conditions.iter() {
                match evaluate_condition(condition, facts) {
                    Ok(true) => return Ok(true),
                    Ok(false) => (),
                    Err(e @ Error::UnknownOperator(_)) => return Err(e),
                    Err(e) => {
                        tracing::error!(
                            "condition on `{}` failed to evaluate, skipping: {e}",
                            condition.key
                        );
                    }
                }
            }
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::FactMap;

    fn facts() -> Facts {
        let mut map = FactMap::new();
        map.insert("hostname".into(), FactValue::Str("LAB-PC-001".into()));
        map.insert("arch".into(), FactValue::Str("x64".into()));
        map.insert("machine_type".into(), FactValue::Str("laptop".into()));
        map.insert("os_build".into(), FactValue::Int(19045));
        map.insert(
            "catalogs".into(),
            FactValue::List(vec!["Production".into(), "Testing".into()]),
        );
        Facts::from_map(map)
    }

    fn condition(key: &str, operator: &str, value: ConditionValue) -> Condition {
        Condition {
            key: key.into(),
            operator: operator.into(),
            value,
        }
    }

    #[test]
    fn equality_and_ordering() {
        let f = facts();
        assert!(evaluate_condition(
            &condition("arch", "==", ConditionValue::Str("x64".into())),
            &f
        )
        .unwrap());
        assert!(evaluate_condition(
            &condition("os_build", ">=", ConditionValue::Int(19041)),
            &f
        )
        .unwrap());
        assert!(!evaluate_condition(
            &condition("arch", "!=", ConditionValue::Str("x64".into())),
            &f
        )
        .unwrap());
    }

    #[test]
    fn pattern_operators_are_case_insensitive() {
        let f = facts();
        assert!(evaluate_condition(
            &condition("hostname", "beginswith", ConditionValue::Str("lab-".into())),
            &f
        )
        .unwrap());
        assert!(evaluate_condition(
            &condition("hostname", "LIKE", ConditionValue::Str("*pc-00*".into())),
            &f
        )
        .unwrap());
        assert!(evaluate_condition(
            &condition("hostname", "ENDSWITH", ConditionValue::Str("001".into())),
            &f
        )
        .unwrap());
    }

    #[test]
    fn membership_on_lists_and_strings() {
        let f = facts();
        assert!(evaluate_condition(
            &condition("catalogs", "CONTAINS", ConditionValue::Str("production".into())),
            &f
        )
        .unwrap());
        assert!(evaluate_condition(
            &condition("machine_type", "IN", ConditionValue::Str("laptop, desktop".into())),
            &f
        )
        .unwrap());
        assert!(evaluate_condition(
            &condition(
                "catalogs",
                "IN",
                ConditionValue::List(vec!["Testing".into(), "Dev".into()])
            ),
            &f
        )
        .unwrap());
    }

    #[test]
    fn unknown_operator_is_a_configuration_error() {
        let err = evaluate_condition(
            &condition("arch", "MATCHES", ConditionValue::Str("x64".into())),
            &facts(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownOperator(_)));
    }

    #[test]
    fn and_treats_unknown_fact_as_false() {
        let conditions = OneOrMany::Many(vec![
            condition("arch", "==", ConditionValue::Str("x64".into())),
            condition("no_such_fact", "==", ConditionValue::Str("x".into())),
        ]);
        assert!(!evaluate_all(&conditions, ConditionType::And, &facts()).unwrap());
    }

    #[test]
    fn or_skips_unknown_fact_and_continues() {
        let conditions = OneOrMany::Many(vec![
            condition("no_such_fact", "==", ConditionValue::Str("x".into())),
            condition("arch", "==", ConditionValue::Str("x64".into())),
        ]);
        assert!(evaluate_all(&conditions, ConditionType::Or, &facts()).unwrap());
    }

    #[test]
    fn evaluation_is_idempotent() {
        let conditions = OneOrMany::One(condition(
            "machine_type",
            "==",
            ConditionValue::Str("laptop".into()),
        ));
        let first = evaluate_all(&conditions, ConditionType::And, &facts()).unwrap();
        let second = evaluate_all(&conditions, ConditionType::And, &facts()).unwrap();
        assert_eq!(first, second);
    }
}
