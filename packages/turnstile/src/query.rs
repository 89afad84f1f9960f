//! Structured filter queries and the compact textual codec.
//!
//! A filter is a conjunctive list of rules. Each rule compares one or more
//! parameters (OR-joined) against a value with one operator. Rules can be
//! built fluently or parsed from the compact wire form, a flat JSON object
//! whose keys read `<param[_or_param2...]>_<opcode>`:
//!
//! ```text
//! { "name_or_alias_cont": "smith", "age_gteq": 18 }
//! ```
//!
//! The opcode table is bijective, so a fluently-built rule set serializes
//! back to exactly the wire form it would have been parsed from.
//!
//! Parameters resolve against the target resource's *output* schema, not
//! its storage columns: a parameter may traverse graph links
//! (`owner_name_cont` filters on the linked owner's `name`), accumulating
//! the link chain needed to build the join downstream.

use serde_json::{Map, Value};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::schema::{Cardinality, OutputProp};

/// Wire key ignored by the rule parser; sorting is handled separately.
pub const SORT_KEY: &str = "s";

// =============================================================================
// Operators
// =============================================================================

/// Filter operator, with its compact wire opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// `cont`: case-insensitive substring.
    Like,
    /// `eq`
    Eq,
    /// `gteq`
    Gte,
    /// `lteq`
    Lte,
    /// `in`
    In,
}

/// Opcode table, longest codes first so suffix matching is unambiguous.
const OPCODES: [(FilterOp, &str); 5] = [
    (FilterOp::Gte, "gteq"),
    (FilterOp::Lte, "lteq"),
    (FilterOp::Like, "cont"),
    (FilterOp::Eq, "eq"),
    (FilterOp::In, "in"),
];

impl FilterOp {
    pub fn code(&self) -> &'static str {
        OPCODES
            .iter()
            .find(|(op, _)| op == self)
            .map(|(_, code)| *code)
            .expect("every operator has an opcode")
    }

    pub fn from_code(code: &str) -> Option<Self> {
        OPCODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(op, _)| *op)
    }
}

// =============================================================================
// Rules
// =============================================================================

/// One filter rule: OR across `params`, a single operator and operand.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub params: Vec<String>,
    pub op: FilterOp,
    pub value: Value,
}

impl FilterRule {
    /// The compact wire key this rule serializes to.
    pub fn key(&self) -> String {
        format!("{}_{}", self.params.join("_or_"), self.op.code())
    }
}

/// A conjunctive rule list.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub rules: Vec<FilterRule>,
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    /// Fluent form: add one rule.
    pub fn rule(
        mut self,
        params: impl IntoIterator<Item = impl Into<String>>,
        op: FilterOp,
        value: Value,
    ) -> Self {
        self.rules.push(FilterRule {
            params: params.into_iter().map(Into::into).collect(),
            op,
            value,
        });
        self
    }

    /// Parse the compact wire form. Unknown opcodes fail; the reserved
    /// sort key is skipped.
    pub fn parse(query: &Map<String, Value>) -> Result<Self, EngineError> {
        let mut rules = Vec::new();
        for (key, value) in query {
            if key == SORT_KEY {
                continue;
            }
            let rule = Self::parse_key(key, value.clone())?;
            rules.push(rule);
        }
        Ok(Filter { rules })
    }

    fn parse_key(key: &str, value: Value) -> Result<FilterRule, EngineError> {
        for (op, code) in OPCODES {
            if let Some(params_part) = key.strip_suffix(&format!("_{code}")) {
                if params_part.is_empty() {
                    break;
                }
                let params: Vec<String> =
                    params_part.split("_or_").map(str::to_string).collect();
                if params.iter().any(String::is_empty) {
                    break;
                }
                return Ok(FilterRule { params, op, value });
            }
        }
        Err(EngineError::InvalidParam {
            param: key.to_string(),
        })
    }

    /// Serialize back to the compact wire form.
    pub fn to_query(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for rule in &self.rules {
            out.insert(rule.key(), rule.value.clone());
        }
        out
    }
}

// =============================================================================
// Parameter resolution
// =============================================================================

/// One traversed graph link in a resolved parameter path.
#[derive(Debug, Clone)]
pub struct LinkStep {
    pub resource: String,
    pub foreign_key: String,
    pub cardinality: Cardinality,
}

/// A parameter resolved to a link chain plus a terminal column.
#[derive(Debug, Clone)]
pub struct ResolvedParam {
    /// Links traversed from the base resource, outermost first. Empty for
    /// a direct column on the base resource.
    pub steps: Vec<LinkStep>,
    /// Terminal column name on the innermost resource.
    pub column: String,
}

/// A rule with every parameter resolved.
#[derive(Debug, Clone)]
pub struct ResolvedRule {
    pub alternatives: Vec<ResolvedParam>,
    pub op: FilterOp,
    pub value: Value,
}

/// Lifecycle columns are filterable even when a schema does not re-declare
/// them as output props.
fn is_lifecycle_param(param: &str) -> bool {
    matches!(
        param,
        "id" | "state" | "created_at" | "updated_at" | "created_by" | "updated_by"
    )
}

/// Resolve a single parameter name against a resource's output schema.
///
/// Starting from the full name, trailing `_`-delimited suffixes are
/// stripped until a prefix matches a declared output prop. A matched graph
/// link recurses into the linked resource with the remaining suffix; a link
/// with no remaining suffix is not a valid filter target. A matched leaf
/// must consume the whole parameter.
pub fn resolve_param(
    engine: &Engine,
    resource: &str,
    param: &str,
) -> Result<ResolvedParam, EngineError> {
    let schema = engine.schema(resource)?;

    if is_lifecycle_param(param) {
        return Ok(ResolvedParam {
            steps: Vec::new(),
            column: param.to_string(),
        });
    }

    let mut prefix = param;
    loop {
        if let Some(prop) = schema.output.get(prefix) {
            match prop {
                OutputProp::Link(link) => {
                    let rest = param[prefix.len()..].trim_start_matches('_');
                    if rest.is_empty() {
                        return Err(EngineError::InvalidParam {
                            param: param.to_string(),
                        });
                    }
                    let inner = resolve_param(engine, &link.resource, rest)?;
                    let mut steps = Vec::with_capacity(inner.steps.len() + 1);
                    steps.push(LinkStep {
                        resource: link.resource.clone(),
                        foreign_key: link.foreign_key.clone(),
                        cardinality: link.cardinality,
                    });
                    steps.extend(inner.steps);
                    return Ok(ResolvedParam {
                        steps,
                        column: inner.column,
                    });
                }
                OutputProp::Leaf(_) | OutputProp::Computed(_) => {
                    if prefix == param {
                        return Ok(ResolvedParam {
                            steps: Vec::new(),
                            column: param.to_string(),
                        });
                    }
                    // Leaf with leftover suffix: not a match, keep stripping.
                }
                OutputProp::Nested(_) => {
                    // A nested map is not a filter target; keep stripping.
                }
            }
        }
        match prefix.rfind('_') {
            Some(idx) => prefix = &prefix[..idx],
            None => {
                return Err(EngineError::InvalidParam {
                    param: param.to_string(),
                })
            }
        }
    }
}

/// Resolve every rule of a filter against the base resource.
pub fn resolve(
    engine: &Engine,
    resource: &str,
    filter: &Filter,
) -> Result<Vec<ResolvedRule>, EngineError> {
    filter
        .rules
        .iter()
        .map(|rule| {
            let alternatives = rule
                .params
                .iter()
                .map(|param| resolve_param(engine, resource, param))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ResolvedRule {
                alternatives,
                op: rule.op,
                value: rule.value.clone(),
            })
        })
        .collect()
}

/// Render a filter operand as a remote query-parameter string.
pub fn operand_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(operand_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}
