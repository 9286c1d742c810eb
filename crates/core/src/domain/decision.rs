use serde::{Deserialize, Serialize};

/// The six tool routes the planner can choose between. The orchestrator
/// dispatches with a total match over this enum; adding a tool means adding
/// a variant and letting the compiler point at every dispatch site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SearchProducts,
    SearchOutlets,
    Calculate,
    Hybrid,
    Clarify,
    AnswerDirectly,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchProducts => "search_products",
            Self::SearchOutlets => "search_outlets",
            Self::Calculate => "calculate",
            Self::Hybrid => "hybrid",
            Self::Clarify => "clarify",
            Self::AnswerDirectly => "answer_directly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "search_products" => Some(Self::SearchProducts),
            "search_outlets" => Some(Self::SearchOutlets),
            "calculate" => Some(Self::Calculate),
            "hybrid" => Some(Self::Hybrid),
            "clarify" => Some(Self::Clarify),
            "answer_directly" => Some(Self::AnswerDirectly),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean surface features extracted from the question before scoring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFlags {
    pub has_numbers: bool,
    pub has_operators: bool,
    pub has_math_expression: bool,
    pub product_keywords_hit: bool,
    pub outlet_keywords_hit: bool,
    pub location_mentioned: bool,
    pub references_prior_turn: bool,
}

/// Immutable planner output for one question. Every response envelope
/// references exactly one of these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub primary_action: Action,
    pub confidence: f64,
    pub reasoning: String,
    pub entities: EntityFlags,
    #[serde(default)]
    pub missing_info: Vec<String>,
    #[serde(default)]
    pub execution_plan: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_prompt: Option<String>,
}
