use kopi_core::config::PlannerConfig;
use kopi_core::{metadata_keys, Action, Decision, EntityFlags, SessionSnapshot};

use crate::calculator::contains_math_expression;
use crate::product_index::SortKey;

// Scoring constants match the tuned values from the production system.
// They are calibration data: change them only with evaluation evidence.
const MATH_EXPRESSION_SCORE: f64 = 0.9;
const TRIGGER_WITH_NUMBERS_SCORE: f64 = 0.7;
const OPERATORS_WITH_NUMBERS_SCORE: f64 = 0.6;
const STRONG_PRODUCT_SCORE: f64 = 0.8;
const SINGLE_PRODUCT_KEYWORD_SCORE: f64 = 0.6;
const STRONG_OUTLET_SCORE: f64 = 0.85;
const OUTLET_KEYWORD_SCORE: f64 = 0.65;
const FOLLOW_UP_SCORE: f64 = 0.3;
const HYBRID_DAMPING: f64 = 0.9;
const HYBRID_GATE: f64 = 0.5;
const RETRIEVAL_THRESHOLD: f64 = 0.6;
const CLARIFY_CONFIDENCE: f64 = 0.7;
const DIRECT_ANSWER_CONFIDENCE: f64 = 0.5;
/// Questions shorter than this many tokens qualify for clarification.
const CLARIFY_TOKEN_THRESHOLD: usize = 4;

const PRODUCT_KEYWORDS: &[&str] = &[
    "tumbler", "bottle", "mug", "cup", "cold cup", "drinkware", "straw", "lid", "capacity",
    "ml", "oz", "price", "color", "cost", "size", "gift", "merchandise",
];

const OUTLET_KEYWORDS: &[&str] = &[
    "outlet", "store", "branch", "location", "near", "address", "open", "hours", "map", "city",
    "state", "postal", "where", "mall", "directions",
];

const CALCULATION_TRIGGERS: &[&str] = &[
    "calculate", "compute", "plus", "minus", "times", "multiplied by", "divided by", "what is",
    "equals",
];

const COUNT_INTENT_WORDS: &[&str] = &["how many", "count", "number of"];

const PRONOUNS: &[&str] = &["it", "that", "those", "them", "there", "this", "these"];

/// Everything the extractor pulled from one question. The booleans surface
/// in the decision record; the counts only drive scoring.
#[derive(Clone, Debug, Default)]
struct Extraction {
    flags: EntityFlags,
    product_keyword_count: usize,
    outlet_keyword_count: usize,
    sort_key: Option<SortKey>,
    count_intent: bool,
    calc_trigger: Option<&'static str>,
    token_count: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct Scores {
    calculate: f64,
    products: f64,
    outlets: f64,
    hybrid: f64,
}

/// Pure question-to-decision classifier. Same question and snapshot always
/// produce the same decision: no clock, no randomness, no live session
/// reference.
#[derive(Clone, Debug)]
pub struct Planner {
    known_locations: Vec<String>,
}

impl Planner {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            known_locations: config
                .known_locations
                .iter()
                .map(|location| location.to_lowercase())
                .collect(),
        }
    }

    pub fn plan(&self, question: &str, snapshot: &SessionSnapshot) -> Decision {
        let extraction = self.extract(question);
        let last_action = snapshot
            .metadata_value(metadata_keys::LAST_PRIMARY_ACTION)
            .and_then(Action::parse);
        let scores = score(&extraction, last_action);
        self.decide(question, snapshot, &extraction, &scores)
    }

    fn extract(&self, question: &str) -> Extraction {
        let lowered = question.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|ch: char| ch.is_whitespace())
            .filter(|token| !token.is_empty())
            .collect();

        let has_numbers = tokens.iter().any(|token| token.chars().any(|ch| ch.is_ascii_digit()));
        let has_operators =
            tokens.iter().any(|token| matches!(*token, "+" | "-" | "*" | "/" | "%" | "**"));
        let has_math_expression = contains_math_expression(&lowered);

        let product_keyword_count = count_keyword_hits(&lowered, &tokens, PRODUCT_KEYWORDS);
        let outlet_keyword_count = count_keyword_hits(&lowered, &tokens, OUTLET_KEYWORDS);

        let location_mentioned = self
            .known_locations
            .iter()
            .any(|location| lowered.contains(location.as_str()))
            || tokens.iter().any(|token| is_postal_code(token));

        // A bare pronoun counts only when nothing in the utterance supplies
        // an antecedent of its own.
        let pronoun_present = tokens
            .iter()
            .any(|token| PRONOUNS.contains(&token.trim_matches(|ch: char| !ch.is_alphanumeric())));
        let references_prior_turn =
            pronoun_present && product_keyword_count == 0 && outlet_keyword_count == 0;

        let calc_trigger =
            CALCULATION_TRIGGERS.iter().find(|trigger| lowered.contains(*trigger)).copied();

        Extraction {
            flags: EntityFlags {
                has_numbers,
                has_operators,
                has_math_expression,
                product_keywords_hit: product_keyword_count > 0,
                outlet_keywords_hit: outlet_keyword_count > 0,
                location_mentioned,
                references_prior_turn,
            },
            product_keyword_count,
            outlet_keyword_count,
            sort_key: SortKey::detect(&lowered),
            count_intent: COUNT_INTENT_WORDS.iter().any(|word| lowered.contains(word)),
            calc_trigger,
            token_count: tokens.len(),
        }
    }

    fn decide(
        &self,
        question: &str,
        snapshot: &SessionSnapshot,
        extraction: &Extraction,
        scores: &Scores,
    ) -> Decision {
        let flags = extraction.flags;
        let retrieval_max = scores.products.max(scores.outlets);

        // Rule 1: arithmetic wins when it at least ties retrieval; a strong
        // retrieval signal alongside upgrades the route to hybrid.
        if scores.calculate >= RETRIEVAL_THRESHOLD && scores.calculate >= retrieval_max {
            let action = if retrieval_max >= RETRIEVAL_THRESHOLD {
                Action::Hybrid
            } else {
                Action::Calculate
            };
            return Decision {
                primary_action: action,
                confidence: scores.calculate,
                reasoning: self.reasoning_for(action, extraction, scores),
                entities: flags,
                missing_info: Vec::new(),
                execution_plan: execution_plan(action),
                clarification_prompt: None,
            };
        }

        // Rule 2: both retrieval signals are solid on their own.
        if scores.hybrid >= HYBRID_GATE {
            return Decision {
                primary_action: Action::Hybrid,
                confidence: scores.hybrid,
                reasoning: self.reasoning_for(Action::Hybrid, extraction, scores),
                entities: flags,
                missing_info: Vec::new(),
                execution_plan: execution_plan(Action::Hybrid),
                clarification_prompt: None,
            };
        }

        // Rule 3: a single retrieval tool; ties break toward products.
        if retrieval_max >= RETRIEVAL_THRESHOLD {
            let action = if scores.products >= scores.outlets {
                Action::SearchProducts
            } else {
                Action::SearchOutlets
            };
            return Decision {
                primary_action: action,
                confidence: retrieval_max,
                reasoning: self.reasoning_for(action, extraction, scores),
                entities: flags,
                missing_info: Vec::new(),
                execution_plan: execution_plan(action),
                clarification_prompt: None,
            };
        }

        // Rule 4: short follow-ups on a live session ask for specifics.
        if extraction.token_count < CLARIFY_TOKEN_THRESHOLD
            && flags.references_prior_turn
            && snapshot.has_history()
        {
            let (prompt, missing_info) = self.clarification_for(snapshot);
            return Decision {
                primary_action: Action::Clarify,
                confidence: CLARIFY_CONFIDENCE,
                reasoning: format!(
                    "short follow-up `{question}` references a prior turn without enough detail"
                ),
                entities: flags,
                missing_info,
                execution_plan: execution_plan(Action::Clarify),
                clarification_prompt: Some(prompt),
            };
        }

        // Rule 5: nothing tool-shaped; the model answers on its own.
        Decision {
            primary_action: Action::AnswerDirectly,
            confidence: DIRECT_ANSWER_CONFIDENCE,
            reasoning: self.reasoning_for(Action::AnswerDirectly, extraction, scores),
            entities: flags,
            missing_info: Vec::new(),
            execution_plan: execution_plan(Action::AnswerDirectly),
            clarification_prompt: None,
        }
    }

    fn clarification_for(&self, snapshot: &SessionSnapshot) -> (String, Vec<String>) {
        let last_action = snapshot
            .metadata_value(metadata_keys::LAST_PRIMARY_ACTION)
            .and_then(Action::parse);

        match last_action {
            Some(Action::SearchProducts) | Some(Action::Hybrid) => {
                let prompt = match snapshot.metadata_value(metadata_keys::LAST_PRODUCT_QUERY) {
                    Some(query) => format!(
                        "Which drinkware do you mean? Your last product search was \"{query}\" - \
                         tell me the product name or what capacity or price range you are after."
                    ),
                    None => "Which drinkware are you asking about? We have tumblers, cups, \
                             bottles, and mugs."
                        .to_string(),
                };
                (prompt, vec!["missing:product_category".to_string()])
            }
            Some(Action::SearchOutlets) => {
                let prompt = match snapshot.metadata_value(metadata_keys::LAST_OUTLET_QUERY) {
                    Some(query) => format!(
                        "Which outlet do you mean? Your last outlet search was \"{query}\" - \
                         tell me the city, area, or mall name."
                    ),
                    None => "Which area are you looking for? For example Shah Alam, Petaling \
                             Jaya, Subang, or Kuala Lumpur."
                        .to_string(),
                };
                (prompt, vec!["missing:location".to_string()])
            }
            _ => (
                "Could you provide more details about what you're looking for?".to_string(),
                vec!["missing:context".to_string()],
            ),
        }
    }

    fn reasoning_for(&self, action: Action, extraction: &Extraction, scores: &Scores) -> String {
        let flags = extraction.flags;
        match action {
            Action::Calculate => {
                let detail = if flags.has_math_expression {
                    "a direct mathematical expression".to_string()
                } else if let Some(trigger) = extraction.calc_trigger {
                    format!("trigger word `{trigger}` with numeric tokens")
                } else {
                    "operators alongside numeric tokens".to_string()
                };
                format!("calculation triggered (score {:.2}): {detail}", scores.calculate)
            }
            Action::SearchProducts => {
                let mut reason = format!(
                    "product search triggered (score {:.2}): {} catalog keyword(s)",
                    scores.products, extraction.product_keyword_count
                );
                if let Some(sort_key) = extraction.sort_key {
                    reason.push_str(&format!(" with sort phrase `{}`", sort_key.as_str()));
                }
                reason
            }
            Action::SearchOutlets => {
                let mut reason = format!(
                    "outlet search triggered (score {:.2}): {} directory keyword(s)",
                    scores.outlets, extraction.outlet_keyword_count
                );
                if flags.location_mentioned {
                    reason.push_str(", location mentioned");
                }
                if extraction.count_intent {
                    reason.push_str(", count intent");
                }
                reason
            }
            Action::Hybrid => format!(
                "hybrid route (calculate {:.2}, products {:.2}, outlets {:.2}): more than one \
                 tool is implicated",
                scores.calculate, scores.products, scores.outlets
            ),
            Action::Clarify => "clarification requested".to_string(),
            Action::AnswerDirectly => format!(
                "no tool signal cleared its threshold (products {:.2}, outlets {:.2}, \
                 calculate {:.2}); answering from model knowledge",
                scores.products, scores.outlets, scores.calculate
            ),
        }
    }
}

fn score(extraction: &Extraction, last_action: Option<Action>) -> Scores {
    let flags = extraction.flags;

    let calculate = if flags.has_math_expression {
        MATH_EXPRESSION_SCORE
    } else if extraction.calc_trigger.is_some() && flags.has_numbers {
        TRIGGER_WITH_NUMBERS_SCORE
    } else if flags.has_operators && flags.has_numbers {
        OPERATORS_WITH_NUMBERS_SCORE
    } else {
        0.0
    };

    let products = if extraction.product_keyword_count >= 2
        || (extraction.product_keyword_count >= 1 && extraction.sort_key.is_some())
    {
        STRONG_PRODUCT_SCORE
    } else if extraction.product_keyword_count == 1 {
        SINGLE_PRODUCT_KEYWORD_SCORE
    } else if flags.references_prior_turn && last_action == Some(Action::SearchProducts) {
        FOLLOW_UP_SCORE
    } else {
        0.0
    };

    let outlets = if extraction.outlet_keyword_count >= 1
        && (flags.location_mentioned || extraction.count_intent)
    {
        STRONG_OUTLET_SCORE
    } else if extraction.outlet_keyword_count >= 1 {
        OUTLET_KEYWORD_SCORE
    } else if flags.references_prior_turn && last_action == Some(Action::SearchOutlets) {
        FOLLOW_UP_SCORE
    } else {
        0.0
    };

    let hybrid = if products > HYBRID_GATE && outlets > HYBRID_GATE {
        products.min(outlets) * HYBRID_DAMPING
    } else {
        0.0
    };

    Scores { calculate, products, outlets, hybrid }
}

/// Single-word keywords must match a whole token; phrases match as
/// substrings. Plural forms still hit because tokens are prefix-compared
/// against the keyword.
fn count_keyword_hits(lowered: &str, tokens: &[&str], keywords: &[&str]) -> usize {
    keywords
        .iter()
        .filter(|keyword| {
            if keyword.contains(' ') {
                lowered.contains(*keyword)
            } else if keyword.len() <= 2 {
                tokens.iter().any(|token| token == *keyword)
            } else {
                tokens.iter().any(|token| {
                    let stripped = token.trim_matches(|ch: char| !ch.is_alphanumeric());
                    stripped == **keyword
                        || (stripped.starts_with(*keyword)
                            && stripped.len() == keyword.len() + 1
                            && stripped.ends_with('s'))
                })
            }
        })
        .count()
}

fn is_postal_code(token: &str) -> bool {
    let stripped = token.trim_matches(|ch: char| !ch.is_ascii_digit());
    stripped.len() == 5 && stripped.chars().all(|ch| ch.is_ascii_digit())
}

fn execution_plan(action: Action) -> Vec<String> {
    let steps: &[&str] = match action {
        Action::Calculate => &[
            "Extract mathematical expression from question",
            "Execute calculator tool",
            "Format calculation result",
        ],
        Action::SearchProducts => &[
            "Execute vector search for products",
            "Apply deterministic re-ranking when a sort phrase is present",
            "Format product results with prices and capacities",
        ],
        Action::SearchOutlets => &[
            "Translate question to a validated SELECT",
            "Execute outlet query against the directory",
            "Format outlet results with addresses",
        ],
        Action::Hybrid => &[
            "Execute product and outlet searches in parallel",
            "Run the calculator when arithmetic is present",
            "Combine results in one response",
        ],
        Action::Clarify => &[
            "Ask user for clarification on missing information",
            "Wait for user response before proceeding",
        ],
        Action::AnswerDirectly => &[
            "Use conversation context for response",
            "Answer from general drinkware knowledge",
        ],
    };
    steps.iter().map(|step| step.to_string()).collect()
}
