use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use kopi_core::{
    metadata_keys, Action, CalcResult, Decision, EngineError, Product, RequestError,
    ServiceError, SessionSnapshot, ToolError, Turn,
};

use crate::calculator::Calculator;
use crate::llm::LlmClient;
use crate::planner::Planner;
use crate::product_index::{ProductIndex, SortKey, DEFAULT_TOP_K};
use crate::session::SessionStore;
use crate::sql_gate::{OutletAnswer, OutletSqlGate};

const SYSTEM_TEMPLATE: &str = "\
You are a helpful and friendly assistant for Kopi Drinkware - a Malaysian drinkware brand \
known for tumblers, cups, and reusable bottles.

You can help users with:
- Product information (tumblers, cups, bottles, straws, lids)
- Outlet locations across Kuala Lumpur and Selangor
- Google Maps URLs for outlet locations
- Pricing and availability
- General conversation about drinkware";

const RESPONSE_INSTRUCTIONS: &str = "\
IMPORTANT INSTRUCTIONS:
- ALWAYS use the information provided in the context blocks above
- When outlet information includes map URLs, present them clearly
- When listing outlets or products, include ALL items provided, do not skip any
- Use bullet points or numbered lists for multiple items
- For price-based queries, recommend the lowest priced option first
- If the user refers to \"that\", \"it\", or \"there\", check the previous conversation
- If you don't have specific information, acknowledge it gracefully";

/// What the boundary returns for one chat request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub response: String,
    pub session_id: String,
    pub planning_info: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculation_result: Option<CalcResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outlet_count: Option<usize>,
}

/// Drives one request end to end: session snapshot, plan, tool dispatch,
/// prompt composition, model call, turn persistence. Borrows the index,
/// gate, and store; its only mutations go through the session store's API.
pub struct ChatEngine {
    planner: Planner,
    calculator: Calculator,
    index: Arc<ProductIndex>,
    gate: Arc<OutletSqlGate>,
    sessions: Arc<SessionStore>,
    llm: Arc<dyn LlmClient>,
    llm_timeout: Duration,
    request_deadline: Duration,
}

/// Everything the timed part of one request produced.
struct ToolOutcome {
    response: String,
    calculation_result: Option<CalcResult>,
    product_results: Option<Vec<(Product, f32)>>,
    outlet_answer: Option<OutletAnswer>,
}

impl ChatEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        planner: Planner,
        calculator: Calculator,
        index: Arc<ProductIndex>,
        gate: Arc<OutletSqlGate>,
        sessions: Arc<SessionStore>,
        llm: Arc<dyn LlmClient>,
        llm_timeout: Duration,
        request_deadline: Duration,
    ) -> Self {
        Self { planner, calculator, index, gate, sessions, llm, llm_timeout, request_deadline }
    }

    pub async fn handle(
        &self,
        question: &str,
        session_id: Option<&str>,
    ) -> Result<ResponseEnvelope, EngineError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RequestError::EmptyQuestion.into());
        }
        let session_id = resolve_session_id(session_id)?;

        let snapshot = self.sessions.snapshot(&session_id);
        let decision = self.planner.plan(question, &snapshot);
        info!(
            session_id = %session_id,
            action = %decision.primary_action,
            confidence = decision.confidence,
            "planner decision"
        );

        let sort_key = SortKey::detect(question);

        // Tool dispatch and the model call share one wall-clock budget; an
        // exhausted budget surfaces as a resource error, not a hung request.
        let outcome = match tokio::time::timeout(
            self.request_deadline,
            self.execute_plan(question, &snapshot, &decision, sort_key),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    deadline_ms = self.request_deadline.as_millis() as u64,
                    "request budget exhausted; failing fast"
                );
                return Err(ServiceError::DeadlineExceeded.into());
            }
        };

        self.record_turn(&session_id, question, &outcome.response, &decision, sort_key);
        if outcome.product_results.is_some() {
            self.sessions.update_metadata(
                &session_id,
                metadata_keys::LAST_PRODUCT_QUERY,
                question.to_string(),
            );
        }
        if outcome.outlet_answer.is_some() {
            self.sessions.update_metadata(
                &session_id,
                metadata_keys::LAST_OUTLET_QUERY,
                question.to_string(),
            );
        }

        Ok(ResponseEnvelope {
            response: outcome.response,
            session_id,
            planning_info: decision,
            calculation_result: outcome.calculation_result,
            product_count: outcome.product_results.as_ref().map(Vec::len),
            outlet_count: outcome.outlet_answer.as_ref().map(|answer| answer.count),
        })
    }

    /// The budgeted part of one request: tool dispatch, prompt composition,
    /// and the model call.
    async fn execute_plan(
        &self,
        question: &str,
        snapshot: &SessionSnapshot,
        decision: &Decision,
        sort_key: Option<SortKey>,
    ) -> Result<ToolOutcome, EngineError> {
        let mut calculation_result: Option<CalcResult> = None;
        let mut product_results: Option<Vec<(Product, f32)>> = None;
        let mut outlet_answer: Option<OutletAnswer> = None;

        // Total dispatch over the action enum: adding a tool means adding a
        // variant and handling it here.
        match decision.primary_action {
            Action::Calculate => {
                calculation_result = Some(self.calculator.parse_and_calculate(question));
            }
            Action::SearchProducts => {
                product_results =
                    Some(self.index.search_sorted(question, DEFAULT_TOP_K, sort_key).await);
            }
            Action::SearchOutlets => {
                outlet_answer = Some(self.answer_outlets(question).await?);
            }
            Action::Hybrid => {
                let (products, outlets) = tokio::join!(
                    self.index.search_sorted(question, DEFAULT_TOP_K, sort_key),
                    self.answer_outlets(question),
                );
                product_results = Some(products);
                outlet_answer = Some(outlets?);
                // A hybrid decision always reports what the calculator saw,
                // even when that is "no expression".
                calculation_result = Some(self.calculator.parse_and_calculate(question));
            }
            Action::Clarify => {
                // No tools, no model call: the clarification prompt is the
                // response.
                let prompt = decision
                    .clarification_prompt
                    .clone()
                    .unwrap_or_else(|| "Could you share a few more details?".to_string());
                return Ok(ToolOutcome {
                    response: prompt,
                    calculation_result: None,
                    product_results: None,
                    outlet_answer: None,
                });
            }
            Action::AnswerDirectly => {}
        }

        let product_block = product_results
            .as_ref()
            .map(|results| ProductIndex::format_results(results, sort_key));
        let outlet_block = outlet_answer.as_ref().map(|answer| answer.formatted_text.clone());

        let prompt = build_prompt(
            question,
            snapshot,
            product_block.as_deref(),
            outlet_block.as_deref(),
            calculation_result.as_ref(),
        );

        let response = match tokio::time::timeout(self.llm_timeout, self.llm.complete(&prompt))
            .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(ToolError::RateLimited { retry_after_ms })) => {
                return Err(ServiceError::RateLimited { retry_after_ms }.into());
            }
            Ok(Err(error)) => {
                warn!(error = %error, "language model call failed; degrading to tool output");
                fallback_answer(
                    calculation_result.as_ref(),
                    product_block.as_deref(),
                    outlet_block.as_deref(),
                )
            }
            Err(_) => {
                warn!(
                    deadline_ms = self.llm_timeout.as_millis() as u64,
                    "language model call timed out; degrading to tool output"
                );
                fallback_answer(
                    calculation_result.as_ref(),
                    product_block.as_deref(),
                    outlet_block.as_deref(),
                )
            }
        };

        Ok(ToolOutcome { response, calculation_result, product_results, outlet_answer })
    }

    /// Appends the turn and the always-written metadata. Runs strictly
    /// after the model call so a cancelled request never records a
    /// half-turn.
    fn record_turn(
        &self,
        session_id: &str,
        question: &str,
        response: &str,
        decision: &Decision,
        sort_key: Option<SortKey>,
    ) {
        self.sessions.append_turn(
            session_id,
            Turn {
                user: question.to_string(),
                assistant: response.to_string(),
                decision: decision.clone(),
                timestamp: Utc::now(),
            },
        );
        self.sessions.update_metadata(
            session_id,
            metadata_keys::LAST_PRIMARY_ACTION,
            decision.primary_action.as_str().to_string(),
        );
        if let Some(sort_key) = sort_key {
            self.sessions.update_metadata(
                session_id,
                metadata_keys::PREFERRED_SORT,
                sort_key.as_str().to_string(),
            );
        }
    }

    async fn answer_outlets(&self, question: &str) -> Result<OutletAnswer, EngineError> {
        self.gate.answer(question).await.map_err(EngineError::Resource)
    }
}

fn resolve_session_id(session_id: Option<&str>) -> Result<String, RequestError> {
    match session_id {
        None => Ok(Uuid::new_v4().to_string()),
        Some(raw) => {
            let trimmed = raw.trim();
            let valid = !trimmed.is_empty()
                && trimmed.len() <= 128
                && trimmed
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
            if valid {
                Ok(trimmed.to_string())
            } else {
                Err(RequestError::InvalidSessionId)
            }
        }
    }
}

fn build_prompt(
    question: &str,
    snapshot: &SessionSnapshot,
    product_block: Option<&str>,
    outlet_block: Option<&str>,
    calculation: Option<&CalcResult>,
) -> String {
    let mut prompt = format!(
        "{SYSTEM_TEMPLATE}\n\nPrevious conversation:\n{}\n\nRelevant drinkware products:\n{}\n\n\
         Relevant outlet locations:\n{}\n\nUser question: {question}\n\n{RESPONSE_INSTRUCTIONS}",
        snapshot.format_history(),
        product_block.unwrap_or("Not requested"),
        outlet_block.unwrap_or("Not requested"),
    );

    match calculation {
        Some(CalcResult::Success { formatted, .. }) => {
            prompt.push_str(&format!(
                "\n\nCALCULATION RESULT:\n{formatted}\n\nKeep the arithmetic part of your \
                 response brief: state the answer plainly."
            ));
        }
        Some(CalcResult::Failure { error_message, .. }) => {
            prompt.push_str(&format!(
                "\n\nCALCULATION ERROR:\n{error_message}\n\nExplain the error simply and ask \
                 whether they need anything else."
            ));
        }
        None => {}
    }

    prompt
}

fn fallback_answer(
    calculation: Option<&CalcResult>,
    product_block: Option<&str>,
    outlet_block: Option<&str>,
) -> String {
    if let Some(CalcResult::Success { formatted, .. }) = calculation {
        return formatted.clone();
    }

    let mut sections = Vec::new();
    if let Some(block) = product_block {
        sections.push(block.to_string());
    }
    if let Some(block) = outlet_block {
        sections.push(block.to_string());
    }
    if sections.is_empty() {
        "I'm having trouble answering right now. Please try again in a moment.".to_string()
    } else {
        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use kopi_core::config::PlannerConfig;
    use kopi_core::{metadata_keys, Action, CalcErrorKind, Catalog, RequestError, EngineError};
    use kopi_db::{connect_with_settings, fixtures, SqlOutletStore};

    use crate::calculator::Calculator;
    use crate::embedding::HashingEmbedder;
    use crate::llm::ScriptedLlmClient;
    use crate::planner::Planner;
    use crate::product_index::ProductIndex;
    use crate::session::SessionStore;
    use crate::sql_gate::OutletSqlGate;

    use super::ChatEngine;

    const CATALOG: &str = r#"{"id":"p-01","name":"All Day Tumbler","description":"Double-walled stainless steel tumbler","price":79.0,"capacity_ml":500,"tags":["tumbler","hot"]}
{"id":"p-02","name":"Frozee Cold Cup","description":"Cold cup tumbler with straw","price":49.0,"capacity_ml":650,"tags":["cold cup","straw"]}
{"id":"p-03","name":"Buddy Mug","description":"Ceramic mug for coffee","price":29.5,"tags":["mug"]}
"#;

    async fn engine_with(replies: Vec<&str>) -> (ChatEngine, Arc<ScriptedLlmClient>) {
        engine_with_window(replies, 3).await
    }

    async fn engine_with_window(
        replies: Vec<&str>,
        window: usize,
    ) -> (ChatEngine, Arc<ScriptedLlmClient>) {
        let llm = Arc::new(ScriptedLlmClient::with_replies(replies));
        let engine = build_engine(llm.clone(), window, Duration::from_secs(30)).await;
        (engine, llm)
    }

    async fn build_engine(
        llm: Arc<dyn crate::llm::LlmClient>,
        window: usize,
        request_deadline: Duration,
    ) -> ChatEngine {
        let catalog = Catalog::parse(CATALOG).expect("catalog");
        let index = Arc::new(
            ProductIndex::build(&catalog, Arc::new(HashingEmbedder::new(128)))
                .await
                .expect("index"),
        );

        // One connection: a plain in-memory database is per-connection.
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        fixtures::load(&pool).await.expect("seed");

        let gate = Arc::new(OutletSqlGate::new(
            llm.clone(),
            Arc::new(SqlOutletStore::new(pool)),
            Duration::from_secs(5),
        ));
        let sessions = Arc::new(SessionStore::new(window, 60, 1_000));
        let planner = Planner::new(&PlannerConfig {
            known_locations: vec!["selangor".to_string(), "kuala lumpur".to_string()],
        });

        ChatEngine::new(
            planner,
            Calculator::new(),
            index,
            gate,
            sessions,
            llm,
            Duration::from_secs(20),
            request_deadline,
        )
    }

    #[tokio::test]
    async fn word_arithmetic_produces_calc_result_and_answer() {
        let (engine, _) = engine_with(vec!["5 plus 3 is 8. Anything else?"]).await;

        let envelope = engine.handle("what is 5 plus 3", None).await.expect("handle");
        assert_eq!(envelope.planning_info.primary_action, Action::Calculate);

        let calc = envelope.calculation_result.expect("calc result");
        assert_eq!(calc.value(), Some(8.0));
        assert!(envelope.response.contains('8'));
        assert!(envelope.product_count.is_none());
        assert!(envelope.outlet_count.is_none());
    }

    #[tokio::test]
    async fn division_by_zero_is_reported_not_raised() {
        let (engine, llm) =
            engine_with(vec!["You can't divide by zero - want to try another sum?"]).await;

        let envelope = engine.handle("what is 100 divided by 0", None).await.expect("handle");
        assert_eq!(envelope.planning_info.primary_action, Action::Calculate);

        let calc = envelope.calculation_result.expect("calc result");
        assert_eq!(calc.error_kind(), Some(CalcErrorKind::DivideByZero));
        assert_eq!(calc.value(), None);

        let prompts = llm.prompts();
        assert!(prompts[0].contains("CALCULATION ERROR"));
    }

    #[tokio::test]
    async fn product_question_attaches_a_product_block() {
        let (engine, llm) = engine_with(vec!["Here are our tumblers."]).await;

        let envelope = engine.handle("show me tumblers", None).await.expect("handle");
        assert_eq!(envelope.planning_info.primary_action, Action::SearchProducts);
        assert!(envelope.product_count.expect("product count") >= 1);

        let prompts = llm.prompts();
        assert!(prompts[0].contains("Relevant drinkware products:"));
        assert!(prompts[0].contains("All Day Tumbler"));
    }

    #[tokio::test]
    async fn cheapest_question_sorts_ascending_by_price() {
        let (engine, llm) = engine_with(vec!["The cheapest is the Buddy Mug."]).await;

        let envelope = engine.handle("cheapest tumbler", None).await.expect("handle");
        assert_eq!(envelope.planning_info.primary_action, Action::SearchProducts);

        let prompt = llm.prompts().remove(0);
        let mug = prompt.find("Buddy Mug").expect("mug in block");
        let cold_cup = prompt.find("Frozee Cold Cup").expect("cold cup in block");
        let tumbler = prompt.find("All Day Tumbler").expect("tumbler in block");
        assert!(mug < cold_cup && cold_cup < tumbler, "block must be price ascending");
    }

    #[tokio::test]
    async fn outlet_count_question_returns_count() {
        let (engine, _) = engine_with(vec![
            "SELECT COUNT(*) AS count FROM outlets WHERE state LIKE '%Selangor%'",
            "There are 4 outlets in Selangor.",
        ])
        .await;

        let envelope =
            engine.handle("how many outlets in Selangor", None).await.expect("handle");
        assert_eq!(envelope.planning_info.primary_action, Action::SearchOutlets);
        assert_eq!(envelope.outlet_count, Some(fixtures::SELANGOR_OUTLETS));
        assert!(envelope.response.contains('4'));
    }

    #[tokio::test]
    async fn arithmetic_with_product_need_runs_hybrid() {
        let (engine, _) = engine_with(vec![
            "SELECT * FROM outlets LIMIT 3",
            "You need 8 tumblers; the All Day Tumbler fits.",
        ])
        .await;

        let envelope =
            engine.handle("I need a tumbler for 5 + 3 people", None).await.expect("handle");
        assert_eq!(envelope.planning_info.primary_action, Action::Hybrid);
        assert_eq!(envelope.calculation_result.expect("calc").value(), Some(8.0));
        assert!(envelope.product_count.expect("products") >= 1);
    }

    #[tokio::test]
    async fn bare_pronoun_clarifies_without_touching_tools() {
        let (engine, llm) = engine_with(vec!["We have several tumblers to choose from."]).await;

        let first = engine.handle("show me tumblers", Some("s-7")).await.expect("first turn");
        assert_eq!(first.planning_info.primary_action, Action::SearchProducts);
        assert_eq!(llm.prompts().len(), 1);

        let second = engine.handle("it", Some("s-7")).await.expect("second turn");
        assert_eq!(second.planning_info.primary_action, Action::Clarify);
        let prompt = second
            .planning_info
            .clarification_prompt
            .as_deref()
            .expect("clarification prompt");
        assert!(!prompt.is_empty());
        assert_eq!(second.response, prompt);
        assert!(second.calculation_result.is_none());
        assert_eq!(llm.prompts().len(), 1, "clarify must not call the model or any tool");
    }

    #[tokio::test]
    async fn session_context_carries_into_the_next_prompt() {
        let (engine, llm) =
            engine_with(vec!["We stock three tumblers.", "As mentioned, three models."]).await;

        let first = engine.handle("show me tumblers", Some("s-9")).await.expect("first");
        assert_eq!(first.session_id, "s-9");

        engine.handle("which is the cheapest tumbler", Some("s-9")).await.expect("second");
        let prompts = llm.prompts();
        assert!(
            prompts[1].contains("User: show me tumblers"),
            "second prompt must include the first turn"
        );
        assert!(prompts[1].contains("Assistant: We stock three tumblers."));
    }

    #[tokio::test]
    async fn generated_session_ids_are_echoed_and_reusable() {
        let (engine, _) = engine_with(vec!["Hello!", "Hello again!"]).await;

        let first = engine.handle("good morning friends", None).await.expect("first");
        assert!(!first.session_id.is_empty());

        let second = engine
            .handle("good morning once more", Some(&first.session_id))
            .await
            .expect("second");
        assert_eq!(second.session_id, first.session_id);
    }

    #[tokio::test]
    async fn empty_question_is_a_request_error() {
        let (engine, _) = engine_with(vec![]).await;
        let error = engine.handle("   ", None).await.expect_err("must fail");
        assert_eq!(error, EngineError::Request(RequestError::EmptyQuestion));
    }

    #[tokio::test]
    async fn malformed_session_id_is_rejected() {
        let (engine, _) = engine_with(vec![]).await;
        let error = engine
            .handle("show me tumblers", Some("no spaces allowed"))
            .await
            .expect_err("must fail");
        assert_eq!(error, EngineError::Request(RequestError::InvalidSessionId));
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_tool_output() {
        // Script is empty: the final completion call fails.
        let (engine, _) = engine_with(vec![]).await;

        let envelope = engine.handle("what is 5 + 3", None).await.expect("handle");
        assert_eq!(envelope.planning_info.primary_action, Action::Calculate);
        assert_eq!(envelope.response, "5 + 3 = 8", "fallback should surface the raw result");
        assert!(envelope.calculation_result.expect("calc").is_ok());
    }

    #[tokio::test]
    async fn metadata_records_last_action_and_queries() {
        let (engine, _) = engine_with(vec![
            "Our tumblers are listed.",
            "SELECT * FROM outlets WHERE state LIKE '%Selangor%'",
            "Plenty of outlets in Selangor.",
        ])
        .await;

        engine.handle("show me tumblers", Some("s-meta")).await.expect("products");
        engine
            .handle("where are your outlets in Selangor", Some("s-meta"))
            .await
            .expect("outlets");

        let snapshot = engine.sessions.snapshot("s-meta");
        assert_eq!(
            snapshot.metadata_value(metadata_keys::LAST_PRIMARY_ACTION),
            Some("search_outlets")
        );
        assert_eq!(
            snapshot.metadata_value(metadata_keys::LAST_PRODUCT_QUERY),
            Some("show me tumblers")
        );
        assert_eq!(
            snapshot.metadata_value(metadata_keys::LAST_OUTLET_QUERY),
            Some("where are your outlets in Selangor")
        );
    }

    struct StallingLlmClient;

    #[async_trait::async_trait]
    impl crate::llm::LlmClient for StallingLlmClient {
        async fn complete(&self, _prompt: &str) -> Result<String, kopi_core::ToolError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok("far too late".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_request_budget_surfaces_as_resource_error() {
        let engine =
            build_engine(Arc::new(StallingLlmClient), 3, Duration::from_secs(1)).await;

        let error = engine
            .handle("good morning everyone", Some("s-slow"))
            .await
            .expect_err("budget must bound the request");
        assert_eq!(error, EngineError::Resource(kopi_core::ServiceError::DeadlineExceeded));

        let snapshot = engine.sessions.snapshot("s-slow");
        assert!(snapshot.turns.is_empty(), "a timed-out request must not record a turn");
    }

    #[tokio::test]
    async fn window_zero_keeps_chat_stateless() {
        let (engine, llm) =
            engine_with_window(vec!["First answer.", "Second answer."], 0).await;

        engine.handle("show me tumblers", Some("s-0")).await.expect("first");
        engine.handle("show me the cheapest cup", Some("s-0")).await.expect("second");

        let prompts = llm.prompts();
        assert!(
            prompts[1].contains("No previous conversation."),
            "window zero must not carry turns"
        );
        assert_eq!(engine.sessions.len(), 1, "the session itself still exists");
    }
}
