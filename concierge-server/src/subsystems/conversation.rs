//! Conversation pipeline.
//!
//! Each inbound event for a session runs to completion under that session's
//! lock: load context, route, call the completion backend, run any tool calls
//! it asks for, persist, then emit the resulting events to the bound
//! connection.

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use concierge_core::completion::{CompletionBackend, CompletionOutput};
use concierge_core::ipc::ServerEvent;
use concierge_core::models::{keys, Context, Role, ToolOutcome, ToolSpec, Turn};
use concierge_core::{timeparse, ConciergeError};
use serde_json::Value;

use super::context_store::ContextStore;
use super::directives::Directive;
use super::dispatcher::{self, ToolDispatcher};
use super::modes::{Mode, ModeRouter};
use super::registry::SessionRegistry;

pub const APOLOGY: &str =
    "Sorry, I'm having trouble responding right now. Please try again in a moment.";

const FALLBACK_AFTER_TOOLS: &str = "All set. Is there anything else I can help you with?";

/// Sent when the model still wants tools after the last permitted round.
pub const UNFINISHED: &str =
    "Sorry, I couldn't finish that request. Could you try again, perhaps one step at a time?";

fn fallback_greeting(ctx: &Context) -> String {
    match ctx.customer_name() {
        Some(name) => format!("Welcome back, {name}! How can I help you today?"),
        None => "Hi, welcome to the salon! Could you tell me your name so I can look you up?".to_string(),
    }
}

pub struct ConversationEngine {
    store: Arc<ContextStore>,
    registry: Arc<SessionRegistry>,
    router: ModeRouter,
    dispatcher: Arc<ToolDispatcher>,
    completion: Arc<dyn CompletionBackend>,
    completion_timeout: Duration,
    max_tool_rounds: usize,
    tz: Tz,
}

impl ConversationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ContextStore>,
        registry: Arc<SessionRegistry>,
        router: ModeRouter,
        dispatcher: Arc<ToolDispatcher>,
        completion: Arc<dyn CompletionBackend>,
        completion_timeout: Duration,
        max_tool_rounds: usize,
        tz: Tz,
    ) -> Self {
        Self {
            store,
            registry,
            router,
            dispatcher,
            completion,
            completion_timeout,
            max_tool_rounds,
            tz,
        }
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn emit(&self, session_id: &str, event: ServerEvent) {
        if !self.registry.send(session_id, event) {
            tracing::debug!(session_id, "Dropped event for unbound session");
        }
    }

    fn emit_context(&self, session_id: &str, ctx: &Context) {
        self.emit(
            session_id,
            ServerEvent::Context {
                context: ctx.clone(),
            },
        );
    }

    /// Role from the context's flag, recorded on the registry binding.
    fn apply_role(&self, session_id: &str, ctx: &mut Context, is_admin: bool) -> Role {
        ctx.ensure_admin_mode(is_admin);
        let role = Role::from_admin(ctx.admin_mode().unwrap_or(is_admin));
        self.registry.set_role(session_id, role);
        role
    }

    /// Once a tool has identified the customer, move the session's record
    /// under the customer key so it is persisted and reachable by either key.
    async fn follow_identity(&self, session_id: &str, ctx: &mut Context) {
        let Some(customer_id) = ctx.customer_id() else {
            return;
        };
        if self.store.resolve(session_id) == customer_id {
            return;
        }
        let (merged, outcome) = self
            .store
            .adopt_in_flight(session_id, &customer_id, std::mem::take(ctx))
            .await;
        tracing::info!(session_id, customer_id = %customer_id, ?outcome, "Customer identified");
        *ctx = merged;
    }

    // ========================================================================
    // Event handlers
    // ========================================================================

    pub async fn chat(&self, session_id: &str, message: &str, is_admin: bool) {
        let _guard = self.store.lock(session_id).await;
        let mut ctx = self.store.get(session_id).await;
        let role = self.apply_role(session_id, &mut ctx, is_admin);

        ctx.push_turn(Turn::user(message));
        let decision = self.router.route(&mut ctx);
        tracing::info!(session_id, mode = %decision.mode, "Handling chat turn");

        self.emit(session_id, ServerEvent::Typing { typing: true });
        let reply = match self.respond(session_id, &mut ctx, decision.mode, role, Some(message)).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Completion failed; sending apology");
                APOLOGY.to_string()
            }
        };

        ctx.push_turn(Turn::assistant(reply.clone()));
        self.store.put(session_id, ctx.clone()).await;

        self.emit(session_id, ServerEvent::assistant_message(reply));
        self.emit(session_id, ServerEvent::Typing { typing: false });
        self.emit_context(session_id, &ctx);
    }

    pub async fn welcome(&self, session_id: &str, is_admin: bool) {
        let _guard = self.store.lock(session_id).await;
        let mut ctx = self.store.get(session_id).await;
        let role = self.apply_role(session_id, &mut ctx, is_admin);
        let decision = self.router.route(&mut ctx);

        let greeting = match self.respond(session_id, &mut ctx, decision.mode, role, None).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => fallback_greeting(&ctx),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Greeting completion failed; using fallback");
                fallback_greeting(&ctx)
            }
        };

        ctx.push_turn(Turn::assistant(greeting.clone()));
        self.store.put(session_id, ctx.clone()).await;
        self.emit(session_id, ServerEvent::assistant_message(greeting));
        self.emit_context(session_id, &ctx);
    }

    pub async fn load_customer(&self, session_id: &str, customer_id: &str, is_admin: bool) {
        let _guard = self.store.lock(session_id).await;
        let info = match self.dispatcher.lookup_customer(customer_id).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(session_id, customer_id, error = %e, "Customer lookup failed");
                self.emit(session_id, ServerEvent::error(dispatcher::human_message(&e)));
                return;
            }
        };

        let (mut ctx, _) = self.store.adopt_customer_key(session_id, customer_id).await;
        self.apply_role(session_id, &mut ctx, is_admin);
        ctx.set(keys::USER_INFO, info);
        let outcome = self.store.put(session_id, ctx.clone()).await;
        tracing::info!(session_id, customer_id, ?outcome, "Loaded customer");
        self.emit_context(session_id, &ctx);
    }

    pub async fn clear_context(&self, session_id: &str) {
        let _guard = self.store.lock(session_id).await;
        let (ctx, _) = self.store.reset(session_id).await;
        self.emit_context(session_id, &ctx);
        self.emit(
            session_id,
            ServerEvent::History {
                history: ctx.history.clone(),
            },
        );
    }

    pub async fn get_context(&self, session_id: &str) {
        let ctx = self.store.get(session_id).await;
        self.emit_context(session_id, &ctx);
    }

    pub async fn get_history(&self, session_id: &str) {
        let ctx = self.store.get(session_id).await;
        self.emit(session_id, ServerEvent::History { history: ctx.history });
    }

    /// Run a tool on behalf of the client. The typed error is returned so the
    /// HTTP surface can pick a status code; events are emitted either way.
    pub async fn use_tool(&self, session_id: &str, tool: &str, params: &Value) -> Result<Value, ConciergeError> {
        let _guard = self.store.lock(session_id).await;
        let mut ctx = self.store.get(session_id).await;

        let result = self.dispatcher.execute(tool, params, &mut ctx).await;
        let outcome = match &result {
            Ok(value) => ToolOutcome::success(tool, value.clone()),
            Err(e) => {
                tracing::warn!(session_id, tool, error = %e, "Direct tool call failed");
                ToolOutcome::failure(tool, dispatcher::human_message(e))
            }
        };

        ctx.push_turn(Turn::tool(tool, params.clone(), outcome.success, outcome.summary()));
        self.follow_identity(session_id, &mut ctx).await;
        self.store.put(session_id, ctx.clone()).await;
        self.emit(session_id, outcome.into());
        self.emit_context(session_id, &ctx);
        result
    }

    // ========================================================================
    // Completion loop
    // ========================================================================

    async fn complete(
        &self,
        directive: &str,
        history: &[Turn],
        input: Option<&str>,
        tools: &[ToolSpec],
    ) -> Result<CompletionOutput, ConciergeError> {
        let call = self.completion.complete(directive, history, input, tools);
        match tokio::time::timeout(self.completion_timeout, call).await {
            Ok(result) => result.map_err(ConciergeError::from),
            Err(_) => Err(ConciergeError::UpstreamUnavailable(format!(
                "completion timed out after {}s",
                self.completion_timeout.as_secs()
            ))),
        }
    }

    /// Ask the backend for a reply, running tool calls between rounds.
    async fn respond(
        &self,
        session_id: &str,
        ctx: &mut Context,
        mode: Mode,
        role: Role,
        input: Option<&str>,
    ) -> Result<String, ConciergeError> {
        let today = timeparse::today_in(self.tz);
        let directive = Directive::build(mode, role, ctx, today);
        let specs = directive.tool_specs();

        // The newest user turn travels as `input`, not as history.
        let prior = if input.is_some() {
            ctx.history.len().saturating_sub(1)
        } else {
            ctx.history.len()
        };
        let mut output = self
            .complete(&directive.render(), &ctx.history[..prior], input, &specs)
            .await?;

        let mut rounds = 0;
        while !output.tool_calls.is_empty() && rounds < self.max_tool_rounds {
            rounds += 1;
            for call in std::mem::take(&mut output.tool_calls) {
                let outcome = if directive.tools.iter().any(|t| *t == call.name) {
                    self.dispatcher.dispatch(&call.name, &call.arguments, ctx).await
                } else {
                    tracing::warn!(session_id, tool = %call.name, mode = %mode, "Tool not offered in this mode");
                    ToolOutcome::failure(&call.name, format!("{} is not available right now.", call.name))
                };
                ctx.push_turn(Turn::tool(&call.name, call.arguments.clone(), outcome.success, outcome.summary()));
                self.emit(session_id, outcome.into());
                self.follow_identity(session_id, ctx).await;
            }

            // Facts may have changed; rebuild the directive for the next round.
            let refreshed = Directive::build(mode, role, ctx, today);
            output = self
                .complete(&refreshed.render(), &ctx.history, None, &specs)
                .await?;
        }

        if !output.tool_calls.is_empty() {
            tracing::warn!(
                session_id,
                rounds,
                pending = output.tool_calls.len(),
                "Tool round limit reached with calls outstanding"
            );
            return Ok(UNFINISHED.to_string());
        }

        if output.text.trim().is_empty() {
            if rounds > 0 {
                return Ok(FALLBACK_AFTER_TOOLS.to_string());
            }
            if input.is_some() {
                return Err(ConciergeError::UpstreamUnavailable("empty completion".into()));
            }
        }
        Ok(output.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use concierge_core::completion::CompletionError;
    use concierge_core::durable::{DurableStore, InMemoryDurableStore};
    use concierge_core::models::{ToolCall, TurnRole};
    use concierge_core::scheduling::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Replays scripted outputs and records what it was asked.
    #[derive(Default)]
    struct ScriptedCompletion {
        script: Mutex<VecDeque<Result<CompletionOutput, CompletionError>>>,
        seen_inputs: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedCompletion {
        fn new(outputs: Vec<Result<CompletionOutput, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(outputs.into()),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedCompletion {
        async fn complete(
            &self,
            _directive: &str,
            _history: &[Turn],
            input: Option<&str>,
            _tools: &[ToolSpec],
        ) -> Result<CompletionOutput, CompletionError> {
            self.seen_inputs.lock().unwrap().push(input.map(str::to_string));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(CompletionError::EmptyResponse))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct OneCustomer;

    #[async_trait]
    impl SchedulingApi for OneCustomer {
        async fn search_contacts(&self, _query: &str) -> Result<Vec<Contact>, SchedulingError> {
            Ok(vec![ana()])
        }
        async fn get_contact(&self, id: &str) -> Result<Contact, SchedulingError> {
            if id == "c1" {
                Ok(ana())
            } else {
                Err(SchedulingError::NotFound(format!("Customer {id}")))
            }
        }
        async fn create_contact(&self, _c: &NewContact) -> Result<Contact, SchedulingError> {
            Ok(ana())
        }
        async fn list_services(&self) -> Result<Vec<Service>, SchedulingError> {
            Ok(vec![])
        }
        async fn availability(&self, _d: chrono::NaiveDate, _s: Option<&str>) -> Result<Vec<Slot>, SchedulingError> {
            Ok(vec![])
        }
        async fn list_appointments(&self, _c: &str) -> Result<Vec<Appointment>, SchedulingError> {
            Ok(vec![])
        }
        async fn create_appointment(&self, _r: &NewAppointment) -> Result<Appointment, SchedulingError> {
            Err(SchedulingError::Api { code: 500, message: "down".into() })
        }
        async fn update_appointment(&self, _i: &str, _c: &AppointmentChange) -> Result<Appointment, SchedulingError> {
            Err(SchedulingError::Api { code: 500, message: "down".into() })
        }
        async fn cancel_appointment(&self, _i: &str) -> Result<(), SchedulingError> {
            Ok(())
        }
        fn name(&self) -> &str {
            "one-customer"
        }
    }

    fn ana() -> Contact {
        Contact {
            id: "c1".into(),
            name: "Ana".into(),
            email: None,
            phone: None,
        }
    }

    fn search_call(query: &str) -> Result<CompletionOutput, CompletionError> {
        Ok(CompletionOutput {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: None,
                name: "search_customer".into(),
                arguments: json!({ "query": query }),
            }],
        })
    }

    fn text(t: &str) -> Result<CompletionOutput, CompletionError> {
        Ok(CompletionOutput {
            text: t.into(),
            tool_calls: vec![],
        })
    }

    fn engine(completion: Arc<ScriptedCompletion>) -> ConversationEngine {
        engine_with_store(completion, ContextStore::volatile_only())
    }

    fn engine_with_store(completion: Arc<ScriptedCompletion>, store: ContextStore) -> ConversationEngine {
        let dispatcher = ToolDispatcher::new(Arc::new(OneCustomer), chrono_tz::UTC, Duration::from_secs(5));
        ConversationEngine::new(
            Arc::new(store),
            Arc::new(SessionRegistry::new()),
            ModeRouter::keyword(3),
            Arc::new(dispatcher),
            completion,
            Duration::from_secs(5),
            4,
            chrono_tz::UTC,
        )
    }

    fn connect(engine: &ConversationEngine) -> (String, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (sid, _) = engine.registry().connect(None, tx, Role::Customer);
        // Drain the session event.
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Session { .. })));
        (sid, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn chat_emits_typing_message_context_in_order() {
        let completion = ScriptedCompletion::new(vec![text("Hello! Who am I speaking with?")]);
        let engine = engine(completion.clone());
        let (sid, mut rx) = connect(&engine);

        engine.chat(&sid, "hi", false).await;
        let events = drain(&mut rx);
        assert!(matches!(events[0], ServerEvent::Typing { typing: true }));
        assert!(matches!(&events[1], ServerEvent::Message { content, .. } if content.starts_with("Hello")));
        assert!(matches!(events[2], ServerEvent::Typing { typing: false }));
        let ServerEvent::Context { context } = &events[3] else {
            panic!("expected context, got {:?}", events[3]);
        };
        assert_eq!(context.history.len(), 2);
        assert_eq!(context.memory[keys::LAST_MODE], "welcome");
        assert_eq!(context.admin_mode(), Some(false));
        assert_eq!(completion.seen_inputs.lock().unwrap()[0].as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn completion_failure_sends_apology() {
        let engine = engine(ScriptedCompletion::new(vec![Err(CompletionError::EmptyResponse)]));
        let (sid, mut rx) = connect(&engine);
        engine.chat(&sid, "hi", false).await;
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::Message { content, .. } if content == APOLOGY)));
        assert!(engine.registry().is_connected(&sid));
        assert_eq!(engine.store().get(&sid).await.history.len(), 2);
    }

    #[tokio::test]
    async fn tool_calls_run_between_rounds() {
        let engine = engine(ScriptedCompletion::new(vec![
            Ok(CompletionOutput {
                text: String::new(),
                tool_calls: vec![ToolCall {
                    id: Some("call_1".into()),
                    name: "search_customer".into(),
                    arguments: json!({"query": "Ana"}),
                }],
            }),
            text("Found you, Ana."),
        ]));
        let (sid, mut rx) = connect(&engine);

        engine.chat(&sid, "I'm Ana", false).await;
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::ToolResult { tool, success: true, .. } if tool == "search_customer")));

        let ctx = engine.store().get(&sid).await;
        assert_eq!(ctx.customer_id().as_deref(), Some("c1"));
        let roles: Vec<TurnRole> = ctx.history.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![TurnRole::User, TurnRole::Tool, TurnRole::Assistant]);
        assert_eq!(ctx.history[2].content, "Found you, Ana.");
    }

    #[tokio::test]
    async fn tools_outside_the_mode_are_refused() {
        let engine = engine(ScriptedCompletion::new(vec![
            Ok(CompletionOutput {
                text: String::new(),
                tool_calls: vec![ToolCall {
                    id: None,
                    name: "cancel_appointment".into(),
                    arguments: json!({"appointmentId": "a1"}),
                }],
            }),
            text("I can't do that yet."),
        ]));
        let (sid, mut rx) = connect(&engine);
        engine.chat(&sid, "hello", false).await;
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::ToolResult { success: false, .. })));
    }

    #[tokio::test]
    async fn welcome_falls_back_to_static_greeting() {
        let engine = engine(ScriptedCompletion::new(vec![]));
        let (sid, mut rx) = connect(&engine);
        engine.welcome(&sid, true).await;
        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::Message { content, .. } if content.contains("welcome to the salon")));
        assert_eq!(engine.registry().role_of(&sid), Some(Role::Admin));
    }

    #[tokio::test]
    async fn load_customer_adopts_and_reports() {
        let engine = engine(ScriptedCompletion::new(vec![text("hi")]));
        let (sid, mut rx) = connect(&engine);
        engine.chat(&sid, "hello", false).await;
        drain(&mut rx);

        engine.load_customer(&sid, "c1", false).await;
        let events = drain(&mut rx);
        let ServerEvent::Context { context } = &events[0] else {
            panic!("expected context");
        };
        assert_eq!(context.customer_name().as_deref(), Some("Ana"));
        assert_eq!(context.history.len(), 2);
        assert_eq!(engine.store().get("c1").await, engine.store().get(&sid).await);
    }

    #[tokio::test]
    async fn load_unknown_customer_emits_error() {
        let engine = engine(ScriptedCompletion::new(vec![]));
        let (sid, mut rx) = connect(&engine);
        engine.load_customer(&sid, "nobody", false).await;
        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::Error { message } if message.contains("not found")));
    }

    #[tokio::test]
    async fn clear_context_keeps_role() {
        let engine = engine(ScriptedCompletion::new(vec![text("hi")]));
        let (sid, mut rx) = connect(&engine);
        engine.chat(&sid, "hello", true).await;
        drain(&mut rx);

        engine.clear_context(&sid).await;
        let events = drain(&mut rx);
        let ServerEvent::Context { context } = &events[0] else {
            panic!("expected context");
        };
        assert!(context.history.is_empty());
        assert_eq!(context.admin_mode(), Some(true));
        assert!(matches!(&events[1], ServerEvent::History { history } if history.is_empty()));
    }

    #[tokio::test]
    async fn use_tool_returns_typed_error() {
        let engine = engine(ScriptedCompletion::new(vec![]));
        let (sid, mut rx) = connect(&engine);
        let err = engine
            .use_tool(&sid, "create_appointment", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::ToolResult { success: false, .. }));
        assert!(matches!(&events[1], ServerEvent::Context { .. }));
    }

    #[tokio::test]
    async fn direct_tool_identification_adopts_customer_key() {
        let durable = Arc::new(InMemoryDurableStore::new());
        let engine = engine_with_store(
            ScriptedCompletion::new(vec![]),
            ContextStore::new(Some(durable.clone())),
        );
        let (sid, _rx) = connect(&engine);

        engine
            .use_tool(&sid, "search_customer", &json!({"query": "Ana"}))
            .await
            .unwrap();

        let by_customer = engine.store().get("c1").await;
        assert_eq!(by_customer.customer_id().as_deref(), Some("c1"));
        assert_eq!(by_customer.history.len(), 1);
        assert_eq!(engine.store().get(&sid).await, by_customer);

        assert_eq!(durable.len(), 1);
        let record = durable.load("c1").await.unwrap().unwrap();
        assert_eq!(record.data["history"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn chat_identification_persists_under_customer_key() {
        let durable = Arc::new(InMemoryDurableStore::new());
        let engine = engine_with_store(
            ScriptedCompletion::new(vec![search_call("Ana"), text("Found you, Ana.")]),
            ContextStore::new(Some(durable.clone())),
        );
        let (sid, _rx) = connect(&engine);

        engine.chat(&sid, "I'm Ana", false).await;

        assert_eq!(engine.store().resolve(&sid), "c1");
        let record = durable.load("c1").await.unwrap().unwrap();
        let history = record.data["history"].as_array().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2]["content"], "Found you, Ana.");
        assert_eq!(durable.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_tool_rounds_do_not_claim_success() {
        let engine = engine(ScriptedCompletion::new(vec![
            search_call("Ana"),
            search_call("Ana"),
            search_call("Ana"),
            search_call("Ana"),
            search_call("Ana"),
        ]));
        let (sid, mut rx) = connect(&engine);

        engine.chat(&sid, "I'm Ana", false).await;
        let replies: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::Message { content, .. } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(replies, vec![UNFINISHED.to_string()]);
    }
}
