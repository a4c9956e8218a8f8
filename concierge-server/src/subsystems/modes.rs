//! Conversation mode router.
//!
//! On every inbound turn the router classifies the recent user turns and
//! picks one of four fixed modes. Precedence: cancel, booking, update
//! (only with an appointment reference), identity gate, default.

use std::fmt;
use std::sync::Arc;

use concierge_core::models::{keys, Context, TurnRole};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Welcome,
    Create,
    Update,
    Cancel,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Welcome => "welcome",
            Mode::Create => "create",
            Mode::Update => "update",
            Mode::Cancel => "cancel",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intent flags; several may be set for one utterance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Intents {
    pub booking: bool,
    pub update: bool,
    pub cancel: bool,
}

impl Intents {
    pub fn union(self, other: Intents) -> Intents {
        Intents {
            booking: self.booking || other.booking,
            update: self.update || other.update,
            cancel: self.cancel || other.cancel,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.booking || self.update || self.cancel)
    }
}

pub trait IntentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Intents;

    fn name(&self) -> &str;
}

/// Regex keyword classifier.
pub struct KeywordClassifier {
    booking: Vec<Regex>,
    update: Vec<Regex>,
    cancel: Vec<Regex>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordClassifier {
    pub fn new() -> Self {
        let mk = |pats: &[&str]| -> Vec<Regex> {
            pats.iter()
                .map(|p| Regex::new(p).expect("Invalid intent regex"))
                .collect()
        };

        Self {
            booking: mk(&[
                r"(?i)\bbook(?:ing|ed)?\b",
                r"(?i)\bschedule\b",
                r"(?i)\b(?:make|set\s+up|get)\s+(?:an?\s+)?(?:new\s+)?(?:appointment|appt)\b",
                r"(?i)\bnew\s+(?:appointment|appt|booking)\b",
                r"(?i)\breserv(?:e|ation)\b",
                r"(?i)\b(?:any\s+)?openings?\b",
                r"(?i)\b(?:i'?d|i\s+would)\s+like\s+(?:an?\s+|to\s+get\s+an?\s+)?(?:haircut|cut|trim|colou?r|blowout|manicure|pedicure|appointment)\b",
            ]),
            update: mk(&[
                r"(?i)\breschedul\w*",
                r"(?i)\b(?:change|move|update|modify|shift)\s+(?:my\s+|the\s+|our\s+)?(?:appointment|appt|booking|reservation|time|date)\b",
                r"(?i)\bpush\s+(?:it|my\s+appointment|the\s+appointment)\s+(?:back|later)\b",
                r"(?i)\bdifferent\s+(?:time|day|date)\b",
                r"(?i)\binstead\s+of\b",
            ]),
            cancel: mk(&[
                r"(?i)\bcancel\w*",
                r"(?i)\bcall\s+(?:it\s+)?off\b",
                r"(?i)\bcan'?t\s+make\s+it\b",
                r"(?i)\bwon'?t\s+(?:be\s+able\s+to\s+)?make\s+it\b",
                r"(?i)\b(?:remove|delete|drop)\s+(?:my\s+|the\s+)?(?:appointment|appt|booking|reservation)\b",
            ]),
        }
    }

    fn any(patterns: &[Regex], text: &str) -> bool {
        patterns.iter().any(|r| r.is_match(text))
    }
}

impl IntentClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Intents {
        Intents {
            booking: Self::any(&self.booking, text),
            update: Self::any(&self.update, text),
            cancel: Self::any(&self.cancel, text),
        }
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub mode: Mode,
    pub intents: Intents,
    /// True when entering `create` dropped a stale appointment reference.
    pub cleared_appointment: bool,
}

pub struct ModeRouter {
    classifier: Arc<dyn IntentClassifier>,
    recency_window: usize,
}

impl ModeRouter {
    pub fn new(classifier: Arc<dyn IntentClassifier>, recency_window: usize) -> Self {
        Self {
            classifier,
            recency_window: recency_window.max(1),
        }
    }

    pub fn keyword(recency_window: usize) -> Self {
        Self::new(Arc::new(KeywordClassifier::new()), recency_window)
    }

    /// Classify the user turns inside the recency window.
    pub fn intents(&self, ctx: &Context) -> Intents {
        ctx.recent_turns(self.recency_window)
            .iter()
            .filter(|t| t.role == TurnRole::User)
            .map(|t| self.classifier.classify(&t.content))
            .fold(Intents::default(), Intents::union)
    }

    /// Pick the mode for the next assistant turn and apply its side effects.
    pub fn route(&self, ctx: &mut Context) -> RouteDecision {
        let intents = self.intents(ctx);
        let mut cleared_appointment = false;

        let mode = if intents.cancel {
            Mode::Cancel
        } else if intents.booking {
            cleared_appointment = ctx.remove(keys::CURRENT_APPOINTMENT_ID).is_some();
            Mode::Create
        } else if intents.update && ctx.appointment_id().is_some() {
            Mode::Update
        } else if !ctx.has_identity() {
            Mode::Welcome
        } else {
            Mode::Create
        };

        ctx.set(keys::LAST_MODE, Value::String(mode.as_str().to_string()));
        tracing::debug!(
            mode = %mode,
            classifier = self.classifier.name(),
            booking = intents.booking,
            update = intents.update,
            cancel = intents.cancel,
            "Routed conversation turn"
        );

        RouteDecision {
            mode,
            intents,
            cleared_appointment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_core::models::Turn;
    use serde_json::json;

    fn router() -> ModeRouter {
        ModeRouter::keyword(3)
    }

    fn ctx_with(turns: &[&str]) -> Context {
        let mut ctx = Context::default();
        for t in turns {
            ctx.push_turn(Turn::user(*t));
        }
        ctx
    }

    fn identified(mut ctx: Context) -> Context {
        ctx.set(keys::USER_INFO, json!({"id": "c1", "name": "Ana"}));
        ctx
    }

    #[test]
    fn classifier_examples() {
        let c = KeywordClassifier::new();
        assert!(c.classify("I'd like to book a haircut").booking);
        assert!(c.classify("can I reschedule to friday?").update);
        assert!(!c.classify("can I reschedule to friday?").booking);
        assert!(c.classify("Please cancel my appointment").cancel);
        assert!(c.classify("I can't make it tomorrow").cancel);
        assert!(c.classify("what time is it").is_empty());
    }

    #[test]
    fn empty_context_cancel_phrase_routes_to_cancel() {
        let mut ctx = ctx_with(&["cancel the appointment"]);
        assert_eq!(router().route(&mut ctx).mode, Mode::Cancel);
    }

    #[test]
    fn cancel_beats_booking_regardless_of_reference() {
        let mut ctx = identified(ctx_with(&["cancel my booking and book a new one"]));
        assert_eq!(router().route(&mut ctx).mode, Mode::Cancel);

        ctx.set(keys::CURRENT_APPOINTMENT_ID, json!("a1"));
        assert_eq!(router().route(&mut ctx).mode, Mode::Cancel);
        assert_eq!(ctx.appointment_id().as_deref(), Some("a1"));
    }

    #[test]
    fn booking_clears_appointment_keeps_identity() {
        let mut ctx = identified(ctx_with(&["I want to book a color"]));
        ctx.set(keys::CURRENT_APPOINTMENT_ID, json!("a1"));
        let decision = router().route(&mut ctx);
        assert_eq!(decision.mode, Mode::Create);
        assert!(decision.cleared_appointment);
        assert!(ctx.appointment_id().is_none());
        assert_eq!(ctx.customer_id().as_deref(), Some("c1"));
    }

    #[test]
    fn update_requires_reference() {
        let mut ctx = identified(ctx_with(&["I need to reschedule"]));
        assert_eq!(router().route(&mut ctx).mode, Mode::Create);

        ctx.set(keys::CURRENT_APPOINTMENT_ID, json!("a1"));
        assert_eq!(router().route(&mut ctx).mode, Mode::Update);
    }

    #[test]
    fn update_without_reference_or_identity_is_welcome() {
        let mut ctx = ctx_with(&["I need to reschedule"]);
        assert_eq!(router().route(&mut ctx).mode, Mode::Welcome);
    }

    #[test]
    fn no_intent_gates_on_identity() {
        let mut ctx = ctx_with(&["hello there"]);
        assert_eq!(router().route(&mut ctx).mode, Mode::Welcome);
        let mut ctx = identified(ctx_with(&["hello there"]));
        assert_eq!(router().route(&mut ctx).mode, Mode::Create);
    }

    #[test]
    fn window_forgets_old_intent() {
        let mut ctx = identified(ctx_with(&["cancel it", "ok", "thanks", "sure"]));
        assert_eq!(router().route(&mut ctx).mode, Mode::Create);

        let mut ctx = identified(ctx_with(&["cancel it", "thanks", "sure"]));
        assert_eq!(router().route(&mut ctx).mode, Mode::Cancel);
    }

    #[test]
    fn assistant_turns_are_not_classified() {
        let mut ctx = identified(Context::default());
        ctx.push_turn(Turn::assistant("Would you like to cancel?"));
        ctx.push_turn(Turn::user("no thanks"));
        assert_eq!(router().route(&mut ctx).mode, Mode::Create);
    }

    #[test]
    fn malformed_history_never_panics() {
        let mut ctx = Context::from_value(json!({
            "history": [null, {"role": 5}, {"content": {"nested": true}}],
            "memory": {"user_info": "not-an-object"}
        }));
        let decision = router().route(&mut ctx);
        assert_eq!(decision.mode, Mode::Welcome);
    }

    #[test]
    fn records_last_mode() {
        let mut ctx = ctx_with(&["hi"]);
        router().route(&mut ctx);
        assert_eq!(ctx.memory[keys::LAST_MODE], "welcome");
    }

    struct AlwaysBooking;

    impl IntentClassifier for AlwaysBooking {
        fn classify(&self, _text: &str) -> Intents {
            Intents {
                booking: true,
                ..Intents::default()
            }
        }

        fn name(&self) -> &str {
            "always-booking"
        }
    }

    #[test]
    fn classifier_is_replaceable() {
        let router = ModeRouter::new(Arc::new(AlwaysBooking), 3);
        let mut ctx = ctx_with(&["hello"]);
        assert_eq!(router.route(&mut ctx).mode, Mode::Create);
    }
}
