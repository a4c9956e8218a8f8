//! Per-mode directives handed to the completion call: which tools are on
//! offer, a short procedure, the caller's role and the known context facts.

use chrono::NaiveDate;
use concierge_core::models::{keys, Context, Role, ToolSpec};
use concierge_core::timeparse;
use serde_json::Value;

use super::modes::Mode;
use super::tools::{self, *};

#[derive(Debug, Clone)]
pub struct Directive {
    pub mode: Mode,
    pub role: Role,
    pub tools: Vec<&'static str>,
    pub instructions: &'static str,
    pub facts: Vec<(&'static str, String)>,
}

fn mode_tools(mode: Mode) -> Vec<&'static str> {
    match mode {
        Mode::Welcome => vec![SEARCH_CUSTOMER, GET_CUSTOMER, CREATE_CUSTOMER, LIST_SERVICES],
        Mode::Create => vec![
            SEARCH_CUSTOMER,
            CREATE_CUSTOMER,
            LIST_SERVICES,
            CHECK_AVAILABILITY,
            CREATE_APPOINTMENT,
            LIST_APPOINTMENTS,
        ],
        Mode::Update => vec![LIST_APPOINTMENTS, LIST_SERVICES, CHECK_AVAILABILITY, UPDATE_APPOINTMENT],
        Mode::Cancel => vec![LIST_APPOINTMENTS, CANCEL_APPOINTMENT],
    }
}

fn mode_instructions(mode: Mode) -> &'static str {
    match mode {
        Mode::Welcome => {
            "Greet the customer and find out who they are. Search by name, phone or email; \
             if nothing matches, offer to create a new customer record. When several results \
             are listed, ask the customer to reply with the number of the right one."
        }
        Mode::Create => {
            "Help the customer book a new appointment. Confirm the service, then a date, then \
             check availability and offer the open slots as a numbered list. Book only after \
             the customer has chosen a slot, and read the booked time back to them."
        }
        Mode::Update => {
            "Help the customer move their current appointment. Ask for the new date, check \
             availability, and update the appointment once a slot is chosen."
        }
        Mode::Cancel => {
            "Help the customer cancel an appointment. If no appointment is selected, list their \
             appointments and ask which one. Confirm before cancelling."
        }
    }
}

impl Directive {
    pub fn build(mode: Mode, role: Role, ctx: &Context, today: NaiveDate) -> Self {
        let mut tools = mode_tools(mode);
        // Staff may look anyone up in every mode.
        if role.is_admin() {
            for extra in [SEARCH_CUSTOMER, GET_CUSTOMER] {
                if !tools.contains(&extra) {
                    tools.push(extra);
                }
            }
        }

        let mut facts = vec![("today", timeparse::format_date(today))];
        if let Some(name) = ctx.customer_name() {
            facts.push(("customer", name));
        }
        if let Some(id) = ctx.customer_id() {
            facts.push(("customer id", id));
        }
        let services: Vec<String> = ctx
            .selected_services()
            .iter()
            .filter_map(|s| s.get("name").and_then(Value::as_str).map(str::to_string))
            .collect();
        if !services.is_empty() {
            facts.push(("selected services", services.join(", ")));
        }
        if let Some(date) = ctx.get_str(keys::PREFERRED_DATE) {
            let shown = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .map(timeparse::format_date)
                .unwrap_or(date);
            facts.push(("preferred date", shown));
        }
        if let Some(time) = ctx.get_str(keys::PREFERRED_TIME) {
            let shown = timeparse::parse_time(&time)
                .map(timeparse::format_time)
                .unwrap_or(time);
            facts.push(("preferred time", shown));
        }
        if let Some(id) = ctx.appointment_id() {
            facts.push(("current appointment", id));
        }

        Self {
            mode,
            role,
            tools,
            instructions: mode_instructions(mode),
            facts,
        }
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        tools::specs_for(&self.tools)
    }

    /// System text for the completion call.
    pub fn render(&self) -> String {
        let audience = match self.role {
            Role::Admin => "You are assisting salon staff.",
            Role::Customer => "You are assisting a salon customer.",
        };
        let mut out = format!(
            "{audience}\nMode: {}\n\n{}\n\nAvailable tools: {}\n",
            self.mode,
            self.instructions,
            self.tools.join(", ")
        );
        if !self.facts.is_empty() {
            out.push_str("\nKnown context:\n");
            for (label, value) in &self.facts {
                out.push_str(&format!("- {label}: {value}\n"));
            }
        }
        out
    }
}
