//! Tool dispatcher.
//!
//! Runs a named tool against the scheduling API, writes its effects into the
//! conversation context, and converts failures into readable messages.
//! Search-type tools cache multi-result lists under `<tool>_candidates`; a
//! later call whose selection input is a bare number picks from that list.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use concierge_core::models::context::value_as_id;
use concierge_core::models::{keys, Context, ToolOutcome, ToolSpec};
use concierge_core::scheduling::{AppointmentChange, NewAppointment, NewContact, SchedulingApi, SchedulingError};
use concierge_core::{timeparse, ConciergeError};
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::tools::{self, *};

/// Longest digit string treated as a list choice rather than a search term.
const MAX_SELECTION_DIGITS: usize = 3;

pub struct ToolDispatcher {
    api: Arc<dyn SchedulingApi>,
    tz: Tz,
    call_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(api: Arc<dyn SchedulingApi>, tz: Tz, call_timeout: Duration) -> Self {
        Self {
            api,
            tz,
            call_timeout,
        }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        tools::all_specs()
    }

    fn today(&self) -> NaiveDate {
        timeparse::today_in(self.tz)
    }

    /// Run a tool and fold any failure into a structured outcome.
    pub async fn dispatch(&self, tool: &str, params: &Value, ctx: &mut Context) -> ToolOutcome {
        match self.execute(tool, params, ctx).await {
            Ok(result) => {
                tracing::info!(tool, "Tool call succeeded");
                ToolOutcome::success(tool, result)
            }
            Err(e) => {
                tracing::warn!(tool, kind = e.kind(), error = %e, "Tool call failed");
                ToolOutcome::failure(tool, human_message(&e))
            }
        }
    }

    /// Run a tool, returning the typed error for callers that map it further.
    pub async fn execute(&self, tool: &str, params: &Value, ctx: &mut Context) -> Result<Value, ConciergeError> {
        if !tools::is_known(tool) {
            return Err(ConciergeError::NotFound(format!("Tool '{tool}'")));
        }
        let params = match params {
            Value::Null => Value::Object(Map::new()),
            Value::Object(_) => params.clone(),
            _ => return Err(ConciergeError::invalid("params", "must be a JSON object")),
        };

        let result = if tools::is_search_tool(tool) {
            self.run_search(tool, &params, ctx).await?
        } else {
            self.run_action(tool, &params, ctx).await?
        };

        ctx.record_tool_usage(tool, &params);
        Ok(result)
    }

    /// Fetch a contact and shape it as `user_info`, without touching a context.
    pub async fn lookup_customer(&self, customer_id: &str) -> Result<Value, ConciergeError> {
        let contact = self.bounded(self.api.get_contact(customer_id)).await?;
        user_info_from(&to_value(&contact)?)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, ConciergeError>
    where
        F: Future<Output = Result<T, SchedulingError>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(ConciergeError::from),
            Err(_) => Err(ConciergeError::UpstreamUnavailable(format!(
                "scheduling API timed out after {}s",
                self.call_timeout.as_secs()
            ))),
        }
    }

    // ========================================================================
    // Search-type tools
    // ========================================================================

    async fn run_search(&self, tool: &str, params: &Value, ctx: &mut Context) -> Result<Value, ConciergeError> {
        let cache_key = keys::candidates(tool);

        if let Some((field, n)) = selection_index(tool, params) {
            let cached = ctx.get(&cache_key).and_then(Value::as_array).cloned();
            match cached {
                Some(list) => {
                    if n == 0 || n > list.len() {
                        return Err(ConciergeError::invalid(
                            field,
                            format!("choose a number between 1 and {}", list.len()),
                        ));
                    }
                    let chosen = list[n - 1].clone();
                    self.apply_selection(tool, &chosen, ctx)?;
                    ctx.remove(&cache_key);
                    return Ok(json!({ "selected": chosen, "number": n }));
                }
                None if field == "selection" => {
                    return Err(ConciergeError::invalid("selection", "there is no list to choose from"));
                }
                None => {}
            }
        }

        let results = self.search(tool, params, ctx).await?;
        match results.len() {
            0 => {
                ctx.remove(&cache_key);
                Ok(json!({ "count": 0, "results": [] }))
            }
            1 => {
                self.apply_selection(tool, &results[0], ctx)?;
                ctx.remove(&cache_key);
                Ok(json!({ "count": 1, "selected": results[0] }))
            }
            count => {
                let numbered: Vec<Value> = results
                    .iter()
                    .enumerate()
                    .map(|(i, r)| {
                        let mut entry = r.clone();
                        if let Some(obj) = entry.as_object_mut() {
                            obj.insert("number".to_string(), json!(i + 1));
                        }
                        entry
                    })
                    .collect();
                ctx.set(cache_key, Value::Array(results));
                Ok(json!({ "count": count, "results": numbered }))
            }
        }
    }

    async fn search(&self, tool: &str, params: &Value, ctx: &mut Context) -> Result<Vec<Value>, ConciergeError> {
        match tool {
            SEARCH_CUSTOMER => {
                let query = required(params, "query")?;
                let contacts = self.bounded(self.api.search_contacts(&query)).await?;
                to_values(&contacts)
            }
            LIST_SERVICES => {
                let services = self.bounded(self.api.list_services()).await?;
                let filter = str_param(params, "query").map(|q| q.to_lowercase());
                let matching: Vec<_> = services
                    .into_iter()
                    .filter(|s| match &filter {
                        Some(f) => s.name.to_lowercase().contains(f.as_str()),
                        None => true,
                    })
                    .collect();
                to_values(&matching)
            }
            CHECK_AVAILABILITY => {
                let raw = required(params, "date")?;
                let date = timeparse::parse_date(&raw, self.today())
                    .ok_or_else(|| ConciergeError::invalid("date", format!("could not understand '{raw}'")))?;
                if date < self.today() {
                    return Err(ConciergeError::invalid("date", "that date is in the past"));
                }
                let service_id = str_param(params, "serviceId").or_else(|| first_service_id(ctx));
                let slots = self
                    .bounded(self.api.availability(date, service_id.as_deref()))
                    .await?;
                ctx.set(keys::PREFERRED_DATE, json!(date.format("%Y-%m-%d").to_string()));
                slots
                    .iter()
                    .map(|slot| {
                        let label = timeparse::parse_slot_start(&slot.start).map(timeparse::format_slot);
                        let mut value = to_value(slot)?;
                        if let (Some(obj), Some(label)) = (value.as_object_mut(), label) {
                            obj.insert("label".to_string(), json!(label));
                        }
                        Ok(value)
                    })
                    .collect()
            }
            LIST_APPOINTMENTS => {
                let customer_id = str_param(params, "customerId")
                    .or_else(|| ctx.customer_id())
                    .ok_or_else(no_customer)?;
                let appointments = self.bounded(self.api.list_appointments(&customer_id)).await?;
                to_values(&appointments)
            }
            other => Err(ConciergeError::NotFound(format!("Tool '{other}'"))),
        }
    }

    /// Write a chosen candidate into memory.
    fn apply_selection(&self, tool: &str, chosen: &Value, ctx: &mut Context) -> Result<(), ConciergeError> {
        match tool {
            SEARCH_CUSTOMER => {
                set_user_info(ctx, chosen)?;
            }
            LIST_SERVICES => {
                let id = chosen.get("id").cloned().unwrap_or(Value::Null);
                let mut services = ctx.selected_services();
                if !services.iter().any(|s| s.get("id") == Some(&id)) {
                    services.push(chosen.clone());
                }
                ctx.set(keys::SELECTED_SERVICES, Value::Array(services));
            }
            CHECK_AVAILABILITY => {
                let start = chosen
                    .get("start")
                    .and_then(Value::as_str)
                    .and_then(timeparse::parse_slot_start)
                    .ok_or_else(|| ConciergeError::invalid("selection", "the chosen slot has no usable start time"))?;
                ctx.set(keys::PREFERRED_DATE, json!(start.format("%Y-%m-%d").to_string()));
                ctx.set(keys::PREFERRED_TIME, json!(start.format("%H:%M").to_string()));
            }
            LIST_APPOINTMENTS => {
                let id = chosen
                    .get("id")
                    .and_then(value_as_id)
                    .ok_or_else(|| ConciergeError::invalid("selection", "the chosen appointment has no id"))?;
                ctx.set(keys::CURRENT_APPOINTMENT_ID, json!(id));
            }
            _ => {}
        }
        Ok(())
    }

    // ========================================================================
    // Action tools
    // ========================================================================

    async fn run_action(&self, tool: &str, params: &Value, ctx: &mut Context) -> Result<Value, ConciergeError> {
        match tool {
            GET_CUSTOMER => {
                let id = required(params, "customerId")?;
                let contact = self.bounded(self.api.get_contact(&id)).await?;
                let value = to_value(&contact)?;
                set_user_info(ctx, &value)?;
                Ok(value)
            }
            CREATE_CUSTOMER => {
                let new = NewContact {
                    name: required(params, "name")?,
                    phone: str_param(params, "phone"),
                    email: str_param(params, "email"),
                };
                let contact = self.bounded(self.api.create_contact(&new)).await?;
                let value = to_value(&contact)?;
                set_user_info(ctx, &value)?;
                Ok(value)
            }
            CREATE_APPOINTMENT => {
                let contact_id = str_param(params, "customerId")
                    .or_else(|| ctx.customer_id())
                    .ok_or_else(no_customer)?;
                let service_id = str_param(params, "serviceId")
                    .or_else(|| first_service_id(ctx))
                    .ok_or_else(|| ConciergeError::invalid("serviceId", "no service has been chosen"))?;
                let date = self.date_param(params, ctx)?;
                let time = time_param(params, ctx)?;
                let request = NewAppointment {
                    contact_id,
                    service_id,
                    start: slot_start(date, time),
                    notes: str_param(params, "notes"),
                };
                let appointment = self.bounded(self.api.create_appointment(&request)).await?;
                ctx.set(keys::CURRENT_APPOINTMENT_ID, json!(appointment.id));
                remember_when(ctx, date, time);
                let mut value = to_value(&appointment)?;
                label(&mut value, date, time);
                Ok(value)
            }
            UPDATE_APPOINTMENT => {
                let id = str_param(params, "appointmentId")
                    .or_else(|| ctx.appointment_id())
                    .ok_or_else(|| ConciergeError::invalid("appointmentId", "no appointment is selected"))?;
                let date = self.date_param(params, ctx)?;
                let time = time_param(params, ctx)?;
                let change = AppointmentChange {
                    start: slot_start(date, time),
                };
                let appointment = self.bounded(self.api.update_appointment(&id, &change)).await?;
                ctx.set(keys::CURRENT_APPOINTMENT_ID, json!(appointment.id));
                remember_when(ctx, date, time);
                let mut value = to_value(&appointment)?;
                label(&mut value, date, time);
                Ok(value)
            }
            CANCEL_APPOINTMENT => {
                let current = ctx.appointment_id();
                let id = str_param(params, "appointmentId")
                    .or_else(|| current.clone())
                    .ok_or_else(|| ConciergeError::invalid("appointmentId", "no appointment is selected"))?;
                self.bounded(self.api.cancel_appointment(&id)).await?;
                if current.as_deref() == Some(id.as_str()) {
                    ctx.remove(keys::CURRENT_APPOINTMENT_ID);
                }
                Ok(json!({ "cancelled": true, "appointmentId": id }))
            }
            other => Err(ConciergeError::NotFound(format!("Tool '{other}'"))),
        }
    }

    fn date_param(&self, params: &Value, ctx: &Context) -> Result<NaiveDate, ConciergeError> {
        match str_param(params, "date") {
            Some(raw) => timeparse::parse_date(&raw, self.today())
                .ok_or_else(|| ConciergeError::invalid("date", format!("could not understand '{raw}'"))),
            None => ctx
                .get_str(keys::PREFERRED_DATE)
                .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok())
                .ok_or_else(|| ConciergeError::invalid("date", "no date has been chosen")),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Readable message for a failed tool call.
pub fn human_message(e: &ConciergeError) -> String {
    match e {
        ConciergeError::NotFound(what) => format!("{what} was not found."),
        ConciergeError::InvalidInput { field, reason } => format!("Invalid {field}: {reason}."),
        ConciergeError::UpstreamUnavailable(_) | ConciergeError::Database(_) => {
            "The booking system is not responding right now. Please try again in a moment.".to_string()
        }
        other => other.to_string(),
    }
}

fn no_customer() -> ConciergeError {
    ConciergeError::invalid("customerId", "no customer is selected; search for or create one first")
}

/// String-valued parameter; numbers are accepted and rendered.
fn str_param(params: &Value, field: &str) -> Option<String> {
    match params.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required(params: &Value, field: &str) -> Result<String, ConciergeError> {
    str_param(params, field).ok_or_else(|| ConciergeError::invalid(field, "is required"))
}

/// The selection field and 1-based number when the input is a bare integer.
fn selection_index(tool: &str, params: &Value) -> Option<(&'static str, usize)> {
    tools::selection_fields(tool).iter().find_map(|field| {
        let raw = str_param(params, field)?;
        let is_choice = !raw.is_empty()
            && raw.len() <= MAX_SELECTION_DIGITS
            && raw.chars().all(|c| c.is_ascii_digit());
        if is_choice {
            raw.parse().ok().map(|n| (*field, n))
        } else {
            None
        }
    })
}

fn time_param(params: &Value, ctx: &Context) -> Result<NaiveTime, ConciergeError> {
    match str_param(params, "time") {
        Some(raw) => timeparse::parse_time(&raw)
            .ok_or_else(|| ConciergeError::invalid("time", format!("could not understand '{raw}'"))),
        None => ctx
            .get_str(keys::PREFERRED_TIME)
            .and_then(|t| timeparse::parse_time(&t))
            .ok_or_else(|| ConciergeError::invalid("time", "no time has been chosen")),
    }
}

fn first_service_id(ctx: &Context) -> Option<String> {
    ctx.selected_services()
        .first()
        .and_then(|s| s.get("id"))
        .and_then(value_as_id)
}

fn slot_start(date: NaiveDate, time: NaiveTime) -> String {
    format!("{}T{}:00", date.format("%Y-%m-%d"), time.format("%H:%M"))
}

fn remember_when(ctx: &mut Context, date: NaiveDate, time: NaiveTime) {
    ctx.set(keys::PREFERRED_DATE, json!(date.format("%Y-%m-%d").to_string()));
    ctx.set(keys::PREFERRED_TIME, json!(time.format("%H:%M").to_string()));
}

fn label(value: &mut Value, date: NaiveDate, time: NaiveTime) {
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "label".to_string(),
            json!(timeparse::format_slot(date.and_time(time))),
        );
    }
}

fn user_info_from(contact: &Value) -> Result<Value, ConciergeError> {
    let id = contact
        .get("id")
        .and_then(value_as_id)
        .ok_or_else(|| ConciergeError::invalid("customer", "record has no id"))?;
    let mut info = Map::new();
    info.insert("id".into(), json!(id));
    for field in ["name", "email", "phone"] {
        if let Some(v) = contact.get(field).filter(|v| !v.is_null()) {
            info.insert(field.into(), v.clone());
        }
    }
    Ok(Value::Object(info))
}

fn set_user_info(ctx: &mut Context, contact: &Value) -> Result<(), ConciergeError> {
    ctx.set(keys::USER_INFO, user_info_from(contact)?);
    Ok(())
}

fn to_value<T: Serialize>(item: &T) -> Result<Value, ConciergeError> {
    serde_json::to_value(item).map_err(|e| ConciergeError::Protocol(e.to_string()))
}

fn to_values<T: Serialize>(items: &[T]) -> Result<Vec<Value>, ConciergeError> {
    items.iter().map(to_value).collect()
}
