//! Built-in tool catalogue: names, descriptions and parameter schemas offered
//! to the completion call, plus the selection rules for search-type tools.

use concierge_core::models::ToolSpec;
use serde_json::{json, Value};

pub const SEARCH_CUSTOMER: &str = "search_customer";
pub const GET_CUSTOMER: &str = "get_customer";
pub const CREATE_CUSTOMER: &str = "create_customer";
pub const LIST_SERVICES: &str = "list_services";
pub const CHECK_AVAILABILITY: &str = "check_availability";
pub const LIST_APPOINTMENTS: &str = "list_appointments";
pub const CREATE_APPOINTMENT: &str = "create_appointment";
pub const UPDATE_APPOINTMENT: &str = "update_appointment";
pub const CANCEL_APPOINTMENT: &str = "cancel_appointment";

pub const ALL_TOOLS: [&str; 9] = [
    SEARCH_CUSTOMER,
    GET_CUSTOMER,
    CREATE_CUSTOMER,
    LIST_SERVICES,
    CHECK_AVAILABILITY,
    LIST_APPOINTMENTS,
    CREATE_APPOINTMENT,
    UPDATE_APPOINTMENT,
    CANCEL_APPOINTMENT,
];

pub fn is_known(name: &str) -> bool {
    ALL_TOOLS.contains(&name)
}

/// Tools whose results may be cached for numbered selection.
pub fn is_search_tool(name: &str) -> bool {
    matches!(
        name,
        SEARCH_CUSTOMER | LIST_SERVICES | CHECK_AVAILABILITY | LIST_APPOINTMENTS
    )
}

/// Parameters that may carry a bare number choosing from the cached list,
/// in lookup order.
pub fn selection_fields(name: &str) -> &'static [&'static str] {
    match name {
        SEARCH_CUSTOMER | LIST_SERVICES => &["selection", "query"],
        CHECK_AVAILABILITY => &["selection", "date"],
        LIST_APPOINTMENTS => &["selection"],
        _ => &[],
    }
}

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

pub fn spec(name: &str) -> Option<ToolSpec> {
    let selection = json!({
        "type": "string",
        "description": "A number choosing an entry from the previously listed results"
    });
    let spec = match name {
        SEARCH_CUSTOMER => ToolSpec::new(
            name,
            "Search customers by name, phone or email. A bare number selects from the last results.",
            schema(
                json!({
                    "query": {"type": "string", "description": "Name, phone, email, or a list number"},
                    "selection": selection,
                }),
                &["query"],
            ),
        ),
        GET_CUSTOMER => ToolSpec::new(
            name,
            "Load a customer record by id and make it the active customer.",
            schema(json!({"customerId": {"type": "string"}}), &["customerId"]),
        ),
        CREATE_CUSTOMER => ToolSpec::new(
            name,
            "Create a new customer record and make it the active customer.",
            schema(
                json!({
                    "name": {"type": "string"},
                    "phone": {"type": "string"},
                    "email": {"type": "string"},
                }),
                &["name"],
            ),
        ),
        LIST_SERVICES => ToolSpec::new(
            name,
            "List salon services, optionally filtered by name. A bare number selects a listed service.",
            schema(
                json!({
                    "query": {"type": "string", "description": "Service name filter or a list number"},
                    "selection": selection,
                }),
                &[],
            ),
        ),
        CHECK_AVAILABILITY => ToolSpec::new(
            name,
            "List open appointment slots on a date. A bare number selects a listed slot.",
            schema(
                json!({
                    "date": {"type": "string", "description": "A date such as 2026-10-20, tomorrow or friday"},
                    "serviceId": {"type": "string"},
                    "selection": selection,
                }),
                &["date"],
            ),
        ),
        LIST_APPOINTMENTS => ToolSpec::new(
            name,
            "List upcoming appointments for the active (or given) customer.",
            schema(
                json!({
                    "customerId": {"type": "string"},
                    "selection": selection,
                }),
                &[],
            ),
        ),
        CREATE_APPOINTMENT => ToolSpec::new(
            name,
            "Book an appointment for the active customer. Missing fields default to the selected service, date and time.",
            schema(
                json!({
                    "serviceId": {"type": "string"},
                    "date": {"type": "string"},
                    "time": {"type": "string", "description": "e.g. 3pm or 15:00"},
                    "notes": {"type": "string"},
                }),
                &[],
            ),
        ),
        UPDATE_APPOINTMENT => ToolSpec::new(
            name,
            "Move an appointment to a new date and time. Defaults to the current appointment.",
            schema(
                json!({
                    "appointmentId": {"type": "string"},
                    "date": {"type": "string"},
                    "time": {"type": "string"},
                }),
                &["date", "time"],
            ),
        ),
        CANCEL_APPOINTMENT => ToolSpec::new(
            name,
            "Cancel an appointment. Defaults to the current appointment.",
            schema(json!({"appointmentId": {"type": "string"}}), &[]),
        ),
        _ => return None,
    };
    Some(spec)
}

pub fn specs_for(names: &[&str]) -> Vec<ToolSpec> {
    names.iter().filter_map(|n| spec(n)).collect()
}

pub fn all_specs() -> Vec<ToolSpec> {
    specs_for(&ALL_TOOLS)
}
