use minijinja::{context, Environment};
use serde_json::{json, Value};

const CALENDAR_POPUP_TEMPLATE: &str = include_str!("templates/calendar_popup.html.j2");

pub const CALENDAR_MESSAGE_TYPE: &str = "google-calendar-oauth";

/// Serializes a value for inline `<script>` use.
pub fn script_json(value: &Value) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "null".to_string())
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

pub fn calendar_popup_payload(error: Option<&str>) -> Value {
    match error {
        None => json!({ "type": CALENDAR_MESSAGE_TYPE, "success": true }),
        Some(error) => json!({ "type": CALENDAR_MESSAGE_TYPE, "success": false, "error": error }),
    }
}

/// Page returned to the OAuth popup: reports the outcome to the opener
/// window, then closes itself.
pub fn render_calendar_popup(target_origin: &str, error: Option<&str>) -> String {
    let payload = script_json(&calendar_popup_payload(error));
    let target_origin = script_json(&Value::String(target_origin.to_string()));
    let (title, message) = match error {
        None => ("Calendar connected", "Google Calendar connected. You can close this window."),
        Some(_) => ("Calendar connection failed", "Google Calendar could not be connected."),
    };

    let mut env = Environment::new();
    if env
        .add_template("calendar_popup.html", CALENDAR_POPUP_TEMPLATE)
        .is_err()
    {
        return fallback_calendar_popup(&payload, &target_origin);
    }
    let Ok(template) = env.get_template("calendar_popup.html") else {
        return fallback_calendar_popup(&payload, &target_origin);
    };

    template
        .render(context! {
            title => title,
            message => message,
            payload => payload,
            target_origin => target_origin,
        })
        .unwrap_or_else(|_| fallback_calendar_popup(&payload, &target_origin))
}

fn fallback_calendar_popup(payload: &str, target_origin: &str) -> String {
    format!(
        "<!doctype html><html><body><script>\
         if (window.opener) {{ window.opener.postMessage({payload}, {target_origin}); }}\
         window.close();</script></body></html>"
    )
}
