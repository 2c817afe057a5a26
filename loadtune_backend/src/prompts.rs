//! Phrasing instructions handed to the LLM, and the few replies spoken as-is.

use crate::config::PresetParameter;
use crate::params::{format_load_rate, format_temperature};
use crate::session::SessionState;

/// "temperature 22℃, load rate 90%", listing only what is set.
pub fn summary(state: &SessionState) -> String {
    let mut parts = Vec::new();
    if let Some(t) = &state.temperature {
        parts.push(format!("temperature {}", t.formatted));
    }
    if let Some(l) = &state.load_rate {
        parts.push(format!("load rate {}", l.formatted));
    }
    parts.join(", ")
}

pub fn ask_for_values(unparsed: &[String], preset: Option<&PresetParameter>) -> String {
    let mut text = String::from(
        "Reply to the user based on the following:\n\
         The user wants to set the temperature and load rate but has not given usable values yet.\n",
    );
    for raw in unparsed {
        text.push_str(&format!("Could not read a number from \"{}\".\n", raw));
    }
    if let Some(preset) = preset {
        text.push_str(&format!(
            "Recommended preset: temperature {}, load rate {}.\n",
            format_temperature(preset.temperature),
            format_load_rate(preset.load_rate)
        ));
    }
    text.push_str(
        "(In a natural, friendly way ask which temperature and load rate they want. \
         They can give both at once or one at a time, or say \"use the preset\".)",
    );
    text
}

/// Values proposed, waiting for the first confirmation.
pub fn proposal(state: &SessionState) -> String {
    match (&state.temperature, &state.load_rate) {
        (Some(t), Some(l)) => format!(
            "Reply to the user based on the following parameters:\n\
             Temperature: {}\n\
             Load rate: {}\n\
             (Ask the user in natural language whether these are correct. They can say \
             \"confirm\" to apply them or change either value.)",
            t.formatted, l.formatted
        ),
        (Some(t), None) => format!(
            "Reply to the user based on the following:\n\
             Temperature recorded: {}\n\
             (Tell the user the temperature is noted and ask for the load rate. They can \
             also say \"confirm\" to apply the temperature alone.)",
            t.formatted
        ),
        (None, Some(l)) => format!(
            "Reply to the user based on the following:\n\
             Load rate recorded: {}\n\
             (Tell the user the load rate is noted and ask for the temperature. They can \
             also say \"confirm\" to apply the load rate alone.)",
            l.formatted
        ),
        (None, None) => ask_for_values(&[], None),
    }
}

/// Remote accepted the values; the optimization job still needs authorizing.
pub fn second_confirmation(state: &SessionState, remote_message: &str) -> String {
    let mut text = format!(
        "Reply to the user based on the following:\n\
         The optimization service accepted {}.\n",
        summary(state)
    );
    if !remote_message.trim().is_empty() {
        text.push_str(&format!("Service says: {}\n", remote_message.trim()));
    }
    text.push_str(
        "(Ask the user to confirm once more to start the AI optimization, or say \
         \"cancel\" to stop.)",
    );
    text
}

pub fn completion(state: &SessionState) -> String {
    let applied = summary(state);
    if applied.is_empty() {
        "AI optimization has started. I'll let you know when it finishes.".to_string()
    } else {
        format!(
            "Done: {} applied. AI optimization has started, I'll let you know when it finishes.",
            applied
        )
    }
}

pub const CANCELLED: &str = "OK, the temperature and load rate setting has been cancelled.";

pub const REMOTE_CANCELLED: &str =
    "The optimization service cancelled the request. Tell me new values to start again.";

pub const NOTHING_TO_CANCEL: &str =
    "There is no temperature or load rate setting in progress to cancel.";

pub const NOTHING_TO_CONFIRM: &str =
    "There is nothing to confirm yet. Please tell me the temperature and load rate, or say \"use the preset\".";
