use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// A fixed, ordered `(regex, intent, agent)` rule. First match wins.
pub struct Rule {
    pub pattern: Regex,
    pub intent: &'static str,
    pub agent: &'static str,
}

fn rule(pattern: &str, intent: &'static str, agent: &'static str) -> Rule {
    Rule { pattern: Regex::new(pattern).expect("static rule regex"), intent, agent }
}

/// Built from English trigger phrases, one family per category, in the
/// same ordering the original rule table groups them in: file, system,
/// time/weather/currency, memory, web, dialogue, self-awareness,
/// capabilities, smalltalk.
pub static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        // file
        rule(r"(?i)\bcreate\s+(a\s+)?file\b", "create_file", "executor"),
        rule(r"(?i)\b(read|open|show)\s+(the\s+)?file\b", "read_file", "executor"),
        rule(r"(?i)\bdelete\s+(the\s+)?file\b", "delete_file", "executor"),
        rule(r"(?i)\blist\s+files?\b", "list_files", "executor"),
        // system
        rule(r"(?i)\blaunch\s+(the\s+)?app(lication)?\b", "launch_app", "executor"),
        rule(r"(?i)\bkill\s+(the\s+)?process\b", "kill_process", "executor"),
        rule(r"(?i)\bsystem\s+(info|status)\b", "system_info", "executor"),
        // time / weather / currency
        rule(r"(?i)\bwhat\s+time\s+is\s+it\b", "get_time", "executor"),
        rule(r"(?i)\bweather\b", "get_weather", "executor"),
        rule(r"(?i)\b(currency|exchange\s+rate)\b", "get_currency_rate", "executor"),
        // memory
        rule(r"(?i)\bremember\s+that\b", "remember_fact", "memory"),
        rule(r"(?i)\bwhat\s+did\s+i\s+(say|tell\s+you)\b", "recall_fact", "memory"),
        // web
        rule(r"(?i)\bsearch\s+(the\s+)?web\b", "web_search", "executor"),
        rule(r"(?i)\bgoogle\b", "web_search", "executor"),
        // dialogue
        rule(r"(?i)^(hi|hello|hey)\b", "greeting", "dialogue"),
        rule(r"(?i)\b(bye|goodbye|see\s+you)\b", "farewell", "dialogue"),
        rule(r"(?i)\bthank(s|\s+you)\b", "thanks", "dialogue"),
        // self-awareness
        rule(r"(?i)\bwho\s+are\s+you\b", "self_identity", "dialogue"),
        rule(r"(?i)\bare\s+you\s+(an?\s+)?(ai|robot|bot)\b", "self_identity", "dialogue"),
        // capabilities
        rule(r"(?i)\bwhat\s+can\s+you\s+do\b", "capabilities", "dialogue"),
        rule(r"(?i)\bhelp\b", "capabilities", "dialogue"),
        // smalltalk
        rule(r"(?i)\bhow\s+are\s+you\b", "smalltalk", "dialogue"),
    ]
});

/// Agents whose intent must be a known tool name to be accepted.
pub fn known_tools() -> &'static [&'static str] {
    &[
        "create_file", "read_file", "delete_file", "list_files", "launch_app",
        "kill_process", "system_info", "get_time", "get_weather", "get_currency_rate",
        "web_search",
    ]
}

/// Per-intent required slot names. A rule requiring a slot whose
/// extractor fails forces escalation past Tier 2.
pub fn required_slots(intent: &str) -> &'static [&'static str] {
    match intent {
        "create_file" => &["filepath"],
        "read_file" => &["filepath"],
        "delete_file" => &["filepath"],
        "launch_app" => &["app_name"],
        "kill_process" => &["process_name"],
        "get_weather" => &["location"],
        "get_currency_rate" => &["currency"],
        "web_search" => &["query"],
        _ => &[],
    }
}

/// Built-in regex slot extraction by intent, applied after the
/// learned-slot layer (which always takes precedence).
pub fn extract_builtin_slots(intent: &str, utterance: &str) -> HashMap<String, String> {
    let mut slots = HashMap::new();
    static FILEPATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b([\w\-./~]+\.\w+|[\w\-./~]*/[\w\-./~]+)\b").unwrap());
    static APP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:launch|open|start)\s+(?:the\s+)?(?:app(?:lication)?\s+)?([\w\- ]+?)(?:\s*$)").unwrap());
    static PROCESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)kill\s+(?:the\s+)?process\s+([\w\-.]+)").unwrap());
    static WEATHER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)weather\s+(?:in|at|for)\s+([\w\- ]+?)(?:\s*$|\?)").unwrap());
    static CURRENCY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b([A-Z]{3})\s*(?:to|->)\s*([A-Z]{3})\b").unwrap());
    static QUERY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:search(?:\s+the\s+web)?|google)\s+(?:for\s+)?(.+)").unwrap());

    match intent {
        "create_file" | "read_file" | "delete_file" => {
            if let Some(c) = FILEPATH_RE.captures(utterance) {
                slots.insert("filepath".to_string(), c.get(1).unwrap().as_str().to_string());
            }
        }
        "launch_app" => {
            if let Some(c) = APP_RE.captures(utterance) {
                slots.insert("app_name".to_string(), c.get(1).unwrap().as_str().trim().to_string());
            }
        }
        "kill_process" => {
            if let Some(c) = PROCESS_RE.captures(utterance) {
                slots.insert("process_name".to_string(), c.get(1).unwrap().as_str().to_string());
            }
        }
        "get_weather" => {
            if let Some(c) = WEATHER_RE.captures(utterance) {
                slots.insert("location".to_string(), c.get(1).unwrap().as_str().trim().to_string());
            }
        }
        "get_currency_rate" => {
            if let Some(c) = CURRENCY_RE.captures(utterance) {
                slots.insert("currency".to_string(), format!("{}->{}", &c[1], &c[2]));
            }
        }
        "web_search" => {
            if let Some(c) = QUERY_RE.captures(utterance) {
                slots.insert("query".to_string(), c.get(1).unwrap().as_str().trim().to_string());
            }
        }
        _ => {}
    }
    slots
}
