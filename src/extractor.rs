use std::collections::{HashSet, VecDeque};

use regex::Regex;
use serde_json::Value;

/// Keys whose string values are taken as email addresses directly.
const EMAIL_KEYS: [&str; 5] = ["email", "e_mail", "mail", "correo", "email_address"];

const EMAIL_PATTERN: &str = r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b";

/// Finds email addresses anywhere inside arbitrarily nested JSON: known
/// email-field keys are read directly, every other string is scanned with a
/// permissive pattern, and nested objects/arrays are walked breadth-first.
pub struct EmailExtractor {
    pattern: Regex,
}

impl EmailExtractor {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(EMAIL_PATTERN).expect("email pattern compiles"),
        }
    }

    /// Returns every qualifying address in discovery order, deduplicated.
    pub fn find_emails(&self, data: &Value) -> Vec<String> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([data]);

        while let Some(current) = queue.pop_front() {
            match current {
                Value::Object(map) => {
                    for (key, value) in map {
                        match value {
                            Value::String(text)
                                if EMAIL_KEYS.contains(&key.to_lowercase().as_str()) =>
                            {
                                if looks_like_email(text) && seen.insert(text.clone()) {
                                    found.push(text.clone());
                                }
                            }
                            Value::String(text) => self.scan_text(text, &mut seen, &mut found),
                            Value::Object(_) | Value::Array(_) => queue.push_back(value),
                            _ => {}
                        }
                    }
                }
                Value::Array(items) => {
                    for item in items {
                        match item {
                            Value::String(text) => self.scan_text(text, &mut seen, &mut found),
                            Value::Object(_) | Value::Array(_) => queue.push_back(item),
                            _ => {}
                        }
                    }
                }
                Value::String(text) => self.scan_text(text, &mut seen, &mut found),
                _ => {}
            }
        }

        found
    }

    fn scan_text(&self, text: &str, seen: &mut HashSet<String>, found: &mut Vec<String>) {
        for matched in self.pattern.find_iter(text) {
            let email = matched.as_str().to_string();
            if seen.insert(email.clone()) {
                found.push(email);
            }
        }
    }
}

impl Default for EmailExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn looks_like_email(candidate: &str) -> bool {
    candidate.contains('@') && candidate.contains('.') && candidate.len() > 5
}
