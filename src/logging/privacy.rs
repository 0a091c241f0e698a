use std::fmt;
use tracing::field::{Field, Visit};

/// Redacts sensitive fields in log output based on field name. Journal
/// content and credentials must never land in production logs verbatim.
pub fn redact_sensitive_field(field_name: &str, value: &str) -> String {
    match field_name {
        // Tokens and keys - show first 8 chars only
        name if name.contains("token") || name.contains("_key") || name == "key" => {
            if value.len() > 8 {
                format!("{}...[REDACTED]", &value[..8])
            } else {
                "[REDACTED]".to_string()
            }
        }
        // Journal text - metadata only
        "content" | "transcript" | "text" | "edited_content" | "llm_content" => {
            let word_count = value.split_whitespace().count();
            format!("[{} chars, {} words]", value.len(), word_count)
        }
        // Device names can identify a user's hardware setup
        "device_name" => {
            if value.len() > 10 {
                format!("{}...", &value[..10])
            } else {
                value.to_string()
            }
        }
        _ => value.to_string(),
    }
}

/// Visitor applying redaction while formatting event fields.
#[allow(dead_code)] // Wired into the subscriber only in Redacted mode
pub struct RedactingVisitor<'a> {
    pub writer: &'a mut dyn fmt::Write,
    pub redact: bool,
}

impl<'a> Visit for RedactingVisitor<'a> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if self.redact {
            let formatted = format!("{:?}", value);
            let redacted = redact_sensitive_field(field.name(), &formatted);
            let _ = write!(self.writer, "{}={} ", field.name(), redacted);
        } else {
            let _ = write!(self.writer, "{}={:?} ", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if self.redact {
            let redacted = redact_sensitive_field(field.name(), value);
            let _ = write!(self.writer, "{}={} ", field.name(), redacted);
        } else {
            let _ = write!(self.writer, "{}={:?} ", field.name(), value);
        }
    }
}
