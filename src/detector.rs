//! Classification of ambient runtime errors.
//!
//! The execution engine can trap into a state where no further call succeeds.
//! Traps surface inconsistently: as a global error event, as an unhandled
//! rejection, or only inside a stack trace. The host forwards whatever it sees
//! as an [`ErrorReport`] and the rule tables below decide what happens to it.
//!
//! Rules are plain data evaluated in order against the lower-cased text of the
//! report. [`NETWORK_RULES`] come first, so a text matching both sets counts as
//! a transient network fault.

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    NetworkTransient,
    EngineCrash,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PatternRule {
    pub pattern: &'static str,
    pub category: ErrorCategory,
}

const fn rule(pattern: &'static str, category: ErrorCategory) -> PatternRule {
    PatternRule { pattern, category }
}

/// Transient transport faults. Checked before [`CRASH_RULES`].
pub const NETWORK_RULES: &[PatternRule] = &[
    rule("failed to fetch", ErrorCategory::NetworkTransient),
    rule("networkerror", ErrorCategory::NetworkTransient),
    rule("network error", ErrorCategory::NetworkTransient),
    rule("network is unreachable", ErrorCategory::NetworkTransient),
    rule("err_connection_refused", ErrorCategory::NetworkTransient),
    rule("connection refused", ErrorCategory::NetworkTransient),
    rule("err_internet_disconnected", ErrorCategory::NetworkTransient),
    rule("disconnected", ErrorCategory::NetworkTransient),
    rule("load failed", ErrorCategory::NetworkTransient),
    rule("synchronize_from_validators", ErrorCategory::NetworkTransient),
    rule("synchronize_chain_state", ErrorCategory::NetworkTransient),
    rule("process_inbox", ErrorCategory::NetworkTransient),
];

/// Signatures of an engine trap.
pub const CRASH_RULES: &[PatternRule] = &[
    rule(
        "called `option::unwrap()` on a `none` value",
        ErrorCategory::EngineCrash,
    ),
    rule("panicked at", ErrorCategory::EngineCrash),
    rule("unreachable", ErrorCategory::EngineCrash),
    rule("runtimeerror", ErrorCategory::EngineCrash),
];

/// Markers that tie an error to the embedded engine. A crash rule only fires
/// when one of these is present somewhere in the report.
pub const ENGINE_ATTRIBUTION: &[&str] = &[
    "linera_web_bg.wasm",
    "linera_web",
    "linera-web",
    "@linera/client",
    "wasm-function",
    "wasm://",
    ".wasm",
];

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AmbientSource {
    #[default]
    ErrorEvent,
    UnhandledRejection,
}

/// An error observed outside any explicit call chain.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ErrorReport {
    pub source: AmbientSource,
    pub message: String,
    pub filename: Option<String>,
    pub stack: Option<String>,
}

impl ErrorReport {
    pub fn error_event(message: impl Into<String>) -> Self {
        Self {
            source: AmbientSource::ErrorEvent,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn unhandled_rejection(reason: impl Into<String>) -> Self {
        Self {
            source: AmbientSource::UnhandledRejection,
            message: reason.into(),
            ..Self::default()
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Message, filename and stack joined and lower-cased.
    pub fn normalized_text(&self) -> String {
        let mut text = self.message.to_lowercase();
        for extra in [&self.filename, &self.stack].into_iter().flatten() {
            text.push('\n');
            text.push_str(&extra.to_lowercase());
        }
        text
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Classification {
    NetworkTransient { pattern: &'static str },
    EngineCrash { pattern: &'static str },
    Unclassified,
}

/// What the host should do with the original error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Let default handling run.
    Propagate,
    /// Prevent default handling; nothing else to do.
    Suppress,
    /// Prevent default handling; a reconnect has been requested.
    SuppressAndReconnect,
}

impl Disposition {
    pub fn prevents_default(self) -> bool {
        !matches!(self, Disposition::Propagate)
    }

    pub fn triggers_reconnect(self) -> bool {
        matches!(self, Disposition::SuppressAndReconnect)
    }
}

impl Classification {
    pub fn disposition(self) -> Disposition {
        match self {
            Classification::NetworkTransient { .. } => Disposition::Suppress,
            Classification::EngineCrash { .. } => Disposition::SuppressAndReconnect,
            Classification::Unclassified => Disposition::Propagate,
        }
    }
}

pub fn classify(report: &ErrorReport) -> Classification {
    classify_text(&report.normalized_text())
}

/// `text` must already be lower-cased.
pub fn classify_text(text: &str) -> Classification {
    if let Some(matched) = first_match(NETWORK_RULES, text) {
        return Classification::NetworkTransient {
            pattern: matched.pattern,
        };
    }
    match first_match(CRASH_RULES, text) {
        Some(matched) if is_engine_attributed(text) => Classification::EngineCrash {
            pattern: matched.pattern,
        },
        _ => Classification::Unclassified,
    }
}

fn first_match<'a>(rules: &'a [PatternRule], text: &str) -> Option<&'a PatternRule> {
    rules.iter().find(|rule| text.contains(rule.pattern))
}

pub fn is_engine_attributed(text: &str) -> bool {
    ENGINE_ATTRIBUTION.iter().any(|marker| text.contains(marker))
}

/// Crash rules only, without the attribution requirement. Used for failures
/// that come straight out of an engine call.
pub fn is_crash_signature(text: &str) -> bool {
    first_match(CRASH_RULES, &text.to_lowercase()).is_some()
}
