//! MT interceptors: pluggable event transforms applied between event
//! construction and routing.
//!
//! An interceptor declares which events it wants via `matches` and rewrites
//! them via `run`. Failures are isolated: a failing interceptor logs and the
//! event continues unchanged. Parameters an interceptor sets explicitly
//! should be added to the event's `locked` list so the connector overlay
//! does not revert them.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::pipeline::MtEvent;

#[derive(Debug, Error)]
pub enum InterceptorError {
    #[error("interceptor rejected the event: {0}")]
    Rejected(String),

    #[error("interceptor failed: {0}")]
    Failed(String),
}

pub trait MtInterceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this interceptor applies to the event
    fn matches(&self, event: &MtEvent) -> bool;

    /// Transform the event. Returning an error leaves the event unchanged.
    fn run(&self, event: MtEvent) -> Result<MtEvent, InterceptorError>;
}

/// Ordered interceptor chain with error isolation.
#[derive(Default)]
pub struct InterceptorRegistry {
    interceptors: Vec<Box<dyn MtInterceptor>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, interceptor: Box<dyn MtInterceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run every matching interceptor in registration order.
    pub fn apply(&self, mut event: MtEvent) -> MtEvent {
        for interceptor in &self.interceptors {
            if !interceptor.matches(&event) {
                continue;
            }

            let snapshot = event.clone();
            match interceptor.run(event) {
                Ok(transformed) => event = transformed,
                Err(err) => {
                    tracing::warn!(
                        interceptor = interceptor.name(),
                        error = %err,
                        "interceptor failed, event unchanged"
                    );
                    event = snapshot;
                }
            }
        }
        event
    }
}

static LONGCODE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{7,}$").expect("valid regex"));
static SHORTCODE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,7}$").expect("valid regex"));

/// Normalizes source-address TON/NPI from the shape of the sender: a
/// 7+ digit longcode is international/ISDN, a shorter all-digit shortcode is
/// unknown-TON/ISDN, and anything else is an alphanumeric sender id. The
/// parameters it sets are locked against the connector overlay.
pub struct StandardNpiInterceptor;

impl MtInterceptor for StandardNpiInterceptor {
    fn name(&self) -> &str {
        "standard_npi"
    }

    fn matches(&self, event: &MtEvent) -> bool {
        event.pdus.first().is_some_and(|pdu| pdu.source_addr.is_some())
    }

    fn run(&self, mut event: MtEvent) -> Result<MtEvent, InterceptorError> {
        let number = event.pdus[0].source_addr.clone().unwrap_or_default();

        let (npi, ton) = if LONGCODE_REGEX.is_match(&number) {
            (1, 1) // ISDN, international
        } else if SHORTCODE_REGEX.is_match(&number) {
            (1, 0) // ISDN, unknown
        } else {
            (0, 5) // unknown, alphanumeric
        };

        for pdu in &mut event.pdus {
            pdu.source_addr_npi = npi;
            pdu.source_addr_ton = ton;
        }
        for param in ["source_addr_npi", "source_addr_ton"] {
            if !event.locked.iter().any(|l| l == param) {
                event.locked.push(param.to_string());
            }
        }
        Ok(event)
    }
}
