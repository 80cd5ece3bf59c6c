//! Request/response middleware chains.
//!
//! Two chains run around every call: `before_request` sees the mutable
//! request context, `after_returning` sees the decoded envelope. Middleware
//! run in registration order; each sees the result of the previous one. A
//! `Halt` verdict short-circuits the call.

use super::envelope::ApiEnvelope;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value};

/// Outcome of one middleware step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Halt,
}

/// Mutable view of a request before it goes on the wire.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub url: String,
    pub params: Map<String, Value>,
    pub headers: Vec<(String, String)>,
}

impl RequestContext {
    pub fn new(method: Method, url: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            method,
            url: url.into(),
            params,
            headers: Vec::new(),
        }
    }
}

#[async_trait]
pub trait BeforeRequest: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext) -> Verdict;
}

#[async_trait]
pub trait AfterReturning: Send + Sync {
    async fn handle(&self, envelope: &mut ApiEnvelope) -> Verdict;
}

/// Lifts a sync closure into the async `BeforeRequest` contract.
pub struct BeforeFn<F>(pub F);

#[async_trait]
impl<F> BeforeRequest for BeforeFn<F>
where
    F: Fn(&mut RequestContext) -> Verdict + Send + Sync,
{
    async fn handle(&self, ctx: &mut RequestContext) -> Verdict {
        (self.0)(ctx)
    }
}

/// Lifts a sync closure into the async `AfterReturning` contract.
pub struct AfterFn<F>(pub F);

#[async_trait]
impl<F> AfterReturning for AfterFn<F>
where
    F: Fn(&mut ApiEnvelope) -> Verdict + Send + Sync,
{
    async fn handle(&self, envelope: &mut ApiEnvelope) -> Verdict {
        (self.0)(envelope)
    }
}

/// Run the before chain in registration order. Returns `Halt` as soon as a
/// middleware short-circuits.
pub async fn run_before(chain: &[std::sync::Arc<dyn BeforeRequest>], ctx: &mut RequestContext) -> Verdict {
    for middleware in chain {
        if middleware.handle(ctx).await == Verdict::Halt {
            return Verdict::Halt;
        }
    }
    Verdict::Proceed
}

/// Run the after chain in registration order.
pub async fn run_after(
    chain: &[std::sync::Arc<dyn AfterReturning>],
    envelope: &mut ApiEnvelope,
) -> Verdict {
    for middleware in chain {
        if middleware.handle(envelope).await == Verdict::Halt {
            return Verdict::Halt;
        }
    }
    Verdict::Proceed
}
