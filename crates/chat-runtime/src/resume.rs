//! Redirect Resumption
//!
//! A checkout or authorization redirect unloads the conversation. When the
//! user lands back on the callback URL, [`plan_resume`] decides what to do
//! with the parked action; the conversation machine executes the plan.

/// What the return URL carried
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnSignal {
    /// Neither checkout nor authorization parameters
    None,
    /// `nvm-api-key` / `planId` from checkout
    Checkout,
    /// Authorization callback completed and a token is stored
    Authorized,
    /// Authorization callback failed (denied, CSRF, exchange error)
    AuthorizationFailed,
}

/// Continuation for a return visit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumePlan {
    /// Nothing to replay now; any parked action stays parked
    Idle,
    /// Wait for the purchase to show up as credits, then replay
    AwaitCredits,
    /// Replay the parked action right away
    Replay,
    /// Drop the parked action; the redirect failed
    Discard,
}

/// Decide how to continue after a redirect
pub fn plan_resume(signal: ReturnSignal, action_parked: bool, checkout_pending: bool) -> ResumePlan {
    if !action_parked {
        return ResumePlan::Idle;
    }
    match signal {
        ReturnSignal::Authorized => ResumePlan::Replay,
        ReturnSignal::AuthorizationFailed => ResumePlan::Discard,
        ReturnSignal::Checkout => ResumePlan::AwaitCredits,
        ReturnSignal::None if checkout_pending => ResumePlan::AwaitCredits,
        ReturnSignal::None => ResumePlan::Idle,
    }
}
