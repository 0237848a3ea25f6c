use crate::context::UserContext;
use async_trait::async_trait;
use trapeze_core::HookError;

/// What a virtual user does.
///
/// The engine calls `on_start` once, `run` once per iteration until the user is told to stop,
/// then `on_stop` once. [`Scenario`](crate::scenario::Scenario) is the stock implementation;
/// anything else can be plugged into [`Engine::start`](crate::Engine::start) directly.
#[async_trait]
pub trait Behavior: Send + Sync + 'static {
    /// A failure here keeps the user from running. It is reported as a spawn failure.
    async fn on_start(&self, _ctx: &mut UserContext) -> Result<(), HookError> {
        Ok(())
    }

    /// One iteration.
    async fn run(&self, ctx: &mut UserContext);

    async fn on_stop(&self, _ctx: &mut UserContext) {}
}
