use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::join_all;
use tokio::sync::mpsc;
use voiceloop_core::permissions::ToolPermissions;
use voiceloop_core::text::DENIED_RESULT;
use voiceloop_core::types::{FunctionCall, FunctionResponse};

use crate::confirm::{ConfirmationBroker, ConfirmationOutcome};
use crate::tools::{ToolContext, ToolHandler, ToolMode, ToolRegistry};
use crate::traits::{EventSink, Outbound};

/// Routes backend tool calls to handlers, asking the user first when the
/// permission set says so.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    permissions: Arc<RwLock<ToolPermissions>>,
    broker: Arc<ConfirmationBroker>,
    sink: Arc<dyn EventSink>,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        permissions: Arc<RwLock<ToolPermissions>>,
        broker: Arc<ConfirmationBroker>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            permissions,
            broker,
            sink,
        }
    }

    fn requires_confirmation(&self, tool: &str) -> bool {
        self.permissions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .requires_confirmation(tool)
    }

    /// Handles one tool-call batch. Calls run concurrently; the responses
    /// that exist are sent together, in call order, as one set.
    ///
    /// Background tools start only once that set is queued, so their
    /// notifications always follow their acknowledgements.
    pub async fn dispatch_batch(&self, calls: Vec<FunctionCall>, outbound: &mpsc::Sender<Outbound>) {
        let futures = calls.iter().map(|call| self.handle_call(call, outbound));
        let mut responses = Vec::new();
        let mut launches = Vec::new();
        for handled in join_all(futures).await {
            responses.extend(handled.response);
            launches.extend(handled.launch);
        }

        if !responses.is_empty() {
            log::debug!("sending {} function response(s)", responses.len());
            if outbound
                .send(Outbound::FunctionResponses(responses))
                .await
                .is_err()
            {
                log::warn!("session closed before function responses could be sent");
            }
        }
        for launch in launches {
            launch.spawn();
        }
    }

    async fn handle_call(&self, call: &FunctionCall, outbound: &mpsc::Sender<Outbound>) -> Handled {
        let Some(handler) = self.registry.get(&call.name).cloned() else {
            log::warn!("ignoring call to unknown tool '{}'", call.name);
            return Handled::default();
        };

        if self.requires_confirmation(&call.name) {
            let pending = match self.broker.request(&call.name, &call.args) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("cannot ask for confirmation of '{}': {e}", call.name);
                    return Handled::respond(FunctionResponse::new(
                        call,
                        format!("Tool '{}' was not run: {e}", call.name),
                    ));
                }
            };
            match pending.wait().await {
                ConfirmationOutcome::Approved => {}
                ConfirmationOutcome::Denied => {
                    log::info!("user denied tool '{}'", call.name);
                    return Handled::respond(FunctionResponse::new(call, DENIED_RESULT));
                }
                ConfirmationOutcome::Abandoned => {
                    log::info!("confirmation for '{}' abandoned", call.name);
                    return Handled::default();
                }
            }
        }

        let ctx = ToolContext::new(call.name.clone(), outbound.clone(), Arc::clone(&self.sink));
        match handler.mode() {
            ToolMode::Immediate => {
                let result = run_tool(handler.as_ref(), call, &ctx).await;
                Handled::respond(FunctionResponse::new(call, result))
            }
            ToolMode::Background { ack } => Handled {
                response: ack.map(|text| FunctionResponse::new(call, text)),
                launch: Some(BackgroundLaunch {
                    handler,
                    call: call.clone(),
                    ctx,
                }),
            },
        }
    }
}

/// What one call contributes to its batch.
#[derive(Default)]
struct Handled {
    response: Option<FunctionResponse>,
    launch: Option<BackgroundLaunch>,
}

impl Handled {
    fn respond(response: FunctionResponse) -> Self {
        Self {
            response: Some(response),
            launch: None,
        }
    }
}

/// A confirmed background call, started after the batch's responses are queued.
struct BackgroundLaunch {
    handler: Arc<dyn ToolHandler>,
    call: FunctionCall,
    ctx: ToolContext,
}

impl BackgroundLaunch {
    fn spawn(self) {
        let Self { handler, call, ctx } = self;
        tokio::spawn(async move {
            log::info!("starting background tool '{}'", call.name);
            let message = match handler.invoke(&call.args, &ctx).await {
                Ok(result) if result.trim().is_empty() => return,
                Ok(result) => result,
                Err(e) => {
                    log::warn!("background tool '{}' failed: {e:#}", call.name);
                    format!("{} failed: {e}", call.name)
                }
            };
            if ctx.notify(&message, true).await.is_err() {
                log::warn!(
                    "session ended before '{}' could report its result",
                    call.name
                );
            }
        });
    }
}

async fn run_tool(handler: &dyn ToolHandler, call: &FunctionCall, ctx: &ToolContext) -> String {
    log::info!("running tool '{}'", call.name);
    match handler.invoke(&call.args, ctx).await {
        Ok(result) => result,
        Err(e) => {
            log::warn!("tool '{}' failed: {e:#}", call.name);
            format!("Tool '{}' failed: {e}", call.name)
        }
    }
}
