use std::any::Any;
use std::fmt::{Debug, Display};
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use thiserror::Error;
use tracing::Instrument;

#[derive(Error, Debug)]
pub enum ActorError {
    #[error("actor logic encountered an error: {0}")]
    Logic(String),
}

/// A long-lived task that owns its state and mutates it only from within its
/// own `run` loop. Everything else talks to an actor through channels.
pub trait Actor: Send + Sized {
    type Id: Display + Debug + Clone + Send + Sync + 'static;

    fn kind(&self) -> &'static str;
    fn id(&self) -> Self::Id;

    fn run(&mut self) -> impl std::future::Future<Output = Result<(), ActorError>> + Send;
}

/// Drives an actor to completion inside a tracing span carrying its identity.
/// A panic in the actor body is caught and logged instead of taking down the
/// runtime; the surrounding supervisor observes the task ending either way.
pub async fn run<A>(mut actor: A)
where
    A: Actor + 'static,
{
    let span = tracing::info_span!("actor", kind = actor.kind(), id = %actor.id());
    async move {
        tracing::debug!("actor starting");
        let result = AssertUnwindSafe(actor.run()).catch_unwind().await;
        match result {
            Ok(Ok(())) => tracing::debug!("actor exited"),
            Ok(Err(err)) => tracing::warn!(error = %err, "actor exited with error"),
            Err(payload) => {
                tracing::error!(panic = %panic_message(&payload), "actor panicked");
            }
        }
    }
    .instrument(span)
    .await
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
