//! User enrichment hooks and the guard that keeps their failures away from
//! the instrumented request.
//!
//! A hook may return an error or panic. Either way the failure is logged and
//! dropped: the request proceeds and the span stays usable.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use opentelemetry::global::BoxedSpan;

use crate::error::FetchError;
use crate::fetch::RequestSummary;
use crate::lifecycle::ResponseSummary;

/// Called with the fresh span and the resolved request.
pub type RequestHook =
    Arc<dyn Fn(&mut BoxedSpan, &RequestSummary) -> anyhow::Result<()> + Send + Sync>;

/// Called with the span and how the request settled.
pub type ResponseHook =
    Arc<dyn Fn(&mut BoxedSpan, FetchOutcome<'_>) -> anyhow::Result<()> + Send + Sync>;

/// How an instrumented request settled, as shown to the response hook.
#[derive(Debug, Clone, Copy)]
pub enum FetchOutcome<'a> {
    Response(&'a ResponseSummary),
    Error(&'a FetchError),
}

/// Why a hook did not complete.
#[derive(Debug)]
pub enum HookFailure {
    Error(anyhow::Error),
    Panic(String),
}

/// Run `hook`, converting an error or a panic into a [`HookFailure`].
pub fn guard_hook<F>(hook: F) -> Result<(), HookFailure>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HookFailure::Error(e)),
        Err(payload) => Err(HookFailure::Panic(panic_message(payload.as_ref()))),
    }
}

/// Run `hook`, logging and discarding any failure.
pub(crate) fn run_hook<F>(name: &'static str, hook: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match guard_hook(hook) {
        Ok(()) => {}
        Err(HookFailure::Error(e)) => {
            tracing::warn!(hook = name, error = %e, "Custom attribute hook failed");
        }
        Err(HookFailure::Panic(message)) => {
            tracing::warn!(hook = name, panic = %message, "Custom attribute hook panicked");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_hook_passes() {
        let mut touched = false;
        guard_hook(|| {
            touched = true;
            Ok(())
        })
        .unwrap();
        assert!(touched);
    }

    #[test]
    fn test_hook_error_is_captured() {
        match guard_hook(|| Err(anyhow::anyhow!("no tenant header"))) {
            Err(HookFailure::Error(e)) => assert_eq!(e.to_string(), "no tenant header"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_hook_panic_is_captured() {
        match guard_hook(|| panic!("hook blew up")) {
            Err(HookFailure::Panic(message)) => assert_eq!(message, "hook blew up"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_run_hook_swallows_failures() {
        run_hook("test", || Err(anyhow::anyhow!("ignored")));
        run_hook("test", || panic!("{}", String::from("also ignored")));
    }
}
