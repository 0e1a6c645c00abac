//! Phase isolation for the scheduler loops.
//!
//! A phase that returns an error or panics is logged and reported as `None`;
//! the caller carries on with the next phase.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::error;

use crate::domain::errors::DomainResult;

/// Run one phase, swallowing errors and panics.
pub async fn crash_protect<T, F>(phase: &'static str, fut: F) -> Option<T>
where
    F: Future<Output = DomainResult<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!(phase, error = %e, "phase failed");
            None
        }
        Err(panic) => {
            error!(phase, panic = %panic_message(&*panic), "phase panicked");
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::DomainError;

    #[tokio::test]
    async fn test_passes_value_through() {
        assert_eq!(crash_protect("ok", async { Ok(7) }).await, Some(7));
    }

    #[tokio::test]
    async fn test_error_is_swallowed() {
        let result: Option<()> = crash_protect("err", async {
            Err(DomainError::DatabaseError("disk full".into()))
        })
        .await;
        assert!(result.is_none());
    }

    fn explode() -> DomainResult<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panic_is_swallowed() {
        let result = crash_protect("panic", async { explode() }).await;
        assert!(result.is_none());
    }

    #[test]
    fn test_panic_message_variants() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*s), "static");
        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*s), "owned");
        let s: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*s), "non-string panic payload");
    }
}
