//! Try/catch/finally for async setup sequences.
//!
//! A protected block may fail by returning `Err(Fault)` or by panicking; both
//! stop the block where they happen and reach the handler as one `anyhow::Error`.
//! The cleanup block always runs exactly once, after the handler.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

pub const UNKNOWN_PROBLEM: &str = "paniced for unknown problem";

/// Whatever a protected block raised, before normalization.
#[derive(Debug)]
pub enum Fault {
    Error(anyhow::Error),
    Message(String),
    Unknown,
}

impl Fault {
    pub fn normalize(self) -> anyhow::Error {
        match self {
            Fault::Error(e) => e,
            Fault::Message(m) => anyhow::Error::msg(m),
            Fault::Unknown => anyhow::Error::msg(UNKNOWN_PROBLEM),
        }
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<anyhow::Error>() {
            Ok(e) => return Fault::Error(*e),
            Err(p) => p,
        };
        let payload = match payload.downcast::<String>() {
            Ok(s) => return Fault::Message(*s),
            Err(p) => p,
        };
        match payload.downcast::<&'static str>() {
            Ok(s) => Fault::Message((*s).to_string()),
            Err(_) => Fault::Unknown,
        }
    }
}

impl From<anyhow::Error> for Fault {
    fn from(e: anyhow::Error) -> Self {
        Fault::Error(e)
    }
}

impl From<String> for Fault {
    fn from(m: String) -> Self {
        Fault::Message(m)
    }
}

impl From<&str> for Fault {
    fn from(m: &str) -> Self {
        Fault::Message(m.to_string())
    }
}

type Handler<'a> = Box<dyn FnOnce(anyhow::Error) + Send + 'a>;

pub struct CatchGroup<'a> {
    try_block: BoxFuture<'a, Result<(), Fault>>,
    catch: Handler<'a>,
    finally: Option<BoxFuture<'a, ()>>,
}

#[derive(Default)]
pub struct CatchGroupBuilder<'a> {
    try_block: Option<BoxFuture<'a, Result<(), Fault>>>,
    catch: Option<Handler<'a>>,
    finally: Option<BoxFuture<'a, ()>>,
}

impl<'a> CatchGroup<'a> {
    pub fn builder() -> CatchGroupBuilder<'a> {
        CatchGroupBuilder::default()
    }

    /// Run the group. Returns `true` if the protected block faulted.
    pub async fn run(self) -> bool {
        let CatchGroup {
            try_block,
            catch,
            finally,
        } = self;

        let fault = match AssertUnwindSafe(try_block).catch_unwind().await {
            Ok(Ok(())) => None,
            Ok(Err(fault)) => Some(fault),
            Err(payload) => Some(Fault::from_panic(payload)),
        };
        let faulted = fault.is_some();
        // A panicking handler must not skip the cleanup; it is re-raised afterwards.
        let handler_panic = match fault {
            Some(fault) => {
                let err = fault.normalize();
                std::panic::catch_unwind(AssertUnwindSafe(move || catch(err))).err()
            }
            None => None,
        };
        if let Some(finally) = finally {
            finally.await;
        }
        if let Some(payload) = handler_panic {
            std::panic::resume_unwind(payload);
        }
        faulted
    }
}

impl<'a> CatchGroupBuilder<'a> {
    pub fn try_block<F>(mut self, block: F) -> Self
    where
        F: Future<Output = Result<(), Fault>> + Send + 'a,
    {
        self.try_block = Some(block.boxed());
        self
    }

    pub fn catch<C>(mut self, handler: C) -> Self
    where
        C: FnOnce(anyhow::Error) + Send + 'a,
    {
        self.catch = Some(Box::new(handler));
        self
    }

    pub fn finally<F>(mut self, block: F) -> Self
    where
        F: Future<Output = ()> + Send + 'a,
    {
        self.finally = Some(block.boxed());
        self
    }

    /// Fails when the protected block or the handler is missing.
    pub fn build(self) -> anyhow::Result<CatchGroup<'a>> {
        match (self.try_block, self.catch) {
            (Some(try_block), Some(catch)) => Ok(CatchGroup {
                try_block,
                catch,
                finally: self.finally,
            }),
            _ => anyhow::bail!("catch group error: try and catch are required"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Trace(Mutex<Vec<String>>);

    impl Trace {
        fn push(&self, s: impl Into<String>) {
            self.0.lock().unwrap().push(s.into());
        }
        fn get(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    async fn run_with(trace: &Trace, block: impl Future<Output = Result<(), Fault>> + Send) -> bool {
        CatchGroup::builder()
            .try_block(block)
            .catch(|e| trace.push(format!("catch:{e}")))
            .finally(async { trace.push("finally") })
            .build()
            .unwrap()
            .run()
            .await
    }

    #[tokio::test]
    async fn clean_run_skips_handler_and_runs_cleanup_once() {
        let trace = Trace::default();
        let faulted = run_with(&trace, async {
            trace.push("try");
            Ok(())
        })
        .await;
        assert!(!faulted);
        assert_eq!(trace.get(), vec!["try", "finally"]);
    }

    #[tokio::test]
    async fn typed_error_passes_through_and_stops_block() {
        let trace = Trace::default();
        async fn steps(trace: &Trace) -> Result<(), Fault> {
            trace.push("step1");
            Err::<(), _>(anyhow::anyhow!("disk full"))?;
            trace.push("step2");
            Ok(())
        }
        let faulted = run_with(&trace, steps(&trace)).await;
        assert!(faulted);
        assert_eq!(trace.get(), vec!["step1", "catch:disk full", "finally"]);
    }

    #[tokio::test]
    async fn text_fault_keeps_its_message() {
        let trace = Trace::default();
        run_with(&trace, async { Err(Fault::from("not an error")) }).await;
        assert_eq!(trace.get(), vec!["catch:not an error", "finally"]);
    }

    #[tokio::test]
    async fn panics_are_normalized() {
        let trace = Trace::default();
        run_with(&trace, async {
            if true {
                panic!("not an error");
            }
            Ok(())
        })
        .await;
        run_with(&trace, async {
            if true {
                std::panic::panic_any(String::from("owned text"));
            }
            Ok(())
        })
        .await;
        run_with(&trace, async {
            if true {
                std::panic::panic_any(anyhow::anyhow!("typed"));
            }
            Ok(())
        })
        .await;
        run_with(&trace, async {
            if true {
                std::panic::panic_any(42_u32);
            }
            Ok(())
        })
        .await;
        assert_eq!(
            trace.get(),
            vec![
                "catch:not an error",
                "finally",
                "catch:owned text",
                "finally",
                "catch:typed",
                "finally",
                format!("catch:{UNKNOWN_PROBLEM}").as_str(),
                "finally",
            ]
        );
    }

    #[tokio::test]
    async fn unknown_fault_message_is_fixed() {
        let trace = Trace::default();
        run_with(&trace, async { Err(Fault::Unknown) }).await;
        assert_eq!(trace.get()[0], "catch:paniced for unknown problem");
    }

    #[tokio::test]
    async fn cleanup_is_optional() {
        let caught = Mutex::new(None);
        let faulted = CatchGroup::builder()
            .try_block(async { Err(Fault::from("boom")) })
            .catch(|e| *caught.lock().unwrap() = Some(e.to_string()))
            .build()
            .unwrap()
            .run()
            .await;
        assert!(faulted);
        assert_eq!(caught.lock().unwrap().as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn cleanup_runs_even_when_the_handler_panics() {
        let cleaned = AtomicBool::new(false);
        let group = CatchGroup::builder()
            .try_block(async { Err(Fault::from("boom")) })
            .catch(|e| panic!("handler gave up on {e}"))
            .finally(async { cleaned.store(true, Ordering::SeqCst) })
            .build()
            .unwrap();
        let outcome = AssertUnwindSafe(group.run()).catch_unwind().await;
        let payload = outcome.expect_err("handler panic is re-raised");
        assert_eq!(payload.downcast_ref::<String>().map(String::as_str), Some("handler gave up on boom"));
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn missing_parts_fail_construction() {
        let no_catch = CatchGroup::builder().try_block(async { Ok(()) }).build();
        assert!(no_catch.is_err());

        let no_try = CatchGroup::builder().catch(|_| {}).finally(async {}).build();
        let err = no_try.err().expect("construction must fail");
        assert!(err.to_string().contains("try and catch are required"));

        assert!(CatchGroup::builder().build().is_err());
    }
}
