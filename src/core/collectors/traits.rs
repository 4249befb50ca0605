use std::{panic::AssertUnwindSafe, time::Duration};

use futures::FutureExt;
use tracing::{debug, warn};

use super::{
    error::CollectorError,
    types::{CollectorResult, Schedule},
};
use crate::core::model::{CollectionResult, Entity, SourceContext, SourceType};

/// Capability interface every source kind implements.
///
/// The orchestrator calls [`initialize`](Collector::initialize) exactly once,
/// then [`entities`](Collector::entities) once, then
/// [`collect`](Collector::collect) every [`interval`](Collector::interval)
/// through [`guarded_poll`], which turns errors and panics into unavailable
/// results.
#[async_trait::async_trait]
pub trait Collector: Send + Sync {
    fn context(&self) -> &SourceContext;

    fn schedule(&self) -> Schedule;

    /// Probes the environment, e.g. resolves a device path or takes a first
    /// CPU sample. A failure is logged and the collector stays scheduled.
    async fn initialize(&mut self) -> CollectorResult<()> {
        Ok(())
    }

    /// Entity descriptors; stable after `initialize`.
    fn entities(&self) -> Vec<Entity>;

    /// One sample of the source.
    async fn collect(&mut self) -> CollectorResult<CollectionResult>;

    /// Stable id, `{source_type}/{source_id}`.
    fn id(&self) -> String {
        let ctx = self.context();
        format!("{}/{}", ctx.source_type.as_str(), ctx.source_id)
    }

    fn name(&self) -> &str {
        &self.context().display_name
    }

    fn source_type(&self) -> SourceType {
        self.context().source_type
    }

    fn state_topic(&self) -> &str {
        &self.context().state_topic
    }

    fn interval(&self) -> Duration {
        self.schedule().interval
    }

    fn enabled(&self) -> bool {
        self.schedule().enabled
    }
}

/// Polls `collector`, never failing.
///
/// Errors become unavailable results whose state is `not_found` for a missing
/// source and `error` otherwise. A panic inside `collect` is caught and
/// reported as `error`. The returned result is normalized, so an unavailable
/// one carries no data.
pub async fn guarded_poll(collector: &mut dyn Collector) -> CollectionResult {
    let id = collector.id();
    let outcome = AssertUnwindSafe(collector.collect()).catch_unwind().await;

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            debug!("Collector {} poll failed: {}", id, e);
            CollectionResult::unavailable(e.state(), Some(e.to_string()))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!("Collector {} panicked during poll: {}", id, message);
            let e = CollectorError::Panicked(message);
            CollectionResult::unavailable(e.state(), Some(e.to_string()))
        }
    };

    result.normalized()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Device, STATE_ERROR, STATE_NOT_FOUND};

    enum Behaviour {
        Ok,
        Missing,
        Fail,
        Panic,
        UnavailableWithData,
    }

    struct Scripted {
        ctx: SourceContext,
        behaviour: Behaviour,
    }

    impl Scripted {
        fn new(behaviour: Behaviour) -> Self {
            let device = Device::host("test", "host", "Host");
            Self {
                ctx: SourceContext::new("test", SourceType::Custom, "scripted", device),
                behaviour,
            }
        }
    }

    #[async_trait::async_trait]
    impl Collector for Scripted {
        fn context(&self) -> &SourceContext {
            &self.ctx
        }

        fn schedule(&self) -> Schedule {
            Schedule::every(Duration::from_secs(1))
        }

        fn entities(&self) -> Vec<Entity> {
            vec![self.ctx.sensor("value", "Value")]
        }

        async fn collect(&mut self) -> CollectorResult<CollectionResult> {
            match self.behaviour {
                Behaviour::Ok => Ok(CollectionResult::online().with("value", 1.234)),
                Behaviour::Missing => Err(CollectorError::SourceNotFound("scripted".into())),
                Behaviour::Fail => Err(CollectorError::Other("boom".into())),
                Behaviour::Panic => panic!("collector bug"),
                Behaviour::UnavailableWithData => {
                    let mut result = CollectionResult::error("half read");
                    result.set("value", 3.0);
                    Ok(result)
                }
            }
        }
    }

    #[tokio::test]
    async fn test_guarded_poll_passes_results_through() {
        let mut collector = Scripted::new(Behaviour::Ok);
        let result = guarded_poll(&mut collector).await;
        assert!(result.available);
        assert!(result.get("value").is_some());
    }

    #[tokio::test]
    async fn test_guarded_poll_maps_missing_source() {
        let mut collector = Scripted::new(Behaviour::Missing);
        let result = guarded_poll(&mut collector).await;
        assert!(!result.available);
        assert_eq!(result.state, STATE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_guarded_poll_maps_errors() {
        let mut collector = Scripted::new(Behaviour::Fail);
        let result = guarded_poll(&mut collector).await;
        assert_eq!(result.state, STATE_ERROR);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("boom")));
    }

    #[tokio::test]
    async fn test_guarded_poll_catches_panics() {
        let mut collector = Scripted::new(Behaviour::Panic);
        let result = guarded_poll(&mut collector).await;
        assert_eq!(result.state, STATE_ERROR);
        assert!(result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("collector bug")));
    }

    #[tokio::test]
    async fn test_guarded_poll_strips_data_of_unavailable_results() {
        let mut collector = Scripted::new(Behaviour::UnavailableWithData);
        let result = guarded_poll(&mut collector).await;
        assert!(result.data().is_empty());
    }

    #[test]
    fn test_default_id() {
        let collector = Scripted::new(Behaviour::Ok);
        assert_eq!(collector.id(), "custom/scripted");
        assert_eq!(collector.state_topic(), "test/custom/scripted");
    }
}
