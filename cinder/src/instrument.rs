//! Composition-time instrumentation registry.
//!
//! Instead of patching third-party call sites at runtime, applications
//! register a wrapper factory per logical call-site identifier and resolve
//! the configured identifiers once, while wiring the service together. The
//! factories produce whatever wrapper type suits the call site (for HTTP
//! clients, `cinder-http`'s outbound interceptor); the registry only
//! brokers between identifiers and factories.

use crate::cinder_warn;
use crate::trace::Recorder;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type WrapperFactory = Arc<dyn Fn(Arc<Recorder>) -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// Maps logical call-site identifiers to wrapper factories.
#[derive(Clone, Default)]
pub struct InstrumentationRegistry {
    factories: HashMap<String, WrapperFactory>,
}

impl InstrumentationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        InstrumentationRegistry::default()
    }

    /// Registers a wrapper factory under `name`, replacing any previous
    /// registration.
    pub fn register<F, W>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(Arc<Recorder>) -> W + Send + Sync + 'static,
        W: Send + Sync + 'static,
    {
        self.factories.insert(
            name.into(),
            Arc::new(move |recorder| Arc::new(factory(recorder))),
        );
    }

    /// Builds the wrapper registered under `name`, or `None` when the
    /// identifier is unknown. Downcast the result to the registered wrapper
    /// type.
    pub fn build(&self, name: &str, recorder: &Arc<Recorder>) -> Option<Arc<dyn Any + Send + Sync>> {
        self.factories
            .get(name)
            .map(|factory| factory(recorder.clone()))
    }

    /// Resolves every call site named in the recorder's configuration,
    /// logging and skipping identifiers with no registered factory.
    pub fn apply(&self, recorder: &Arc<Recorder>) -> Vec<(String, Arc<dyn Any + Send + Sync>)> {
        let mut wrappers = Vec::new();
        for name in &recorder.config().instrument {
            match self.build(name, recorder) {
                Some(wrapper) => wrappers.push((name.clone(), wrapper)),
                None => {
                    cinder_warn!(
                        name: "Instrumentation.UnknownCallSite",
                        call_site = name.clone()
                    );
                }
            }
        }
        wrappers
    }
}

impl fmt::Debug for InstrumentationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("InstrumentationRegistry")
            .field("call_sites", &names)
            .finish()
    }
}
