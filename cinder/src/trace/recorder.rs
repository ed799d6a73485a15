//! The recorder: begin/end operations over the current context.
//!
//! There is deliberately no process-wide recorder; construct one with
//! [`Recorder::builder`] at composition time and share it by [`Arc`] with
//! every interceptor and capture site that needs it.

use crate::cinder_warn;
use crate::context::Context;
use crate::emitter::{DaemonEmitter, Emitter, NoopEmitter};
use crate::trace::{
    Config, ContextMissing, Entity, Error, IdGenerator, Namespace, RandomIdGenerator, Sampler,
    SamplingRequest, SamplingRuleSet, StartupPolicy, TraceHeader,
};
use std::ops::Deref;
use std::sync::Arc;

/// Handle to an open root segment.
#[derive(Clone, Debug)]
pub struct Segment {
    entity: Arc<Entity>,
}

impl Segment {
    /// The underlying shared entity.
    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }
}

impl Deref for Segment {
    type Target = Entity;

    fn deref(&self) -> &Entity {
        &self.entity
    }
}

/// Handle to an open subsegment.
#[derive(Clone, Debug)]
pub struct Subsegment {
    entity: Arc<Entity>,
}

impl Subsegment {
    /// The underlying shared entity.
    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }
}

impl Deref for Subsegment {
    type Target = Entity;

    fn deref(&self) -> &Entity {
        &self.entity
    }
}

/// Records segments and subsegments against the calling task's context and
/// emits closed, sampled trees.
#[derive(Debug)]
pub struct Recorder {
    config: Config,
    sampler: Sampler,
    emitter: Arc<dyn Emitter>,
    id_generator: Box<dyn IdGenerator>,
}

impl Recorder {
    /// Starts building a recorder.
    pub fn builder() -> RecorderBuilder {
        RecorderBuilder::default()
    }

    /// The configuration this recorder was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Service identity recorded on root segments.
    pub fn service(&self) -> &str {
        &self.config.service
    }

    /// The sampling decision engine.
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Bound on recorded exception-chain depth.
    pub fn max_cause_depth(&self) -> usize {
        self.config.max_cause_depth
    }

    /// Begins a root segment, deciding sampling from the inbound header and
    /// the configured rules.
    ///
    /// Interceptors that already consulted the sampler (to include method
    /// and path in the decision) use [`Recorder::begin_segment_with_decision`]
    /// instead; the decision is made once per trace either way.
    pub fn begin_segment(
        &self,
        name: &str,
        header: Option<&TraceHeader>,
    ) -> Result<Option<Segment>, Error> {
        let sampled = self.sampler.decide(
            header,
            &SamplingRequest {
                service: Some(&self.config.service),
                ..SamplingRequest::default()
            },
        );
        self.begin_segment_with_decision(name, header, sampled)
    }

    /// Begins a root segment with an already-made sampling decision.
    ///
    /// The trace id is adopted from the header when present, freshly
    /// generated otherwise; the header's parent id becomes the segment's
    /// parent so the upstream caller can stitch the trace together. Root
    /// segments do not nest: with a segment already open the
    /// context-missing policy applies.
    pub fn begin_segment_with_decision(
        &self,
        name: &str,
        header: Option<&TraceHeader>,
        sampled: bool,
    ) -> Result<Option<Segment>, Error> {
        if Context::active_entity().is_some() {
            return self.context_violation(Error::EntityAlreadyOpen);
        }

        let trace_id = header
            .and_then(|h| h.trace_id)
            .unwrap_or_else(|| self.id_generator.new_trace_id());
        let parent_id = header.and_then(|h| h.parent_id);
        let entity = Entity::new_segment(
            name,
            trace_id,
            parent_id,
            self.id_generator.new_segment_id(),
            sampled,
        );
        Context::push_active(entity.clone());
        Ok(Some(Segment { entity }))
    }

    /// Begins a subsegment under the entity currently open in the calling
    /// task's context.
    ///
    /// With nothing open the context-missing policy applies; under
    /// [`ContextMissing::LogError`] the caller receives `Ok(None)` and must
    /// treat the span as untraced (give-up), skipping the matching end call.
    pub fn begin_subsegment(
        &self,
        name: &str,
        namespace: Namespace,
    ) -> Result<Option<Subsegment>, Error> {
        let Some(parent) = Context::active_entity() else {
            return self.context_violation(Error::SegmentNotFound);
        };
        if !parent.in_progress() {
            return self.context_violation(Error::AlreadyEnded);
        }

        let entity = Entity::new_subsegment(
            name,
            namespace,
            &parent,
            self.id_generator.new_segment_id(),
        );
        Context::push_active(entity.clone());
        Ok(Some(Subsegment { entity }))
    }

    /// Closes and pops the current subsegment. Closing an entity that has
    /// already ended is a no-op.
    pub fn end_subsegment(&self) -> Result<(), Error> {
        match Context::active_entity() {
            Some(entity) if entity.is_subsegment() => {
                entity.close();
                Context::pop_active();
                Ok(())
            }
            _ => self.context_violation::<()>(Error::SegmentNotFound).map(drop),
        }
    }

    /// Closes and pops the current segment, handing the completed tree to
    /// the emitter when sampled.
    ///
    /// Subsegments still open at this point are closed first and logged;
    /// nothing dangling ever reaches the emitter.
    pub fn end_segment(&self) -> Result<(), Error> {
        loop {
            match Context::active_entity() {
                None => {
                    return self.context_violation::<()>(Error::SegmentNotFound).map(drop);
                }
                Some(entity) if entity.is_subsegment() => {
                    cinder_warn!(
                        name: "Recorder.DanglingSubsegment",
                        subsegment = entity.name().to_string()
                    );
                    entity.close();
                    Context::pop_active();
                }
                Some(segment) => {
                    segment.close();
                    Context::pop_active();
                    if segment.sampled() {
                        self.emit(&segment);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Root segment of the calling task's context, if one is open.
    pub fn current_segment(&self) -> Option<Segment> {
        Context::map_current(|cx| {
            cx.root()
                .filter(|entity| entity.is_segment())
                .cloned()
                .map(|entity| Segment { entity })
        })
    }

    /// Subsegment at the top of the calling task's context, if any.
    pub fn current_subsegment(&self) -> Option<Subsegment> {
        Context::active_entity()
            .filter(|entity| entity.is_subsegment())
            .map(|entity| Subsegment { entity })
    }

    /// Entity at the top of the calling task's context, if any.
    pub fn current_entity(&self) -> Option<Arc<Entity>> {
        Context::active_entity()
    }

    /// Records an annotation on the current entity.
    pub fn put_annotation(
        &self,
        key: impl Into<String>,
        value: impl Into<crate::trace::AnnotationValue>,
    ) -> Result<(), Error> {
        match Context::active_entity() {
            Some(entity) => {
                entity.put_annotation(key, value);
                Ok(())
            }
            None => self.context_violation::<()>(Error::SegmentNotFound).map(drop),
        }
    }

    /// Records `err` on the current entity, bounded by the configured cause
    /// depth.
    pub fn add_exception(
        &self,
        err: &(dyn std::error::Error + 'static),
        remote: bool,
    ) -> Result<(), Error> {
        match Context::active_entity() {
            Some(entity) => {
                entity.add_exception(err, self.config.max_cause_depth, remote);
                Ok(())
            }
            None => self.context_violation::<()>(Error::SegmentNotFound).map(drop),
        }
    }

    fn emit(&self, entity: &Arc<Entity>) {
        if let Err(err) = self.emitter.emit(entity.snapshot()) {
            // Emission failures must never reach request handling.
            cinder_warn!(name: "Recorder.EmitFailed", message = err.to_string());
        }
    }

    fn context_violation<T>(&self, err: Error) -> Result<Option<T>, Error> {
        match self.config.context_missing {
            ContextMissing::RuntimeError => Err(err),
            ContextMissing::LogError => {
                cinder_warn!(name: "Recorder.ContextMissing", message = err.to_string());
                Ok(None)
            }
        }
    }
}

/// Configures and constructs a [`Recorder`].
#[derive(Debug, Default)]
pub struct RecorderBuilder {
    config: Config,
    rules: SamplingRuleSet,
    emitter: Option<Arc<dyn Emitter>>,
    id_generator: Option<Box<dyn IdGenerator>>,
}

impl RecorderBuilder {
    /// Service identity for root segments and rule matching.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.config.service = service.into();
        self
    }

    /// `host:port` of the collector daemon.
    pub fn with_daemon_address(mut self, addr: impl Into<String>) -> Self {
        self.config.daemon_address = addr.into();
        self
    }

    /// Process-wide tracing switch.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Recorder-level sampling switch; off traces every request.
    pub fn with_sampling(mut self, sampling: bool) -> Self {
        self.config.sampling = sampling;
        self
    }

    /// Behavior when no entity is open.
    pub fn with_context_missing(mut self, policy: ContextMissing) -> Self {
        self.config.context_missing = policy;
        self
    }

    /// Behavior when the daemon is unreachable at startup.
    pub fn with_startup_policy(mut self, policy: StartupPolicy) -> Self {
        self.config.startup = policy;
        self
    }

    /// Bound on recorded exception-chain depth.
    pub fn with_max_cause_depth(mut self, depth: usize) -> Self {
        self.config.max_cause_depth = depth;
        self
    }

    /// Logical call sites to resolve against the instrumentation registry.
    pub fn with_instrument<I, S>(mut self, call_sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.instrument = call_sites.into_iter().map(Into::into).collect();
        self
    }

    /// Local sampling rules.
    pub fn with_sampling_rules(mut self, rules: SamplingRuleSet) -> Self {
        self.rules = rules;
        self
    }

    /// Replaces the daemon emitter, skipping the startup probe.
    pub fn with_emitter(mut self, emitter: impl Emitter + 'static) -> Self {
        self.emitter = Some(Arc::new(emitter));
        self
    }

    /// Replaces the id generator.
    pub fn with_id_generator(mut self, id_generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Some(Box::new(id_generator));
        self
    }

    /// Builds the recorder.
    ///
    /// Without a custom emitter this resolves and connects the daemon
    /// address as a startup prerequisite check. On failure,
    /// [`StartupPolicy::SoftFail`] logs, disables tracing for the process
    /// and keeps running; [`StartupPolicy::HardFail`] returns the error.
    pub fn build(self) -> Result<Recorder, Error> {
        let mut config = self.config;

        let emitter: Arc<dyn Emitter> = match self.emitter {
            Some(emitter) => emitter,
            None if config.enabled => {
                match DaemonEmitter::new(config.daemon_address.as_str()) {
                    Ok(emitter) => Arc::new(emitter),
                    Err(source) => {
                        let err = Error::DaemonUnreachable {
                            addr: config.daemon_address.clone(),
                            source,
                        };
                        match config.startup {
                            StartupPolicy::HardFail => return Err(err),
                            StartupPolicy::SoftFail => {
                                cinder_warn!(
                                    name: "Recorder.TracingDisabled",
                                    message = err.to_string()
                                );
                                config.enabled = false;
                                Arc::new(NoopEmitter)
                            }
                        }
                    }
                }
            }
            None => Arc::new(NoopEmitter),
        };

        let sampler = Sampler::new(config.enabled, config.sampling, self.rules);
        Ok(Recorder {
            config,
            sampler,
            emitter,
            id_generator: self
                .id_generator
                .unwrap_or_else(|| Box::<RandomIdGenerator>::default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::InMemoryEmitter;
    use crate::trace::{IncrementIdGenerator, SampleDecision, TraceId};

    fn test_recorder(emitter: Arc<InMemoryEmitter>) -> Recorder {
        RecorderBuilder::default()
            .with_service("test")
            .with_sampling(false)
            .with_emitter(emitter)
            .with_id_generator(IncrementIdGenerator::new())
            .build()
            .unwrap()
    }

    #[test]
    fn segment_lifecycle_emits_once() {
        let emitter = Arc::new(InMemoryEmitter::new());
        let recorder = test_recorder(emitter.clone());

        let segment = recorder.begin_segment("test", None).unwrap().unwrap();
        assert!(segment.sampled());
        assert!(segment.in_progress());
        assert_eq!(recorder.current_segment().unwrap().id(), segment.id());

        recorder.end_segment().unwrap();
        assert!(recorder.current_segment().is_none());

        let emitted = emitter.finished_segments();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].name, "test");

        // A second end is a no-op under the default policy.
        recorder.end_segment().unwrap();
        assert_eq!(emitter.finished_segments().len(), 1);
    }

    #[test]
    fn unsampled_segments_are_not_emitted() {
        let emitter = Arc::new(InMemoryEmitter::new());
        let recorder = test_recorder(emitter.clone());

        let segment = recorder
            .begin_segment_with_decision("test", None, false)
            .unwrap()
            .unwrap();
        assert!(!segment.sampled());
        recorder.end_segment().unwrap();

        assert!(emitter.finished_segments().is_empty());
    }

    #[test]
    fn header_identity_is_adopted() {
        let emitter = Arc::new(InMemoryEmitter::new());
        let recorder = test_recorder(emitter);

        let header = TraceHeader {
            trace_id: Some(TraceId::from_hex("1-58406520-a006649127e371903a2de979").unwrap()),
            parent_id: Some("4c721bf33e3caf8f".parse().unwrap()),
            decision: SampleDecision::Sampled,
        };

        let segment = recorder
            .begin_segment("test", Some(&header))
            .unwrap()
            .unwrap();
        assert_eq!(Some(segment.trace_id()), header.trace_id);
        assert_eq!(segment.parent_id(), header.parent_id);
        assert!(segment.sampled());
        recorder.end_segment().unwrap();
    }

    #[test]
    fn segments_do_not_nest() {
        let emitter = Arc::new(InMemoryEmitter::new());
        let recorder = test_recorder(emitter);

        let _outer = recorder.begin_segment("outer", None).unwrap().unwrap();
        assert!(recorder.begin_segment("inner", None).unwrap().is_none());
        recorder.end_segment().unwrap();
    }

    #[test]
    fn missing_context_honors_the_policy() {
        let emitter = Arc::new(InMemoryEmitter::new());
        let recorder = test_recorder(emitter);

        // LogError: no-op with no usable handle.
        assert!(recorder
            .begin_subsegment("call", Namespace::Remote)
            .unwrap()
            .is_none());
        assert!(recorder.put_annotation("key", "value").is_ok());

        let strict = RecorderBuilder::default()
            .with_context_missing(ContextMissing::RuntimeError)
            .with_emitter(InMemoryEmitter::new())
            .build()
            .unwrap();
        assert!(matches!(
            strict.begin_subsegment("call", Namespace::Remote),
            Err(Error::SegmentNotFound)
        ));
        assert!(matches!(
            strict.end_segment(),
            Err(Error::SegmentNotFound)
        ));
    }

    #[test]
    fn subsegments_nest_and_pop_in_order() {
        let emitter = Arc::new(InMemoryEmitter::new());
        let recorder = test_recorder(emitter.clone());

        let segment = recorder.begin_segment("test", None).unwrap().unwrap();
        let outer = recorder
            .begin_subsegment("outer", Namespace::Local)
            .unwrap()
            .unwrap();
        let inner = recorder
            .begin_subsegment("inner", Namespace::Local)
            .unwrap()
            .unwrap();

        assert_eq!(inner.parent_id(), Some(outer.id()));
        assert_eq!(recorder.current_subsegment().unwrap().id(), inner.id());

        recorder.end_subsegment().unwrap();
        assert_eq!(recorder.current_subsegment().unwrap().id(), outer.id());
        recorder.end_subsegment().unwrap();
        assert!(recorder.current_subsegment().is_none());
        recorder.end_segment().unwrap();

        let emitted = emitter.finished_segments();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].subsegments.len(), 1);
        assert_eq!(emitted[0].subsegments[0].subsegments.len(), 1);
        let _ = segment;
    }

    #[test]
    fn end_segment_closes_dangling_subsegments() {
        let emitter = Arc::new(InMemoryEmitter::new());
        let recorder = test_recorder(emitter.clone());

        recorder.begin_segment("test", None).unwrap().unwrap();
        let dangling = recorder
            .begin_subsegment("dangling", Namespace::Local)
            .unwrap()
            .unwrap();

        recorder.end_segment().unwrap();
        assert!(!dangling.in_progress());
        assert_eq!(emitter.finished_segments().len(), 1);
    }

    #[test]
    fn soft_fail_disables_tracing_when_daemon_is_unreachable() {
        let recorder = RecorderBuilder::default()
            .with_daemon_address("cinder-daemon.invalid:2000")
            .build()
            .unwrap();
        assert!(!recorder.config().enabled);
        assert!(!recorder.sampler().enabled());
        assert!(!recorder.sampler().decide(None, &SamplingRequest::default()));

        let hard = RecorderBuilder::default()
            .with_daemon_address("cinder-daemon.invalid:2000")
            .with_startup_policy(StartupPolicy::HardFail)
            .build();
        assert!(matches!(hard, Err(Error::DaemonUnreachable { .. })));
    }
}
