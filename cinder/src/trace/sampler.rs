//! The sampling decision engine.
//!
//! One decision is made per trace, in strict precedence order: an upstream
//! directive in the inbound [`TraceHeader`] wins outright, then the global
//! enable switch, then the recorder-level sampling switch, and only then the
//! local rule set — first matching rule, its per-second fixed-target quota,
//! and finally its probabilistic rate.

use crate::trace::ids::with_rng;
use crate::trace::{Error, SampleDecision, TraceHeader};
use rand::Rng;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A literal-or-wildcard match pattern for one rule field.
///
/// `*` matches anything, a trailing `*` matches by prefix, and anything
/// else must match exactly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pattern {
    /// Matches any value.
    Any,
    /// Matches values starting with the given prefix.
    Prefix(String),
    /// Matches the value exactly.
    Exact(String),
}

impl Pattern {
    /// Parses the textual rule-field form.
    pub fn new(pattern: &str) -> Pattern {
        if pattern == "*" {
            Pattern::Any
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            Pattern::Prefix(prefix.to_string())
        } else {
            Pattern::Exact(pattern.to_string())
        }
    }

    /// True when `value` matches this pattern.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Prefix(prefix) => value.starts_with(prefix),
            Pattern::Exact(exact) => value == exact,
        }
    }
}

impl FromStr for Pattern {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Pattern::new(s))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::Prefix(prefix) => write!(f, "{prefix}*"),
            Pattern::Exact(exact) => f.write_str(exact),
        }
    }
}

/// Per-second guaranteed sampling quota.
///
/// The counter resets on every whole second regardless of request volume;
/// unused budget does not carry over.
#[derive(Debug)]
struct Reservoir {
    capacity: u64,
    state: Mutex<ReservoirState>,
}

#[derive(Debug, Default)]
struct ReservoirState {
    this_sec: u64,
    taken: u64,
}

impl Reservoir {
    fn new(capacity: u64) -> Reservoir {
        Reservoir {
            capacity,
            state: Mutex::new(ReservoirState::default()),
        }
    }

    fn take(&self, now: u64) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.this_sec != now {
            state.this_sec = now;
            state.taken = 0;
        }
        if state.taken < self.capacity {
            state.taken += 1;
            true
        } else {
            false
        }
    }
}

/// One local sampling rule.
#[derive(Debug)]
pub struct SamplingRule {
    /// Human-readable description, carried through from the rule document.
    pub description: Option<String>,
    /// Pattern applied to the service name.
    pub service_name: Pattern,
    /// Pattern applied to the HTTP method, matched case-insensitively.
    pub http_method: Pattern,
    /// Pattern applied to the url path.
    pub url_path: Pattern,
    /// Requests per second sampled regardless of the rate.
    pub fixed_target: u64,
    /// Probability applied to requests beyond the fixed target.
    pub rate: f64,
    reservoir: Reservoir,
}

impl SamplingRule {
    /// Builds a rule; `rate` must be within `[0, 1]`.
    pub fn new(
        service_name: Pattern,
        http_method: Pattern,
        url_path: Pattern,
        fixed_target: u64,
        rate: f64,
    ) -> Result<SamplingRule, Error> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(Error::InvalidRule(format!(
                "rate {rate} is outside [0, 1]"
            )));
        }
        Ok(SamplingRule {
            description: None,
            service_name,
            http_method,
            url_path,
            fixed_target,
            rate,
            reservoir: Reservoir::new(fixed_target),
        })
    }

    /// Catch-all rule with the given budget and rate.
    pub fn default_rule(fixed_target: u64, rate: f64) -> Result<SamplingRule, Error> {
        SamplingRule::new(Pattern::Any, Pattern::Any, Pattern::Any, fixed_target, rate)
    }

    fn matches(&self, request: &SamplingRequest<'_>) -> bool {
        self.service_name
            .matches(request.service.unwrap_or_default())
            && self
                .http_method
                .matches(&request.method.unwrap_or_default().to_uppercase())
            && self.url_path.matches(request.path.unwrap_or_default())
    }

    fn sample(&self, now: u64) -> bool {
        if self.reservoir.take(now) {
            return true;
        }
        self.rate > 0.0 && with_rng(|rng| rng.gen::<f64>()) < self.rate
    }
}

/// An ordered rule sequence plus the mandatory catch-all default.
#[derive(Debug)]
pub struct SamplingRuleSet {
    /// Rules evaluated in order, first match wins.
    pub rules: Vec<SamplingRule>,
    /// Fallback applied when no rule matches.
    pub default_rule: SamplingRule,
}

/// Default per-second budget of the catch-all rule.
pub const DEFAULT_FIXED_TARGET: u64 = 600;
/// Default probabilistic rate of the catch-all rule.
pub const DEFAULT_RATE: f64 = 0.01;

impl Default for SamplingRuleSet {
    fn default() -> Self {
        SamplingRuleSet {
            rules: Vec::new(),
            default_rule: SamplingRule::default_rule(DEFAULT_FIXED_TARGET, DEFAULT_RATE)
                .expect("default rate is valid"),
        }
    }
}

impl SamplingRuleSet {
    /// Builds a rule set from explicit parts.
    pub fn new(rules: Vec<SamplingRule>, default_rule: SamplingRule) -> SamplingRuleSet {
        SamplingRuleSet {
            rules,
            default_rule,
        }
    }

    /// Parses the versioned JSON rule document:
    ///
    /// ```json
    /// {
    ///   "version": 1,
    ///   "rules": [
    ///     {
    ///       "description": "Player moves.",
    ///       "service_name": "*",
    ///       "http_method": "GET",
    ///       "url_path": "/api/move/*",
    ///       "fixed_target": 0,
    ///       "rate": 0.05
    ///     }
    ///   ],
    ///   "default": {"fixed_target": 600, "rate": 0.01}
    /// }
    /// ```
    pub fn from_json(document: &str) -> Result<SamplingRuleSet, Error> {
        let document: RuleSetDocument =
            serde_json::from_str(document).map_err(|err| Error::InvalidRule(err.to_string()))?;
        if document.version != 1 {
            return Err(Error::InvalidRule(format!(
                "unsupported rule document version {}",
                document.version
            )));
        }

        let mut rules = Vec::with_capacity(document.rules.len());
        for rule in document.rules {
            let mut built = SamplingRule::new(
                Pattern::new(&rule.service_name),
                Pattern::new(&rule.http_method),
                Pattern::new(&rule.url_path),
                rule.fixed_target,
                rule.rate,
            )?;
            built.description = rule.description;
            rules.push(built);
        }

        Ok(SamplingRuleSet {
            rules,
            default_rule: SamplingRule::default_rule(
                document.default.fixed_target,
                document.default.rate,
            )?,
        })
    }

    fn matching_rule(&self, request: &SamplingRequest<'_>) -> &SamplingRule {
        self.rules
            .iter()
            .find(|rule| rule.matches(request))
            .unwrap_or(&self.default_rule)
    }
}

#[derive(Debug, Deserialize)]
struct RuleSetDocument {
    version: u32,
    #[serde(default)]
    rules: Vec<RuleDocument>,
    default: DefaultRuleDocument,
}

#[derive(Debug, Deserialize)]
struct RuleDocument {
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "any_pattern")]
    service_name: String,
    #[serde(default = "any_pattern")]
    http_method: String,
    #[serde(default = "any_pattern")]
    url_path: String,
    fixed_target: u64,
    rate: f64,
}

#[derive(Debug, Deserialize)]
struct DefaultRuleDocument {
    fixed_target: u64,
    rate: f64,
}

fn any_pattern() -> String {
    "*".to_string()
}

/// The request attributes a sampling decision is based on.
#[derive(Clone, Copy, Debug, Default)]
pub struct SamplingRequest<'a> {
    /// Name of the service handling the request.
    pub service: Option<&'a str>,
    /// HTTP method.
    pub method: Option<&'a str>,
    /// Url path.
    pub path: Option<&'a str>,
}

/// Decides, once per trace, whether detailed recording happens.
#[derive(Debug)]
pub struct Sampler {
    enabled: bool,
    sampling: bool,
    rules: SamplingRuleSet,
}

impl Sampler {
    /// Builds a sampler.
    ///
    /// `enabled` is the process-wide tracing switch; `sampling` is the
    /// recorder-level rate-limiting switch — when it is off every request
    /// (not overridden upstream) is traced.
    pub fn new(enabled: bool, sampling: bool, rules: SamplingRuleSet) -> Sampler {
        Sampler {
            enabled,
            sampling,
            rules,
        }
    }

    /// True when tracing is enabled for this process.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the sampling decision for one request. Terminal: callers
    /// must not consult the sampler again for the same trace.
    pub fn decide(&self, header: Option<&TraceHeader>, request: &SamplingRequest<'_>) -> bool {
        self.decide_at(header, request, epoch_now())
    }

    pub(crate) fn decide_at(
        &self,
        header: Option<&TraceHeader>,
        request: &SamplingRequest<'_>,
        now: u64,
    ) -> bool {
        // The upstream decision has the highest precedence so one trace is
        // recorded consistently across services.
        if let Some(header) = header {
            match header.decision {
                SampleDecision::Sampled => return true,
                SampleDecision::NotSampled => return false,
                SampleDecision::Requested => {}
            }
        }
        if !self.enabled {
            return false;
        }
        if !self.sampling {
            return true;
        }
        self.rules.matching_rule(request).sample(now)
    }
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>() -> SamplingRequest<'a> {
        SamplingRequest {
            service: Some("booking"),
            method: Some("GET"),
            path: Some("/api/trips"),
        }
    }

    fn drop_everything() -> SamplingRuleSet {
        SamplingRuleSet::new(
            Vec::new(),
            SamplingRule::default_rule(0, 0.0).unwrap(),
        )
    }

    #[test]
    fn pattern_matching() {
        let cases = [
            ("*", "anything", true),
            ("*", "", true),
            ("/api/move/*", "/api/move/north", true),
            ("/api/move/*", "/api/stay", false),
            ("GET", "GET", true),
            ("GET", "POST", false),
            ("", "", true),
            ("", "x", false),
        ];
        for (pattern, value, expected) in cases {
            assert_eq!(
                Pattern::new(pattern).matches(value),
                expected,
                "{pattern:?} vs {value:?}"
            );
        }
    }

    #[test]
    fn upstream_decision_overrides_local_rules() {
        // Local rules would drop everything, but the header wins.
        let sampler = Sampler::new(true, true, drop_everything());
        let sampled = TraceHeader {
            decision: SampleDecision::Sampled,
            ..TraceHeader::default()
        };
        assert!(sampler.decide(Some(&sampled), &request()));

        // And the reverse: local rules would keep everything.
        let sampler = Sampler::new(true, true, SamplingRuleSet::default());
        let not_sampled = TraceHeader {
            decision: SampleDecision::NotSampled,
            ..TraceHeader::default()
        };
        assert!(!sampler.decide(Some(&not_sampled), &request()));
    }

    #[test]
    fn requested_decision_falls_through_to_rules() {
        let sampler = Sampler::new(true, true, drop_everything());
        let requested = TraceHeader::default();
        assert!(!sampler.decide(Some(&requested), &request()));
    }

    #[test]
    fn disabled_process_never_samples() {
        let sampler = Sampler::new(false, true, SamplingRuleSet::default());
        assert!(!sampler.decide(None, &request()));
        // ... and the switch is weaker than an upstream directive.
        let sampled = TraceHeader {
            decision: SampleDecision::Sampled,
            ..TraceHeader::default()
        };
        assert!(sampler.decide(Some(&sampled), &request()));
    }

    #[test]
    fn sampling_switch_off_traces_everything() {
        let sampler = Sampler::new(true, false, drop_everything());
        for _ in 0..32 {
            assert!(sampler.decide(None, &request()));
        }
    }

    #[test]
    fn fixed_target_admits_exactly_one_per_interval() {
        let sampler = Sampler::new(
            true,
            true,
            SamplingRuleSet::new(Vec::new(), SamplingRule::default_rule(1, 0.0).unwrap()),
        );

        let now = 1_600_000_000;
        let decisions: Vec<bool> = (0..10)
            .map(|_| sampler.decide_at(None, &request(), now))
            .collect();
        assert_eq!(decisions.iter().filter(|d| **d).count(), 1);
        assert!(decisions[0]);

        // The budget refills on the next interval and unused budget from
        // earlier intervals does not accumulate.
        assert!(sampler.decide_at(None, &request(), now + 3));
        assert!(!sampler.decide_at(None, &request(), now + 3));
    }

    #[test]
    fn first_matching_rule_wins() {
        let keep_moves = SamplingRule::new(
            Pattern::Any,
            Pattern::Any,
            Pattern::new("/api/move/*"),
            1_000,
            1.0,
        )
        .unwrap();
        let sampler = Sampler::new(
            true,
            true,
            SamplingRuleSet::new(vec![keep_moves], SamplingRule::default_rule(0, 0.0).unwrap()),
        );

        let moves = SamplingRequest {
            service: Some("booking"),
            method: Some("get"),
            path: Some("/api/move/north"),
        };
        assert!(sampler.decide(None, &moves));
        assert!(!sampler.decide(None, &request()));
    }

    #[test]
    fn rule_document_parses() {
        let rules = SamplingRuleSet::from_json(
            r#"{
                "version": 1,
                "rules": [
                    {
                        "description": "Player moves.",
                        "service_name": "*",
                        "http_method": "*",
                        "url_path": "/api/move/*",
                        "fixed_target": 0,
                        "rate": 0.05
                    }
                ],
                "default": {"fixed_target": 600, "rate": 0.01}
            }"#,
        )
        .unwrap();

        assert_eq!(rules.rules.len(), 1);
        assert_eq!(rules.rules[0].description.as_deref(), Some("Player moves."));
        assert_eq!(rules.rules[0].url_path, Pattern::Prefix("/api/move/".into()));
        assert_eq!(rules.default_rule.fixed_target, 600);
    }

    #[test]
    fn rule_document_rejects_bad_input() {
        assert!(SamplingRuleSet::from_json("{}").is_err());
        assert!(SamplingRuleSet::from_json(
            r#"{"version": 2, "rules": [], "default": {"fixed_target": 0, "rate": 0}}"#
        )
        .is_err());
        assert!(SamplingRuleSet::from_json(
            r#"{"version": 1, "rules": [], "default": {"fixed_target": 0, "rate": 1.5}}"#
        )
        .is_err());
    }
}
