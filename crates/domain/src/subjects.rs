use std::collections::BTreeMap;

use vessel_errors::{VesselError, VesselResult};

pub const DEFAULT_NAMESPACE: &str = "vessel";

/// Prefix of the per-agent stream names.
pub const AGENT_STREAM_PREFIX: &str = "AGENT_";

/// Values bound to the placeholder segments of a template.
pub type Params = BTreeMap<String, String>;

/// 主题模板中的每一段
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A dot-delimited subject template such as `vessel.worker.start.<agent>.<worker>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl SubjectTemplate {
    pub fn parse(template: &str) -> VesselResult<Self> {
        if template.is_empty() {
            return Err(VesselError::config_error("subject template is empty"));
        }
        let mut segments = Vec::new();
        for part in template.split('.') {
            if part.is_empty() {
                return Err(VesselError::config_error(format!(
                    "subject template '{template}' has an empty segment"
                )));
            }
            if let Some(name) = part.strip_prefix('<').and_then(|p| p.strip_suffix('>')) {
                if name.is_empty() {
                    return Err(VesselError::config_error(format!(
                        "subject template '{template}' has an unnamed placeholder"
                    )));
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a concrete subject, returning the bound placeholder values.
    pub fn matches(&self, subject: &str) -> Option<Params> {
        let parts: Vec<&str> = subject.split('.').collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = Params::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if part.is_empty() => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }

    /// Render a concrete subject; every placeholder must be bound.
    pub fn render(&self, params: &Params) -> VesselResult<String> {
        let mut parts = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => parts.push(lit.as_str()),
                Segment::Param(name) => {
                    let value = params.get(name).ok_or_else(|| {
                        VesselError::Internal(format!(
                            "placeholder <{name}> of '{}' is not bound",
                            self.raw
                        ))
                    })?;
                    validate_token(value)?;
                    parts.push(value.as_str());
                }
            }
        }
        Ok(parts.join("."))
    }

    /// Render a broker filter: unbound placeholders become `*`.
    pub fn filter(&self, params: &Params) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(lit) => lit.as_str(),
                Segment::Param(name) => params.get(name).map(String::as_str).unwrap_or("*"),
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Table of subject templates, each bound to a handler value.
///
/// Lookups walk the table in insertion order and return the first match.
#[derive(Debug, Clone)]
pub struct Router<H> {
    routes: Vec<(SubjectTemplate, H)>,
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> Router<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, template: SubjectTemplate, handler: H) -> &mut Self {
        self.routes.push((template, handler));
        self
    }

    pub fn resolve(&self, subject: &str) -> Option<(&H, Params)> {
        self.routes
            .iter()
            .find_map(|(template, handler)| template.matches(subject).map(|p| (handler, p)))
    }
}

/// 协议中的所有主题
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Route {
    WorkerStart,
    WorkerStop,
    WorkerStdin,
    WorkerStdout,
    WorkerStatus,
    Reply,
    ConnectionInfo,
}

impl Route {
    pub const ALL: [Route; 7] = [
        Route::WorkerStart,
        Route::WorkerStop,
        Route::WorkerStdin,
        Route::WorkerStdout,
        Route::WorkerStatus,
        Route::Reply,
        Route::ConnectionInfo,
    ];

    /// The four subjects whose messages make up a job's lifecycle.
    pub const JOB_LIFECYCLE: [Route; 4] = [
        Route::WorkerStart,
        Route::WorkerStop,
        Route::WorkerStatus,
        Route::Reply,
    ];

    fn suffix(&self) -> &'static str {
        match self {
            Route::WorkerStart => "worker.start.<agent>.<worker>",
            Route::WorkerStop => "worker.stop.<agent>.<worker>",
            Route::WorkerStdin => "worker.stdin.<agent>.<worker>",
            Route::WorkerStdout => "worker.stdout.<agent>.<worker>",
            Route::WorkerStatus => "worker.status.<agent>.<worker>",
            Route::Reply => "reply.<agent>.<message>",
            Route::ConnectionInfo => "connection.info.<agent>",
        }
    }
}

/// Subject naming for one namespace.
#[derive(Debug, Clone)]
pub struct Subjects {
    namespace: String,
    templates: BTreeMap<Route, SubjectTemplate>,
}

impl Subjects {
    pub fn new(namespace: &str) -> VesselResult<Self> {
        for token in namespace.split('.') {
            validate_token(token)?;
        }
        Self::build(namespace)
    }

    fn build(namespace: &str) -> VesselResult<Self> {
        let templates = Route::ALL
            .iter()
            .map(|route| {
                SubjectTemplate::parse(&format!("{namespace}.{}", route.suffix()))
                    .map(|template| (*route, template))
            })
            .collect::<VesselResult<BTreeMap<_, _>>>()?;
        Ok(Self {
            namespace: namespace.to_string(),
            templates,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn template(&self, route: Route) -> &SubjectTemplate {
        // build() fails unless every route parsed
        &self.templates[&route]
    }

    /// Router over every protocol subject.
    pub fn router(&self) -> Router<Route> {
        self.router_for(&Route::ALL)
    }

    pub fn router_for(&self, routes: &[Route]) -> Router<Route> {
        let mut router = Router::new();
        for route in routes {
            router.add(self.template(*route).clone(), *route);
        }
        router
    }

    pub fn worker_subject(&self, route: Route, agent: &str, worker: &str) -> VesselResult<String> {
        let params = Params::from([
            ("agent".to_string(), agent.to_string()),
            ("worker".to_string(), worker.to_string()),
        ]);
        self.template(route).render(&params)
    }

    pub fn start(&self, agent: &str, worker: &str) -> VesselResult<String> {
        self.worker_subject(Route::WorkerStart, agent, worker)
    }

    pub fn stop(&self, agent: &str, worker: &str) -> VesselResult<String> {
        self.worker_subject(Route::WorkerStop, agent, worker)
    }

    pub fn stdin(&self, agent: &str, worker: &str) -> VesselResult<String> {
        self.worker_subject(Route::WorkerStdin, agent, worker)
    }

    pub fn stdout(&self, agent: &str, worker: &str) -> VesselResult<String> {
        self.worker_subject(Route::WorkerStdout, agent, worker)
    }

    pub fn status(&self, agent: &str, worker: &str) -> VesselResult<String> {
        self.worker_subject(Route::WorkerStatus, agent, worker)
    }

    pub fn reply(&self, agent: &str, message_id: &str) -> VesselResult<String> {
        let params = Params::from([
            ("agent".to_string(), agent.to_string()),
            ("message".to_string(), message_id.to_string()),
        ]);
        self.template(Route::Reply).render(&params)
    }

    pub fn connection_info(&self, agent: &str) -> VesselResult<String> {
        let params = Params::from([("agent".to_string(), agent.to_string())]);
        self.template(Route::ConnectionInfo).render(&params)
    }

    /// Filter for one route on one agent, any worker / message id.
    pub fn agent_filter(&self, route: Route, agent: &str) -> String {
        let params = Params::from([("agent".to_string(), agent.to_string())]);
        self.template(route).filter(&params)
    }

    pub fn agent_filters(&self, routes: &[Route], agent: &str) -> Vec<String> {
        routes.iter().map(|r| self.agent_filter(*r, agent)).collect()
    }

    pub fn stream_name(&self, agent: &str) -> String {
        format!("{AGENT_STREAM_PREFIX}{agent}")
    }

    /// Subjects captured by an agent's stream.
    pub fn stream_subjects(&self, agent: &str) -> Vec<String> {
        let ns = &self.namespace;
        vec![
            format!("{ns}.worker.*.{agent}.*"),
            format!("{ns}.reply.{agent}.*"),
            format!("{ns}.connection.info.{agent}"),
        ]
    }
}

pub fn agent_from_stream(stream: &str) -> Option<&str> {
    stream
        .strip_prefix(AGENT_STREAM_PREFIX)
        .filter(|agent| !agent.is_empty())
}

/// Identifiers are embedded as subject tokens and must not contain
/// separators, wildcards or whitespace.
pub fn validate_token(token: &str) -> VesselResult<()> {
    if token.is_empty()
        || token
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
    {
        return Err(VesselError::config_error(format!(
            "'{token}' is not a valid subject token"
        )));
    }
    Ok(())
}

/// Broker-style filter matching: `*` matches exactly one token, a trailing
/// `>` matches one or more tokens.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return filter_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn matches_any(filters: &[String], subject: &str) -> bool {
    filters.is_empty() || filters.iter().any(|f| subject_matches(f, subject))
}
