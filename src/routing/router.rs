//! Backend resolution for incoming calls.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Resolve `(backendAddress, methodName)` for a call
//! - Return an explicit no-match when nothing applies
//!
//! # Design Decisions
//! - Immutable after construction; reloads build a new Router
//! - Resolution order: override, first matching route, fallback
//! - O(n) route scan (acceptable for typical route counts)

use serde::Serialize;

use crate::config::schema::{GrpcConfig, RouteConfig};
use crate::routing::matcher::{AndMatcher, CallInfo, HostMatcher, Matcher, MethodPrefixMatcher};

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub backend: String,
    pub priority: u32,
    matcher: AndMatcher,
}

/// Where a call goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendTarget {
    /// `host:port` of the backend.
    pub address: String,
    /// Method path relayed to the backend.
    pub method: String,
    /// Route that selected the backend, if any.
    pub route: Option<String>,
    /// How the backend was chosen.
    pub source: TargetSource,
}

impl BackendTarget {
    /// Bounded label for per-call metrics: the route name, or the source
    /// when no route matched. Never the client-supplied method path.
    pub fn metric_label(&self) -> &str {
        match &self.route {
            Some(name) => name,
            None => self.source.as_str(),
        }
    }
}

/// Which step of resolution picked the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSource {
    Override,
    Route,
    Fallback,
}

impl TargetSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetSource::Override => "override",
            TargetSource::Route => "route",
            TargetSource::Fallback => "fallback",
        }
    }
}

/// Summary of one route for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub name: String,
    pub backend: String,
    pub priority: u32,
}

#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
    override_address: Option<String>,
    fallback_address: Option<String>,
}

impl Router {
    /// Compile routes, highest priority first. Equal priorities keep file order.
    pub fn from_config(routes: &[RouteConfig], grpc: &GrpcConfig) -> Self {
        let mut compiled: Vec<Route> = routes
            .iter()
            .map(|route| {
                let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
                if let Some(host) = &route.host {
                    matchers.push(Box::new(HostMatcher::new(host.as_str())));
                }
                if let Some(prefix) = &route.method_prefix {
                    matchers.push(Box::new(MethodPrefixMatcher::new(prefix.as_str())));
                }
                Route {
                    name: route.name.clone(),
                    backend: route.backend.clone(),
                    priority: route.priority,
                    matcher: AndMatcher::new(matchers),
                }
            })
            .collect();
        compiled.sort_by(|a, b| b.priority.cmp(&a.priority));

        Self {
            routes: compiled,
            override_address: grpc.backend_address_override.clone(),
            fallback_address: grpc.backend_address_fallback.clone(),
        }
    }

    /// Resolve the backend for a call.
    pub fn resolve(&self, call: &CallInfo<'_>) -> Option<BackendTarget> {
        let target = |address: &str, route: Option<&str>, source| BackendTarget {
            address: address.to_string(),
            method: call.method.to_string(),
            route: route.map(str::to_string),
            source,
        };

        if let Some(address) = &self.override_address {
            return Some(target(address, None, TargetSource::Override));
        }
        if let Some(route) = self.routes.iter().find(|r| r.matcher.matches(call)) {
            return Some(target(&route.backend, Some(&route.name), TargetSource::Route));
        }
        self.fallback_address
            .as_deref()
            .map(|address| target(address, None, TargetSource::Fallback))
    }

    pub fn routes(&self) -> Vec<RouteSummary> {
        self.routes
            .iter()
            .map(|r| RouteSummary {
                name: r.name.clone(),
                backend: r.backend.clone(),
                priority: r.priority,
            })
            .collect()
    }
}
