//! App Engine target routing: derives the host an AppEngine task dispatches
//! to, honoring `APP_ENGINE_EMULATOR_HOST` when set.

use std::env;

use crate::proto::AppEngineRouting;

pub const EMULATOR_HOST_ENV: &str = "APP_ENGINE_EMULATOR_HOST";

/// Resolves the dispatch host for an AppEngine task in `project`.
///
/// Without the emulator env var this produces production-style
/// `*.appspot.com` hostnames, joining non-empty routing components with
/// `-dot-`. With the env var set to `<scheme>://<host>`, routing components
/// become subdomains of that host instead.
pub fn resolve_host(project: &str, routing: Option<&AppEngineRouting>) -> String {
    let components = routing
        .map(|r| {
            [&r.instance, &r.version, &r.service]
                .into_iter()
                .filter(|part| !part.is_empty())
                .cloned()
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    match env::var(EMULATOR_HOST_ENV) {
        Err(_) => {
            let mut parts = components;
            parts.push(project.to_string());
            format!("https://{}.appspot.com", parts.join("-dot-"))
        }
        Ok(emulator) => {
            if components.is_empty() {
                return emulator;
            }
            let (scheme, host) = emulator
                .split_once("://")
                .unwrap_or(("https", emulator.as_str()));
            let mut parts = components;
            parts.push(host.to_string());
            format!("{}://{}", scheme, parts.join("."))
        }
    }
}
