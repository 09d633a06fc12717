#[macro_use]
extern crate error_chain;

pub mod common;
pub mod config;
pub mod configmap;
pub mod controllers;
pub mod crd;
pub mod failover;
pub mod kruise;
pub mod kube_utils;
pub mod manager;
pub mod probe;
pub mod runtime;
pub mod tomlconfig;
pub mod version;
pub mod webhook;

pub mod errors {
    use std::time::Duration;

    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            HttpRequest(reqwest::Error);
            Kube(kube::Error);
            Json(serde_json::Error);
            TomlDe(toml::de::Error);
            TomlSer(toml::ser::Error);
            Semver(semver::Error);
            DurationParse(humantime::DurationError);
        }

        errors {
            // deferred work: requeue after the delay without counting a failure
            ReSync(reason: String, after: Duration) {
                description("re-sync requested")
                display("re-sync in {}s: {}", after.as_secs(), reason)
            }

            // the desired state cannot be reached until the spec is corrected
            Invariant(reason: String, message: String) {
                description("invariant violation")
                display("{}: {}", reason, message)
            }

            MissingNamespace(kind: String, name: String) {
                description("namespaced object without namespace")
                display("{} {} has no namespace", kind, name)
            }
        }
    }

    /// Shorthand for an explicit re-sync request.
    pub fn resync(reason: impl Into<String>, after: Duration) -> Error {
        ErrorKind::ReSync(reason.into(), after).into()
    }

    /// Shorthand for an invariant violation with a machine-readable reason.
    pub fn invariant(reason: impl Into<String>, message: impl Into<String>) -> Error {
        ErrorKind::Invariant(reason.into(), message.into()).into()
    }

    impl Error {
        /// Returns the requested delay if this error is a re-sync request.
        pub fn resync_after(&self) -> Option<Duration> {
            match self.kind() {
                ErrorKind::ReSync(_, after) => Some(*after),
                _ => None,
            }
        }

        /// Returns `(reason, message)` if this error is an invariant violation.
        pub fn as_invariant(&self) -> Option<(&str, &str)> {
            match self.kind() {
                ErrorKind::Invariant(reason, message) => Some((reason, message)),
                _ => None,
            }
        }

        /// Stale resource version or similar write race.
        pub fn is_conflict(&self) -> bool {
            matches!(self.kind(), ErrorKind::Kube(kube::Error::Api(e)) if e.code == 409)
        }

        pub fn is_not_found(&self) -> bool {
            matches!(self.kind(), ErrorKind::Kube(kube::Error::Api(e)) if e.code == 404)
        }
    }
}

/// Version of this operator, stamped on objects it creates.
pub const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Field manager used for every write the operator issues.
pub const FIELD_MANAGER: &str = "mo-operator";
