use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

static AGENT_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());
static SUBDOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap());
static TARGET_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[a-zA-Z0-9.-]+(:\d+)?(/.*)?$").unwrap());

pub fn validate_agent_id(id: &str) -> Result<(), ValidationError> {
    if AGENT_ID_REGEX.is_match(id) { Ok(()) } else { Err(ValidationError::new("invalid agent id")) }
}

pub fn validate_subdomain(subdomain: &str) -> Result<(), ValidationError> {
    if SUBDOMAIN_REGEX.is_match(subdomain) { Ok(()) } else { Err(ValidationError::new("invalid subdomain")) }
}

pub fn validate_ip(ip: &str) -> Result<(), ValidationError> {
    if ip.parse::<std::net::Ipv4Addr>().is_ok() { Ok(()) } else { Err(ValidationError::new("invalid IPv4 address")) }
}

pub fn validate_target_url(url: &str) -> Result<(), ValidationError> {
    if TARGET_URL_REGEX.is_match(url) { Ok(()) } else { Err(ValidationError::new("invalid target URL")) }
}

pub mod errors {
    use super::*;

    /// The payload returned by every failing API handler.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RequestHandlerError {
        /// A human readable description of the failure.
        pub message: String,

        /// A stable machine readable error kind.
        pub error_code: String,
    }

    impl RequestHandlerError {
        pub fn new<M: Into<String>, C: Into<String>>(message: M, error_code: C) -> Self {
            Self { message: message.into(), error_code: error_code.into() }
        }
    }
}

pub mod agents {
    use super::*;

    pub mod register {
        use super::*;

        /// A request to register an agent under the mongo domain.
        #[derive(Clone, Debug, Serialize, Deserialize, Validate)]
        #[serde(rename_all = "camelCase")]
        pub struct RegisterAgentRequest {
            /// The agent identifier, used unchanged as a subdomain label.
            #[validate(custom(function = "validate_agent_id"), length(min = 1, max = 63))]
            pub agent_id: String,

            /// Overrides the caller's remote address as the route target.
            #[validate(custom(function = "validate_ip"))]
            pub target_ip: Option<String>,
        }

        #[derive(Clone, Debug, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct RegisterAgentResponse {
            /// The stable connection string the agent's database is reachable at.
            pub mongodb_url: String,

            /// The TLS posture the connection probe detected for the backend.
            pub tls_posture: String,

            /// Whether a fresh certificate was issued during registration.
            pub certificate_issued: bool,
        }
    }
}

pub mod frontdoor {
    use super::*;

    pub mod add_subdomain {
        use super::*;

        /// A request to route `<subdomain>.<mongo domain>` to a MongoDB backend.
        #[derive(Clone, Debug, Serialize, Deserialize, Validate)]
        #[serde(rename_all = "camelCase")]
        pub struct AddSubdomainRequest {
            #[validate(custom(function = "validate_subdomain"), length(min = 1, max = 63))]
            pub subdomain: String,

            #[validate(custom(function = "validate_ip"))]
            pub target_ip: String,

            /// The owning agent; defaults to the subdomain when absent.
            #[validate(custom(function = "validate_agent_id"))]
            pub agent_id: Option<String>,
        }

        #[derive(Clone, Debug, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct AddSubdomainResponse {
            pub domain: String,
            pub mongodb_url: String,
            pub tls_passthrough: bool,
        }
    }

    pub mod add_app {
        use super::*;

        /// A request to route `<subdomain>.<app domain>` to an HTTP application.
        #[derive(Clone, Debug, Serialize, Deserialize, Validate)]
        #[serde(rename_all = "camelCase")]
        pub struct AddAppRequest {
            #[validate(custom(function = "validate_subdomain"), length(min = 1, max = 63))]
            pub subdomain: String,

            #[validate(custom(function = "validate_target_url"))]
            pub target_url: String,

            #[validate(custom(function = "validate_agent_id"))]
            pub agent_id: Option<String>,
        }

        #[derive(Clone, Debug, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct AddAppResponse {
            pub domain: String,
            pub target_url: String,
        }
    }
}

pub mod mongodb {
    use super::*;

    pub mod remove {
        use super::*;

        #[derive(Clone, Debug, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct RemoveAgentResponse {
            pub agent_id: String,
            pub certificate_revoked: bool,
        }
    }

    pub mod test {
        use super::*;

        /// The outcome of probing an agent's backend.
        #[derive(Clone, Debug, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct ConnectionTestResponse {
            pub agent_id: String,
            pub target: String,

            /// One of `plaintext`, `tls-required`, `ambiguous`, `unreachable`.
            pub classification: String,

            /// Whether the L4 router currently passes TLS through.
            pub tls_passthrough: bool,

            pub recommendations: Vec<String>,
        }
    }
}

pub mod status {
    use super::*;
    use chrono::{DateTime, Utc};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct StatusResponse {
        pub uptime_seconds: u64,
        pub app_domain: String,
        pub mongo_domain: String,

        /// Health of the sibling proxy as last observed.
        pub proxy_health: String,

        /// Whether automatic recovery is currently enabled.
        pub auto_recovery_enabled: bool,

        pub breakers: Vec<BreakerStatus>,
        pub recovery_history: Vec<RecoveryRecord>,
        pub registered_agents: u64,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct BreakerStatus {
        pub name: String,

        /// One of `closed`, `open`, `half-open`.
        pub state: String,

        pub consecutive_failures: u32,
        pub last_failure: Option<DateTime<Utc>>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RecoveryRecord {
        pub timestamp: DateTime<Utc>,
        pub attempt: u32,

        /// One of `container-start`, `service-restart`, `container-restart`.
        pub action: String,

        pub success: bool,
        pub message: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple("alpha", true)]
    #[case::dashed("alpha-01", true)]
    #[case::multi("a-b-c", true)]
    #[case::digits("0x7", false)]
    #[case::uppercase("Alpha", false)]
    #[case::leading_dash("-alpha", false)]
    #[case::trailing_dash("alpha-", false)]
    #[case::double_dash("alpha--01", false)]
    #[case::empty("", false)]
    fn subdomain_validation(#[case] subdomain: &str, #[case] valid: bool) {
        assert_eq!(validate_subdomain(subdomain).is_ok(), valid, "{subdomain}");
    }

    #[rstest]
    #[case::plain("agent1", true)]
    #[case::underscore("agent_1", true)]
    #[case::mixed_case("Agent-1", true)]
    #[case::dot("agent.1", false)]
    #[case::slash("agent/1", false)]
    #[case::space("agent 1", false)]
    fn agent_id_validation(#[case] id: &str, #[case] valid: bool) {
        assert_eq!(validate_agent_id(id).is_ok(), valid, "{id}");
    }

    #[rstest]
    #[case::valid("10.0.0.7", true)]
    #[case::loopback("127.0.0.1", true)]
    #[case::octet_overflow("10.0.0.256", false)]
    #[case::hostname("mongo.example.com", false)]
    #[case::short("10.0.0", false)]
    fn ip_validation(#[case] ip: &str, #[case] valid: bool) {
        assert_eq!(validate_ip(ip).is_ok(), valid, "{ip}");
    }

    #[rstest]
    #[case::http("http://10.0.0.7:8080", true)]
    #[case::https("https://app.internal/path", true)]
    #[case::no_scheme("app.internal", false)]
    #[case::ftp("ftp://app.internal", false)]
    fn target_url_validation(#[case] url: &str, #[case] valid: bool) {
        assert_eq!(validate_target_url(url).is_ok(), valid, "{url}");
    }

    #[test]
    fn register_request_validates_nested_fields() {
        let request = agents::register::RegisterAgentRequest {
            agent_id: "beta_2".into(),
            target_ip: Some("not-an-ip".into()),
        };
        assert!(request.validate().is_err());

        let request =
            agents::register::RegisterAgentRequest { agent_id: "beta_2".into(), target_ip: Some("10.0.0.8".into()) };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn request_serialization_is_camel_case() {
        let request = frontdoor::add_app::AddAppRequest {
            subdomain: "shop".into(),
            target_url: "http://10.0.0.9:3000".into(),
            agent_id: None,
        };
        let serialized = serde_json::to_value(&request).unwrap();
        assert!(serialized.get("targetUrl").is_some());
        assert!(serialized.get("agentId").is_some());
    }
}
