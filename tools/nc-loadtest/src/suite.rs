use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use netconf_session::{DEFAULT_PORT, Endpoint, Rpc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// datastore targeted by get-config/edit-config when the action names none
pub const DEFAULT_DATASTORE: &str = "running";

/// longest a suite may wait before its last client starts
pub const MAX_RAMPUP_SPAN: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A load test: who connects where, how often, and what each client replays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteDefinition {
    #[serde(rename = "iterations")]
    pub iteration_count: usize,
    #[serde(rename = "clients")]
    pub client_count: usize,
    #[serde(rename = "rampup", default)]
    pub rampup_seconds: u64,
    #[serde(rename = "configs", default)]
    pub host_configs: Vec<HostConfig>,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl SuiteDefinition {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read suite at {}", path.display()))?;
        Self::parse_str(raw).with_context(|| format!("invalid suite {}", path.display()))
    }

    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let suite: Self = serde_yaml::from_str(s.as_ref()).context("failed to parse suite yaml")?;
        suite.validate()?;
        debug!(?suite);
        Ok(suite)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialize suite")
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_count == 0 {
            bail!("clients must be greater than 0");
        }
        if self.iteration_count == 0 {
            bail!("iterations must be greater than 0");
        }
        match self.start_offset(self.client_count - 1) {
            Some(span) if span <= MAX_RAMPUP_SPAN => {}
            _ => bail!(
                "rampup of {}s over {} clients exceeds {:?}",
                self.rampup_seconds,
                self.client_count,
                MAX_RAMPUP_SPAN
            ),
        }
        for (idx, host) in self.host_configs.iter().enumerate() {
            if self.host_configs[..idx]
                .iter()
                .any(|other| other.hostname == host.hostname)
            {
                bail!("host `{}` is configured more than once", host.hostname);
            }
        }
        for call in self.protocol_calls() {
            if self.host(&call.hostname).is_none() {
                bail!("action targets `{}` but no config exists for it", call.hostname);
            }
        }
        Ok(())
    }

    pub fn host(&self, hostname: &str) -> Option<&HostConfig> {
        self.host_configs.iter().find(|h| h.hostname == hostname)
    }

    /// reuse policy for `hostname`, `false` for unknown hosts
    pub fn is_reuse_connection(&self, hostname: &str) -> bool {
        reuse_connection(&self.host_configs, hostname)
    }

    pub fn hostnames(&self) -> Vec<&str> {
        self.host_configs.iter().map(|h| h.hostname.as_str()).collect()
    }

    pub fn rampup(&self) -> Duration {
        Duration::from_secs(self.rampup_seconds)
    }

    /// delay before `client_id` starts, `None` if it does not fit a [`Duration`]
    pub fn start_offset(&self, client_id: usize) -> Option<Duration> {
        let clients = u64::try_from(client_id).ok()?;
        self.rampup_seconds
            .checked_mul(clients)
            .map(Duration::from_secs)
    }

    fn protocol_calls(&self) -> impl Iterator<Item = &ProtocolCall> {
        self.blocks
            .iter()
            .flat_map(|block| &block.actions)
            .filter_map(|action| match action {
                Action::Netconf(call) => Some(call),
                Action::Sleep(_) => None,
            })
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "reuseconnection", default)]
    pub reuse_connection: bool,
}

/// reuse policy for `hostname` among `hosts`, `false` for unknown hosts
pub fn reuse_connection(hosts: &[HostConfig], hostname: &str) -> bool {
    hosts
        .iter()
        .any(|h| h.hostname == hostname && h.reuse_connection)
}

pub const fn default_port() -> u16 {
    DEFAULT_PORT
}

impl HostConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.hostname, self.port).with_credentials(&self.username, &self.password)
    }
}

impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("reuse_connection", &self.reuse_connection)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// free-form label, e.g. `init` or `sequential`
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// one scripted step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Netconf(ProtocolCall),
    Sleep(Pause),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolCall {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    /// sent verbatim as the rpc body
    #[serde(rename = "message", default, skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,
    /// filter for get/get-config, config for edit-config
    #[serde(default, alias = "filter", alias = "config", skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,
    /// regex the reply body must match
    #[serde(rename = "expected", default, skip_serializing_if = "Option::is_none")]
    pub expected_pattern: Option<String>,
}

impl ProtocolCall {
    /// name recorded against results: the operation, else the raw message
    pub fn name(&self) -> String {
        match (&self.operation, &self.raw_message) {
            (Some(op), _) => op.to_string(),
            (None, Some(msg)) => msg.clone(),
            (None, None) => String::new(),
        }
    }

    pub fn to_rpc(&self) -> Result<Rpc, BuildError> {
        if let Some(op) = &self.operation {
            return op.to_rpc(self.payload.as_deref(), self.datastore.as_deref());
        }
        match &self.raw_message {
            Some(msg) if !msg.trim().is_empty() => Ok(Rpc::new(msg.trim())),
            _ => Err(BuildError::NothingToSend),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("no operation or message specified")]
    NothingToSend,
    #[error("{0} is not a supported operation")]
    Unsupported(String),
}

/// Named NETCONF operations. Names the tool cannot build are kept so that the suite
/// still loads and the call fails on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Get,
    GetConfig,
    EditConfig,
    Unsupported(String),
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "get",
            Self::GetConfig => "get-config",
            Self::EditConfig => "edit-config",
            Self::Unsupported(name) => name,
        }
    }

    fn to_rpc(&self, payload: Option<&str>, datastore: Option<&str>) -> Result<Rpc, BuildError> {
        let datastore = datastore.unwrap_or(DEFAULT_DATASTORE);
        let filter = payload
            .map(|f| format!(r#"<filter type="subtree">{f}</filter>"#))
            .unwrap_or_default();
        let body = match self {
            Self::Get => format!("<get>{filter}</get>"),
            Self::GetConfig => {
                format!("<get-config><source><{datastore}/></source>{filter}</get-config>")
            }
            Self::EditConfig => format!(
                "<edit-config><target><{datastore}/></target><config>{}</config></edit-config>",
                payload.unwrap_or_default()
            ),
            Self::Unsupported(name) => return Err(BuildError::Unsupported(name.clone())),
        };
        Ok(Rpc::new(body))
    }
}

impl From<String> for Operation {
    fn from(name: String) -> Self {
        match name.as_str() {
            "get" => Self::Get,
            "get-config" => Self::GetConfig,
            "edit-config" => Self::EditConfig,
            _ => Self::Unsupported(name),
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.as_str().to_owned()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pause {
    /// seconds
    pub duration: u64,
}

impl Pause {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SUITE: &str = r#"
iterations: 5
clients: 2
rampup: 0
configs:
  - hostname: 10.0.0.1
    port: 830
    username: admin
    password: admin
    reuseconnection: true
  - hostname: 10.0.0.2
    username: admin
    password: admin
blocks:
  - type: init
    actions:
      - netconf:
          hostname: 10.0.0.1
          operation: get-config
          filter: <interfaces xmlns="urn:ietf:params:xml:ns:yang:ietf-interfaces"/>
          expected: "interfaces"
      - sleep:
          duration: 1
  - type: sequential
    actions:
      - netconf:
          hostname: 10.0.0.2
          message: <get-schema/>
"#;

    #[test]
    fn parse_suite() {
        let suite = SuiteDefinition::parse_str(SUITE).expect("suite should parse");
        assert_eq!(suite.iteration_count, 5);
        assert_eq!(suite.client_count, 2);
        assert_eq!(suite.hostnames(), ["10.0.0.1", "10.0.0.2"]);
        assert!(suite.is_reuse_connection("10.0.0.1"));
        assert!(!suite.is_reuse_connection("10.0.0.2"));
        assert!(!suite.is_reuse_connection("10.0.0.3"));
        // port falls back to the netconf default
        assert_eq!(suite.host("10.0.0.2").map(|h| h.port), Some(830));

        let Some(Action::Netconf(call)) = suite.blocks[0].actions.first() else {
            panic!("expected a netconf action");
        };
        assert_eq!(call.operation, Some(Operation::GetConfig));
        assert_eq!(call.expected_pattern.as_deref(), Some("interfaces"));
        assert_eq!(suite.blocks[0].actions[1], Action::Sleep(Pause { duration: 1 }));
        assert_eq!(suite.blocks[1].kind.as_deref(), Some("sequential"));
    }

    #[test]
    fn yaml_round_trip_keeps_suite() {
        let suite = SuiteDefinition::parse_str(SUITE).expect("suite should parse");
        let again = SuiteDefinition::parse_str(suite.to_yaml().expect("yaml")).expect("reparse");
        assert_eq!(suite, again);
    }

    #[test]
    fn reject_invalid_suites() {
        let err = SuiteDefinition::parse_str("iterations: 1\nclients: 0\n").unwrap_err();
        assert!(err.to_string().contains("clients"));

        let err = SuiteDefinition::parse_str("iterations: 0\nclients: 1\n").unwrap_err();
        assert!(err.to_string().contains("iterations"));

        let err = SuiteDefinition::parse_str(
            "iterations: 1\nclients: 1\nblocks:\n  - actions:\n      - netconf: {hostname: r9, operation: get}\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("r9"));
    }

    #[test]
    fn rampup_span_must_fit() {
        let err = SuiteDefinition::parse_str("iterations: 1\nclients: 2\nrampup: 18446744073709551615\n")
            .unwrap_err();
        assert!(err.to_string().contains("rampup"), "{err}");

        // multiplies without overflowing but would start the last client years from now
        let err = SuiteDefinition::parse_str("iterations: 1\nclients: 1001\nrampup: 86400\n").unwrap_err();
        assert!(err.to_string().contains("rampup"), "{err}");

        // a single client never waits, whatever the rampup
        let suite = SuiteDefinition::parse_str("iterations: 1\nclients: 1\nrampup: 18446744073709551615\n")
            .expect("single client");
        assert_eq!(suite.start_offset(0), Some(Duration::ZERO));
        assert_eq!(suite.start_offset(2), None);

        let suite = SuiteDefinition::parse_str("iterations: 1\nclients: 3\nrampup: 2\n").expect("suite");
        assert_eq!(suite.start_offset(2), Some(Duration::from_secs(4)));
    }

    #[test]
    fn reuse_lookup_by_hostname() {
        let suite = SuiteDefinition::parse_str(SUITE).expect("suite should parse");
        assert!(reuse_connection(&suite.host_configs, "10.0.0.1"));
        assert!(!reuse_connection(&suite.host_configs, "10.0.0.2"));
        assert!(!reuse_connection(&[], "10.0.0.1"));
    }

    #[test]
    fn build_operation_bodies() {
        let call = |operation: &str, payload: Option<&str>| ProtocolCall {
            hostname: "r1".to_owned(),
            operation: Some(Operation::from(operation.to_owned())),
            raw_message: None,
            payload: payload.map(str::to_owned),
            datastore: None,
            expected_pattern: None,
        };

        assert_eq!(call("get", None).to_rpc().unwrap().body(), "<get></get>");
        assert_eq!(
            call("get-config", Some("<system/>")).to_rpc().unwrap().body(),
            r#"<get-config><source><running/></source><filter type="subtree"><system/></filter></get-config>"#
        );
        let mut edit = call("edit-config", Some("<system/>"));
        edit.datastore = Some("candidate".to_owned());
        assert_eq!(
            edit.to_rpc().unwrap().body(),
            "<edit-config><target><candidate/></target><config><system/></config></edit-config>"
        );

        let err = call("kill-session", None).to_rpc().unwrap_err();
        assert_eq!(err.to_string(), "kill-session is not a supported operation");
    }

    #[test]
    fn raw_message_or_nothing() {
        let mut call = ProtocolCall {
            hostname: "r1".to_owned(),
            operation: None,
            raw_message: Some(" <get-schema/> ".to_owned()),
            payload: None,
            datastore: None,
            expected_pattern: None,
        };
        assert_eq!(call.name(), " <get-schema/> ");
        assert_eq!(call.to_rpc().unwrap().body(), "<get-schema/>");

        call.raw_message = None;
        assert_eq!(call.to_rpc().unwrap_err(), BuildError::NothingToSend);
        assert_eq!(
            BuildError::NothingToSend.to_string(),
            "no operation or message specified"
        );
    }
}
