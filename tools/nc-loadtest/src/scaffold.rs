use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::archive::SUITE_FILE;

pub const SAMPLE_SUITE: &str = r#"# clients start rampup seconds apart, each replays every block `iterations` times
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
    port: 830
    username: admin
    password: admin
    reuseconnection: false
blocks:
  - type: init
    actions:
      - netconf:
          hostname: 10.0.0.1
          operation: get-config
          datastore: running
          expected: "^<data"
      - sleep:
          duration: 1
  - type: sequential
    actions:
      - netconf:
          hostname: 10.0.0.1
          operation: get
          filter: <system-state xmlns="urn:ietf:params:xml:ns:yang:ietf-system"/>
      - netconf:
          hostname: 10.0.0.2
          operation: edit-config
          config: <system xmlns="urn:ietf:params:xml:ns:yang:ietf-system"><location>lab</location></system>
"#;

/// Create `dir` with a sample suite, refusing to touch an existing one
pub fn init(dir: &Path) -> Result<PathBuf> {
    let suite = dir.join(SUITE_FILE);
    if suite.exists() {
        bail!("`{}` already exists", suite.display());
    }
    fs::create_dir_all(dir).with_context(|| format!("failed to create `{}`", dir.display()))?;
    fs::write(&suite, SAMPLE_SUITE)
        .with_context(|| format!("failed to write `{}`", suite.display()))?;
    info!(path = %suite.display(), "sample suite created");
    Ok(suite)
}
