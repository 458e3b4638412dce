use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct RawState {
    #[serde(default)]
    pub group_selection: HashMap<String, String>,
}

/// State bound to the file it was read from.
#[derive(Debug)]
pub struct LinkedState {
    pub state_path: PathBuf,
    pub state: RawState,
}

impl LinkedState {
    pub fn flush(&self) -> std::io::Result<()> {
        let content = serde_yaml::to_string(&self.state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let content = "# This file is managed by Switchyard. Do not edit unless you know what you are doing.\n".to_string() + content.as_str();
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&self.state_path)?;
        file.write_all(content.as_bytes())?;
        file.flush()
    }
}

#[test]
fn test_state_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut linked = LinkedState {
        state_path: dir.path().join("nested").join("state.yml"),
        state: RawState::default(),
    };
    linked
        .state
        .group_selection
        .insert("Proxy".to_string(), "hk-01".to_string());
    linked.flush().unwrap();
    let text = std::fs::read_to_string(&linked.state_path).unwrap();
    let state: RawState = serde_yaml::from_str(&text).unwrap();
    assert_eq!(state.group_selection.get("Proxy").unwrap(), "hk-01");
}
