use std::{
    collections::BTreeMap,
    fs,
    io::{self, Error, ErrorKind},
    path::Path,
};

use log::info;
use serde::Serialize;

/// Represents the flat "KEY=VALUE" workflow configuration.
/// Lines starting with '#' and blank lines are skipped; the first '='
/// splits key from value; keys and values are trimmed. A duplicate key
/// keeps its last occurrence.
#[derive(Debug, Clone, Serialize, Eq, PartialEq, Default)]
#[serde(transparent)]
pub struct Config {
    values: BTreeMap<String, String>,
}

impl Config {
    pub fn load(file_path: &str) -> io::Result<Self> {
        info!("loading config from {}", file_path);

        if !Path::new(file_path).exists() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("config file {} does not exist", file_path),
            ));
        }

        let contents = fs::read_to_string(file_path)?;
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                values.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Fails fast with the missing key name, so a broken configuration
    /// aborts the workflow before any provider call is made with it.
    pub fn required(&self, key: &str) -> io::Result<String> {
        self.values.get(key).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("required config key '{}' not found", key),
            )
        })
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Reads an integer-valued key, falling back to "default" when absent.
    pub fn u64_or(&self, key: &str, default: u64) -> io::Result<u64> {
        match self.values.get(key) {
            None => Ok(default),
            Some(v) => v.parse::<u64>().map_err(|e| {
                Error::new(
                    ErrorKind::InvalidInput,
                    format!("config key '{}' is not an integer ({})", key, e),
                )
            }),
        }
    }

    /// Converts to string for the startup echo.
    pub fn encode_json(&self) -> io::Result<String> {
        serde_json::to_string_pretty(&self)
            .map_err(|e| Error::new(ErrorKind::Other, format!("failed to serialize Config {}", e)))
    }
}

#[test]
fn test_parse() {
    let _ = env_logger::builder().is_test(true).try_init();

    let contents = r#"
# region settings
REGION = us-east-1

INSTANCE_TYPE=t2.micro
KEY_NAME=demo-key
UBUNTU_FILTER=ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*
BROKEN LINE WITHOUT DELIMITER
EMPTY_OK=
DUP=first
DUP=second
"#;
    let cfg = Config::parse(contents);

    assert_eq!(cfg.get("REGION"), Some("us-east-1"));
    assert_eq!(cfg.get("INSTANCE_TYPE"), Some("t2.micro"));
    assert_eq!(cfg.get("KEY_NAME"), Some("demo-key"));
    assert_eq!(
        cfg.get("UBUNTU_FILTER"),
        Some("ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*")
    );
    assert_eq!(cfg.get("EMPTY_OK"), Some(""));

    // last occurrence wins
    assert_eq!(cfg.get("DUP"), Some("second"));

    // comment lines and lines without '=' contribute nothing
    assert_eq!(cfg.get("# region settings"), None);
    assert_eq!(cfg.get("BROKEN LINE WITHOUT DELIMITER"), None);
}

#[test]
fn test_required_and_defaults() {
    let cfg = Config::parse("KEY_NAME=demo-key\nAUTO_TEARDOWN_HOURS=5\n");

    assert_eq!(cfg.required("KEY_NAME").unwrap(), "demo-key");
    let err = cfg.required("REGION").unwrap_err();
    assert!(err.to_string().contains("REGION"));

    assert_eq!(cfg.get_or("KEY_TYPE", "ed25519"), "ed25519");
    assert_eq!(cfg.u64_or("AUTO_TEARDOWN_HOURS", 2).unwrap(), 5);
    assert_eq!(cfg.u64_or("SSH_WAIT_TIMEOUT_SECS", 300).unwrap(), 300);
    assert!(Config::parse("AUTO_TEARDOWN_HOURS=abc\n")
        .u64_or("AUTO_TEARDOWN_HOURS", 2)
        .is_err());
}

#[test]
fn test_load_missing_file() {
    let ret = Config::load("/tmp/webup-test-no-such-config.txt");
    assert!(ret.is_err());
    assert_eq!(ret.unwrap_err().kind(), std::io::ErrorKind::NotFound);
}

#[test]
fn test_load_round_trip() {
    use std::io::Write;

    let mut f = tempfile::NamedTempFile::new().unwrap();
    write!(f, "REGION=ap-south-1\n#comment\nKEY_FILE=demo-key.pem\n").unwrap();

    let cfg = Config::load(f.path().to_str().unwrap()).unwrap();
    assert_eq!(cfg.get("REGION"), Some("ap-south-1"));
    assert_eq!(cfg.get("KEY_FILE"), Some("demo-key.pem"));

    let s = cfg.encode_json().unwrap();
    assert!(s.contains("ap-south-1"));
}
