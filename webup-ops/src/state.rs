use std::{
    fs::{self, File, OpenOptions},
    io::{self, Error, ErrorKind, Write},
    path::{Path, PathBuf},
};

use log::info;
use serde::{Deserialize, Serialize};

pub const VPC_ID_FILE: &str = "vpc_id.txt";
pub const INSTANCE_ID_FILE: &str = "instance_id.txt";
pub const INSTANCE_IP_FILE: &str = "instance_ip.txt";

/// One launched instance, as recorded across the create and scale workflows.
/// The on-disk format stays two newline-delimited files ("instance_id.txt"
/// and "instance_ip.txt") whose Nth lines pair up; reads reconstruct the
/// pairing and fail on a line-count mismatch instead of drifting.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct InstanceRecord {
    pub instance_id: String,
    pub public_ip: String,
}

/// Local flat-file store shared by the independently-invoked workflows.
/// No locking: running two workflows concurrently against the same
/// directory is the operator's responsibility.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: &str) -> Self {
        Self {
            dir: PathBuf::from(dir),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn write_vpc_id(&self, vpc_id: &str) -> io::Result<()> {
        info!("writing VPC id '{}' to {}", vpc_id, VPC_ID_FILE);
        fs::write(self.path(VPC_ID_FILE), vpc_id)
    }

    pub fn read_vpc_id(&self) -> io::Result<Option<String>> {
        let p = self.path(VPC_ID_FILE);
        if !p.exists() {
            return Ok(None);
        }
        let s = fs::read_to_string(p)?;
        let s = s.trim().to_string();
        if s.is_empty() {
            return Ok(None);
        }
        Ok(Some(s))
    }

    /// Overwrites both instance files with a single record (create workflow).
    pub fn reset_instances(&self, rec: &InstanceRecord) -> io::Result<()> {
        info!(
            "recording instance {} ({}) to fresh state files",
            rec.instance_id, rec.public_ip
        );
        fs::write(
            self.path(INSTANCE_ID_FILE),
            format!("{}\n", rec.instance_id),
        )?;
        fs::write(self.path(INSTANCE_IP_FILE), format!("{}\n", rec.public_ip))
    }

    /// Appends one record to both instance files (scale workflow).
    pub fn append_instance(&self, rec: &InstanceRecord) -> io::Result<()> {
        info!(
            "appending instance {} ({}) to state files",
            rec.instance_id, rec.public_ip
        );
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(INSTANCE_ID_FILE))?;
        f.write_all(format!("{}\n", rec.instance_id).as_bytes())?;

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(INSTANCE_IP_FILE))?;
        f.write_all(format!("{}\n", rec.public_ip).as_bytes())
    }

    /// Reads back all recorded instances, re-pairing the Nth id line with
    /// the Nth ip line.
    pub fn read_instances(&self) -> io::Result<Vec<InstanceRecord>> {
        let ids = read_lines(&self.path(INSTANCE_ID_FILE))?;
        let ips = read_lines(&self.path(INSTANCE_IP_FILE))?;
        if ids.len() != ips.len() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "instance id/ip files out of sync ({} ids, {} ips)",
                    ids.len(),
                    ips.len()
                ),
            ));
        }
        Ok(ids
            .into_iter()
            .zip(ips)
            .map(|(instance_id, public_ip)| InstanceRecord {
                instance_id,
                public_ip,
            })
            .collect())
    }

    /// The first recorded public address (deploy workflow target).
    pub fn read_primary_ip(&self) -> io::Result<String> {
        let recs = self.read_instances()?;
        match recs.into_iter().next() {
            Some(rec) => Ok(rec.public_ip),
            None => Err(Error::new(
                ErrorKind::NotFound,
                "no instance recorded; run 'create' first",
            )),
        }
    }

    /// Local file persisting the CloudWatch Logs sequence token between
    /// appends, one file per group/stream pair.
    pub fn token_path(&self, log_group: &str, log_stream: &str) -> PathBuf {
        self.path(&format!(".{}_{}.seq", log_group, log_stream))
    }

    pub fn read_token(&self, path: &Path) -> Option<String> {
        let s = fs::read_to_string(path).ok()?;
        let s = s.trim().to_string();
        if s.is_empty() {
            return None;
        }
        Some(s)
    }

    pub fn write_token(&self, path: &Path, token: Option<&str>) -> io::Result<()> {
        let mut f = File::create(path)?;
        f.write_all(token.unwrap_or_default().as_bytes())
    }

    /// Removes the three state files unconditionally (destroy workflow);
    /// absent files are not an error.
    pub fn remove_artifacts(&self) {
        for name in [INSTANCE_ID_FILE, INSTANCE_IP_FILE, VPC_ID_FILE] {
            let p = self.path(name);
            if p.exists() {
                if let Err(e) = fs::remove_file(&p) {
                    log::warn!("failed to remove {} ({})", name, e);
                } else {
                    info!("removed {}", name);
                }
            }
        }
    }
}

fn read_lines(p: &Path) -> io::Result<Vec<String>> {
    if !p.exists() {
        return Ok(Vec::new());
    }
    Ok(fs::read_to_string(p)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

#[test]
fn test_vpc_id_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());

    assert_eq!(store.read_vpc_id().unwrap(), None);
    store.write_vpc_id("vpc-0123456789abcdef0").unwrap();
    assert_eq!(
        store.read_vpc_id().unwrap(),
        Some(String::from("vpc-0123456789abcdef0"))
    );
}

#[test]
fn test_instance_pairing_across_create_and_scale() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());

    let first = InstanceRecord {
        instance_id: String::from("i-aaaaaaaaaaaaaaaaa"),
        public_ip: String::from("3.3.3.1"),
    };
    let second = InstanceRecord {
        instance_id: String::from("i-bbbbbbbbbbbbbbbbb"),
        public_ip: String::from("3.3.3.2"),
    };

    // create overwrites, scale appends
    store.reset_instances(&first).unwrap();
    store.append_instance(&second).unwrap();

    let recs = store.read_instances().unwrap();
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[0], first);
    assert_eq!(recs[1], second);
    assert_eq!(store.read_primary_ip().unwrap(), "3.3.3.1");

    // a second create resets the files to one line each
    store.reset_instances(&second).unwrap();
    let recs = store.read_instances().unwrap();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0], second);
}

#[test]
fn test_instance_files_out_of_sync() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());

    fs::write(dir.path().join(INSTANCE_ID_FILE), "i-aaa\ni-bbb\n").unwrap();
    fs::write(dir.path().join(INSTANCE_IP_FILE), "3.3.3.1\n").unwrap();

    let ret = store.read_instances();
    assert!(ret.is_err());
    assert_eq!(ret.unwrap_err().kind(), ErrorKind::InvalidData);
}

#[test]
fn test_token_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());
    let p = store.token_path("webup-logs", "workflows");
    assert!(p.to_str().unwrap().ends_with(".webup-logs_workflows.seq"));

    // absent and empty both mean "no token"
    assert_eq!(store.read_token(&p), None);
    store.write_token(&p, None).unwrap();
    assert_eq!(store.read_token(&p), None);

    store.write_token(&p, Some("49590302938407709")).unwrap();
    assert_eq!(
        store.read_token(&p),
        Some(String::from("49590302938407709"))
    );
}

#[test]
fn test_remove_artifacts_tolerates_missing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());

    store.write_vpc_id("vpc-1").unwrap();
    store.remove_artifacts();
    assert_eq!(store.read_vpc_id().unwrap(), None);

    // second run with nothing left is fine
    store.remove_artifacts();
}
