//! YAML configuration.
//!
//! Field names match the wire config other mounts use. Zero values are
//! replaced with defaults after parse, so a partial file behaves the same as
//! one spelling the defaults out.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("could not parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("auth mode {0:?} not supported")]
    AuthMode(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub aerospike: Aerospike,
    pub fs: FsSettings,
    #[serde(rename = "mountDir")]
    pub mount_dir: String,
    pub log: LogSettings,
    #[serde(rename = "mountParams")]
    pub mount_params: MountParams,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Aerospike {
    pub host: String,
    pub port: u16,
    pub namespace: String,
    /// Multi-record transactions on/off. Operation code is identical either
    /// way; off means per-command atomicity only.
    pub mrt: bool,
    pub auth: Auth,
    pub tls: Tls,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Auth {
    pub username: String,
    pub password: String,
    pub mode: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Internal,
    External,
    Pki,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Tls {
    #[serde(rename = "caFile")]
    pub ca_file: String,
    #[serde(rename = "certFile")]
    pub cert_file: String,
    #[serde(rename = "keyFile")]
    pub key_file: String,
    #[serde(rename = "tlsName")]
    pub tls_name: String,
}

/// Store command timeouts, in seconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub total: u64,
    pub socket: u64,
    pub mrt: u64,
    pub connect: u64,
    pub login: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FsSettings {
    #[serde(rename = "rootMode")]
    pub root_mode: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: i32,
    pub kmesg: bool,
    pub stderr: bool,
    pub file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MountParams {
    pub rw: bool,
    pub ro: bool,
    pub debug: bool,
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_reader(file)
    }

    pub fn from_reader(reader: impl Read) -> Result<Self, ConfigError> {
        let mut settings: Settings = serde_yaml::from_reader(reader)?;
        settings.apply_defaults();
        settings.auth_mode()?;
        Ok(settings)
    }

    fn apply_defaults(&mut self) {
        let t = &mut self.aerospike.timeouts;
        if t.socket == 0 {
            t.socket = 30;
        }
        if t.total == 0 {
            t.total = 120;
        }
        if t.mrt == 0 {
            t.mrt = 120;
        }
        if t.connect == 0 {
            t.connect = 60;
        }
        if t.login == 0 {
            t.login = 60;
        }
        if self.aerospike.port == 0 {
            self.aerospike.port = 3000;
        }
        if self.fs.root_mode == 0 {
            self.fs.root_mode = 0o755;
        }
        if self.log.level == 0 {
            self.log.level = 3;
        } else if self.log.level == -1 {
            self.log.level = 0;
        }
        if !self.log.kmesg && !self.log.stderr && self.log.file.is_empty() {
            self.log.kmesg = true;
        }
    }

    /// Authentication mode for the store client seam; only meaningful when a
    /// username is configured.
    pub fn auth_mode(&self) -> Result<AuthMode, ConfigError> {
        match self.aerospike.auth.mode.to_uppercase().as_str() {
            "INTERNAL" | "" => Ok(AuthMode::Internal),
            "EXTERNAL" => Ok(AuthMode::External),
            "PKI" => Ok(AuthMode::Pki),
            other => Err(ConfigError::AuthMode(other.to_owned())),
        }
    }

    /// Apply `-o` mount options on top of the config file.
    pub fn set_read_write(&mut self) {
        self.mount_params.rw = true;
        self.mount_params.ro = false;
    }

    pub fn set_read_only(&mut self) {
        self.mount_params.ro = true;
        self.mount_params.rw = false;
    }

    pub fn set_debug(&mut self) {
        self.mount_params.debug = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let s = Settings::from_reader("{}".as_bytes()).unwrap();
        assert_eq!(s.aerospike.timeouts.total, 120);
        assert_eq!(s.aerospike.timeouts.socket, 30);
        assert_eq!(s.aerospike.timeouts.mrt, 120);
        assert_eq!(s.aerospike.timeouts.connect, 60);
        assert_eq!(s.aerospike.timeouts.login, 60);
        assert_eq!(s.aerospike.port, 3000);
        assert_eq!(s.fs.root_mode, 0o755);
        assert_eq!(s.log.level, 3);
        assert!(s.log.kmesg, "kmesg on when no sink chosen");
        assert!(!s.aerospike.mrt);
    }

    #[test]
    fn full_config_parses() {
        let yaml = r#"
aerospike:
  host: asd1.example.com
  port: 3100
  namespace: fsdata
  mrt: true
  auth:
    username: fsuser
    password: hunter2
    mode: EXTERNAL
  tls:
    caFile: /etc/ssl/ca.pem
    tlsName: asd-cluster
  timeouts:
    socket: 10
    total: 60
fs:
  rootMode: 0o750
mountDir: /mnt/asd
log:
  level: 4
  stderr: true
mountParams:
  rw: true
"#;
        let s = Settings::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(s.aerospike.host, "asd1.example.com");
        assert_eq!(s.aerospike.port, 3100);
        assert_eq!(s.aerospike.namespace, "fsdata");
        assert!(s.aerospike.mrt);
        assert_eq!(s.auth_mode().unwrap(), AuthMode::External);
        assert_eq!(s.aerospike.tls.tls_name, "asd-cluster");
        assert_eq!(s.aerospike.timeouts.socket, 10);
        assert_eq!(s.aerospike.timeouts.total, 60);
        // untouched timeouts still get defaults
        assert_eq!(s.aerospike.timeouts.mrt, 120);
        assert_eq!(s.fs.root_mode, 0o750);
        assert_eq!(s.mount_dir, "/mnt/asd");
        assert_eq!(s.log.level, 4);
        assert!(s.log.stderr);
        assert!(!s.log.kmesg, "explicit sink disables the kmesg default");
        assert!(s.mount_params.rw);
    }

    #[test]
    fn level_minus_one_means_silent() {
        let s = Settings::from_reader("log: {level: -1}".as_bytes()).unwrap();
        assert_eq!(s.log.level, 0);
    }

    #[test]
    fn unknown_auth_mode_is_an_error() {
        let err = Settings::from_reader("aerospike: {auth: {mode: KERBEROS}}".as_bytes());
        assert!(matches!(err, Err(ConfigError::AuthMode(_))));
    }

    #[test]
    fn mount_options_override_config() {
        let mut s = Settings::from_reader("mountParams: {ro: true}".as_bytes()).unwrap();
        assert!(s.mount_params.ro);
        s.set_read_write();
        assert!(s.mount_params.rw);
        assert!(!s.mount_params.ro);
        s.set_read_only();
        assert!(s.mount_params.ro);
        assert!(!s.mount_params.rw);
    }
}
