//! The `setting` table's keys (§6), typed and with their documented
//! defaults, mirroring the teacher's `PageServerConf`: a struct that can be
//! built from TOML for local testing and local development, and
//! synchronized against the catalog's `setting` table at runtime.

use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::catalog::{self, Catalog};
use crate::error::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub usessl: bool,
    /// `-1` unlimited, `0` auto-shape, `>0` bytes/sec cap.
    pub maxdownloadspeed: i64,
    pub maxuploadspeed: i64,
    pub ignorepatterns: String,
    pub ignorepaths: String,
    pub p2psync: bool,
    pub fsroot: String,
    pub fscachepath: String,
    pub fscachesize: u64,
    pub sleepstopcrypto: bool,
    pub minlocalfreespace: u64,
    pub api_server: String,
    pub location_id: u64,

    /// Not a `setting` row: where the catalog's sqlite file lives.
    #[serde(skip)]
    pub catalog_path: Utf8PathBuf,
    #[serde(skip)]
    pub max_parallel_uploads: usize,
    #[serde(skip)]
    pub upload_older_than: Duration,
    #[serde(skip)]
    pub min_size_for_checksums: u64,
    #[serde(skip)]
    pub start_new_uploads_threshold: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            usessl: true,
            maxdownloadspeed: 0,
            maxuploadspeed: 0,
            ignorepatterns: String::new(),
            ignorepaths: String::new(),
            p2psync: false,
            fsroot: String::new(),
            fscachepath: String::new(),
            fscachesize: 0,
            sleepstopcrypto: false,
            minlocalfreespace: 1024 * 1024 * 1024,
            api_server: "api.example.invalid".to_owned(),
            location_id: 1,
            catalog_path: Utf8PathBuf::from("syncengine.db"),
            max_parallel_uploads: 4,
            upload_older_than: Duration::from_secs(5),
            min_size_for_checksums: 4 * 1024 * 1024,
            start_new_uploads_threshold: 64 * 1024 * 1024,
        }
    }
}

impl SyncConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads every recognized key present in `setting`, leaving unset keys
    /// at their struct defaults.
    pub fn load_from_catalog(cat: &Catalog) -> Result<Self, SyncError> {
        let conn = cat.read_lock()?;
        let mut cfg = SyncConfig::default();
        macro_rules! load_bool {
            ($field:ident) => {
                if let Some(v) = catalog::get_setting(&conn, stringify!($field))? {
                    cfg.$field = v == "1" || v.eq_ignore_ascii_case("true");
                }
            };
        }
        macro_rules! load_int {
            ($field:ident) => {
                if let Some(v) = catalog::get_setting(&conn, stringify!($field))? {
                    if let Ok(n) = v.parse() {
                        cfg.$field = n;
                    }
                }
            };
        }
        macro_rules! load_str {
            ($field:ident) => {
                if let Some(v) = catalog::get_setting(&conn, stringify!($field))? {
                    cfg.$field = v;
                }
            };
        }
        load_bool!(usessl);
        load_int!(maxdownloadspeed);
        load_int!(maxuploadspeed);
        load_str!(ignorepatterns);
        load_str!(ignorepaths);
        load_bool!(p2psync);
        load_str!(fsroot);
        load_str!(fscachepath);
        load_int!(fscachesize);
        load_bool!(sleepstopcrypto);
        load_int!(minlocalfreespace);
        load_str!(api_server);
        load_int!(location_id);
        Ok(cfg)
    }

    pub fn persist_to_catalog(&self, cat: &Catalog) -> Result<(), SyncError> {
        let txn = cat.begin()?;
        let conn = txn.conn();
        catalog::set_setting(conn, "usessl", if self.usessl { "1" } else { "0" })?;
        catalog::set_setting(conn, "maxdownloadspeed", &self.maxdownloadspeed.to_string())?;
        catalog::set_setting(conn, "maxuploadspeed", &self.maxuploadspeed.to_string())?;
        catalog::set_setting(conn, "ignorepatterns", &self.ignorepatterns)?;
        catalog::set_setting(conn, "ignorepaths", &self.ignorepaths)?;
        catalog::set_setting(conn, "p2psync", if self.p2psync { "1" } else { "0" })?;
        catalog::set_setting(conn, "fscachesize", &self.fscachesize.to_string())?;
        catalog::set_setting(
            conn,
            "sleepstopcrypto",
            if self.sleepstopcrypto { "1" } else { "0" },
        )?;
        catalog::set_setting(conn, "minlocalfreespace", &self.minlocalfreespace.to_string())?;
        catalog::set_setting(conn, "api_server", &self.api_server)?;
        catalog::set_setting(conn, "location_id", &self.location_id.to_string())?;
        txn.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip_overrides_defaults() {
        let cfg = SyncConfig::from_toml("usessl = false\nmaxuploadspeed = 500000\n").unwrap();
        assert!(!cfg.usessl);
        assert_eq!(cfg.maxuploadspeed, 500_000);
        assert_eq!(cfg.location_id, 1, "unset keys keep their default");
    }

    #[test]
    fn persist_then_load_round_trips_through_the_catalog() {
        let cat = Catalog::open_in_memory().unwrap();
        let mut cfg = SyncConfig::default();
        cfg.usessl = false;
        cfg.maxuploadspeed = -1;
        cfg.api_server = "eu.example.invalid".into();
        cfg.persist_to_catalog(&cat).unwrap();

        let loaded = SyncConfig::load_from_catalog(&cat).unwrap();
        assert!(!loaded.usessl);
        assert_eq!(loaded.maxuploadspeed, -1);
        assert_eq!(loaded.api_server, "eu.example.invalid");
    }
}
