//! CDC connection credentials.
//!
//! Read from a config file with one `k=v` per line and `#` comments. The
//! replication client cannot use the host's in-process credentials, so a
//! dedicated account is configured out of band.

use std::path::Path;
use std::time::Duration;

use crate::options::{read_config_file, OptionsError};

/// Initial-connection retry policy: ~600 seconds at 1 s intervals, then
/// the consumer gives up.
pub const CONNECT_RETRY_ATTEMPTS: u32 = 600;
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct CdcConfig {
    pub user: String,
    pub password: String,
    pub socket: String,
    pub host: String,
    pub port: Option<u16>,
}

impl CdcConfig {
    pub fn from_file(path: &Path) -> Result<Self, OptionsError> {
        let opts = read_config_file(path)?;
        Ok(Self {
            user: opts.get("myvector_user_id").unwrap_or("").to_string(),
            password: opts
                .get("myvector_user_password")
                .unwrap_or("")
                .to_string(),
            socket: opts.get("myvector_socket").unwrap_or("").to_string(),
            host: opts.get("myvector_host").unwrap_or("").to_string(),
            port: opts.get("myvector_port").and_then(|p| p.parse().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_all_keys() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# replication credentials").unwrap();
        writeln!(f, "myvector_user_id=repl").unwrap();
        writeln!(f, "myvector_user_password=secret").unwrap();
        writeln!(f, "myvector_host=db.internal").unwrap();
        writeln!(f, "myvector_port=3307").unwrap();

        let cfg = CdcConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.user, "repl");
        assert_eq!(cfg.password, "secret");
        assert_eq!(cfg.host, "db.internal");
        assert_eq!(cfg.port, Some(3307));
        assert_eq!(cfg.socket, "");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(CdcConfig::from_file(Path::new("/nonexistent/myvector.cnf")).is_err());
    }
}
