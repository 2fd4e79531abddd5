use anyhow::{Context, Result};
use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// File name of the task snapshot, resolved against the working directory.
pub const CONFIG_FILE: &str = "config.json";
/// Port used when the snapshot has none (or an invalid one).
pub const DEFAULT_PORT: u16 = 9000;
/// Tracing level to use if neither `RUST_LOG` nor `--log` is given.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Resolve the snapshot path: an explicit override (made absolute against
/// the working directory) or `./config.json`.
pub fn config_path(override_path: Option<&Path>) -> Result<PathBuf> {
    let cwd = env::current_dir().with_context(|| "resolve working directory")?;
    Ok(resolve(&cwd, override_path))
}

fn resolve(cwd: &Path, override_path: Option<&Path>) -> PathBuf {
    match override_path {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) => cwd.join(p),
        None => cwd.join(CONFIG_FILE),
    }
}

/// Listen address for the control plane (all interfaces).
pub fn bind_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_is_config_json_in_cwd() {
        let cwd = Path::new("/srv/beacon");
        assert_eq!(resolve(cwd, None), PathBuf::from("/srv/beacon/config.json"));
        assert_eq!(
            resolve(cwd, Some(Path::new("state/tasks.json"))),
            PathBuf::from("/srv/beacon/state/tasks.json")
        );
        assert_eq!(
            resolve(cwd, Some(Path::new("/etc/beacon.json"))),
            PathBuf::from("/etc/beacon.json")
        );
    }

    #[test]
    fn binds_all_interfaces() {
        assert_eq!(bind_addr(9000).to_string(), "0.0.0.0:9000");
    }
}
