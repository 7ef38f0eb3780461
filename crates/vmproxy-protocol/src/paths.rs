use std::path::PathBuf;

/// Returns the default socket path for the proxy daemon.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("vmproxy.sock")
    } else {
        let uid = nix::unistd::Uid::current();
        PathBuf::from(format!("/tmp/vmproxy-{uid}.sock"))
    }
}

/// Returns the config directory path for the proxy daemon.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("vmproxy")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("vmproxy")
    } else {
        PathBuf::from("/tmp/vmproxy")
    }
}

/// Returns the default config file path.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

/// URL shims are told to connect to for a given socket path.
pub fn socket_url(path: &std::path::Path) -> String {
    format!("unix://{}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_uses_unix_scheme() {
        let url = socket_url(std::path::Path::new("/run/vmproxy.sock"));
        assert_eq!(url, "unix:///run/vmproxy.sock");
    }

    #[test]
    fn config_lives_in_dirs_path() {
        assert!(config_path().starts_with(dirs_path()));
        assert!(config_path().ends_with("config.toml"));
    }
}
