//! Server configuration.
//!
//! [`Config`] is an immutable value handed to
//! [`GitSshServer::new`](super::GitSshServer::new). Embedding services build
//! it in code; the `resolve_*` helpers implement a three-tier priority for
//! hosts that want environment overrides:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GITKIT_LISTEN_ADDR` | `0.0.0.0:2222` | Listener address |
//! | `GITKIT_REPO_DIR` | `./repos` | Repository root |
//! | `GITKIT_KEY_DIR` | `./keys` | Host key directory |
//! | `GITKIT_TIMEOUT_SECS` | unset | Per-channel deadline in seconds |
//! | `GITKIT_LATENCY_MS` | unset | Injected per-channel delay in milliseconds |
//! | `GITKIT_AUTHORIZED_KEYS` | `<key dir>/authorized_keys` | Authorized keys file |
//! | `GITKIT_GIT_BINARY` | `git` | Git executable spawned per channel |

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::auth::PublicKeyLookup;
use super::error::{Error, Result};

/// Default listener address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:2222";

/// Default repository root
pub const DEFAULT_REPO_DIR: &str = "./repos";

/// Default host key directory
pub const DEFAULT_KEY_DIR: &str = "./keys";

/// Default git executable
pub const DEFAULT_GIT_BINARY: &str = "git";

/// File name of the authorized keys file inside the key directory
pub const AUTHORIZED_KEYS_FILE: &str = "authorized_keys";

/// Default maximum authentication attempts per connection
pub const DEFAULT_MAX_AUTH_ATTEMPTS: usize = 6;

/// Default SSH inactivity timeout (10 minutes)
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(600);

/// Default cap on client input waiting for a channel's process (32MB)
pub const DEFAULT_MAX_PENDING_INPUT: usize = 32 * 1024 * 1024;

/// Environment variable name for the listener address
pub const LISTEN_ADDR_ENV_VAR: &str = "GITKIT_LISTEN_ADDR";

/// Environment variable name for the repository root
pub const REPO_DIR_ENV_VAR: &str = "GITKIT_REPO_DIR";

/// Environment variable name for the host key directory
pub const KEY_DIR_ENV_VAR: &str = "GITKIT_KEY_DIR";

/// Environment variable name for the per-channel timeout in seconds
pub const TIMEOUT_ENV_VAR: &str = "GITKIT_TIMEOUT_SECS";

/// Environment variable name for the injected latency in milliseconds
pub const LATENCY_ENV_VAR: &str = "GITKIT_LATENCY_MS";

/// Environment variable name for the authorized keys file
pub const AUTHORIZED_KEYS_ENV_VAR: &str = "GITKIT_AUTHORIZED_KEYS";

/// Environment variable name for the git executable
pub const GIT_BINARY_ENV_VAR: &str = "GITKIT_GIT_BINARY";

/// Configuration for a [`GitSshServer`](super::GitSshServer).
#[derive(Clone)]
pub struct Config {
    /// Root under which every requested repository must resolve.
    pub dir: PathBuf,
    /// Directory holding (or receiving) the host key.
    pub key_dir: PathBuf,
    /// Hard ceiling from channel open to subprocess completion.
    pub timeout: Option<Duration>,
    /// Fixed delay injected before each channel's subprocess is spawned.
    pub latency: Option<Duration>,
    /// Authentication policy.
    pub public_key_lookup: Arc<dyn PublicKeyLookup>,
    /// Git executable used for `upload-pack` / `receive-pack`.
    pub git_binary: PathBuf,
    pub max_auth_attempts: usize,
    /// Idle connections are dropped after this long; `None` disables it.
    pub inactivity_timeout: Option<Duration>,
    /// Client input a channel may queue ahead of its process before the
    /// channel is aborted.
    pub max_pending_input: usize,
}

impl Config {
    /// Create a configuration with the required settings and defaults for the
    /// rest.
    pub fn new(
        dir: impl Into<PathBuf>,
        key_dir: impl Into<PathBuf>,
        public_key_lookup: impl PublicKeyLookup + 'static,
    ) -> Self {
        Self {
            dir: dir.into(),
            key_dir: key_dir.into(),
            timeout: None,
            latency: None,
            public_key_lookup: Arc::new(public_key_lookup),
            git_binary: PathBuf::from(DEFAULT_GIT_BINARY),
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            inactivity_timeout: Some(DEFAULT_INACTIVITY_TIMEOUT),
            max_pending_input: DEFAULT_MAX_PENDING_INPUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_git_binary(mut self, git_binary: impl Into<PathBuf>) -> Self {
        self.git_binary = git_binary.into();
        self
    }

    pub fn with_max_auth_attempts(mut self, attempts: usize) -> Self {
        self.max_auth_attempts = attempts;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_max_pending_input(mut self, bytes: usize) -> Self {
        self.max_pending_input = bytes;
        self
    }

    /// Check that the repository root exists and return its canonical form.
    pub(crate) fn canonical_dir(&self) -> Result<PathBuf> {
        if !self.dir.is_dir() {
            return Err(Error::InvalidRepoRoot {
                path: self.dir.clone(),
            });
        }
        self.dir.canonicalize().map_err(|_| Error::InvalidRepoRoot {
            path: self.dir.clone(),
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("dir", &self.dir)
            .field("key_dir", &self.key_dir)
            .field("timeout", &self.timeout)
            .field("latency", &self.latency)
            .field("public_key_lookup", &self.public_key_lookup.name())
            .field("git_binary", &self.git_binary)
            .field("max_auth_attempts", &self.max_auth_attempts)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .field("max_pending_input", &self.max_pending_input)
            .finish()
    }
}

/// Resolve the listener address with priority: parameter -> env var -> default
pub fn resolve_listen_addr(addr_param: Option<&str>) -> String {
    if let Some(addr) = addr_param {
        return addr.to_string();
    }

    if let Ok(env_addr) = env::var(LISTEN_ADDR_ENV_VAR)
        && !env_addr.trim().is_empty()
    {
        return env_addr.trim().to_string();
    }

    DEFAULT_LISTEN_ADDR.to_string()
}

/// Resolve the repository root with priority: parameter -> env var -> default
pub fn resolve_repo_dir(dir_param: Option<PathBuf>) -> PathBuf {
    resolve_path(dir_param, REPO_DIR_ENV_VAR, Path::new(DEFAULT_REPO_DIR))
}

/// Resolve the host key directory with priority: parameter -> env var -> default
pub fn resolve_key_dir(dir_param: Option<PathBuf>) -> PathBuf {
    resolve_path(dir_param, KEY_DIR_ENV_VAR, Path::new(DEFAULT_KEY_DIR))
}

/// Resolve the authorized keys file with priority: parameter -> env var ->
/// `<key_dir>/authorized_keys`
pub fn resolve_authorized_keys(path_param: Option<PathBuf>, key_dir: &Path) -> PathBuf {
    resolve_path(
        path_param,
        AUTHORIZED_KEYS_ENV_VAR,
        &key_dir.join(AUTHORIZED_KEYS_FILE),
    )
}

/// Resolve the git executable with priority: parameter -> env var -> default
pub fn resolve_git_binary(binary_param: Option<PathBuf>) -> PathBuf {
    resolve_path(binary_param, GIT_BINARY_ENV_VAR, Path::new(DEFAULT_GIT_BINARY))
}

/// Resolve the per-channel timeout with priority: parameter -> env var -> none
pub fn resolve_timeout(timeout_param: Option<Duration>) -> Option<Duration> {
    if timeout_param.is_some() {
        return timeout_param;
    }

    env::var(TIMEOUT_ENV_VAR)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Resolve the injected latency with priority: parameter -> env var -> none
pub fn resolve_latency(latency_param: Option<Duration>) -> Option<Duration> {
    if latency_param.is_some() {
        return latency_param;
    }

    env::var(LATENCY_ENV_VAR)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn resolve_path(param: Option<PathBuf>, env_var: &str, default: &Path) -> PathBuf {
    // Priority 1: Use parameter if provided
    if let Some(path) = param {
        return path;
    }

    // Priority 2: Use environment variable if set
    if let Ok(env_path) = env::var(env_var)
        && !env_path.trim().is_empty()
    {
        return PathBuf::from(env_path.trim());
    }

    // Priority 3: Default value
    default.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::types::Identity;
    use std::sync::Mutex as StdMutex;

    // Use a mutex to serialize env var tests to avoid race conditions
    // SAFETY: Tests are serialized via ENV_TEST_MUTEX to prevent data races
    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    /// Helper to set an environment variable safely within tests.
    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn set_env(key: &str, value: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::set_var(key, value) };
    }

    /// Helper to remove an environment variable safely within tests.
    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn remove_env(key: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::remove_var(key) };
    }

    fn accept_all(_: &str) -> Result<Identity, String> {
        Ok(Identity::new("12345"))
    }

    mod builder {
        use super::*;

        #[test]
        fn test_defaults() {
            let config = Config::new("/srv/git", "/srv/keys", accept_all);
            assert_eq!(config.dir, PathBuf::from("/srv/git"));
            assert_eq!(config.key_dir, PathBuf::from("/srv/keys"));
            assert!(config.timeout.is_none());
            assert!(config.latency.is_none());
            assert_eq!(config.git_binary, PathBuf::from("git"));
            assert_eq!(config.max_auth_attempts, DEFAULT_MAX_AUTH_ATTEMPTS);
            assert_eq!(config.inactivity_timeout, Some(DEFAULT_INACTIVITY_TIMEOUT));
            assert_eq!(config.max_pending_input, DEFAULT_MAX_PENDING_INPUT);
        }

        #[test]
        fn test_with_methods() {
            let config = Config::new("/srv/git", "/srv/keys", accept_all)
                .with_timeout(Duration::from_secs(30))
                .with_latency(Duration::from_millis(250))
                .with_git_binary("/usr/local/bin/git")
                .with_max_auth_attempts(2)
                .with_inactivity_timeout(None)
                .with_max_pending_input(4096);
            assert_eq!(config.timeout, Some(Duration::from_secs(30)));
            assert_eq!(config.latency, Some(Duration::from_millis(250)));
            assert_eq!(config.git_binary, PathBuf::from("/usr/local/bin/git"));
            assert_eq!(config.max_auth_attempts, 2);
            assert!(config.inactivity_timeout.is_none());
            assert_eq!(config.max_pending_input, 4096);
        }

        #[test]
        fn test_debug_names_lookup() {
            let config = Config::new("/srv/git", "/srv/keys", accept_all);
            let debug = format!("{:?}", config);
            assert!(debug.contains("public_key_lookup: \"closure\""));
        }
    }

    mod repo_root {
        use super::*;

        #[test]
        fn test_existing_directory_is_canonicalized() {
            let dir = tempfile::tempdir().unwrap();
            let config = Config::new(dir.path().join("."), "/srv/keys", accept_all);
            let canonical = config.canonical_dir().unwrap();
            assert_eq!(canonical, dir.path().canonicalize().unwrap());
        }

        #[test]
        fn test_missing_directory_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let config = Config::new(dir.path().join("missing"), "/srv/keys", accept_all);
            assert!(matches!(
                config.canonical_dir(),
                Err(Error::InvalidRepoRoot { .. })
            ));
        }

        #[test]
        fn test_file_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let file = dir.path().join("file");
            std::fs::write(&file, b"not a dir").unwrap();
            let config = Config::new(file, "/srv/keys", accept_all);
            assert!(matches!(
                config.canonical_dir(),
                Err(Error::InvalidRepoRoot { .. })
            ));
        }
    }

    mod config_resolution {
        use super::*;

        mod listen_addr {
            use super::*;

            #[test]
            fn test_uses_param_when_provided() {
                assert_eq!(resolve_listen_addr(Some("127.0.0.1:2022")), "127.0.0.1:2022");
            }

            #[test]
            fn test_uses_env_var_when_no_param() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    set_env(LISTEN_ADDR_ENV_VAR, "127.0.0.1:3022");
                }
                let result = resolve_listen_addr(None);
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(LISTEN_ADDR_ENV_VAR);
                }
                assert_eq!(result, "127.0.0.1:3022");
            }

            #[test]
            fn test_uses_default_when_no_param_or_env() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(LISTEN_ADDR_ENV_VAR);
                }
                assert_eq!(resolve_listen_addr(None), DEFAULT_LISTEN_ADDR);
            }
        }

        mod directories {
            use super::*;

            #[test]
            fn test_param_takes_priority_over_env() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    set_env(REPO_DIR_ENV_VAR, "/from/env");
                }
                let result = resolve_repo_dir(Some(PathBuf::from("/from/param")));
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(REPO_DIR_ENV_VAR);
                }
                assert_eq!(result, PathBuf::from("/from/param"));
            }

            #[test]
            fn test_repo_dir_from_env() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    set_env(REPO_DIR_ENV_VAR, "/srv/repos");
                }
                let result = resolve_repo_dir(None);
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(REPO_DIR_ENV_VAR);
                }
                assert_eq!(result, PathBuf::from("/srv/repos"));
            }

            #[test]
            fn test_key_dir_default() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(KEY_DIR_ENV_VAR);
                }
                assert_eq!(resolve_key_dir(None), PathBuf::from(DEFAULT_KEY_DIR));
            }

            #[test]
            fn test_empty_env_var_falls_back_to_default() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    set_env(KEY_DIR_ENV_VAR, "   ");
                }
                let result = resolve_key_dir(None);
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(KEY_DIR_ENV_VAR);
                }
                assert_eq!(result, PathBuf::from(DEFAULT_KEY_DIR));
            }

            #[test]
            fn test_authorized_keys_defaults_into_key_dir() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(AUTHORIZED_KEYS_ENV_VAR);
                }
                assert_eq!(
                    resolve_authorized_keys(None, Path::new("/srv/keys")),
                    PathBuf::from("/srv/keys/authorized_keys")
                );
            }

            #[test]
            fn test_git_binary_from_env() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    set_env(GIT_BINARY_ENV_VAR, "/opt/git/bin/git");
                }
                let result = resolve_git_binary(None);
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(GIT_BINARY_ENV_VAR);
                }
                assert_eq!(result, PathBuf::from("/opt/git/bin/git"));
            }
        }

        mod timeout {
            use super::*;

            #[test]
            fn test_uses_param_when_provided() {
                assert_eq!(
                    resolve_timeout(Some(Duration::from_secs(5))),
                    Some(Duration::from_secs(5))
                );
            }

            #[test]
            fn test_uses_env_var_when_no_param() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    set_env(TIMEOUT_ENV_VAR, "90");
                }
                let result = resolve_timeout(None);
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(TIMEOUT_ENV_VAR);
                }
                assert_eq!(result, Some(Duration::from_secs(90)));
            }

            #[test]
            fn test_unset_means_no_timeout() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(TIMEOUT_ENV_VAR);
                }
                assert_eq!(resolve_timeout(None), None);
            }

            #[test]
            fn test_ignores_invalid_env_var() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    set_env(TIMEOUT_ENV_VAR, "-10");
                }
                let result = resolve_timeout(None);
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(TIMEOUT_ENV_VAR);
                }
                // Parsing fails for negative u64, so no timeout is used
                assert_eq!(result, None);
            }
        }

        mod latency {
            use super::*;

            #[test]
            fn test_uses_env_var_in_milliseconds() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    set_env(LATENCY_ENV_VAR, "1500");
                }
                let result = resolve_latency(None);
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(LATENCY_ENV_VAR);
                }
                assert_eq!(result, Some(Duration::from_millis(1500)));
            }

            #[test]
            fn test_param_takes_priority_over_env() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    set_env(LATENCY_ENV_VAR, "1500");
                }
                let result = resolve_latency(Some(Duration::from_millis(10)));
                // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
                unsafe {
                    remove_env(LATENCY_ENV_VAR);
                }
                assert_eq!(result, Some(Duration::from_millis(10)));
            }
        }
    }
}
