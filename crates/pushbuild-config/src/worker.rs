//! Worker configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_MAX_IDLE_SECS: u64 = 1800;
const DEFAULT_FEED_URL: &str = "https://hg.mozilla.org";
const DEFAULT_RETRIES: u32 = 5;
const DEFAULT_RETRY_DELAY_SECS: u64 = 1;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TOPIC: &str = "change.#";
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 1;

/// Complete configuration for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker: WorkerIdentity,
    pub feed: FeedConfig,
    /// Live notifications. Absent means catch-up only.
    pub notifications: Option<NotificationConfig>,
    pub branches: Vec<BranchConfig>,
    pub build: BuildConfig,
    pub store: StoreConfig,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_type: String,
    pub instance_id: String,
    /// Stop after this long without work. `None` never stops.
    pub max_idle: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub base_url: Url,
    pub retries: u32,
    pub retry_delay: Duration,
    /// Limit on a single pushlog request, connect to last byte.
    pub request_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_FEED_URL).expect("default feed URL is valid"),
            retries: DEFAULT_RETRIES,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub topic: String,
    pub poll_timeout: Duration,
    /// Address the HTTP ingestion endpoint binds to. Notifications only
    /// arrive through this endpoint, so it is required.
    pub listen: SocketAddr,
    /// HMAC secret for signed notifications.
    pub secret: Option<String>,
    /// Drop notifications whose `_meta.master_name` does not contain this.
    pub master: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub name: String,
    /// Resume after this changeset. `None` starts from the feed's default window.
    pub after: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub work_dir: PathBuf,
    /// Base URL branches are cloned from (`{repository}/{branch}`).
    pub repository: Url,
    pub mozconfig: Option<PathBuf>,
    pub patch: Option<PathBuf>,
    pub tooltool_manifest: Option<String>,
    pub tooltool_command: Vec<String>,
    pub setup_command: Option<Vec<String>>,
    pub command: Vec<String>,
}

impl BuildConfig {
    /// Contents of the configured mozconfig, or empty.
    pub fn mozconfig_text(&self) -> ConfigResult<String> {
        read_optional(self.mozconfig.as_deref()).map(Option::unwrap_or_default)
    }

    /// Contents of the configured patch, if any.
    pub fn patch_text(&self) -> ConfigResult<Option<String>> {
        read_optional(self.patch.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub public_url: Option<Url>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn read_optional(path: Option<&Path>) -> ConfigResult<Option<String>> {
    match path {
        Some(path) => Ok(Some(std::fs::read_to_string(path)?)),
        None => Ok(None),
    }
}

/// Read and parse a worker configuration file.
pub fn load_worker_config(path: impl AsRef<Path>) -> ConfigResult<WorkerConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_worker_config(&content)
}

/// Parse a worker configuration from KDL text.
pub fn parse_worker_config(kdl: &str) -> ConfigResult<WorkerConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut worker = None;
    let mut feed = FeedConfig::default();
    let mut notifications = None;
    let mut branches = Vec::new();
    let mut build = None;
    let mut store = None;
    let mut log_format = LogFormat::default();

    for node in doc.nodes() {
        match node.name().value() {
            "worker" => worker = Some(parse_worker(node)?),
            "feed" => feed = parse_feed(node)?,
            "notifications" => notifications = Some(parse_notifications(node)?),
            "branches" => branches = parse_branches(node)?,
            "build" => build = Some(parse_build(node)?),
            "store" => store = Some(parse_store(node)?),
            "log-format" => {
                log_format = match get_first_string_arg(node).as_deref() {
                    Some("json") => LogFormat::Json,
                    Some("text") | None => LogFormat::Text,
                    Some(other) => {
                        return Err(ConfigError::invalid(
                            "log-format",
                            format!("expected \"text\" or \"json\", got {:?}", other),
                        ));
                    }
                };
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if branches.is_empty() {
        return Err(ConfigError::MissingField("branches".to_string()));
    }

    Ok(WorkerConfig {
        worker: worker.unwrap_or_else(|| WorkerIdentity {
            worker_type: "default".to_string(),
            instance_id: default_instance_id(),
            max_idle: Some(Duration::from_secs(DEFAULT_MAX_IDLE_SECS)),
        }),
        feed,
        notifications,
        branches,
        build: build.ok_or_else(|| ConfigError::MissingField("build".to_string()))?,
        store: store.ok_or_else(|| ConfigError::MissingField("store".to_string()))?,
        log_format,
    })
}

fn default_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("unknown-{}", host)
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerIdentity> {
    let worker_type = get_string_prop(node, "type").unwrap_or_else(|| "default".to_string());
    let instance_id = get_string_prop(node, "instance-id").unwrap_or_else(default_instance_id);
    let max_idle = match get_seconds_prop(node, "max-idle")? {
        None => Some(Duration::from_secs(DEFAULT_MAX_IDLE_SECS)),
        Some(d) if d.is_zero() => None,
        Some(d) => Some(d),
    };

    Ok(WorkerIdentity {
        worker_type,
        instance_id,
        max_idle,
    })
}

fn parse_feed(node: &KdlNode) -> ConfigResult<FeedConfig> {
    let mut feed = FeedConfig::default();

    if let Some(url) = get_string_prop(node, "base-url") {
        feed.base_url = parse_url("feed base-url", &url)?;
    }
    if let Some(retries) = get_int_prop(node, "retries") {
        if retries < 1 {
            return Err(ConfigError::invalid("feed retries", "must be at least 1"));
        }
        feed.retries = u32::try_from(retries)
            .map_err(|_| ConfigError::invalid("feed retries", "out of range"))?;
    }
    if let Some(delay) = get_seconds_prop(node, "retry-delay")? {
        feed.retry_delay = delay;
    }
    if let Some(timeout) = get_seconds_prop(node, "request-timeout")? {
        if timeout.is_zero() {
            return Err(ConfigError::invalid("feed request-timeout", "must be positive"));
        }
        feed.request_timeout = timeout;
    }

    Ok(feed)
}

fn parse_notifications(node: &KdlNode) -> ConfigResult<NotificationConfig> {
    let topic = get_string_prop(node, "topic").unwrap_or_else(|| DEFAULT_TOPIC.to_string());
    let poll_timeout = get_seconds_prop(node, "poll-timeout")?
        .unwrap_or(Duration::from_secs(DEFAULT_POLL_TIMEOUT_SECS));
    if poll_timeout.is_zero() {
        return Err(ConfigError::invalid(
            "notifications poll-timeout",
            "must be positive",
        ));
    }
    let listen = get_string_prop(node, "listen")
        .ok_or_else(|| ConfigError::MissingField("notifications listen".to_string()))?
        .parse::<SocketAddr>()
        .map_err(|e| ConfigError::invalid("notifications listen", e.to_string()))?;

    Ok(NotificationConfig {
        topic,
        poll_timeout,
        listen,
        secret: get_string_prop(node, "secret"),
        master: get_string_prop(node, "master"),
    })
}

fn parse_branches(node: &KdlNode) -> ConfigResult<Vec<BranchConfig>> {
    let mut branches: Vec<BranchConfig> = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "branch" {
                continue;
            }
            let name = get_first_string_arg(child)
                .ok_or_else(|| ConfigError::MissingField("branch name".to_string()))?;
            if branches.iter().any(|b| b.name == name) {
                return Err(ConfigError::Duplicate(format!("branch '{}'", name)));
            }
            branches.push(BranchConfig {
                name,
                after: get_string_prop(child, "after"),
            });
        }
    }

    Ok(branches)
}

fn parse_build(node: &KdlNode) -> ConfigResult<BuildConfig> {
    let work_dir = get_string_prop(node, "work-dir")
        .map(PathBuf::from)
        .ok_or_else(|| ConfigError::MissingField("build work-dir".to_string()))?;
    let repository = match get_string_prop(node, "repository") {
        Some(url) => parse_url("build repository", &url)?,
        None => parse_url("build repository", DEFAULT_FEED_URL)?,
    };

    let mut build = BuildConfig {
        work_dir,
        repository,
        mozconfig: None,
        patch: None,
        tooltool_manifest: None,
        tooltool_command: vec![
            "python".to_string(),
            "tooltool.py".to_string(),
            "fetch".to_string(),
        ],
        setup_command: None,
        command: vec!["make".to_string(), "-f".to_string(), "client.mk".to_string()],
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "mozconfig" => build.mozconfig = get_first_string_arg(child).map(PathBuf::from),
                "patch" => build.patch = get_first_string_arg(child).map(PathBuf::from),
                "tooltool-manifest" => build.tooltool_manifest = get_first_string_arg(child),
                "tooltool-command" => {
                    build.tooltool_command = non_empty_args(child, "build tooltool-command")?
                }
                "setup-command" => {
                    build.setup_command = Some(non_empty_args(child, "build setup-command")?)
                }
                "command" => build.command = non_empty_args(child, "build command")?,
                _ => {}
            }
        }
    }

    Ok(build)
}

fn parse_store(node: &KdlNode) -> ConfigResult<StoreConfig> {
    let path = get_string_prop(node, "path")
        .map(PathBuf::from)
        .ok_or_else(|| ConfigError::MissingField("store path".to_string()))?;
    let public_url = get_string_prop(node, "public-url")
        .map(|url| parse_url("store public-url", &url))
        .transpose()?;

    Ok(StoreConfig { path, public_url })
}

fn parse_url(field: &str, value: &str) -> ConfigResult<Url> {
    Url::parse(value).map_err(|e| ConfigError::invalid(field, e.to_string()))
}

fn non_empty_args(node: &KdlNode, field: &str) -> ConfigResult<Vec<String>> {
    let args = get_all_string_args(node);
    if args.is_empty() {
        return Err(ConfigError::invalid(field, "expected at least one argument"));
    }
    Ok(args)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

fn get_seconds_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    match get_int_prop(node, name) {
        None => Ok(None),
        Some(secs) => u64::try_from(secs)
            .map(|s| Some(Duration::from_secs(s)))
            .map_err(|_| ConfigError::invalid(name, "must be a non-negative number of seconds")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        worker type="linux64" instance-id="builder-1" max-idle=600
        feed base-url="https://hg.example.org" retries=3 retry-delay=2 request-timeout=10
        notifications poll-timeout=1 listen="127.0.0.1:3000" secret="s3cret" master="releng"
        branches {
            branch "mozilla-central" after="abcdef123456"
            branch "try"
        }
        build work-dir="/builds/pushbuild" repository="https://hg.example.org" {
            mozconfig "/etc/pushbuild/mozconfig"
            tooltool-manifest "browser/config/tooltool-manifests/linux64/releng.manifest"
            setup-command "sh" "setup.sh"
            command "./mach" "build"
        }
        store path="/var/lib/pushbuild/logs" public-url="https://logs.example.com/"
        log-format "json"
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = parse_worker_config(FULL).unwrap();

        assert_eq!(config.worker.worker_type, "linux64");
        assert_eq!(config.worker.instance_id, "builder-1");
        assert_eq!(config.worker.max_idle, Some(Duration::from_secs(600)));
        assert_eq!(config.feed.base_url.as_str(), "https://hg.example.org/");
        assert_eq!(config.feed.retries, 3);
        assert_eq!(config.feed.retry_delay, Duration::from_secs(2));
        assert_eq!(config.feed.request_timeout, Duration::from_secs(10));

        let notifications = config.notifications.unwrap();
        assert_eq!(notifications.topic, "change.#");
        assert_eq!(notifications.listen, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(notifications.secret.as_deref(), Some("s3cret"));
        assert_eq!(notifications.master.as_deref(), Some("releng"));

        assert_eq!(
            config.branches,
            vec![
                BranchConfig {
                    name: "mozilla-central".to_string(),
                    after: Some("abcdef123456".to_string()),
                },
                BranchConfig {
                    name: "try".to_string(),
                    after: None,
                },
            ]
        );

        assert_eq!(config.build.command, vec!["./mach", "build"]);
        assert_eq!(
            config.build.setup_command,
            Some(vec!["sh".to_string(), "setup.sh".to_string()])
        );
        assert_eq!(config.build.tooltool_command[0], "python");
        assert_eq!(config.store.path, PathBuf::from("/var/lib/pushbuild/logs"));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_defaults_apply() {
        let kdl = r#"
            branches {
                branch "try"
            }
            build work-dir="/builds"
            store path="/logs"
        "#;

        let config = parse_worker_config(kdl).unwrap();
        assert_eq!(
            config.worker.max_idle,
            Some(Duration::from_secs(DEFAULT_MAX_IDLE_SECS))
        );
        assert!(config.worker.instance_id.starts_with("unknown-"));
        assert_eq!(config.feed.retries, 5);
        assert_eq!(config.feed.retry_delay, Duration::from_secs(1));
        assert_eq!(
            config.feed.request_timeout,
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
        );
        assert!(config.notifications.is_none());
        assert_eq!(config.build.command, vec!["make", "-f", "client.mk"]);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_zero_max_idle_disables_idle_shutdown() {
        let kdl = r#"
            worker type="linux64" max-idle=0
            branches {
                branch "try"
            }
            build work-dir="/builds"
            store path="/logs"
        "#;

        let config = parse_worker_config(kdl).unwrap();
        assert_eq!(config.worker.max_idle, None);
    }

    #[test]
    fn test_missing_branches() {
        let kdl = r#"
            build work-dir="/builds"
            store path="/logs"
        "#;

        let result = parse_worker_config(kdl);
        assert!(matches!(result, Err(ConfigError::MissingField(f)) if f == "branches"));
    }

    #[test]
    fn test_duplicate_branch() {
        let kdl = r#"
            branches {
                branch "try"
                branch "try"
            }
            build work-dir="/builds"
            store path="/logs"
        "#;

        let result = parse_worker_config(kdl);
        assert!(matches!(result, Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_invalid_feed_url() {
        let kdl = r#"
            feed base-url="not a url"
            branches {
                branch "try"
            }
            build work-dir="/builds"
            store path="/logs"
        "#;

        let result = parse_worker_config(kdl);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_default_instance_id_uses_hostname() {
        let host = hostname::get().unwrap().into_string().unwrap();
        assert_eq!(default_instance_id(), format!("unknown-{}", host));
    }

    #[test]
    fn test_notifications_require_listen_address() {
        let kdl = r#"
            notifications topic="change.#"
            branches {
                branch "try"
            }
            build work-dir="/builds"
            store path="/logs"
        "#;

        let result = parse_worker_config(kdl);
        assert!(
            matches!(result, Err(ConfigError::MissingField(f)) if f == "notifications listen")
        );
    }

    #[test]
    fn test_zero_request_timeout_rejected() {
        let kdl = r#"
            feed request-timeout=0
            branches {
                branch "try"
            }
            build work-dir="/builds"
            store path="/logs"
        "#;

        let result = parse_worker_config(kdl);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_missing_store() {
        let kdl = r#"
            branches {
                branch "try"
            }
            build work-dir="/builds"
        "#;

        let result = parse_worker_config(kdl);
        assert!(matches!(result, Err(ConfigError::MissingField(f)) if f == "store"));
    }

    #[test]
    fn test_mozconfig_text_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mozconfig");
        std::fs::write(&path, "ac_add_options --enable-debug\n").unwrap();

        let mut config = parse_worker_config(FULL).unwrap();
        config.build.mozconfig = Some(path);
        config.build.patch = None;

        assert_eq!(
            config.build.mozconfig_text().unwrap(),
            "ac_add_options --enable-debug\n"
        );
        assert_eq!(config.build.patch_text().unwrap(), None);
    }
}
